//! Streaming payload files to a module during `Download`
//!
//! The module reads `stream-next` to learn the path of the next stream,
//! relative to the tree, then reads the file body from that FIFO. An empty
//! line on `stream-next` means no more streams. A module that exits without
//! ever opening `stream-next` gets the files stored in `files/` instead.

use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tracing::{debug, info};

use crate::artifact::PayloadFile;
use crate::errors::AgentError;
use crate::filesys::fifo::{create_fifo, try_open_sender, OPEN_POLL_INTERVAL};
use crate::update_module::call::{ModuleOptions, ModuleProcess};
use crate::update_module::file_tree::FileTree;
use crate::update_module::protocol::ModuleCall;

enum ReaderSide {
    Connected(pipe::Sender),
    ModuleExited,
}

/// Wait until the module opens `path` for reading, or stops running
async fn wait_for_reader(
    process: &mut ModuleProcess,
    path: &Path,
) -> Result<ReaderSide, AgentError> {
    loop {
        if let Some(sender) = try_open_sender(path)? {
            return Ok(ReaderSide::Connected(sender));
        }
        // past the deadline the final wait() takes care of killing it
        if process.has_exited()? || process.deadline_passed() {
            return Ok(ReaderSide::ModuleExited);
        }
        tokio::time::sleep(OPEN_POLL_INTERVAL).await;
    }
}

async fn send_line(mut sender: pipe::Sender, line: &str) -> Result<(), AgentError> {
    sender.write_all(line.as_bytes()).await?;
    sender.write_all(b"\n").await?;
    sender.flush().await?;
    Ok(())
}

/// Announce `file` on the already connected `stream-next` and send its body
async fn stream_file(
    process: &mut ModuleProcess,
    tree: &FileTree,
    stream_next: pipe::Sender,
    file: &mut PayloadFile,
) -> Result<(), AgentError> {
    let relative = format!("streams/{}", file.name);
    let stream_path = tree.path().join(&relative);
    create_fifo(&stream_path)?;
    send_line(stream_next, &relative).await?;

    match wait_for_reader(process, &stream_path).await? {
        ReaderSide::Connected(mut sender) => {
            let copied = tokio::io::copy(&mut file.reader, &mut sender).await?;
            sender.flush().await?;
            debug!("Streamed {} bytes of {}", copied, file.name);
            Ok(())
        }
        ReaderSide::ModuleExited => Err(AgentError::ModuleError(format!(
            "{} exited without reading {}",
            process.label(),
            relative
        ))),
    }
}

async fn store_files(tree: &FileTree, files: Vec<PayloadFile>) -> Result<(), AgentError> {
    let dir = tree.files_dir();
    dir.recreate().await?;
    for mut file in files {
        let mut out = tokio::fs::File::create(dir.path().join(&file.name)).await?;
        tokio::io::copy(&mut file.reader, &mut out).await?;
        out.sync_all().await?;
    }
    Ok(())
}

/// Run `Download` for one payload
pub async fn download(
    program: &Path,
    tree: &FileTree,
    files: Vec<PayloadFile>,
    options: &ModuleOptions,
) -> Result<(), AgentError> {
    tree.remove_streams().await?;
    tree.files_dir().delete().await?;
    tree.streams_dir().create().await?;
    create_fifo(&tree.stream_next())?;

    let mut process = ModuleProcess::spawn(
        program,
        ModuleCall::Download,
        Some(tree.path()),
        tree.path(),
        options,
    )?;

    let mut files = files.into_iter();
    let mut pending = files.next();
    let mut streamed = 0usize;
    let mut module_streams = false;
    let mut stream_error = None;

    while let Some(mut file) = pending.take() {
        match wait_for_reader(&mut process, &tree.stream_next()).await {
            Ok(ReaderSide::Connected(sender)) => {
                module_streams = true;
                if let Err(e) = stream_file(&mut process, tree, sender, &mut file).await {
                    stream_error = Some(e);
                    break;
                }
                streamed += 1;
                pending = files.next();
            }
            Ok(ReaderSide::ModuleExited) => {
                pending = Some(file);
                break;
            }
            Err(e) => {
                stream_error = Some(e);
                break;
            }
        }
    }

    if stream_error.is_none() && pending.is_none() {
        if let Ok(ReaderSide::Connected(sender)) =
            wait_for_reader(&mut process, &tree.stream_next()).await
        {
            if let Err(e) = send_line(sender, "").await {
                debug!("Module did not take the end of streams marker: {}", e);
            }
        }
    }

    let result = process.wait().await;
    tree.remove_streams().await?;
    result?;
    if let Some(e) = stream_error {
        return Err(e);
    }

    let remaining: Vec<PayloadFile> = pending.into_iter().chain(files).collect();
    if module_streams {
        if !remaining.is_empty() {
            return Err(AgentError::ModuleError(format!(
                "Module exited after consuming {} of {} streams",
                streamed,
                streamed + remaining.len()
            )));
        }
        info!("Module consumed {} payload streams", streamed);
    } else if !remaining.is_empty() {
        info!("Module did not stream, storing {} files", remaining.len());
        store_files(tree, remaining).await?;
    }
    Ok(())
}
