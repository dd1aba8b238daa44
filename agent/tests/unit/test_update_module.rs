//! Update Modules as real executables

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use otagent::app::options::AppOptions;
use otagent::app::run::{run_standalone, StandaloneCommand};
use otagent::artifact::PayloadFile;
use otagent::deploy::standalone::StandaloneResult;
use otagent::errors::AgentError;
use otagent::filesys::dir::Dir;
use otagent::storage::database::FileDatabase;
use otagent::storage::layout::StorageLayout;
use otagent::storage::provides::load_provides;
use otagent::storage::settings::Settings;
use otagent::update_module::call::ModuleOptions;
use otagent::update_module::file_tree::FileTreeInfo;
use otagent::update_module::{
    ExecutableModule, ExecutableModuleRegistry, ModuleCall, ModuleRegistry, RebootAction,
    RollbackSupport, UpdateModule,
};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

const LOGGING_MODULE: &str = r#"
echo "$1" >> "$MODULE_LOG"
case "$1" in
    NeedsArtifactReboot) echo "No" ;;
    SupportsRollback) echo "Yes" ;;
    ArtifactInstall) test -f "$2/files/rootfs.ext4" || exit 3 ;;
    ArtifactCommit) exit "${COMMIT_EXIT:-0}" ;;
esac
exit 0
"#;

fn write_module(dir: &Path, name: &str, body: &str, log: &Path) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    let script = format!("#!/bin/sh\nMODULE_LOG=\"{}\"\n{}", log.display(), body);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn read_log(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn payload(name: &str, body: &[u8]) -> PayloadFile {
    PayloadFile {
        name: name.to_string(),
        reader: Box::new(std::io::Cursor::new(body.to_vec())),
    }
}

fn tree_info() -> FileTreeInfo {
    FileTreeInfo {
        artifact_name: "release-2".to_string(),
        payload_type: "rootfs-image".to_string(),
        current_artifact_name: "release-1".to_string(),
        device_type: "qemux86-64".to_string(),
        ..Default::default()
    }
}

struct Fixture {
    _tmp: TempDir,
    log: PathBuf,
    module: ExecutableModule,
}

fn fixture(body: &str, options: ModuleOptions) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("calls.log");
    let program = write_module(&tmp.path().join("modules"), "rootfs-image", body, &log);
    let module = ExecutableModule::new("rootfs-image", program, &tmp.path().join("work"), options);
    Fixture {
        _tmp: tmp,
        log,
        module,
    }
}

#[tokio::test]
async fn test_files_are_stored_for_modules_that_do_not_stream() {
    let f = fixture(LOGGING_MODULE, ModuleOptions::default());
    f.module.prepare_file_tree(&tree_info()).await.unwrap();

    f.module
        .download(vec![payload("rootfs.ext4", b"root filesystem")])
        .await
        .unwrap();

    let stored = f.module.file_tree().files_dir().file("rootfs.ext4");
    assert_eq!(stored.read_string().await.unwrap(), "root filesystem");
    assert!(!f.module.file_tree().streams_dir().exists().await);

    assert_ok!(f.module.call_state(ModuleCall::ArtifactInstall).await);
    assert_eq!(read_log(&f.log), vec!["Download", "ArtifactInstall"]);
}

#[tokio::test]
async fn test_streaming_module_reads_every_file() {
    let body = r#"
case "$1" in
    Download)
        while read -r stream < stream-next && [ -n "$stream" ]; do
            cat "$stream" > "../copy-$(basename "$stream")"
        done ;;
esac
exit 0
"#;
    let f = fixture(body, ModuleOptions::default());
    f.module.prepare_file_tree(&tree_info()).await.unwrap();

    f.module
        .download(vec![
            payload("boot.img", b"kernel"),
            payload("rootfs.ext4", b"root filesystem"),
        ])
        .await
        .unwrap();

    let payload_dir = f.module.file_tree().path().parent().unwrap().to_path_buf();
    assert_eq!(
        std::fs::read_to_string(payload_dir.join("copy-boot.img")).unwrap(),
        "kernel"
    );
    assert_eq!(
        std::fs::read_to_string(payload_dir.join("copy-rootfs.ext4")).unwrap(),
        "root filesystem"
    );
    assert!(!f.module.file_tree().files_dir().exists().await);
}

#[tokio::test]
async fn test_exit_code_decides_state_result() {
    let f = fixture(
        &LOGGING_MODULE.replace("${COMMIT_EXIT:-0}", "2"),
        ModuleOptions::default(),
    );
    f.module.prepare_file_tree(&tree_info()).await.unwrap();

    let install = f.module.call_state(ModuleCall::ArtifactInstall).await;
    assert!(matches!(install, Err(AgentError::ModuleError(_))));

    let commit = f.module.call_state(ModuleCall::ArtifactCommit).await;
    assert!(matches!(commit, Err(AgentError::ModuleError(_))));

    assert_ok!(f.module.call_state(ModuleCall::ArtifactVerifyReboot).await);

    let query = f.module.call_state(ModuleCall::SupportsRollback).await;
    assert!(matches!(query, Err(AgentError::Internal(_))));
}

#[tokio::test]
async fn test_query_answers() {
    let answering = r#"
case "$1" in
    NeedsArtifactReboot) echo "Automatic" ;;
    SupportsRollback) echo "AutomaticDualRootfs" ;;
esac
"#;
    let f = fixture(answering, ModuleOptions::default());
    assert_eq!(f.module.needs_reboot().await.unwrap(), RebootAction::Automatic);
    assert_eq!(
        f.module.supports_rollback().await.unwrap(),
        RollbackSupport::AutomaticDualRootfs
    );

    let silent = fixture("exit 0\n", ModuleOptions::default());
    assert_eq!(silent.module.needs_reboot().await.unwrap(), RebootAction::No);
    assert_eq!(
        silent.module.supports_rollback().await.unwrap(),
        RollbackSupport::No
    );

    let chatty = fixture("echo Yes\necho No\n", ModuleOptions::default());
    assert_err!(chatty.module.supports_rollback().await);

    let confused = fixture("echo Maybe\n", ModuleOptions::default());
    assert!(matches!(
        confused.module.needs_reboot().await,
        Err(AgentError::ProtocolError(_))
    ));
}

#[tokio::test]
async fn test_hanging_module_is_killed() {
    let options = ModuleOptions {
        timeout: Duration::from_millis(300),
        kill_grace: Duration::from_millis(200),
    };
    let f = fixture("trap '' TERM\nsleep 30\n", options);
    f.module.prepare_file_tree(&tree_info()).await.unwrap();

    let started = Instant::now();
    let result = f.module.call_state(ModuleCall::ArtifactInstall).await;

    assert!(matches!(result, Err(AgentError::ModuleTimeout(_))));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_cleanup_twice_is_safe() {
    let f = fixture(LOGGING_MODULE, ModuleOptions::default());
    f.module.prepare_file_tree(&tree_info()).await.unwrap();

    assert_ok!(f.module.call_state(ModuleCall::Cleanup).await);
    assert_ok!(f.module.call_state(ModuleCall::Cleanup).await);
    assert_ok!(f.module.cleanup().await);
    assert!(!f.module.file_tree().exists().await);

    // without a tree there is nothing left to clean
    f.module.cleanup().await.unwrap();
    assert_eq!(read_log(&f.log), vec!["Cleanup", "Cleanup", "Cleanup"]);
}

#[tokio::test]
async fn test_registry_lookup() {
    let tmp = TempDir::new().unwrap();
    let modules = tmp.path().join("modules");
    let log = tmp.path().join("calls.log");
    write_module(&modules, "rootfs-image", LOGGING_MODULE, &log);
    std::fs::write(modules.join("not-executable"), "#!/bin/sh\n").unwrap();

    let registry = ExecutableModuleRegistry::new(
        &modules,
        tmp.path().join("work"),
        ModuleOptions::default(),
    );

    let module = registry.module_for("rootfs-image").await.unwrap();
    assert_eq!(module.payload_type(), "rootfs-image");

    for payload_type in ["deb", "not-executable", "../modules/rootfs-image", ""] {
        assert!(
            matches!(
                registry.module_for(payload_type).await,
                Err(AgentError::NoModuleForPayload(_))
            ),
            "{}",
            payload_type
        );
    }
}

#[tokio::test]
async fn test_standalone_install_and_commit_from_disk() {
    let tmp = TempDir::new().unwrap();
    let layout = StorageLayout::new(tmp.path());
    let log = tmp.path().join("calls.log");
    write_module(&layout.modules_dir, "rootfs-image", LOGGING_MODULE, &log);
    layout
        .device_type_file()
        .write_string("device_type=qemux86-64\n")
        .await
        .unwrap();

    let artifact = Dir::new(tmp.path().join("release-2"));
    artifact
        .file("header.json")
        .write_string(
            r#"{
                "artifact_name": "release-2",
                "depends": {"device_type": "qemux86-64"},
                "provides": {"rootfs-image.checksum": "abc123"},
                "payloads": [{"type": "rootfs-image"}]
            }"#,
        )
        .await
        .unwrap();
    artifact
        .subdir("data")
        .subdir("0000")
        .file("rootfs.ext4")
        .write_string("root filesystem")
        .await
        .unwrap();

    let options = AppOptions::from_settings(&Settings::default(), layout.clone());
    let uri = format!("file://{}", artifact.path().display());

    let result = run_standalone(&options, StandaloneCommand::Install(uri))
        .await
        .unwrap();
    assert_eq!(
        result,
        StandaloneResult::Installed {
            reboot_required: false
        }
    );

    let result = run_standalone(&options, StandaloneCommand::Commit)
        .await
        .unwrap();
    assert_eq!(result, StandaloneResult::Committed);

    assert_eq!(
        read_log(&log),
        vec![
            "Download",
            "SupportsRollback",
            "ArtifactInstall",
            "NeedsArtifactReboot",
            "ArtifactCommit",
            "Cleanup"
        ]
    );
    assert!(!layout
        .modules_work_dir()
        .subdir("payloads")
        .subdir("0000")
        .subdir("tree")
        .exists()
        .await);

    let db = FileDatabase::open(layout.datastore_file()).await.unwrap();
    let provides = load_provides(&db).await.unwrap();
    assert_eq!(provides.get("artifact_name"), Some(&"release-2".to_string()));
    assert_eq!(
        provides.get("rootfs-image.checksum"),
        Some(&"abc123".to_string())
    );

    let result = run_standalone(&options, StandaloneCommand::Resume)
        .await
        .unwrap();
    assert_eq!(result, StandaloneResult::NoUpdateInProgress);
}
