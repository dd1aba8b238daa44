//! otagent - Entry Point
//!
//! Over-the-air update agent. Installs artifacts through Update Modules,
//! either one command at a time (standalone) or driven by a deployment
//! server (daemon).

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context};
use tracing::{error, info};

use otagent::app::options::{default_settings_path, AppOptions};
use otagent::app::run::{run_daemon, run_standalone, StandaloneCommand};
use otagent::filesys::file::File;
use otagent::logs::{init_logging, LogLevel, LogOptions};
use otagent::storage::layout::StorageLayout;
use otagent::storage::settings::load_settings;
use otagent::utils::version_info;

const USAGE: &str = "\
Usage: otagent [--config=<file>] [--log-level=<level>] <command>

Commands:
  install <artifact>   Install an artifact, stopping before commit if it can be rolled back
  commit               Commit the installed update
  rollback             Roll back the installed update
  resume               Continue an interrupted update
  daemon               Poll the deployment server and deploy

Options:
  --config=<file>      Settings file (default /etc/otagent/settings.json)
  --log-level=<level>  trace, debug, info, warn or error
  --json-logs          Log JSON lines to stdout
  --reboot-exit-code   Exit with 4 when a reboot is required
  --run-once           Daemon exits after its first deployment
  --version            Print version information";

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let mut cli_args: HashMap<String, String> = HashMap::new();
    let mut positional: Vec<String> = Vec::new();

    for arg in env::args().skip(1) {
        if let Some(flag) = arg.strip_prefix("--") {
            match flag.split_once('=') {
                Some((key, value)) => cli_args.insert(key.to_string(), value.to_string()),
                None => cli_args.insert(flag.to_string(), "true".to_string()),
            };
        } else {
            positional.push(arg);
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(version) => println!("{}", version),
            Err(e) => eprintln!("{}", e),
        }
        return;
    }

    if cli_args.contains_key("help") || positional.is_empty() {
        println!("{}", USAGE);
        return;
    }

    let code = match run_cli(&cli_args, &positional).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run_cli(cli_args: &HashMap<String, String>, positional: &[String]) -> anyhow::Result<i32> {
    // Retrieve the settings file
    let settings_path = cli_args
        .get("config")
        .map(PathBuf::from)
        .unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&File::new(&settings_path))
        .await
        .with_context(|| format!("loading settings from {}", settings_path.display()))?;
    if let Some(level) = cli_args.get("log-level") {
        settings.log_level = level.parse::<LogLevel>().map_err(anyhow::Error::msg)?;
    }

    let mut options = AppOptions::from_settings(&settings, StorageLayout::default());
    options.daemon.stop_after_deployment = cli_args.contains_key("run-once");

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings
            .log_to_file
            .then(|| options.layout.logs_dir().path().to_path_buf()),
        json_format: cli_args.contains_key("json-logs"),
        ..Default::default()
    };
    let _log_guard = init_logging(log_options).context("initializing logging")?;

    let version = version_info();
    info!("otagent {} ({})", version.version, version.git_hash);

    let command = match positional {
        [verb] if verb == "daemon" => {
            run_daemon(&options, await_shutdown_signal())
                .await
                .context("running the daemon")?;
            return Ok(0);
        }
        [verb, artifact] if verb == "install" => StandaloneCommand::Install(artifact.clone()),
        [verb] if verb == "commit" => StandaloneCommand::Commit,
        [verb] if verb == "rollback" => StandaloneCommand::Rollback,
        [verb] if verb == "resume" => StandaloneCommand::Resume,
        _ => bail!("Invalid command line: {}\n\n{}", positional.join(" "), USAGE),
    };

    let result = run_standalone(&options, command.clone())
        .await
        .with_context(|| format!("running {:?}", command))?;
    println!("{}", describe(&result));
    Ok(result.exit_code(cli_args.contains_key("reboot-exit-code")))
}

fn describe(result: &otagent::deploy::standalone::StandaloneResult) -> &'static str {
    use otagent::deploy::standalone::StandaloneResult as R;
    match result {
        R::Installed {
            reboot_required: true,
        } => "Installed, reboot the device and then commit or roll back",
        R::Installed { .. } => "Installed, commit or roll back when ready",
        R::InstalledAndCommitted {
            reboot_required: true,
        } => "Installed and committed, reboot the device to use the update",
        R::InstalledAndCommitted { .. } => "Installed and committed",
        R::Committed => "Committed",
        R::RolledBack => "Rolled back",
        R::NoRollback => "The update does not support rollback",
        R::Failed { rolled_back: true } => "Installation failed, the previous version was restored",
        R::Failed { rolled_back: false } => {
            "Installation failed and could not be rolled back, the system may be inconsistent"
        }
        R::FailedNothingDone => "Installation failed, nothing was changed",
        R::NoUpdateInProgress => "No update in progress",
    }
}

async fn await_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        _ => {
            error!("Unable to listen for termination signals, falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down...");
        }
        _ = sigint.recv() => {
            info!("SIGINT received, shutting down...");
        }
    }
}
