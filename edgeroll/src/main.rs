//! edgeroll - Entry Point
//!
//! Runs the rollout orchestrator, the device update executor, or both,
//! depending on the configured role.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use edgeroll::app::options::AppOptions;
use edgeroll::app::run::run;
use edgeroll::app::state::AppState;
use edgeroll::errors::FleetError;
use edgeroll::filesys::file::File;
use edgeroll::logs::{init_logging, LogOptions};
use edgeroll::storage::layout::StorageLayout;
use edgeroll::storage::settings::{Role, Settings};
use edgeroll::utils::version_info;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file
    let settings_file = match cli_args.get("settings") {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };
    let mut settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file {}: {}", settings_file.path().display(), e);
                return;
            }
        }
    } else {
        Settings::default()
    };

    if let Some(role) = cli_args.get("role") {
        match role.parse::<Role>() {
            Ok(role) => settings.role = role,
            Err(e) => {
                eprintln!("{}", e);
                return;
            }
        }
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };
    if !settings_file.exists().await {
        warn!(
            "Settings file {} not found, using defaults",
            settings_file.path().display()
        );
    }

    let manifest = cli_args.get("manifest").map(PathBuf::from);
    let options = AppOptions::from_settings(&settings, layout);
    if manifest.is_some() && !options.runs_control() {
        error!("--manifest needs the control or standalone role");
        return;
    }

    info!("Running edgeroll {} with options: {:?}", version.version, options);
    let result = run(options, await_shutdown_signal(), move |state| async move {
        match manifest {
            Some(path) => submit_manifest(state, path).await,
            None => Ok(()),
        }
    })
    .await;
    if let Err(e) = result {
        error!("Failed to run edgeroll: {e}");
    }
}

/// Create and start the deployment described by the manifest at `path`
async fn submit_manifest(state: Arc<AppState>, path: PathBuf) -> Result<(), FleetError> {
    let control = state
        .control
        .as_ref()
        .ok_or_else(|| FleetError::ConfigError("no orchestrator in this role".to_string()))?;

    let data = tokio::fs::read(&path).await?;
    let deployment = control
        .orchestrator
        .create_deployment_from_manifest(&data, "cli")
        .await?;
    let deployment = control.orchestrator.start_deployment(&deployment.id).await?;
    info!(
        deployment = %deployment.id,
        name = %deployment.name,
        "Deployment from {} started",
        path.display()
    );
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Unable to install signal handlers, waiting for Ctrl+C only");
                    if tokio::signal::ctrl_c().await.is_err() {
                        error!("Failed to listen for Ctrl+C");
                    }
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
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Ctrl+C received, shutting down...");
    }
}
