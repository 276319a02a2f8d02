use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use replay_recorder::configuration::ReplayOptions;
use replay_recorder::context::{Clock, TokioClock};
use replay_recorder::delivery::{FileTransport, HttpTransport, Transport};
use replay_recorder::recording::ScriptedRecorder;
use replay_recorder::storage::{FileSessionStorage, MemorySessionStorage, SessionStorage};
use replay_recorder::{ReplayContext, ReplayController, StopOptions};

#[derive(Parser)]
#[command(name = "replay-recorder")]
#[command(version)]
#[command(about = "Records a DOM recorder trace into replay segments")]
struct Args {
    /// Recorder trace, one JSON entry per line
    #[arg(short, long)]
    trace: PathBuf,

    /// TOML options file
    #[arg(short, long, env = "REPLAY_CONFIG")]
    config: Option<PathBuf>,

    /// Directory receiving one file per envelope
    #[arg(short, long, conflicts_with = "endpoint")]
    out: Option<PathBuf>,

    /// Envelope endpoint URL
    #[arg(short, long, env = "REPLAY_ENDPOINT")]
    endpoint: Option<String>,

    /// Directory for the sticky session. Defaults to $REPLAY_STORAGE_DIR,
    /// kept in memory when neither is set
    #[arg(long)]
    storage_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    let options = match &args.config {
        Some(path) => ReplayOptions::from_file(path).unwrap_or_else(|e| {
            error!("Unable to import configuration from {}: {}", path.display(), e);
            std::process::exit(1);
        }),
        None => {
            info!("No configuration file given, using defaults");
            ReplayOptions::default()
        }
    };

    let transport: Arc<dyn Transport> = match (&args.endpoint, &args.out) {
        (Some(endpoint), _) => match HttpTransport::new(endpoint.as_str()) {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                error!("Unable to create HTTP transport: {}", e);
                std::process::exit(1);
            }
        },
        (None, out) => {
            let dir = out.clone().unwrap_or_else(|| PathBuf::from("replay-envelopes"));
            match FileTransport::new(&dir) {
                Ok(transport) => Arc::new(transport),
                Err(e) => {
                    error!("Unable to write envelopes to {}: {}", dir.display(), e);
                    std::process::exit(1);
                }
            }
        }
    };

    let file_storage = match &args.storage_dir {
        Some(dir) => FileSessionStorage::new(dir).map(Some),
        None => FileSessionStorage::from_env(),
    };
    let storage: Arc<dyn SessionStorage> = match file_storage {
        Ok(Some(storage)) => Arc::new(storage),
        Ok(None) => Arc::new(MemorySessionStorage::new()),
        Err(e) => {
            warn!("Falling back to in-memory session storage: {}", e);
            Arc::new(MemorySessionStorage::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());
    let recorder = match ScriptedRecorder::from_file(&args.trace, Arc::clone(&clock)) {
        Ok(recorder) => Arc::new(recorder),
        Err(e) => {
            error!("Unable to load trace {}: {}", args.trace.display(), e);
            std::process::exit(1);
        }
    };
    info!("Loaded {} trace event(s)", recorder.len());

    let context = ReplayContext::new(storage, transport, recorder.clone()).with_clock(clock);
    let controller = ReplayController::new(options, context).unwrap_or_else(|e| {
        error!("Unable to create a controller instance: {}, exiting...", e);
        std::process::exit(1);
    });

    controller.start().await;
    if !controller.is_enabled().await {
        error!("Replay did not start, exiting...");
        std::process::exit(1);
    }

    tokio::select! {
        _ = recorder.finished() => info!("Trace finished"),
        _ = wait_until_inactive(&controller) => warn!("Replay stopped or paused before the trace finished"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    controller
        .stop(StopOptions {
            force_flush: true,
            reason: Some("shutdown".to_string()),
        })
        .await;
    info!("Replay recorder exiting");
}

/// Resolves once the controller stopped or paused itself.
async fn wait_until_inactive(controller: &ReplayController) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        if !controller.is_enabled().await || controller.is_paused().await {
            return;
        }
    }
}
