use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use opto_rig::{
    AcquisitionWorker, RemoteRecordingControl, WorkerEvent, WorkerOptions,
    config::{RigConfig, parse_config_file},
    logging::initiate_logging,
};
use rig_camera::{CameraModule, sim::SimCameraModule};
use rig_sync::SyncSubscriber;

/// Record camera video when the stimulation controller says so.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Rig configuration file (TOML). Defaults are used if not given.
    #[arg(short, long, env = "OPTO_RIG_CONFIG")]
    config: Option<PathBuf>,
    /// Sync endpoint of the stimulation controller, e.g.
    /// `tcp://stimhost:5506`. Overrides the configuration.
    #[arg(long)]
    sync_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => parse_config_file(path)
            .with_context(|| format!("reading config file \"{}\"", path.display()))?,
        None => RigConfig::default(),
    };
    let _guard =
        initiate_logging(cfg.logging.file.as_ref(), false).map_err(|e| anyhow::anyhow!(e))?;

    if cfg.camera.backend != "sim" {
        anyhow::bail!("camera backend \"{}\" is not available", cfg.camera.backend);
    }
    let mut module = SimCameraModule::new();
    let name = match &cfg.camera.name {
        Some(name) => name.clone(),
        None => module
            .camera_names()?
            .into_iter()
            .next()
            .context("no cameras found")?,
    };
    let options = WorkerOptions {
        device_settle: cfg.recording.device_settle(),
        queue_size: cfg.recording.queue_size,
        ..Default::default()
    };
    let worker = Arc::new(
        AcquisitionWorker::open(&mut module, &name, options)
            .with_context(|| format!("opening camera \"{name}\""))?,
    );
    for (param, value) in cfg.camera.params()? {
        worker
            .set_camera_param(param, value)
            .with_context(|| format!("setting {}", param.as_str()))?;
    }
    worker.configure_recording(cfg.recording.settings())?;

    let events = worker.subscribe_events();
    std::thread::Builder::new()
        .name("worker-events".to_string())
        .spawn(move || {
            for event in events.iter() {
                match event {
                    WorkerEvent::RecordingFailed(reason) => warn!("recording failed: {reason}"),
                    WorkerEvent::FrameError(_) => {}
                    event => info!("{event:?}"),
                }
            }
        })?;

    let endpoint = cli.sync_endpoint.unwrap_or_else(|| cfg.sync.endpoint());
    let subscriber = SyncSubscriber::connect(&endpoint)
        .await
        .with_context(|| format!("connecting to {endpoint}"))?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut sub_task = subscriber.spawn(tx);
    let remote = RemoteRecordingControl::new(worker.clone()).spawn(rx)?;
    info!("camera \"{name}\" waiting for commands from {endpoint}");

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            info!("interrupted, shutting down");
        }
        r = &mut sub_task => {
            r??;
            warn!("sync subscriber ended");
        }
    }
    sub_task.abort();
    // The subscriber task owned the sender, so this ends once it is gone.
    let _ = sub_task.await;
    if remote.join().is_err() {
        warn!("remote control thread panicked");
    }

    // Closes any open recording.
    drop(worker);
    Ok(())
}
