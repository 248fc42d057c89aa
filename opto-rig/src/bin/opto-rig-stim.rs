use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use opto_rig::{
    config::{RigConfig, parse_config_file},
    logging::initiate_logging,
    metadata::StimulusMetadata,
    stimulus::{LogDisplay, StimulusPlan, StimulusSequencer},
};
use rig_pulse::{PulseDriver, PwmLed, sim::SimulatedDaio};
use rig_sync::SyncPublisher;

/// Time for already-running subscribers to connect after binding.
const SUBSCRIBER_GRACE: Duration = Duration::from_millis(500);

/// Run a stimulation protocol and tell the recorder when to record.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Rig configuration file (TOML). Defaults are used if not given.
    #[arg(short, long, env = "OPTO_RIG_CONFIG")]
    config: Option<PathBuf>,
    /// Endpoint to publish on, e.g. `tcp://0.0.0.0:5506`. Overrides the
    /// configuration.
    #[arg(long)]
    sync_endpoint: Option<String>,
    /// Present masks in the configured order instead of shuffling.
    #[arg(long)]
    no_shuffle: bool,
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

    let stim = &cfg.stimulus;
    let plan = if stim.shuffle && !cli.no_shuffle {
        StimulusPlan::shuffled(&stim.masks, stim.reps, &mut rand::rng())?
    } else {
        StimulusPlan::sequential(&stim.masks, stim.reps)?
    };
    let timing = stim.timing()?;

    let mut led = PwmLed::new(&cfg.led.name, SimulatedDaio::new(), cfg.led.pwm_channel);
    led.set_intensity(cfg.led.intensity)?;
    led.set_frequency(cfg.led.frequency_hz)?;

    let endpoint = cli.sync_endpoint.unwrap_or_else(|| cfg.sync.endpoint());
    let publisher = SyncPublisher::bind(&endpoint)
        .await
        .with_context(|| format!("binding {endpoint}"))?;
    let publisher = publisher.spawn();
    tokio::time::sleep(SUBSCRIBER_GRACE).await;

    let sequencer =
        StimulusSequencer::new(led, Box::new(LogDisplay), Box::new(publisher.sender()), timing)?;
    let run = sequencer.start(plan)?;
    let completions = run.completions();
    let mut done = tokio::task::spawn_blocking(move || completions.recv());

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            info!("interrupted, stopping after the current step");
            run.stop();
        }
        _ = &mut done => {}
    }
    let (sequencer, complete) = tokio::task::spawn_blocking(move || run.join()).await??;

    let metadata = StimulusMetadata::from_run(&complete, sequencer.timing(), sequencer.driver());
    info!("stimulus metadata: {}", serde_json::to_string(&metadata)?);

    // Holds a sender. The publisher only finishes once all are gone.
    drop(sequencer);
    publisher.shutdown().await;
    if !complete.completed() {
        warn!("run ended early: {:?}", complete.outcome);
    }
    complete.into_result()?;
    Ok(())
}
