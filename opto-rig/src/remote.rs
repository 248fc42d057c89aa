//! Recording driven by the stimulation controller over the sync channel.

use std::{sync::Arc, thread::JoinHandle};

use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};

use rig_sync::SyncMessage;

use crate::{AcquisitionState, AcquisitionWorker, Error, Result};

/// Filename prefix used when no filename was configured.
const DEFAULT_BASE_FILENAME: &str = "trial";

/// Applies sync messages to an [AcquisitionWorker], one at a time, in the
/// order received.
pub struct RemoteRecordingControl {
    worker: Arc<AcquisitionWorker>,
    base_filename: Option<String>,
}

impl RemoteRecordingControl {
    pub fn new(worker: Arc<AcquisitionWorker>) -> Self {
        Self {
            worker,
            base_filename: None,
        }
    }

    /// Act on one message.
    ///
    /// A trial index names the next recording `<base>_<index>`, where
    /// `<base>` is the filename configured when the first index arrived.
    pub fn apply(&mut self, msg: SyncMessage) -> Result<()> {
        match msg {
            SyncMessage::TrialIndex(index) => {
                let mut settings = self.worker.recording_settings();
                let base = self
                    .base_filename
                    .get_or_insert_with(|| {
                        settings
                            .filename
                            .clone()
                            .filter(|f| !f.is_empty())
                            .unwrap_or_else(|| DEFAULT_BASE_FILENAME.to_string())
                    })
                    .clone();
                settings.filename = Some(format!("{base}_{index}"));
                match self.worker.configure_recording(settings) {
                    Err(Error::InvalidTransition { .. }) => {
                        // The previous trial is still recording.
                        warn!("trial {index} arrived while recording, keeping current filename");
                        Ok(())
                    }
                    r => r,
                }
            }
            SyncMessage::StartRecording => {
                let t = self.worker.start_recording()?;
                info!("remote start, video start time {t}");
                Ok(())
            }
            SyncMessage::StopRecording => {
                if self.worker.state() != AcquisitionState::Recording {
                    debug!("STOP_RECORDING while not recording, ignored");
                }
                if let Some(session) = self.worker.stop_recording()? {
                    info!(
                        "remote stop, {} frames in \"{}\"",
                        session.frame_count,
                        session.path.display()
                    );
                }
                Ok(())
            }
        }
    }

    /// Apply every message from `rx` on a new thread until the channel
    /// disconnects. Failures are logged and do not end the loop.
    pub fn spawn(mut self, rx: Receiver<SyncMessage>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("remote-recording".to_string())
            .spawn(move || {
                for msg in rx.iter() {
                    debug!("sync message {msg}");
                    if let Err(e) = self.apply(msg) {
                        error!("applying {msg}: {e}");
                    }
                }
                debug!("sync channel closed");
            })
    }
}
