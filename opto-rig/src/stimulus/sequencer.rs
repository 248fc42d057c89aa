use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use rig_pulse::PulseDriver;
use rig_sync::{SyncMessage, SyncPublish};

use super::{Mask, StimulusPlan};
use crate::{ConfigurationError, Error, ResourceError, Result};

/// Wait between `START_RECORDING` and the mask exposure. Must exceed the
/// recorder's device settle delay so the stimulus is on video. The
/// recorder runs on its own host, so [RigConfig::validate] can only check
/// this when both controllers read the same configuration file.
///
/// [RigConfig::validate]: crate::config::RigConfig::validate
pub const DEFAULT_RECORDING_LEAD: Duration = Duration::from_secs(2);
/// Wait between exposing a mask and pulsing the LED, for the projector to
/// show it.
pub const DEFAULT_DISPLAY_SETTLE: Duration = Duration::from_secs(1);
/// Wait after the last trial, covering trailing frames.
pub const DEFAULT_DRAIN_DELAY: Duration = Duration::from_secs(2);

/// Upper bound on how long `stop()` takes to end a wait.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StimulusTiming {
    pub pulse_duration: Duration,
    /// Time from the pulse to `STOP_RECORDING`.
    pub recording_duration: Duration,
    /// Time from one `STOP_RECORDING` to the next is
    /// `interval - recording_duration`.
    pub interval: Duration,
    pub recording_lead: Duration,
    pub display_settle: Duration,
    pub drain: Duration,
}

impl StimulusTiming {
    pub fn new(pulse_duration: Duration, recording_duration: Duration, interval: Duration) -> Self {
        Self {
            pulse_duration,
            recording_duration,
            interval,
            recording_lead: DEFAULT_RECORDING_LEAD,
            display_settle: DEFAULT_DISPLAY_SETTLE,
            drain: DEFAULT_DRAIN_DELAY,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        if self.pulse_duration.is_zero() {
            return Err(ConfigurationError::InvalidValue {
                field: "pulse_duration",
                reason: "must be positive".into(),
            });
        }
        if self.interval < self.recording_duration {
            return Err(ConfigurationError::IntervalShorterThanRecording {
                interval: self.interval,
                recording: self.recording_duration,
            });
        }
        Ok(())
    }

    /// The wait after `STOP_RECORDING`.
    pub fn post_recording_wait(&self) -> Duration {
        self.interval.saturating_sub(self.recording_duration)
    }
}

/// The projector which shows the masks.
///
/// Both calls are fire-and-forget. The display settle delay is the only
/// synchronization with the actual display update.
pub trait MaskDisplay: Send {
    fn expose(&mut self, mask: &Mask);
    fn clear(&mut self);
}

/// A [MaskDisplay] which only logs.
#[derive(Debug, Default)]
pub struct LogDisplay;

impl MaskDisplay for LogDisplay {
    fn expose(&mut self, mask: &Mask) {
        info!("expose mask {} ({})", mask.id, mask.name);
    }
    fn clear(&mut self) {
        info!("clear display");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    Expose(Mask),
    Clear,
}

/// Forwards display requests to whoever drives the projector.
impl MaskDisplay for Sender<DisplayEvent> {
    fn expose(&mut self, mask: &Mask) {
        if self.send(DisplayEvent::Expose(mask.clone())).is_err() {
            warn!("display gone, mask {} not shown", mask.id);
        }
    }
    fn clear(&mut self) {
        let _ = self.send(DisplayEvent::Clear);
    }
}

/// One executed trial.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TrialRecord {
    pub trial_index: u32,
    pub mask_id: u32,
    pub mask_name: String,
    pub pulse_start: DateTime<Local>,
    pub pulse_end: DateTime<Local>,
    pub pulse_duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    /// The LED driver failed. The run stopped at the failing trial.
    Failed(rig_pulse::Error),
}

/// Sent once at the end of every run, however it ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunComplete {
    pub outcome: RunOutcome,
    pub plan: StimulusPlan,
    /// One record per pulse delivered, in trial order.
    pub trials: Vec<TrialRecord>,
}

impl RunComplete {
    pub fn completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    /// The trial history, or the hardware fault which ended the run.
    pub fn into_result(self) -> Result<Vec<TrialRecord>> {
        match self.outcome {
            RunOutcome::Failed(e) => Err(Error::Run(e)),
            RunOutcome::Completed | RunOutcome::Cancelled => Ok(self.trials),
        }
    }
}

/// Runs stimulus plans on one LED driver.
///
/// [start](Self::start) moves the sequencer onto its run thread and
/// [RunHandle::join] gives it back, so a driver is never used by two runs
/// at once.
pub struct StimulusSequencer<D> {
    driver: D,
    display: Box<dyn MaskDisplay>,
    publisher: Box<dyn SyncPublish>,
    timing: StimulusTiming,
}

impl<D: PulseDriver + 'static> StimulusSequencer<D> {
    pub fn new(
        driver: D,
        display: Box<dyn MaskDisplay>,
        publisher: Box<dyn SyncPublish>,
        timing: StimulusTiming,
    ) -> Result<Self> {
        timing.validate()?;
        Ok(Self {
            driver,
            display,
            publisher,
            timing,
        })
    }

    pub fn timing(&self) -> &StimulusTiming {
        &self.timing
    }

    pub fn set_timing(&mut self, timing: StimulusTiming) -> Result<()> {
        timing.validate()?;
        self.timing = timing;
        Ok(())
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Start executing `plan` on a new thread.
    pub fn start(self, plan: StimulusPlan) -> Result<RunHandle<D>> {
        if plan.is_empty() {
            return Err(ConfigurationError::EmptyPlan.into());
        }
        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let join = std::thread::Builder::new()
            .name("stimulus-sequencer".to_string())
            .spawn({
                let cancel = cancel.clone();
                let mut this = self;
                move || {
                    let complete = this.run(plan, &cancel);
                    // The handle may already be gone.
                    let _ = done_tx.send(complete.clone());
                    (this, complete)
                }
            })
            .map_err(ResourceError::Io)?;
        Ok(RunHandle {
            cancel,
            done_rx,
            join,
        })
    }

    fn run(&mut self, plan: StimulusPlan, cancel: &AtomicBool) -> RunComplete {
        info!(
            "starting stimulation: {} trials, masks {:?}",
            plan.len(),
            plan.mask_ids()
        );
        let mut trials = Vec::with_capacity(plan.len());
        let mut outcome = RunOutcome::Completed;
        for (i, mask) in plan.trials().iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                outcome = RunOutcome::Cancelled;
                break;
            }
            match self.run_trial(i as u32, mask, cancel, &mut trials) {
                Ok(true) => {}
                Ok(false) => {
                    outcome = RunOutcome::Cancelled;
                    break;
                }
                Err(e) => {
                    error!("trial {i}: {e}");
                    outcome = RunOutcome::Failed(e);
                    break;
                }
            }
        }
        if outcome == RunOutcome::Completed {
            debug!("waiting {:?} for trailing frames", self.timing.drain);
            if !wait(self.timing.drain, cancel) {
                // All trials are done. Only the drain was cut short.
                debug!("drain delay cancelled");
            }
        }
        self.display.clear();
        info!(
            "stimulation ended ({outcome:?}) after {} of {} trials",
            trials.len(),
            plan.len()
        );
        RunComplete {
            outcome,
            plan,
            trials,
        }
    }

    /// Returns `Ok(false)` if cancelled. `STOP_RECORDING` is published
    /// however the trial ends.
    fn run_trial(
        &mut self,
        index: u32,
        mask: &Mask,
        cancel: &AtomicBool,
        trials: &mut Vec<TrialRecord>,
    ) -> std::result::Result<bool, rig_pulse::Error> {
        info!("trial {index}: mask {} ({})", mask.id, mask.name);
        self.publish(SyncMessage::TrialIndex(index));
        self.publish(SyncMessage::StartRecording);
        let presented = self.present(index, mask, cancel, trials);
        self.publish(SyncMessage::StopRecording);
        if !presented? {
            return Ok(false);
        }
        Ok(wait(self.timing.post_recording_wait(), cancel))
    }

    fn present(
        &mut self,
        index: u32,
        mask: &Mask,
        cancel: &AtomicBool,
        trials: &mut Vec<TrialRecord>,
    ) -> std::result::Result<bool, rig_pulse::Error> {
        if !wait(self.timing.recording_lead, cancel) {
            return Ok(false);
        }
        self.display.expose(mask);
        if !wait(self.timing.display_settle, cancel) {
            return Ok(false);
        }
        // Not interruptible.
        let timing = self.driver.pulse(self.timing.pulse_duration)?;
        debug!(
            "trial {index}: pulse {} .. {} ({:?})",
            timing.start, timing.end, timing.duration
        );
        trials.push(TrialRecord {
            trial_index: index,
            mask_id: mask.id,
            mask_name: mask.name.clone(),
            pulse_start: timing.start,
            pulse_end: timing.end,
            pulse_duration: timing.duration,
        });
        Ok(wait(self.timing.recording_duration, cancel))
    }

    fn publish(&self, msg: SyncMessage) {
        // Best effort: nobody acknowledges these.
        if let Err(e) = self.publisher.publish(msg) {
            warn!("publishing {msg}: {e}");
        }
    }
}

/// Sleep for `d` in slices. Returns `false` as soon as `cancel` is set.
fn wait(d: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + d;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(WAIT_SLICE));
    }
}

/// A running stimulation.
pub struct RunHandle<D> {
    cancel: Arc<AtomicBool>,
    done_rx: Receiver<RunComplete>,
    join: JoinHandle<(StimulusSequencer<D>, RunComplete)>,
}

impl<D> RunHandle<D> {
    /// Ask the run to stop after the current step. A pulse in progress is
    /// completed first.
    pub fn stop(&self) {
        info!("stimulation stop requested");
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Receives the [RunComplete] once the run ends.
    pub fn completions(&self) -> Receiver<RunComplete> {
        self.done_rx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to end and get the sequencer back.
    pub fn join(self) -> Result<(StimulusSequencer<D>, RunComplete)> {
        self.join.join().map_err(|_| {
            error!("stimulus thread panicked");
            Error::WorkerDisconnected
        })
    }
}
