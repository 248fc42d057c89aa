//! Timed mask presentations with LED pulses.
//!
//! Each trial is bracketed by `START_RECORDING` and `STOP_RECORDING` on the
//! sync channel so that a remote recorder captures the pulse with lead and
//! lag time on either side.

mod plan;
mod sequencer;

pub use plan::{Mask, StimulusPlan};
pub use sequencer::{
    DEFAULT_DISPLAY_SETTLE, DEFAULT_DRAIN_DELAY, DEFAULT_RECORDING_LEAD, DisplayEvent, LogDisplay,
    MaskDisplay, RunComplete, RunHandle, RunOutcome, StimulusSequencer, StimulusTiming,
    TrialRecord,
};
