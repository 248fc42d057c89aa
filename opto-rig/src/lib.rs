//! Camera recording synchronized with optogenetic stimulation.
//!
//! A recording controller runs an [AcquisitionWorker] for its camera and
//! follows `START_RECORDING`/`STOP_RECORDING` messages through
//! [RemoteRecordingControl]. A stimulation controller runs a
//! [StimulusSequencer](stimulus::StimulusSequencer) which publishes those
//! messages around each LED pulse. The two may run on different hosts.

mod acquisition;
pub mod config;
mod error;
mod frame_source;
pub mod logging;
pub mod metadata;
mod remote;
pub mod stimulus;

pub use acquisition::{
    AcquisitionState, AcquisitionWorker, DEFAULT_DEVICE_SETTLE, DEFAULT_PREVIEW_CAPACITY,
    DEFAULT_QUEUE_SIZE, RecordingSession, WorkerEvent, WorkerOptions,
};
pub use error::{ConfigurationError, Error, ResourceError, Result};
pub use frame_source::FrameSource;
pub use remote::RemoteRecordingControl;
