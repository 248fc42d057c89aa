use std::time::Duration;

use crate::acquisition::AcquisitionState;

/// A request which cannot run with the current configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("missing required field \"{0}\"")]
    MissingField(&'static str),
    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("stimulus plan is empty")]
    EmptyPlan,
    #[error("cannot shuffle without adjacent repeats: only one distinct mask")]
    SingleDistinctMask,
    #[error("cannot shuffle without adjacent repeats: mask {id} makes up {count} of {total} trials")]
    UnsatisfiableOrder { id: u32, count: usize, total: usize },
    #[error("interval {interval:?} is shorter than the recording duration {recording:?}")]
    IntervalShorterThanRecording {
        interval: Duration,
        recording: Duration,
    },
}

/// A device or encoder could not be opened.
#[derive(thiserror::Error, Debug)]
pub enum ResourceError {
    #[error("camera: {0}")]
    Camera(#[from] rig_camera::Error),
    #[error("encoder: {0}")]
    Encoder(rig_video_writer::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),
    #[error("run error: {0}")]
    Run(#[from] rig_pulse::Error),
    #[error("sync error: {0}")]
    Sync(#[from] rig_sync::Error),
    #[error("cannot {requested} while {state:?}")]
    InvalidTransition {
        state: AcquisitionState,
        requested: &'static str,
    },
    #[error("worker disconnected")]
    WorkerDisconnected,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rig_video_writer::Error> for Error {
    fn from(e: rig_video_writer::Error) -> Self {
        match e {
            rig_video_writer::Error::MissingField(name) => {
                Error::Configuration(ConfigurationError::MissingField(name))
            }
            rig_video_writer::Error::InvalidSetting { field, reason } => {
                Error::Configuration(ConfigurationError::InvalidValue { field, reason })
            }
            e => Error::Resource(ResourceError::Encoder(e)),
        }
    }
}

impl From<rig_camera::Error> for Error {
    fn from(e: rig_camera::Error) -> Self {
        Error::Resource(ResourceError::Camera(e))
    }
}

impl Error {
    /// True for errors caused by the request rather than by a device.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}
