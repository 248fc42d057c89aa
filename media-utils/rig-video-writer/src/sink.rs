use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use rig_camera::{Frame, PixelFormat};
use tracing::{debug, info};

use crate::{
    CONTAINER_EXTENSION, DefaultEncoderFactory, EncoderFactory, EncoderSpec, Error, Fourcc,
    FrameEncoder, Result,
};

/// What to record and where. All fields must be set before a recording can
/// be opened.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordingSettings {
    /// Base name of the output file, without extension.
    pub filename: Option<String>,
    /// Nominal frame rate written into the container.
    pub fps: Option<f64>,
    pub fourcc: Option<Fourcc>,
    pub directory: Option<PathBuf>,
}

impl RecordingSettings {
    /// Check that every field is set and sane.
    ///
    /// Fields are checked in the order filename, fps, fourcc, directory and
    /// the first missing one is reported.
    pub fn validate(&self) -> Result<()> {
        self.resolve().map(|_| ())
    }

    /// The full path of the container file, `<directory>/<filename>.avi`.
    pub fn output_path(&self) -> Result<PathBuf> {
        self.resolve().map(|r| r.path)
    }

    fn resolve(&self) -> Result<Resolved> {
        let filename = self
            .filename
            .as_deref()
            .filter(|f| !f.is_empty())
            .ok_or(Error::MissingField("filename"))?;
        let fps = self.fps.ok_or(Error::MissingField("fps"))?;
        if !(fps.is_finite() && fps > 0.0) {
            return Err(Error::InvalidSetting {
                field: "fps",
                reason: format!("{fps} is not a positive number"),
            });
        }
        let fourcc = self.fourcc.ok_or(Error::MissingField("fourcc"))?;
        let directory = self
            .directory
            .as_ref()
            .ok_or(Error::MissingField("directory"))?;
        if !directory.is_dir() {
            return Err(Error::DirectoryNotWritable(directory.clone()));
        }
        let suffix = format!(".{CONTAINER_EXTENSION}");
        let name = if filename.to_ascii_lowercase().ends_with(&suffix) {
            filename.to_string()
        } else {
            format!("{filename}{suffix}")
        };
        Ok(Resolved {
            path: directory.join(name),
            fps,
            fourcc,
        })
    }
}

struct Resolved {
    path: PathBuf,
    fps: f64,
    fourcc: Fourcc,
}

/// What was written during one recording.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SessionSummary {
    pub path: PathBuf,
    pub frame_count: u64,
    pub first_frame_index: Option<u64>,
    pub last_frame_index: Option<u64>,
}

struct OpenRecording {
    encoder: Box<dyn FrameEncoder>,
    summary: SessionSummary,
}

/// Writes frames of one recording session into a video container.
///
/// At most one recording is open at a time. Configuration cannot change
/// while a recording is open.
pub struct RecordingSink {
    settings: RecordingSettings,
    factory: Arc<dyn EncoderFactory>,
    open: Option<OpenRecording>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(DefaultEncoderFactory))
    }

    pub fn with_factory(factory: Arc<dyn EncoderFactory>) -> Self {
        Self {
            settings: RecordingSettings::default(),
            factory,
            open: None,
        }
    }

    pub fn configure(&mut self, settings: RecordingSettings) -> Result<()> {
        if self.open.is_some() {
            return Err(Error::AlreadyOpen);
        }
        debug!("recording settings: {settings:?}");
        self.settings = settings;
        Ok(())
    }

    pub fn settings(&self) -> &RecordingSettings {
        &self.settings
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Path of the open recording, if any.
    pub fn path(&self) -> Option<&Path> {
        self.open.as_ref().map(|o| o.summary.path.as_path())
    }

    /// Create the output file for frames of the given geometry.
    ///
    /// Nothing is created if the settings are incomplete.
    pub fn open(&mut self, width: u32, height: u32, pixel_format: PixelFormat) -> Result<PathBuf> {
        if self.open.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let Resolved { path, fps, fourcc } = self.settings.resolve()?;
        let spec = EncoderSpec {
            width,
            height,
            fps,
            fourcc,
            is_color: pixel_format.is_color(),
            path: path.clone(),
        };
        let encoder = self.factory.open(&spec).map_err(|e| match e {
            Error::IoError { source } if source.kind() == std::io::ErrorKind::PermissionDenied => {
                Error::DirectoryNotWritable(
                    path.parent().map(Path::to_path_buf).unwrap_or_default(),
                )
            }
            e => e,
        })?;
        info!(
            "recording {width}x{height} at {fps} fps ({fourcc}) to \"{}\"",
            path.display()
        );
        self.open = Some(OpenRecording {
            encoder,
            summary: SessionSummary {
                path: path.clone(),
                frame_count: 0,
                first_frame_index: None,
                last_frame_index: None,
            },
        });
        Ok(path)
    }

    pub fn write(&mut self, frame: &Frame) -> Result<()> {
        let open = self.open.as_mut().ok_or(Error::NotOpen)?;
        open.encoder.write_frame(frame)?;
        let s = &mut open.summary;
        s.frame_count += 1;
        s.first_frame_index.get_or_insert(frame.index);
        s.last_frame_index = Some(frame.index);
        Ok(())
    }

    /// Finalize the container. Returns `None` if nothing was open.
    ///
    /// The sink is closed afterwards even if finalizing failed.
    pub fn close(&mut self) -> Result<Option<SessionSummary>> {
        let Some(mut open) = self.open.take() else {
            return Ok(None);
        };
        open.encoder.finish()?;
        info!(
            "closed \"{}\" after {} frames",
            open.summary.path.display(),
            open.summary.frame_count
        );
        Ok(Some(open.summary))
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("while closing recording: {e}");
        }
    }
}
