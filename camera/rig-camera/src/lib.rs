//! Camera capability traits used by the opto-rig acquisition engine.
//!
//! Concrete camera bindings (vendor SDKs) implement [Camera] and
//! [CameraModule]. The [sim] module provides a synthetic camera which is used
//! when no hardware backend is available.

use std::fmt;

pub mod sim;

// ---------------------------
// errors

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Timeout")]
    Timeout,
    #[error("CameraError({msg})")]
    CameraError { msg: String },
    #[error("camera \"{name}\" could not be opened: {msg}")]
    OpenFailed { name: String, msg: String },
    #[error("parameter {0} not supported by this camera")]
    ParamNotSupported(CameraParam),
    #[error("value {value} for {param} outside range [{min}, {max}]")]
    OutOfRange {
        param: CameraParam,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

impl<'a> From<&'a str> for Error {
    fn from(orig: &'a str) -> Error {
        Error::CameraError {
            msg: orig.to_string(),
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Error {
        Error::CameraError { msg }
    }
}

// ---------------------------
// Frame

/// Pixel layout of a [Frame] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8 bits per pixel, single channel.
    Mono8,
    /// 24 bits per pixel, interleaved R, G, B.
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }
    pub fn is_color(&self) -> bool {
        matches!(self, PixelFormat::Rgb8)
    }
}

/// An image acquired from a camera.
///
/// Rows are tightly packed: the stride is `width * bytes_per_pixel`.
#[derive(Clone)]
pub struct Frame {
    /// Frame number as counted by the camera backend. Monotonically
    /// increasing for the lifetime of the camera.
    pub index: u64,
    /// Wall-clock time at which the host received the frame.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn stride(&self) -> usize {
        self.width as usize * self.pixel_format.bytes_per_pixel()
    }

    /// A frame without pixel data, as returned by some drivers when no image
    /// was ready. Such frames are never forwarded downstream.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("timestamp", &self.timestamp)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &self.pixel_format)
            .finish_non_exhaustive()
    }
}

// ---------------------------
// Parameters

/// The adjustable camera parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CameraParam {
    /// frames per second
    Framerate,
    /// microseconds
    Exposure,
    /// dB
    Gain,
    OffsetX,
    OffsetY,
    Height,
    Width,
}

impl CameraParam {
    pub const ALL: [CameraParam; 7] = [
        CameraParam::Framerate,
        CameraParam::Exposure,
        CameraParam::Gain,
        CameraParam::OffsetX,
        CameraParam::OffsetY,
        CameraParam::Height,
        CameraParam::Width,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CameraParam::Framerate => "framerate",
            CameraParam::Exposure => "exposure",
            CameraParam::Gain => "gain",
            CameraParam::OffsetX => "offsetX",
            CameraParam::OffsetY => "offsetY",
            CameraParam::Height => "height",
            CameraParam::Width => "width",
        }
    }

    /// Region-of-interest parameters only take integer values.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            CameraParam::OffsetX | CameraParam::OffsetY | CameraParam::Height | CameraParam::Width
        )
    }
}

impl fmt::Display for CameraParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CameraParam {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        CameraParam::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::from(format!("unknown camera parameter \"{s}\"")))
    }
}

/// Everything a user interface needs to present one parameter control.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamControl {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub increment: f64,
}

impl ParamControl {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

// ---------------------------
// CameraModule

/// A module for opening cameras of one backend.
pub trait CameraModule: Send {
    type CameraType: Camera;

    fn name(&self) -> &str;
    fn camera_names(&self) -> Result<Vec<String>>;
    /// Open the named camera. Failure here is fatal for the caller.
    fn camera(&mut self, name: &str) -> Result<Self::CameraType>;
}

// ---------------------------
// Camera

pub trait Camera: Send {
    fn name(&self) -> &str;

    /// Current value of `param`, or `None` if the camera does not expose it.
    fn param(&self, param: CameraParam) -> Result<Option<f64>>;
    fn set_param(&mut self, param: CameraParam, value: f64) -> Result<()>;
    /// `None` means the parameter is not adjustable.
    fn param_range(&self, param: CameraParam) -> Option<(f64, f64)>;
    /// `None` means the parameter is not adjustable.
    fn param_increment(&self, param: CameraParam) -> Option<f64>;

    /// The control description for `param`, if value, range and increment are
    /// all available. A `None` here means the control must be disabled.
    fn param_control(&self, param: CameraParam) -> Option<ParamControl> {
        let value = self.param(param).ok().flatten()?;
        let (min, max) = self.param_range(param)?;
        let increment = self.param_increment(param)?;
        Some(ParamControl {
            value,
            min,
            max,
            increment,
        })
    }

    /// Image width in pixels
    fn width(&self) -> Result<u32> {
        let w = self
            .param(CameraParam::Width)?
            .ok_or(Error::ParamNotSupported(CameraParam::Width))?;
        Ok(w as u32)
    }
    /// Image height in pixels
    fn height(&self) -> Result<u32> {
        let h = self
            .param(CameraParam::Height)?
            .ok_or(Error::ParamNotSupported(CameraParam::Height))?;
        Ok(h as u32)
    }
    fn framerate(&self) -> Result<f64> {
        self.param(CameraParam::Framerate)?
            .ok_or(Error::ParamNotSupported(CameraParam::Framerate))
    }
    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Mono8
    }

    // Acquisition ----------------------------
    fn acquisition_start(&mut self) -> Result<()>;
    fn acquisition_stop(&mut self) -> Result<()>;

    /// Synchronous (blocking) frame acquisition.
    ///
    /// Returns `Ok(None)` if the device had no frame ready.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

impl<C: Camera + ?Sized> Camera for Box<C> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn param(&self, param: CameraParam) -> Result<Option<f64>> {
        (**self).param(param)
    }
    fn set_param(&mut self, param: CameraParam, value: f64) -> Result<()> {
        (**self).set_param(param, value)
    }
    fn param_range(&self, param: CameraParam) -> Option<(f64, f64)> {
        (**self).param_range(param)
    }
    fn param_increment(&self, param: CameraParam) -> Option<f64> {
        (**self).param_increment(param)
    }
    fn param_control(&self, param: CameraParam) -> Option<ParamControl> {
        (**self).param_control(param)
    }
    fn width(&self) -> Result<u32> {
        (**self).width()
    }
    fn height(&self) -> Result<u32> {
        (**self).height()
    }
    fn framerate(&self) -> Result<f64> {
        (**self).framerate()
    }
    fn pixel_format(&self) -> PixelFormat {
        (**self).pixel_format()
    }
    fn acquisition_start(&mut self) -> Result<()> {
        (**self).acquisition_start()
    }
    fn acquisition_stop(&mut self) -> Result<()> {
        (**self).acquisition_stop()
    }
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn param_names_roundtrip() {
        for p in CameraParam::ALL {
            let parsed: CameraParam = p.as_str().parse().unwrap();
            assert_eq!(parsed, p);
        }
        assert!("brightness".parse::<CameraParam>().is_err());
    }

    #[test]
    fn empty_frame_detected() {
        let frame = Frame {
            index: 0,
            timestamp: chrono::Utc::now(),
            width: 4,
            height: 2,
            pixel_format: PixelFormat::Mono8,
            data: vec![],
        };
        assert!(frame.is_empty());
        assert_eq!(frame.stride(), 4);
    }
}
