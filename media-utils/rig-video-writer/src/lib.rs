//! Video recording for the opto-rig acquisition engine.
//!
//! A [RecordingSink] owns the lifecycle of one output file. The encoding
//! itself happens in a [FrameEncoder], chosen from the requested [Fourcc] by
//! an [EncoderFactory]. [BgRecordingWriter] moves an open sink onto its own
//! thread so that encoding does not run on the camera poll loop.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use rig_camera::{Frame, PixelFormat};

mod avi;
mod ffmpeg;
mod sink;
mod writer_thread;

pub use avi::AviWriter;
pub use ffmpeg::FfmpegEncoder;
pub use sink::{RecordingSettings, RecordingSink, SessionSummary};
pub use writer_thread::BgRecordingWriter;

/// File extension of every container written by this crate.
pub const CONTAINER_EXTENSION: &str = "avi";

/// Possible errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("recording not configured: missing {0}")]
    MissingField(&'static str),
    #[error("invalid {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
    #[error("invalid fourcc \"{0}\": expected four ASCII characters")]
    InvalidFourcc(String),
    #[error("unsupported codec {0}")]
    UnsupportedCodec(Fourcc),
    #[error("codec {0} cannot store color frames")]
    ColorNotSupported(Fourcc),
    #[error("output directory {0} is not a writable directory")]
    DirectoryNotWritable(PathBuf),
    #[error("frame is {got_width}x{got_height} {got_format:?}, encoder expects {width}x{height} {format:?}")]
    FrameMismatch {
        width: u32,
        height: u32,
        format: PixelFormat,
        got_width: u32,
        got_height: u32,
        got_format: PixelFormat,
    },
    #[error("AVI file would exceed 4 GiB")]
    FileTooLarge,
    #[error("ffmpeg error ({status}): {stderr}")]
    FfmpegError {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("recording already open")]
    AlreadyOpen,
    #[error("recording not open")]
    NotOpen,
    #[error("already done")]
    AlreadyDone,
    #[error("WorkerDisconnected")]
    WorkerDisconnected,
}

pub type Result<T> = std::result::Result<T, Error>;

// ---------------------------
// Fourcc

/// A four-character code identifying a video codec.
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fourcc([u8; 4]);

impl Fourcc {
    pub const fn new(code: [u8; 4]) -> Self {
        Self(code)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// How frames in this codec are written.
    pub fn codec(&self) -> Codec {
        match &self.0 {
            b"Y800" | b"GREY" => Codec::Raw(RawLayout::Y800),
            b"DIB " => Codec::Raw(RawLayout::Dib),
            b"XVID" => Codec::Ffmpeg(&["-c:v", "mpeg4", "-vtag", "xvid", "-q:v", "2"]),
            b"MP4V" => Codec::Ffmpeg(&["-c:v", "mpeg4", "-q:v", "2"]),
            b"MJPG" => Codec::Ffmpeg(&["-c:v", "mjpeg", "-q:v", "2"]),
            b"H264" => Codec::Ffmpeg(&["-c:v", "libx264", "-preset", "fast"]),
            b"FFV1" => Codec::Ffmpeg(&["-c:v", "ffv1"]),
            _ => Codec::Unsupported,
        }
    }
}

impl FromStr for Fourcc {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return Err(Error::InvalidFourcc(s.to_string()));
        }
        let mut code = [0u8; 4];
        for (dest, src) in code.iter_mut().zip(bytes) {
            *dest = src.to_ascii_uppercase();
        }
        Ok(Self(code))
    }
}

impl TryFrom<String> for Fourcc {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Fourcc> for String {
    fn from(f: Fourcc) -> String {
        f.to_string()
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Constructed from ASCII only.
        f.write_str(std::str::from_utf8(&self.0).unwrap_or("????"))
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fourcc({self})")
    }
}

/// Uncompressed layouts written directly by [AviWriter].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawLayout {
    /// 8-bit luma, top-down rows.
    Y800,
    /// Windows DIB, bottom-up rows padded to 4 bytes. 8-bit paletted gray or
    /// 24-bit BGR.
    Dib,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Raw(RawLayout),
    /// Encoded by an `ffmpeg` child process with these codec arguments.
    Ffmpeg(&'static [&'static str]),
    Unsupported,
}

// ---------------------------
// Encoder

/// Everything needed to create an encoder.
#[derive(Debug, Clone)]
pub struct EncoderSpec {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub fourcc: Fourcc,
    pub is_color: bool,
    pub path: PathBuf,
}

impl EncoderSpec {
    pub fn pixel_format(&self) -> PixelFormat {
        if self.is_color {
            PixelFormat::Rgb8
        } else {
            PixelFormat::Mono8
        }
    }

    pub(crate) fn check_frame(&self, frame: &Frame) -> Result<()> {
        if frame.width != self.width
            || frame.height != self.height
            || frame.pixel_format != self.pixel_format()
        {
            return Err(Error::FrameMismatch {
                width: self.width,
                height: self.height,
                format: self.pixel_format(),
                got_width: frame.width,
                got_height: frame.height,
                got_format: frame.pixel_format,
            });
        }
        Ok(())
    }
}

/// A video encoder producing one container file.
pub trait FrameEncoder: Send {
    fn path(&self) -> &Path;
    /// Append one frame.
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
    /// Flush everything and finalize the container. Further calls do nothing.
    fn finish(&mut self) -> Result<()>;
}

/// Creates encoders. Injected into [RecordingSink] so tests can observe
/// encoder usage.
pub trait EncoderFactory: Send + Sync {
    fn open(&self, spec: &EncoderSpec) -> Result<Box<dyn FrameEncoder>>;
}

/// Chooses [AviWriter] or [FfmpegEncoder] from the fourcc.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEncoderFactory;

impl EncoderFactory for DefaultEncoderFactory {
    fn open(&self, spec: &EncoderSpec) -> Result<Box<dyn FrameEncoder>> {
        match spec.fourcc.codec() {
            Codec::Raw(layout) => Ok(Box::new(AviWriter::create(spec.clone(), layout)?)),
            Codec::Ffmpeg(args) => Ok(Box::new(FfmpegEncoder::spawn(spec.clone(), args)?)),
            Codec::Unsupported => Err(Error::UnsupportedCodec(spec.fourcc)),
        }
    }
}

/// Returns true if an `ffmpeg` executable can be run.
pub fn ffmpeg_available() -> bool {
    std::process::Command::new("ffmpeg")
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
