//! Rig configuration, read from a TOML file.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration for the simulated hardware.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use rig_camera::CameraParam;
use rig_video_writer::{Fourcc, RecordingSettings};

use crate::{
    ConfigurationError, DEFAULT_DEVICE_SETTLE, DEFAULT_QUEUE_SIZE,
    stimulus::{
        DEFAULT_DISPLAY_SETTLE, DEFAULT_DRAIN_DELAY, DEFAULT_RECORDING_LEAD, Mask, StimulusTiming,
    },
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),
    #[error(transparent)]
    Invalid(#[from] ConfigurationError),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const DEFAULT_SYNC_HOST: &str = "127.0.0.1";
pub const DEFAULT_SYNC_PORT: u16 = 5506;
pub const DEFAULT_PWM_CHANNEL: u8 = 6;

fn default_backend() -> String {
    "sim".to_string()
}

fn default_sync_host() -> String {
    DEFAULT_SYNC_HOST.to_string()
}

const fn default_sync_port() -> u16 {
    DEFAULT_SYNC_PORT
}

const fn default_device_settle_ms() -> u64 {
    DEFAULT_DEVICE_SETTLE.as_millis() as u64
}

const fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

const fn default_reps() -> usize {
    1
}

const fn default_true() -> bool {
    true
}

const fn default_pulse_duration_ms() -> u64 {
    1000
}

const fn default_recording_duration_s() -> f64 {
    5.0
}

const fn default_interval_s() -> f64 {
    10.0
}

const fn default_recording_lead_ms() -> u64 {
    DEFAULT_RECORDING_LEAD.as_millis() as u64
}

const fn default_display_settle_ms() -> u64 {
    DEFAULT_DISPLAY_SETTLE.as_millis() as u64
}

const fn default_drain_ms() -> u64 {
    DEFAULT_DRAIN_DELAY.as_millis() as u64
}

fn default_led_name() -> String {
    "LED".to_string()
}

const fn default_pwm_channel() -> u8 {
    DEFAULT_PWM_CHANNEL
}

const fn default_intensity() -> f64 {
    1.0
}

const fn default_frequency_hz() -> f64 {
    1000.0
}

#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RigConfig {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub stimulus: StimulusConfig,
    #[serde(default)]
    pub led: LedConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Camera to open. If not set, the first camera found.
    #[serde(default)]
    pub name: Option<String>,
    /// Initial values, keyed by parameter name (e.g. `exposure`, `offsetX`).
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            name: None,
            params: BTreeMap::new(),
        }
    }
}

impl CameraConfig {
    pub fn params(&self) -> std::result::Result<Vec<(CameraParam, f64)>, ConfigurationError> {
        self.params
            .iter()
            .map(|(name, value)| {
                let param = name
                    .parse()
                    .map_err(|e: rig_camera::Error| ConfigurationError::InvalidValue {
                        field: "camera.params",
                        reason: e.to_string(),
                    })?;
                Ok((param, *value))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordingConfig {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub fourcc: Option<Fourcc>,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_device_settle_ms")]
    pub device_settle_ms: u64,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            filename: None,
            fps: None,
            fourcc: None,
            directory: None,
            device_settle_ms: default_device_settle_ms(),
            queue_size: default_queue_size(),
        }
    }
}

impl RecordingConfig {
    pub fn settings(&self) -> RecordingSettings {
        RecordingSettings {
            filename: self.filename.clone(),
            fps: self.fps,
            fourcc: self.fourcc,
            directory: self.directory.clone(),
        }
    }

    pub fn device_settle(&self) -> Duration {
        Duration::from_millis(self.device_settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default = "default_sync_host")]
    pub host: String,
    #[serde(default = "default_sync_port")]
    pub port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            host: default_sync_host(),
            port: default_sync_port(),
        }
    }
}

impl SyncConfig {
    pub fn endpoint(&self) -> String {
        rig_sync::endpoint(&self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StimulusConfig {
    #[serde(default)]
    pub masks: Vec<Mask>,
    #[serde(default = "default_reps")]
    pub reps: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default = "default_pulse_duration_ms")]
    pub pulse_duration_ms: u64,
    #[serde(default = "default_recording_duration_s")]
    pub recording_duration_s: f64,
    #[serde(default = "default_interval_s")]
    pub interval_s: f64,
    #[serde(default = "default_recording_lead_ms")]
    pub recording_lead_ms: u64,
    #[serde(default = "default_display_settle_ms")]
    pub display_settle_ms: u64,
    #[serde(default = "default_drain_ms")]
    pub drain_ms: u64,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            masks: Vec::new(),
            reps: default_reps(),
            shuffle: true,
            pulse_duration_ms: default_pulse_duration_ms(),
            recording_duration_s: default_recording_duration_s(),
            interval_s: default_interval_s(),
            recording_lead_ms: default_recording_lead_ms(),
            display_settle_ms: default_display_settle_ms(),
            drain_ms: default_drain_ms(),
        }
    }
}

fn seconds(field: &'static str, s: f64) -> std::result::Result<Duration, ConfigurationError> {
    Duration::try_from_secs_f64(s).map_err(|e| ConfigurationError::InvalidValue {
        field,
        reason: format!("{s}: {e}"),
    })
}

impl StimulusConfig {
    /// The validated timing of a run.
    pub fn timing(&self) -> std::result::Result<StimulusTiming, ConfigurationError> {
        let timing = StimulusTiming {
            pulse_duration: Duration::from_millis(self.pulse_duration_ms),
            recording_duration: seconds(
                "stimulus.recording_duration_s",
                self.recording_duration_s,
            )?,
            interval: seconds("stimulus.interval_s", self.interval_s)?,
            recording_lead: Duration::from_millis(self.recording_lead_ms),
            display_settle: Duration::from_millis(self.display_settle_ms),
            drain: Duration::from_millis(self.drain_ms),
        };
        timing.validate()?;
        Ok(timing)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedConfig {
    #[serde(default = "default_led_name")]
    pub name: String,
    #[serde(default = "default_pwm_channel")]
    pub pwm_channel: u8,
    #[serde(default = "default_intensity")]
    pub intensity: f64,
    #[serde(default = "default_frequency_hz")]
    pub frequency_hz: f64,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            name: default_led_name(),
            pwm_channel: default_pwm_channel(),
            intensity: default_intensity(),
            frequency_hz: default_frequency_hz(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Expand `~` and environment variables, then resolve relative to `dirname`.
fn fixup_relative_path(path: &mut PathBuf, dirname: &Path) -> Result<()> {
    let pathstr = path
        .as_os_str()
        .to_str()
        .ok_or_else(|| Error::NonUtf8Path(path.clone()))?;
    let expanded = shellexpand::full(pathstr)?;
    *path = PathBuf::from(expanded.to_string());

    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

impl RigConfig {
    fn fixup_relative_paths(&mut self, orig_path: &Path) -> Result<()> {
        let dirname = orig_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        if let Some(directory) = self.recording.directory.as_mut() {
            fixup_relative_path(directory, &dirname)?;
        }
        if let Some(file) = self.logging.file.as_mut() {
            fixup_relative_path(file, &dirname)?;
        }
        Ok(())
    }

    /// Check everything which can be checked without opening hardware.
    pub fn validate(&self) -> Result<()> {
        self.camera.params()?;
        self.stimulus.timing()?;
        if self.stimulus.recording_lead_ms <= self.recording.device_settle_ms {
            return Err(ConfigurationError::InvalidValue {
                field: "stimulus.recording_lead_ms",
                reason: format!(
                    "{} ms must exceed recording.device_settle_ms ({} ms)",
                    self.stimulus.recording_lead_ms, self.recording.device_settle_ms
                ),
            }
            .into());
        }
        if let Some(fps) = self.recording.fps {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(ConfigurationError::InvalidValue {
                    field: "recording.fps",
                    reason: format!("{fps} is not a positive number"),
                }
                .into());
            }
        }
        if self.recording.queue_size == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "recording.queue_size",
                reason: "must be at least 1".into(),
            }
            .into());
        }
        if !(0.0..=1.0).contains(&self.led.intensity) {
            return Err(ConfigurationError::InvalidValue {
                field: "led.intensity",
                reason: format!("{} outside [0, 1]", self.led.intensity),
            }
            .into());
        }
        Ok(())
    }
}

pub fn parse_config_file<P: AsRef<Path>>(fname: P) -> Result<RigConfig> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    let mut cfg: RigConfig = toml::from_str(&contents)?;
    cfg.fixup_relative_paths(fname.as_ref())?;
    cfg.validate()?;
    Ok(cfg)
}
