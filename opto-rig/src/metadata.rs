//! Plain values describing a recording and a stimulation run, for export
//! alongside the video.

use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, TimeZone};

use rig_camera::CameraParam;
use rig_pulse::PulseDriver;

use crate::{
    AcquisitionWorker, Result,
    stimulus::{RunComplete, StimulusTiming},
};

/// Seconds since the unix epoch, with sub-second precision.
pub fn epoch_seconds<Tz: TimeZone>(t: &DateTime<Tz>) -> f64 {
    t.timestamp() as f64 + f64::from(t.timestamp_subsec_nanos()) * 1e-9
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct VideoSettings {
    pub fps: Option<f64>,
    pub exposure: Option<f64>,
    pub gain: Option<f64>,
    #[serde(rename = "frame_width")]
    pub width: Option<f64>,
    #[serde(rename = "frame_height")]
    pub height: Option<f64>,
    pub fourcc: Option<String>,
    #[serde(rename = "video_filename")]
    pub filename: Option<String>,
    pub directory: Option<PathBuf>,
    /// When frame writing began, in seconds since the epoch.
    #[serde(rename = "video_start")]
    pub video_start_time: Option<f64>,
}

impl VideoSettings {
    /// Current camera values and recording settings of `worker`.
    pub fn from_worker(worker: &AcquisitionWorker) -> Result<Self> {
        let controls = worker.camera_controls()?;
        let value = |p: CameraParam| {
            controls
                .iter()
                .find(|(param, _)| *param == p)
                .and_then(|(_, c)| c.map(|c| c.value))
        };
        let settings = worker.recording_settings();
        Ok(Self {
            fps: value(CameraParam::Framerate),
            exposure: value(CameraParam::Exposure),
            gain: value(CameraParam::Gain),
            width: value(CameraParam::Width),
            height: value(CameraParam::Height),
            fourcc: settings.fourcc.map(|f| f.to_string()),
            filename: settings.filename,
            directory: settings.directory,
            video_start_time: worker.video_start_time().as_ref().map(epoch_seconds),
        })
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StimulusMetadata {
    /// Seconds.
    pub interval: f64,
    pub mask_order: Vec<String>,
    pub mask_ids: Vec<u32>,
    pub completed: bool,
    pub led_name: String,
    pub pwm_frequency: f64,
    #[serde(rename = "pwm_duty_cycle")]
    pub duty_cycle: f64,
    /// Seconds since the epoch, one per delivered pulse.
    pub pulse_start: Vec<f64>,
    pub pulse_end: Vec<f64>,
    /// Seconds, measured on a monotonic clock.
    pub pulse_duration: Vec<f64>,
}

impl StimulusMetadata {
    pub fn from_run<D: PulseDriver>(
        complete: &RunComplete,
        timing: &StimulusTiming,
        driver: &D,
    ) -> Self {
        let trials = &complete.trials;
        Self {
            interval: timing.interval.as_secs_f64(),
            mask_order: complete.plan.mask_names(),
            mask_ids: complete.plan.mask_ids(),
            completed: complete.completed(),
            led_name: driver.name().to_string(),
            pwm_frequency: driver.frequency(),
            duty_cycle: driver.intensity(),
            pulse_start: trials.iter().map(|t| epoch_seconds(&t.pulse_start)).collect(),
            pulse_end: trials.iter().map(|t| epoch_seconds(&t.pulse_end)).collect(),
            pulse_duration: trials
                .iter()
                .map(|t| Duration::as_secs_f64(&t.pulse_duration))
                .collect(),
        }
    }
}
