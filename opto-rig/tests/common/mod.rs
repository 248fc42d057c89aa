#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Local;
use parking_lot::Mutex;

use opto_rig::WorkerOptions;
use rig_camera::{Camera, CameraParam, Frame, PixelFormat};
use rig_pulse::{PulseDriver, PulseTiming};
use rig_video_writer::{EncoderFactory, EncoderSpec, FrameEncoder};

pub const WIDTH: u32 = 32;
pub const HEIGHT: u32 = 24;

/// What a [ScriptedCamera] was asked to do.
#[derive(Debug, Default)]
pub struct CameraLog {
    pub starts: usize,
    pub stops: usize,
}

/// Produces frames with consecutive indices while acquiring.
pub struct ScriptedCamera {
    limit: Option<u64>,
    period: Duration,
    fail_every: Option<u64>,
    next_index: u64,
    polls: u64,
    acquiring: bool,
    log: Arc<Mutex<CameraLog>>,
}

impl ScriptedCamera {
    /// `limit` frames in total, or without end if `None`, one per `period`.
    pub fn new(limit: Option<u64>, period: Duration) -> Self {
        Self {
            limit,
            period,
            fail_every: None,
            next_index: 0,
            polls: 0,
            acquiring: false,
            log: Default::default(),
        }
    }

    /// Every `n`th poll fails without consuming a frame.
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n);
        self
    }

    pub fn log(&self) -> Arc<Mutex<CameraLog>> {
        self.log.clone()
    }
}

impl Camera for ScriptedCamera {
    fn name(&self) -> &str {
        "scripted"
    }
    fn param(&self, param: CameraParam) -> rig_camera::Result<Option<f64>> {
        Ok(match param {
            CameraParam::Width => Some(WIDTH as f64),
            CameraParam::Height => Some(HEIGHT as f64),
            CameraParam::Framerate => Some(1.0 / self.period.as_secs_f64().max(1e-3)),
            _ => None,
        })
    }
    fn set_param(&mut self, param: CameraParam, _value: f64) -> rig_camera::Result<()> {
        Err(rig_camera::Error::ParamNotSupported(param))
    }
    fn param_range(&self, _param: CameraParam) -> Option<(f64, f64)> {
        None
    }
    fn param_increment(&self, _param: CameraParam) -> Option<f64> {
        None
    }
    fn acquisition_start(&mut self) -> rig_camera::Result<()> {
        self.acquiring = true;
        self.log.lock().starts += 1;
        Ok(())
    }
    fn acquisition_stop(&mut self) -> rig_camera::Result<()> {
        self.acquiring = false;
        self.log.lock().stops += 1;
        Ok(())
    }
    fn next_frame(&mut self) -> rig_camera::Result<Option<Frame>> {
        if !self.acquiring {
            return Err("not acquiring".into());
        }
        self.polls += 1;
        if let Some(n) = self.fail_every {
            if self.polls % n == 0 {
                return Err(format!("poll {} failed", self.polls).into());
            }
        }
        std::thread::sleep(self.period);
        if self.limit.is_some_and(|limit| self.next_index >= limit) {
            return Ok(None);
        }
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(Frame {
            index,
            timestamp: chrono::Utc::now(),
            width: WIDTH,
            height: HEIGHT,
            pixel_format: PixelFormat::Mono8,
            data: vec![(index % 256) as u8; (WIDTH * HEIGHT) as usize],
        }))
    }
}

/// Everything written through a [CountingEncoderFactory].
#[derive(Debug, Default)]
pub struct EncoderLog {
    pub opened: Vec<PathBuf>,
    pub finished: usize,
    /// Frame indices per opened encoder.
    pub frames: Vec<Vec<u64>>,
}

#[derive(Default)]
pub struct CountingEncoderFactory {
    pub log: Arc<Mutex<EncoderLog>>,
}

struct CountingEncoder {
    path: PathBuf,
    slot: usize,
    done: bool,
    log: Arc<Mutex<EncoderLog>>,
}

impl EncoderFactory for CountingEncoderFactory {
    fn open(&self, spec: &EncoderSpec) -> rig_video_writer::Result<Box<dyn FrameEncoder>> {
        let mut log = self.log.lock();
        log.opened.push(spec.path.clone());
        log.frames.push(Vec::new());
        Ok(Box::new(CountingEncoder {
            path: spec.path.clone(),
            slot: log.frames.len() - 1,
            done: false,
            log: self.log.clone(),
        }))
    }
}

impl FrameEncoder for CountingEncoder {
    fn path(&self) -> &Path {
        &self.path
    }
    fn write_frame(&mut self, frame: &Frame) -> rig_video_writer::Result<()> {
        self.log.lock().frames[self.slot].push(frame.index);
        Ok(())
    }
    fn finish(&mut self) -> rig_video_writer::Result<()> {
        if !self.done {
            self.done = true;
            self.log.lock().finished += 1;
        }
        Ok(())
    }
}

pub fn fast_options(factory: Arc<dyn EncoderFactory>) -> WorkerOptions {
    WorkerOptions {
        device_settle: Duration::from_millis(10),
        queue_size: 4,
        encoder_factory: factory,
    }
}

/// A [PulseDriver] which sleeps for the pulse and can fail on request.
pub struct FakeLed {
    intensity: f64,
    frequency: f64,
    pulses: usize,
    fail_at: Option<usize>,
}

impl FakeLed {
    pub fn new() -> Self {
        Self {
            intensity: 0.5,
            frequency: 1000.0,
            pulses: 0,
            fail_at: None,
        }
    }

    /// Pulse number `n` (counting from 0) reports a hardware fault.
    pub fn failing_at(n: usize) -> Self {
        Self {
            fail_at: Some(n),
            ..Self::new()
        }
    }

    pub fn pulses(&self) -> usize {
        self.pulses
    }
}

impl PulseDriver for FakeLed {
    fn name(&self) -> &str {
        "fake LED"
    }
    fn set_intensity(&mut self, intensity: f64) -> rig_pulse::Result<()> {
        self.intensity = intensity;
        Ok(())
    }
    fn intensity(&self) -> f64 {
        self.intensity
    }
    fn set_frequency(&mut self, hz: f64) -> rig_pulse::Result<()> {
        self.frequency = hz;
        Ok(())
    }
    fn frequency(&self) -> f64 {
        self.frequency
    }
    fn pulse(&mut self, duration: Duration) -> rig_pulse::Result<PulseTiming> {
        let n = self.pulses;
        self.pulses += 1;
        if self.fail_at == Some(n) {
            return Err(rig_pulse::Error::Hardware("LED driver not responding".into()));
        }
        let t0 = Instant::now();
        let start = Local::now();
        std::thread::sleep(duration);
        Ok(PulseTiming {
            start,
            end: Local::now(),
            duration: t0.elapsed(),
        })
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
