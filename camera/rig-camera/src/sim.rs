//! A synthetic camera producing moving-gradient mono8 frames.
//!
//! Frames are paced at the configured framerate, so the acquisition engine
//! sees the same blocking behaviour it would see with a hardware device.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::{Camera, CameraModule, CameraParam, Error, Frame, PixelFormat, Result};

const SENSOR_WIDTH: u32 = 648;
const SENSOR_HEIGHT: u32 = 488;

pub struct SimCameraModule {
    names: Vec<String>,
}

impl SimCameraModule {
    pub fn new() -> Self {
        Self {
            names: vec!["sim-0".to_string()],
        }
    }
}

impl Default for SimCameraModule {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraModule for SimCameraModule {
    type CameraType = SimCamera;

    fn name(&self) -> &str {
        "sim"
    }

    fn camera_names(&self) -> Result<Vec<String>> {
        Ok(self.names.clone())
    }

    fn camera(&mut self, name: &str) -> Result<SimCamera> {
        if !self.names.iter().any(|n| n == name) {
            return Err(Error::OpenFailed {
                name: name.to_string(),
                msg: format!("no such camera, available: {:?}", self.names),
            });
        }
        Ok(SimCamera::new(name))
    }
}

pub struct SimCamera {
    name: String,
    framerate: f64,
    exposure: f64,
    gain: f64,
    offset_x: u32,
    offset_y: u32,
    width: u32,
    height: u32,
    acquiring: bool,
    next_index: u64,
    next_deadline: Option<Instant>,
}

impl SimCamera {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            framerate: 100.0,
            exposure: 4500.0,
            gain: 0.0,
            offset_x: 0,
            offset_y: 0,
            width: SENSOR_WIDTH,
            height: SENSOR_HEIGHT,
            acquiring: false,
            next_index: 0,
            next_deadline: None,
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.framerate)
    }

    fn render(&self, index: u64) -> Vec<u8> {
        let w = self.width as usize;
        let h = self.height as usize;
        let shift = (index % 256) as usize;
        let mut data = vec![0u8; w * h];
        for (row_idx, row) in data.chunks_exact_mut(w).enumerate() {
            for (col_idx, px) in row.iter_mut().enumerate() {
                *px = ((col_idx + row_idx + shift) % 256) as u8;
            }
        }
        data
    }
}

impl Camera for SimCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn param(&self, param: CameraParam) -> Result<Option<f64>> {
        use CameraParam::*;
        Ok(Some(match param {
            Framerate => self.framerate,
            Exposure => self.exposure,
            Gain => self.gain,
            OffsetX => self.offset_x as f64,
            OffsetY => self.offset_y as f64,
            Height => self.height as f64,
            Width => self.width as f64,
        }))
    }

    fn set_param(&mut self, param: CameraParam, value: f64) -> Result<()> {
        let (min, max) = self
            .param_range(param)
            .ok_or(Error::ParamNotSupported(param))?;
        if !(min..=max).contains(&value) {
            return Err(Error::OutOfRange {
                param,
                value,
                min,
                max,
            });
        }
        use CameraParam::*;
        match param {
            Framerate => self.framerate = value,
            Exposure => self.exposure = value,
            Gain => self.gain = value,
            OffsetX => self.offset_x = value as u32,
            OffsetY => self.offset_y = value as u32,
            Height => self.height = value as u32,
            Width => self.width = value as u32,
        }
        debug!("{}: set {param} to {value}", self.name);
        Ok(())
    }

    fn param_range(&self, param: CameraParam) -> Option<(f64, f64)> {
        use CameraParam::*;
        Some(match param {
            Framerate => (1.0, 500.0),
            Exposure => (10.0, 1_000_000.0),
            Gain => (0.0, 24.0),
            OffsetX => (0.0, (SENSOR_WIDTH - self.width) as f64),
            OffsetY => (0.0, (SENSOR_HEIGHT - self.height) as f64),
            Height => (16.0, (SENSOR_HEIGHT - self.offset_y) as f64),
            Width => (16.0, (SENSOR_WIDTH - self.offset_x) as f64),
        })
    }

    fn param_increment(&self, param: CameraParam) -> Option<f64> {
        use CameraParam::*;
        Some(match param {
            Framerate | Gain => 0.1,
            Exposure => 1.0,
            OffsetX | Width => 4.0,
            OffsetY | Height => 2.0,
        })
    }

    fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Mono8
    }

    fn acquisition_start(&mut self) -> Result<()> {
        self.acquiring = true;
        self.next_deadline = Some(Instant::now() + self.frame_interval());
        Ok(())
    }

    fn acquisition_stop(&mut self) -> Result<()> {
        self.acquiring = false;
        self.next_deadline = None;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.acquiring {
            return Err("acquisition not started".into());
        }
        let deadline = self
            .next_deadline
            .unwrap_or_else(|| Instant::now() + self.frame_interval());
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        // Do not accumulate a backlog if the consumer was slow.
        self.next_deadline = Some(deadline.max(now) + self.frame_interval());

        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(Frame {
            index,
            timestamp: chrono::Utc::now(),
            width: self.width,
            height: self.height,
            pixel_format: PixelFormat::Mono8,
            data: self.render(index),
        }))
    }
}
