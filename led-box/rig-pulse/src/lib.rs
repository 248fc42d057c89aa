//! Timed LED pulses for optogenetic stimulation.
//!
//! A [PulseDriver] switches a light source on for a fixed duration and
//! reports when it did so. [PwmLed] implements it on top of any
//! [DigitalAnalogIo] device by using a PWM output whose duty cycle sets the
//! LED intensity.

use std::time::Duration;

use chrono::{DateTime, Local};

mod pwm_led;
pub mod sim;
mod u3;

pub use pwm_led::PwmLed;
pub use u3::{TimerMode, U3PwmConfig};

/// Lowest PWM frequency reachable with the 48 MHz timer clock.
pub const MIN_FREQUENCY_HZ: f64 = 2.861;
/// Highest PWM frequency reachable with the 48 MHz timer clock.
pub const MAX_FREQUENCY_HZ: f64 = 187_500.0;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("intensity {0} outside [0, 1]")]
    IntensityOutOfRange(f64),
    #[error("frequency {0} Hz outside [{MIN_FREQUENCY_HZ}, {MAX_FREQUENCY_HZ}] Hz")]
    FrequencyOutOfRange(f64),
    #[error("hardware fault: {0}")]
    Hardware(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// When a pulse happened.
///
/// `start` and `end` are wall-clock anchors for aligning with video frames.
/// `duration` is measured on a monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct PulseTiming {
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    pub duration: Duration,
}

/// A light source which can be pulsed.
pub trait PulseDriver: Send {
    fn name(&self) -> &str;
    /// Set the intensity, from 0 (off) to 1 (full).
    fn set_intensity(&mut self, intensity: f64) -> Result<()>;
    fn intensity(&self) -> f64;
    fn set_frequency(&mut self, hz: f64) -> Result<()>;
    fn frequency(&self) -> f64;
    /// Switch on, block for `duration`, switch off.
    fn pulse(&mut self, duration: Duration) -> Result<PulseTiming>;
}

impl<D: PulseDriver + ?Sized> PulseDriver for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn set_intensity(&mut self, intensity: f64) -> Result<()> {
        (**self).set_intensity(intensity)
    }
    fn intensity(&self) -> f64 {
        (**self).intensity()
    }
    fn set_frequency(&mut self, hz: f64) -> Result<()> {
        (**self).set_frequency(hz)
    }
    fn frequency(&self) -> f64 {
        (**self).frequency()
    }
    fn pulse(&mut self, duration: Duration) -> Result<PulseTiming> {
        (**self).pulse(duration)
    }
}

/// A digital-analog I/O board.
pub trait DigitalAnalogIo: Send {
    fn digital_write(&mut self, channel: u8, high: bool) -> Result<()>;
    /// Start PWM output on `channel`. A duty cycle of 0 drives the line low.
    fn pwm(&mut self, channel: u8, duty_cycle: f64, frequency: f64) -> Result<()>;
}

pub(crate) fn check_intensity(intensity: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&intensity) {
        return Err(Error::IntensityOutOfRange(intensity));
    }
    Ok(())
}

pub(crate) fn check_frequency(hz: f64) -> Result<()> {
    if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
        return Err(Error::FrequencyOutOfRange(hz));
    }
    Ok(())
}
