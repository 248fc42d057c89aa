use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, error};

use crate::{
    DigitalAnalogIo, Error, PulseDriver, PulseTiming, Result, check_frequency, check_intensity,
};

/// An LED on a PWM output of a [DigitalAnalogIo] device.
///
/// The intensity is the PWM duty cycle.
pub struct PwmLed<D> {
    name: String,
    io: D,
    channel: u8,
    intensity: f64,
    frequency: f64,
}

impl<D: DigitalAnalogIo> PwmLed<D> {
    /// The LED starts at full intensity with a 1 kHz PWM.
    pub fn new(name: &str, io: D, channel: u8) -> Self {
        Self {
            name: name.to_string(),
            io,
            channel,
            intensity: 1.0,
            frequency: 1000.0,
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn io(&self) -> &D {
        &self.io
    }

    pub fn into_inner(self) -> D {
        self.io
    }
}

impl<D: DigitalAnalogIo> PulseDriver for PwmLed<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_intensity(&mut self, intensity: f64) -> Result<()> {
        check_intensity(intensity)?;
        self.intensity = intensity;
        Ok(())
    }

    fn intensity(&self) -> f64 {
        self.intensity
    }

    fn set_frequency(&mut self, hz: f64) -> Result<()> {
        check_frequency(hz)?;
        self.frequency = hz;
        Ok(())
    }

    fn frequency(&self) -> f64 {
        self.frequency
    }

    fn pulse(&mut self, duration: Duration) -> Result<PulseTiming> {
        let t0 = Instant::now();
        let start = Local::now();
        self.io.pwm(self.channel, self.intensity, self.frequency)?;
        let deadline = t0 + duration;
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        if let Err(e) = self.io.digital_write(self.channel, false) {
            error!("{}: could not switch off channel {}: {e}", self.name, self.channel);
            return Err(Error::Hardware(format!("switching off failed: {e}")));
        }
        let end = Local::now();
        let elapsed = t0.elapsed();
        debug!(
            "{}: pulse {:?} at intensity {} ({} Hz)",
            self.name, elapsed, self.intensity, self.frequency
        );
        Ok(PulseTiming {
            start,
            end,
            duration: elapsed,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{DaioEvent, SimulatedDaio};

    #[test_log::test]
    fn pulse_switches_on_then_off() {
        let daio = SimulatedDaio::new();
        let log = daio.log();
        let mut led = PwmLed::new("blue", daio, 4);
        led.set_intensity(0.25).unwrap();
        led.set_frequency(500.0).unwrap();
        let timing = led.pulse(Duration::from_millis(30)).unwrap();
        assert!(timing.duration >= Duration::from_millis(30));
        assert!(timing.end >= timing.start);

        let events = log.events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            DaioEvent::Pwm {
                channel, config, ..
            } => {
                assert_eq!(*channel, 4);
                assert_eq!(config.unwrap().value, 49151);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            events[1],
            DaioEvent::Digital {
                channel: 4,
                high: false,
                ..
            }
        ));
    }

    #[test]
    fn settings_validated() {
        let mut led = PwmLed::new("blue", SimulatedDaio::new(), 4);
        assert!(led.set_intensity(-0.1).is_err());
        assert!(led.set_frequency(1e6).is_err());
        assert_eq!(led.intensity(), 1.0);
        assert_eq!(led.frequency(), 1000.0);
    }

    #[test]
    fn fault_during_pulse_reported() {
        let daio = SimulatedDaio::new();
        daio.log().fail_next("cable unplugged");
        let mut led = PwmLed::new("blue", daio, 4);
        let err = led.pulse(Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, Error::Hardware(_)));
    }
}
