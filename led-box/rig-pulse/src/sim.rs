//! An in-memory [DigitalAnalogIo] device which records every request.

use std::{sync::Arc, time::Instant};

use parking_lot::Mutex;

use crate::{DigitalAnalogIo, Error, Result, U3PwmConfig};

#[derive(Debug, Clone, PartialEq)]
pub enum DaioEvent {
    Digital {
        at: Instant,
        channel: u8,
        high: bool,
    },
    Pwm {
        at: Instant,
        channel: u8,
        /// `None` when the duty cycle was 0 and the line was driven low.
        config: Option<U3PwmConfig>,
    },
}

#[derive(Default)]
struct Inner {
    events: Vec<DaioEvent>,
    fail_next: Option<String>,
}

/// Shared view of the requests made to a [SimulatedDaio].
#[derive(Clone, Default)]
pub struct DaioLog {
    inner: Arc<Mutex<Inner>>,
}

impl DaioLog {
    pub fn events(&self) -> Vec<DaioEvent> {
        self.inner.lock().events.clone()
    }

    /// Make the next request fail with a hardware fault.
    pub fn fail_next(&self, msg: &str) {
        self.inner.lock().fail_next = Some(msg.to_string());
    }
}

/// Validates requests the way a LabJack U3 would and records them.
#[derive(Default)]
pub struct SimulatedDaio {
    log: DaioLog,
}

impl SimulatedDaio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> DaioLog {
        self.log.clone()
    }

    fn record(&mut self, event: DaioEvent) -> Result<()> {
        let mut inner = self.log.inner.lock();
        if let Some(msg) = inner.fail_next.take() {
            return Err(Error::Hardware(msg));
        }
        tracing::trace!("{event:?}");
        inner.events.push(event);
        Ok(())
    }
}

impl DigitalAnalogIo for SimulatedDaio {
    fn digital_write(&mut self, channel: u8, high: bool) -> Result<()> {
        self.record(DaioEvent::Digital {
            at: Instant::now(),
            channel,
            high,
        })
    }

    fn pwm(&mut self, channel: u8, duty_cycle: f64, frequency: f64) -> Result<()> {
        let config = U3PwmConfig::compute(duty_cycle, frequency)?;
        self.record(DaioEvent::Pwm {
            at: Instant::now(),
            channel,
            config,
        })
    }
}
