use crate::{Result, check_frequency, check_intensity};

const CLOCK_HZ: f64 = 48e6;
/// Above this the 16-bit timer cannot be clocked fast enough.
const MAX_16BIT_HZ: f64 = 732.42;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TimerMode {
    Pwm16Bit,
    Pwm8Bit,
}

impl TimerMode {
    /// Register value selecting this mode.
    pub fn register_value(&self) -> u8 {
        match self {
            TimerMode::Pwm16Bit => 0,
            TimerMode::Pwm8Bit => 1,
        }
    }

    fn bits(&self) -> i32 {
        match self {
            TimerMode::Pwm16Bit => 16,
            TimerMode::Pwm8Bit => 8,
        }
    }
}

/// Timer settings producing a PWM output on a LabJack U3 class device with
/// the 48 MHz clock base and divisor enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct U3PwmConfig {
    pub mode: TimerMode,
    /// 1..=255, with 0 meaning 256.
    pub clock_divisor: u8,
    /// Fraction of the period spent low, scaled to 16 bits.
    pub value: u16,
}

impl U3PwmConfig {
    /// Returns `None` for a duty cycle of 0: the timer cannot fully turn off
    /// so the line must be driven low digitally instead.
    pub fn compute(duty_cycle: f64, frequency: f64) -> Result<Option<Self>> {
        check_intensity(duty_cycle)?;
        check_frequency(frequency)?;
        if duty_cycle == 0.0 {
            return Ok(None);
        }
        let mode = if frequency > MAX_16BIT_HZ {
            TimerMode::Pwm8Bit
        } else {
            TimerMode::Pwm16Bit
        };
        let divisor = (CLOCK_HZ / (frequency * 2f64.powi(mode.bits()))) as u32;
        let clock_divisor = if divisor >= 256 { 0 } else { divisor as u8 };
        let value = (65535.0 * (1.0 - duty_cycle)) as u16;
        Ok(Some(Self {
            mode,
            clock_divisor,
            value,
        }))
    }

    /// The PWM frequency actually produced.
    pub fn effective_frequency(&self) -> f64 {
        let divisor = if self.clock_divisor == 0 {
            256.0
        } else {
            self.clock_divisor as f64
        };
        CLOCK_HZ / (divisor * 2f64.powi(self.mode.bits()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Error;

    #[test]
    fn mode_follows_frequency() {
        let c = U3PwmConfig::compute(0.5, 732.42).unwrap().unwrap();
        assert_eq!(c.mode, TimerMode::Pwm16Bit);
        assert_eq!(c.clock_divisor, 1);
        assert_eq!(c.value, 32767);

        let c = U3PwmConfig::compute(0.5, 1000.0).unwrap().unwrap();
        assert_eq!(c.mode, TimerMode::Pwm8Bit);
        assert_eq!(c.clock_divisor, 187);
        assert!((c.effective_frequency() - 1002.67).abs() < 0.01);
    }

    #[test]
    fn lowest_frequency_uses_divisor_256() {
        let c = U3PwmConfig::compute(1.0, 2.861).unwrap().unwrap();
        assert_eq!(c.clock_divisor, 0);
        assert_eq!(c.value, 0);
    }

    #[test]
    fn zero_duty_is_no_timer() {
        assert_eq!(U3PwmConfig::compute(0.0, 100.0).unwrap(), None);
    }

    #[test]
    fn out_of_range() {
        assert_eq!(
            U3PwmConfig::compute(1.5, 100.0),
            Err(Error::IntensityOutOfRange(1.5))
        );
        assert_eq!(
            U3PwmConfig::compute(0.5, 200_000.0),
            Err(Error::FrequencyOutOfRange(200_000.0))
        );
        assert!(U3PwmConfig::compute(0.5, 1.0).is_err());
    }
}
