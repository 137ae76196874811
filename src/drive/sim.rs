use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{check_pwm_args, DriveError, LedOutput, PwmOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmWrite {
    pub channel: u8,
    pub on: u16,
    pub off: u16,
}

/// PWM controller stand-in that logs and records every write.
///
/// Clones share the same record, so a test can keep one handle while the
/// car owns another.
#[derive(Debug, Clone, Default)]
pub struct SimPwm {
    writes: Arc<Mutex<Vec<PwmWrite>>>,
}

impl SimPwm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<PwmWrite> {
        self.writes.lock().clone()
    }

    /// Last `off` value written to `channel`, 0 if never written
    pub fn duty(&self, channel: u8) -> u16 {
        self.writes
            .lock()
            .iter()
            .rev()
            .find(|w| w.channel == channel)
            .map_or(0, |w| w.off)
    }
}

impl PwmOutput for SimPwm {
    fn set_pwm(&mut self, channel: u8, on: u16, off: u16) -> Result<(), DriveError> {
        check_pwm_args(channel, on, off)?;
        log::debug!("pwm ch{} on={} off={}", channel, on, off);
        self.writes.lock().push(PwmWrite { channel, on, off });
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimLed {
    on: Arc<AtomicBool>,
}

impl SimLed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Relaxed)
    }
}

impl LedOutput for SimLed {
    fn set(&mut self, on: bool) -> Result<(), DriveError> {
        log::debug!("led {}", if on { "on" } else { "off" });
        self.on.store(on, Ordering::Relaxed);
        Ok(())
    }
}
