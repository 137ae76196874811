//! Hand-off between the HTTP command handlers and the control loop.
//!
//! Handlers post [`Intent`]s into a single-slot [`CommandMailbox`]; a newer
//! intent of the same kind replaces an older one that has not been consumed
//! yet. The control loop drains the mailbox once per tick and drives the car.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ControlConfig;
use crate::drive::{Car, DriveCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Drive(DriveCommand),
    ToggleLed,
    Buzz,
    Servo(u8),
}

/// Everything posted since the last tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Pending {
    pub drive: Option<DriveCommand>,
    pub toggle_led: bool,
    pub buzz: bool,
    pub servo: Option<u8>,
}

impl Pending {
    pub fn is_empty(&self) -> bool {
        *self == Pending::default()
    }
}

#[derive(Debug)]
pub struct CommandMailbox {
    slot: Mutex<Pending>,
    servo_target: AtomicU8,
}

impl CommandMailbox {
    pub fn new(servo_position: u8) -> Self {
        Self {
            slot: Mutex::new(Pending::default()),
            servo_target: AtomicU8::new(servo_position.min(100)),
        }
    }

    pub fn post(&self, intent: Intent) {
        let mut slot = self.slot.lock();
        match intent {
            Intent::Drive(cmd) => slot.drive = Some(cmd),
            Intent::ToggleLed => slot.toggle_led = true,
            Intent::Buzz => slot.buzz = true,
            Intent::Servo(pos) => {
                let pos = pos.min(100);
                slot.servo = Some(pos);
                self.servo_target.store(pos, Ordering::Relaxed);
            }
        }
    }

    /// Empties the slot and returns what was in it
    pub fn take(&self) -> Pending {
        std::mem::take(&mut *self.slot.lock())
    }

    /// Most recently requested servo position, consumed or not
    pub fn servo_target(&self) -> u8 {
        self.servo_target.load(Ordering::Relaxed)
    }
}

pub struct ControlLoop {
    mailbox: Arc<CommandMailbox>,
    car: Car,
    tick: Duration,
    buzz: Duration,
}

impl ControlLoop {
    pub fn new(mailbox: Arc<CommandMailbox>, car: Car, config: &ControlConfig) -> Self {
        Self {
            mailbox,
            car,
            tick: Duration::from_millis(config.tick_ms),
            buzz: Duration::from_millis(config.buzzer_ms),
        }
    }

    pub fn car(&self) -> &Car {
        &self.car
    }

    /// Applies whatever is pending. Output errors are logged; the loop goes on.
    pub fn tick(&mut self) {
        let pending = self.mailbox.take();
        if pending.is_empty() {
            return;
        }

        if let Some(cmd) = pending.drive {
            if self.car.drive() != Some(cmd) {
                log::info!("Drive: {}", cmd.as_str());
                if let Err(e) = self.car.apply_drive(cmd) {
                    log::error!("Failed to apply drive command '{}': {}", cmd.as_str(), e);
                }
            }
        }

        if pending.toggle_led {
            match self.car.toggle_led() {
                Ok(()) => log::info!("LED {}", if self.car.led_on() { "on" } else { "off" }),
                Err(e) => log::error!("Failed to toggle LED: {}", e),
            }
        }

        if let Some(pos) = pending.servo {
            if self.car.servo_position() != Some(pos) {
                log::info!("Servo: {}", pos);
                if let Err(e) = self.car.set_servo(pos) {
                    log::error!("Failed to move servo: {}", e);
                }
            }
        }

        if pending.buzz {
            if let Err(e) = self.beep() {
                log::error!("Buzzer failed: {}", e);
            }
        }
    }

    fn beep(&mut self) -> Result<(), crate::drive::DriveError> {
        self.car.buzzer(true)?;
        thread::sleep(self.buzz);
        self.car.buzzer(false)
    }

    /// Ticks until `running` is cleared, then stops the wheels.
    /// Blocks the calling thread; run it on the blocking pool.
    pub fn run(mut self, running: Arc<AtomicBool>) {
        log::info!("Control loop started ({}ms tick)", self.tick.as_millis());

        while running.load(Ordering::Relaxed) {
            let started = Instant::now();
            self.tick();
            thread::sleep(self.tick.saturating_sub(started.elapsed()));
        }

        if let Err(e) = self.car.apply_drive(DriveCommand::Stop) {
            log::error!("Failed to stop wheels on shutdown: {}", e);
        }
        log::info!("Control loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MotorConfig, ServoConfig};
    use crate::drive::{SimLed, SimPwm};

    fn control_loop() -> (ControlLoop, Arc<CommandMailbox>, SimPwm, SimLed) {
        let pwm = SimPwm::new();
        let led = SimLed::new();
        let mut car = Car::new(
            Box::new(pwm.clone()),
            Box::new(led.clone()),
            MotorConfig::default(),
            ServoConfig::default(),
        );
        car.init().unwrap();

        let mailbox = Arc::new(CommandMailbox::new(0));
        let config = ControlConfig {
            tick_ms: 1,
            buzzer_ms: 1,
        };
        let ctl = ControlLoop::new(Arc::clone(&mailbox), car, &config);
        (ctl, mailbox, pwm, led)
    }

    #[test]
    fn test_last_drive_command_wins() {
        let mailbox = CommandMailbox::new(0);
        mailbox.post(Intent::Drive(DriveCommand::Left));
        mailbox.post(Intent::Drive(DriveCommand::Right));
        mailbox.post(Intent::Drive(DriveCommand::Stop));

        assert_eq!(mailbox.take().drive, Some(DriveCommand::Stop));
        assert!(mailbox.take().is_empty());
    }

    #[test]
    fn test_flags_consumed_once() {
        let mailbox = CommandMailbox::new(0);
        mailbox.post(Intent::ToggleLed);
        mailbox.post(Intent::ToggleLed);
        mailbox.post(Intent::Buzz);

        let pending = mailbox.take();
        assert!(pending.toggle_led);
        assert!(pending.buzz);

        let pending = mailbox.take();
        assert!(!pending.toggle_led);
        assert!(!pending.buzz);
    }

    #[test]
    fn test_servo_target_survives_take() {
        let mailbox = CommandMailbox::new(20);
        assert_eq!(mailbox.servo_target(), 20);

        mailbox.post(Intent::Servo(150));
        assert_eq!(mailbox.take().servo, Some(100));
        assert_eq!(mailbox.servo_target(), 100);
    }

    #[test]
    fn test_tick_applies_pending_intents() {
        let (mut ctl, mailbox, pwm, led) = control_loop();

        mailbox.post(Intent::Drive(DriveCommand::Right));
        mailbox.post(Intent::ToggleLed);
        mailbox.post(Intent::Servo(75));
        ctl.tick();

        assert_eq!(ctl.car().drive(), Some(DriveCommand::Right));
        assert_eq!(pwm.duty(2), 2047);
        assert_eq!(pwm.duty(1), 0);
        assert!(led.is_on());
        assert_eq!(pwm.duty(4), 350);
        assert_eq!(ctl.car().servo_position(), Some(75));
    }

    #[test]
    fn test_repeated_command_not_rewritten() {
        let (mut ctl, mailbox, pwm, _) = control_loop();

        mailbox.post(Intent::Drive(DriveCommand::Left));
        ctl.tick();
        let writes = pwm.writes().len();

        mailbox.post(Intent::Drive(DriveCommand::Left));
        ctl.tick();
        assert_eq!(pwm.writes().len(), writes);
    }

    #[test]
    fn test_buzz_pulses_channel() {
        let (mut ctl, mailbox, pwm, _) = control_loop();

        mailbox.post(Intent::Buzz);
        ctl.tick();

        let buzzer: Vec<u16> =
            pwm.writes().iter().filter(|w| w.channel == 5).map(|w| w.off).collect();
        // init writes 0, then the pulse
        assert_eq!(buzzer, vec![0, 4095, 0]);
    }

    #[test]
    fn test_run_stops_wheels_on_exit() {
        let (ctl, mailbox, pwm, _) = control_loop();
        let running = Arc::new(AtomicBool::new(true));

        mailbox.post(Intent::Drive(DriveCommand::Forward));
        let flag = Arc::clone(&running);
        let handle = thread::spawn(move || ctl.run(flag));

        let deadline = Instant::now() + Duration::from_secs(2);
        while pwm.duty(2) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pwm.duty(2), 2047);

        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();
        assert_eq!(pwm.duty(2), 0);
        assert_eq!(pwm.duty(1), 0);
    }
}
