// src/hardware/simulated.rs - In-process stepper model for tests and dry runs
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;

use super::{HardwareError, MotorHandle, MotorRegistry};

/// Observable state of a simulated stepper driver.
#[derive(Debug, Clone)]
pub struct SimulatedMotorState {
    pub serial_number: String,
    pub current_position: i32,
    pub target_position: i32,
    pub energized: bool,
    /// Tic drivers latch safe-start on energize; no motion until it is cleared.
    pub safe_start_latched: bool,
    pub current_limit: u8,
    pub max_speed: u32,
    /// Steps travelled per position read. `i32::MAX` arrives instantly.
    pub steps_per_poll: i32,
    /// Maximum landing error in steps. Applied once per commanded move; the
    /// following reads correct onto the target.
    pub landing_noise: i32,
    landed: bool,
    pub disconnected: bool,
    pub halt_count: u32,
    pub targets: Vec<i32>,
}

/// Stepper driver that moves a fixed number of steps every time its position
/// is read.
///
/// Clones share state, so tests keep one clone to inspect or inject faults
/// while the axis controller owns another.
#[derive(Debug, Clone)]
pub struct SimulatedMotor {
    serial_number: String,
    state: Arc<Mutex<SimulatedMotorState>>,
}

impl SimulatedMotor {
    pub fn new(serial_number: impl Into<String>, steps_per_poll: i32) -> Self {
        let serial_number = serial_number.into();
        Self {
            serial_number: serial_number.clone(),
            state: Arc::new(Mutex::new(SimulatedMotorState {
                serial_number,
                current_position: 0,
                target_position: 0,
                energized: false,
                safe_start_latched: true,
                current_limit: 0,
                max_speed: 0,
                steps_per_poll: steps_per_poll.max(1),
                landing_noise: 0,
                landed: false,
                disconnected: false,
                halt_count: 0,
                targets: Vec::new(),
            })),
        }
    }

    pub fn with_landing_noise(self, noise: i32) -> Self {
        self.lock().landing_noise = noise.abs();
        self
    }

    pub fn snapshot(&self) -> SimulatedMotorState {
        self.lock().clone()
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.lock().disconnected = disconnected;
    }

    /// Places the carriage somewhere without going through the driver.
    pub fn force_position(&self, position: i32) {
        let mut state = self.lock();
        state.current_position = position;
        state.target_position = position;
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedMotorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connected(&self) -> Result<MutexGuard<'_, SimulatedMotorState>, HardwareError> {
        let state = self.lock();
        if state.disconnected {
            return Err(HardwareError::NotConnected(state.serial_number.clone()));
        }
        Ok(state)
    }
}

impl MotorHandle for SimulatedMotor {
    fn serial_number(&self) -> &str {
        &self.serial_number
    }

    fn get_current_position(&mut self) -> Result<i32, HardwareError> {
        let mut state = self.connected()?;
        let can_move = state.energized && !state.safe_start_latched;
        let remaining = state.target_position - state.current_position;
        if can_move && remaining != 0 {
            let step = remaining.clamp(-state.steps_per_poll, state.steps_per_poll);
            state.current_position += step;
            if state.current_position == state.target_position
                && state.landing_noise > 0
                && !state.landed
            {
                let noise = rand::rng().random_range(-state.landing_noise..=state.landing_noise);
                state.current_position = state.current_position.saturating_add(noise);
                state.landed = true;
            }
        }
        Ok(state.current_position)
    }

    fn set_target_position(&mut self, position: i32) -> Result<(), HardwareError> {
        let mut state = self.connected()?;
        if !state.energized {
            return Err(HardwareError::NotEnergized(state.serial_number.clone()));
        }
        state.target_position = position;
        state.landed = false;
        state.targets.push(position);
        Ok(())
    }

    fn halt_and_hold(&mut self) -> Result<(), HardwareError> {
        let mut state = self.connected()?;
        state.target_position = state.current_position;
        state.halt_count += 1;
        Ok(())
    }

    fn halt_and_set_position(&mut self, position: i32) -> Result<(), HardwareError> {
        let mut state = self.connected()?;
        state.current_position = position;
        state.target_position = position;
        state.halt_count += 1;
        Ok(())
    }

    fn energize(&mut self) -> Result<(), HardwareError> {
        let mut state = self.connected()?;
        state.energized = true;
        state.safe_start_latched = true;
        Ok(())
    }

    fn deenergize(&mut self) -> Result<(), HardwareError> {
        let mut state = self.connected()?;
        state.energized = false;
        state.safe_start_latched = true;
        Ok(())
    }

    fn set_current_limit(&mut self, code: u8) -> Result<(), HardwareError> {
        let mut state = self.connected()?;
        state.current_limit = code;
        Ok(())
    }

    fn set_max_speed(&mut self, steps_per_second: u32) -> Result<(), HardwareError> {
        let mut state = self.connected()?;
        state.max_speed = steps_per_second;
        Ok(())
    }

    fn exit_safe_start(&mut self) -> Result<(), HardwareError> {
        let mut state = self.connected()?;
        state.safe_start_latched = false;
        Ok(())
    }
}

/// Registry reporting a fixed list of simulated drivers.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRegistry {
    serial_numbers: Vec<String>,
}

impl SimulatedRegistry {
    pub fn new(serial_numbers: Vec<String>) -> Self {
        Self { serial_numbers }
    }
}

impl MotorRegistry for SimulatedRegistry {
    fn list_serial_numbers(&self) -> Result<Vec<String>, HardwareError> {
        Ok(self.serial_numbers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_motor(steps_per_poll: i32) -> SimulatedMotor {
        let mut motor = SimulatedMotor::new("00000001", steps_per_poll);
        motor.energize().unwrap();
        motor.exit_safe_start().unwrap();
        motor
    }

    #[test]
    fn test_moves_by_steps_per_poll() {
        let mut motor = ready_motor(40);
        motor.set_target_position(100).unwrap();
        assert_eq!(motor.get_current_position().unwrap(), 40);
        assert_eq!(motor.get_current_position().unwrap(), 80);
        assert_eq!(motor.get_current_position().unwrap(), 100);
        assert_eq!(motor.get_current_position().unwrap(), 100);
    }

    #[test]
    fn test_safe_start_blocks_motion() {
        let mut motor = SimulatedMotor::new("00000001", 10);
        motor.energize().unwrap();
        motor.set_target_position(50).unwrap();
        assert_eq!(motor.get_current_position().unwrap(), 0);
        motor.exit_safe_start().unwrap();
        assert_eq!(motor.get_current_position().unwrap(), 10);
    }

    #[test]
    fn test_target_rejected_when_deenergized() {
        let mut motor = SimulatedMotor::new("00000001", 10);
        assert!(matches!(
            motor.set_target_position(5),
            Err(HardwareError::NotEnergized(_))
        ));
    }

    #[test]
    fn test_disconnect_fault() {
        let mut motor = ready_motor(10);
        let device = motor.clone();
        device.set_disconnected(true);
        assert!(matches!(
            motor.get_current_position(),
            Err(HardwareError::NotConnected(_))
        ));
    }

    #[test]
    fn test_landing_noise_stays_within_bound() {
        let mut motor = ready_motor(i32::MAX).with_landing_noise(3);
        motor.set_target_position(1000).unwrap();
        let landed = motor.get_current_position().unwrap();
        assert!((997..=1003).contains(&landed));
        assert_eq!(motor.snapshot().target_position, 1000);
    }

    #[test]
    fn test_noisy_landing_corrects_onto_target() {
        let mut motor = ready_motor(1).with_landing_noise(2);
        for target in [0, 3, 0] {
            motor.set_target_position(target).unwrap();
            let mut reading = motor.get_current_position().unwrap();
            for _ in 0..10 {
                reading = motor.get_current_position().unwrap();
            }
            assert_eq!(reading, target);
        }
    }
}
