// src/hardware/mod.rs - Motor collaborators owned by the axis controllers
pub mod simulated;
pub mod ticcmd;
pub mod worker;

pub use simulated::{SimulatedMotor, SimulatedRegistry};
pub use ticcmd::{TicCmdMotor, TicCmdRegistry};
pub use worker::MotorWorker;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HardwareError {
    #[error("motor {0} is not connected")]
    NotConnected(String),
    #[error("motor {0} is not energized")]
    NotEnergized(String),
    #[error("command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("device worker for motor {0} has stopped")]
    WorkerStopped(String),
    #[error("command queue for motor {0} is full")]
    QueueFull(String),
    #[error("could not parse device output: {0}")]
    Parse(String),
}

/// Narrow interface to one stepper driver.
///
/// The scan core only depends on these calls; how they reach the device is
/// up to the implementation. Implementations may block, in which case they
/// should be wrapped in a [`MotorWorker`] before being handed to an axis.
pub trait MotorHandle: Send {
    fn serial_number(&self) -> &str;
    fn get_current_position(&mut self) -> Result<i32, HardwareError>;
    fn set_target_position(&mut self, position: i32) -> Result<(), HardwareError>;
    fn halt_and_hold(&mut self) -> Result<(), HardwareError>;
    fn halt_and_set_position(&mut self, position: i32) -> Result<(), HardwareError>;
    fn energize(&mut self) -> Result<(), HardwareError>;
    fn deenergize(&mut self) -> Result<(), HardwareError>;
    fn set_current_limit(&mut self, code: u8) -> Result<(), HardwareError>;
    /// Speed cap in steps per second, already clamped by [`clamp_max_speed`].
    fn set_max_speed(&mut self, steps_per_second: u32) -> Result<(), HardwareError>;
    fn exit_safe_start(&mut self) -> Result<(), HardwareError>;
}

/// Enumerates the stepper drivers attached to the host.
///
/// Constructed once at start-up and passed to whatever needs it.
pub trait MotorRegistry: Send + Sync {
    fn list_serial_numbers(&self) -> Result<Vec<String>, HardwareError>;
}

/// Tic T500 current limit codes, indexed by code, in milliamps.
pub const CURRENT_LIMIT_TABLE_MA: [u32; 33] = [
    0, 1, 174, 343, 495, 634, 762, 880, 990, 1092, 1189, 1281, 1368, 1452, 1532, 1611, 1687,
    1762, 1835, 1909, 1982, 2056, 2131, 2207, 2285, 2366, 2451, 2540, 2634, 2734, 2843, 2962,
    3093,
];

pub const DEFAULT_CURRENT_LIMIT_CODE: u8 = 2;

pub fn current_limit_ma(code: u8) -> Option<u32> {
    CURRENT_LIMIT_TABLE_MA.get(code as usize).copied()
}

pub const MIN_MAX_SPEED: u32 = 1;
pub const MAX_MAX_SPEED: u32 = 50_000;

/// Tic drivers take speeds in steps per 10000 seconds.
pub const TIC_SPEED_SCALE: u32 = 10_000;

pub fn clamp_max_speed(steps_per_second: u32) -> u32 {
    steps_per_second.clamp(MIN_MAX_SPEED, MAX_MAX_SPEED)
}

pub fn tic_speed_units(steps_per_second: u32) -> u32 {
    clamp_max_speed(steps_per_second) * TIC_SPEED_SCALE
}
