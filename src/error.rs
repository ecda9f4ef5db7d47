// src/error.rs - Scan error taxonomy
use thiserror::Error;

use crate::hardware::HardwareError;
use crate::motion::ScanState;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScanError {
    #[error("Invalid scan parameters: {0}")]
    InvalidScanParameters(String),
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Capture channel full, request {sequence} dropped")]
    CaptureChannelFull { sequence: u64 },
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ScanState,
    },
}

impl From<HardwareError> for ScanError {
    fn from(error: HardwareError) -> Self {
        ScanError::DeviceUnavailable(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_errors_map_to_device_unavailable() {
        let error: ScanError = HardwareError::NotEnergized("00425332".to_string()).into();
        assert_eq!(
            error,
            ScanError::DeviceUnavailable("motor 00425332 is not energized".to_string())
        );
    }

    #[test]
    fn test_invalid_state_message() {
        let error = ScanError::InvalidState {
            operation: "configure",
            state: ScanState::Moving,
        };
        assert_eq!(error.to_string(), "Cannot configure while moving");
    }
}
