// src/hardware/ticcmd.rs - Tic stepper drivers through the `ticcmd` command line tool
use std::process::Command;

use super::{HardwareError, MotorHandle, MotorRegistry, current_limit_ma, tic_speed_units};

/// Lists attached Tic drivers with `ticcmd --list`.
#[derive(Debug, Clone)]
pub struct TicCmdRegistry {
    program: String,
}

impl TicCmdRegistry {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

impl MotorRegistry for TicCmdRegistry {
    fn list_serial_numbers(&self) -> Result<Vec<String>, HardwareError> {
        let stdout = run_ticcmd(&self.program, &["--list"])?;
        let serials = parse_device_list(&stdout);
        tracing::debug!("ticcmd reported {} device(s): {:?}", serials.len(), serials);
        Ok(serials)
    }
}

/// Extracts serial numbers from `ticcmd --list` output.
///
/// Each line looks like `00425332,         Tic T500 Stepper Motor Controller`.
pub fn parse_device_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split(',').next())
        .map(str::trim)
        .filter(|serial| !serial.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads the `Current position:` field from `ticcmd --status` output.
pub fn parse_current_position(output: &str) -> Result<i32, HardwareError> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Current position:"))
        .ok_or_else(|| HardwareError::Parse("no 'Current position' in status".to_string()))?
        .trim()
        .parse::<i32>()
        .map_err(|e| HardwareError::Parse(format!("current position: {}", e)))
}

/// One Tic driver addressed by serial number. Every call blocks on a
/// `ticcmd` process, so this is meant to live behind a `MotorWorker`.
#[derive(Debug, Clone)]
pub struct TicCmdMotor {
    program: String,
    serial_number: String,
}

impl TicCmdMotor {
    pub fn new(program: impl Into<String>, serial_number: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            serial_number: serial_number.into(),
        }
    }

    fn device_command(&self, args: &[&str]) -> Result<String, HardwareError> {
        let mut full_args = vec!["-d", self.serial_number.as_str()];
        full_args.extend_from_slice(args);
        run_ticcmd(&self.program, &full_args)
    }
}

impl MotorHandle for TicCmdMotor {
    fn serial_number(&self) -> &str {
        &self.serial_number
    }

    fn get_current_position(&mut self) -> Result<i32, HardwareError> {
        let status = self.device_command(&["--status"])?;
        parse_current_position(&status)
    }

    fn set_target_position(&mut self, position: i32) -> Result<(), HardwareError> {
        self.device_command(&["--position", &position.to_string()])
            .map(|_| ())
    }

    fn halt_and_hold(&mut self) -> Result<(), HardwareError> {
        self.device_command(&["--halt-and-hold"]).map(|_| ())
    }

    fn halt_and_set_position(&mut self, position: i32) -> Result<(), HardwareError> {
        self.device_command(&["--halt-and-set-position", &position.to_string()])
            .map(|_| ())
    }

    fn energize(&mut self) -> Result<(), HardwareError> {
        self.device_command(&["--energize"]).map(|_| ())
    }

    fn deenergize(&mut self) -> Result<(), HardwareError> {
        self.device_command(&["--deenergize"]).map(|_| ())
    }

    fn set_current_limit(&mut self, code: u8) -> Result<(), HardwareError> {
        let milliamps = current_limit_ma(code).ok_or_else(|| HardwareError::CommandFailed {
            command: "--current".to_string(),
            message: format!("unknown current limit code {}", code),
        })?;
        self.device_command(&["--current", &milliamps.to_string()])
            .map(|_| ())
    }

    fn set_max_speed(&mut self, steps_per_second: u32) -> Result<(), HardwareError> {
        let units = tic_speed_units(steps_per_second);
        self.device_command(&["--max-speed", &units.to_string()])
            .map(|_| ())
    }

    fn exit_safe_start(&mut self) -> Result<(), HardwareError> {
        self.device_command(&["--exit-safe-start"]).map(|_| ())
    }
}

fn run_ticcmd(program: &str, args: &[&str]) -> Result<String, HardwareError> {
    let command_line = format!("{} {}", program, args.join(" "));
    tracing::trace!("exec: {}", command_line);
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| HardwareError::CommandFailed {
            command: command_line.clone(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(HardwareError::CommandFailed {
            command: command_line,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_list() {
        let output = "00425332,         Tic T500 Stepper Motor Controller            \n\
                      00425333,         Tic T500 Stepper Motor Controller            \n\n";
        assert_eq!(parse_device_list(output), vec!["00425332", "00425333"]);
    }

    #[test]
    fn test_parse_device_list_empty() {
        assert!(parse_device_list("").is_empty());
    }

    #[test]
    fn test_parse_current_position() {
        let status = "Name:                         Tic T500\n\
                      Serial number:                00425332\n\
                      Target position:              1200\n\
                      Current position:             -37\n";
        assert_eq!(parse_current_position(status).unwrap(), -37);
    }

    #[test]
    fn test_parse_current_position_missing() {
        assert!(matches!(
            parse_current_position("Target position: 3\n"),
            Err(HardwareError::Parse(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_max_speed_is_sent_in_tic_units() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args.txt");
        let script = dir.path().join("fake-ticcmd");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" > '{}'\n", args_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut motor = TicCmdMotor::new(script.to_string_lossy(), "00425332");
        motor.set_max_speed(90_000).unwrap();
        let args = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(args.trim(), "-d 00425332 --max-speed 500000000");
    }

    #[test]
    fn test_missing_program_is_command_failure() {
        let registry = TicCmdRegistry::new("definitely-not-a-real-ticcmd-binary");
        assert!(matches!(
            registry.list_serial_numbers(),
            Err(HardwareError::CommandFailed { .. })
        ));
    }
}
