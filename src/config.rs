//! # Scanner Configuration
//!
//! Host configuration is a single TOML file. Every field has a default, so an
//! empty file (or no file at all, see [`Config::default`]) describes a fully
//! simulated three-axis rig.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [scanner]
//! name = "bench rig"
//! tick_interval_ms = 100
//! dwell_secs = 2.0
//! trigger_axis = "forward"
//!
//! [hardware]
//! simulate = false
//! ticcmd = "/usr/local/bin/ticcmd"
//!
//! [camera]
//! backend = "gphoto2"
//! output_dir = "./results"
//! subject = "Beetle"
//!
//! [steppers.stepper_1]
//! axis = "forward"
//! serial = "00425332"
//! min_position = 0
//! max_position = 2000
//! divisions = 5
//! ```
//!
//! Stepper sections are named `stepper_<N>`; when `axis` is omitted the index
//! picks it (1 forward, 2 tilt, 3 yaw).

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::hardware::{CURRENT_LIMIT_TABLE_MA, DEFAULT_CURRENT_LIMIT_CODE};
use crate::motion::{AxisId, AxisParameters, AxisTuning, DEFAULT_MAX_SPEED};
use crate::scan::SequencerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default = "default_steppers")]
    pub steppers: BTreeMap<String, StepperConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scanner: ScannerConfig::default(),
            hardware: HardwareConfig::default(),
            camera: CameraConfig::default(),
            steppers: default_steppers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScannerConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_dwell_secs")]
    pub dwell_secs: f64,
    /// Fraction of the target position within which an axis counts as arrived.
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: f64,
    #[serde(default = "default_trigger_axis")]
    pub trigger_axis: AxisId,
    #[serde(default)]
    pub gate_on_capture: bool,
    #[serde(default = "default_true")]
    pub abort_on_fault: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            tick_interval_ms: default_tick_interval_ms(),
            dwell_secs: default_dwell_secs(),
            position_tolerance: default_position_tolerance(),
            trigger_axis: default_trigger_axis(),
            gate_on_capture: false,
            abort_on_fault: true,
        }
    }
}

impl ScannerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Saturates for values `validate` would reject.
    pub fn dwell(&self) -> Duration {
        Duration::try_from_secs_f64(self.dwell_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig {
            trigger_axis: self.trigger_axis,
            gate_on_capture: self.gate_on_capture,
            abort_on_fault: self.abort_on_fault,
        }
    }

    pub fn axis_tuning(&self, stepper: &StepperConfig) -> AxisTuning {
        AxisTuning {
            tolerance: self.position_tolerance,
            dwell: self.dwell(),
            current_limit: stepper.current_limit,
            max_speed: stepper.max_speed,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HardwareConfig {
    #[serde(default = "default_true")]
    pub simulate: bool,
    #[serde(default = "default_ticcmd")]
    pub ticcmd: String,
    #[serde(default = "default_worker_poll_ms")]
    pub worker_poll_ms: u64,
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
    /// Steps a simulated motor travels per position poll.
    #[serde(default = "default_simulated_speed")]
    pub simulated_speed: i32,
    #[serde(default)]
    pub simulated_noise: i32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            simulate: true,
            ticcmd: default_ticcmd(),
            worker_poll_ms: default_worker_poll_ms(),
            command_queue: default_command_queue(),
            simulated_speed: default_simulated_speed(),
            simulated_noise: 0,
        }
    }
}

impl HardwareConfig {
    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    Simulated,
    Gphoto2,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CameraConfig {
    #[serde(default = "default_camera_backend")]
    pub backend: CameraBackend,
    #[serde(default = "default_gphoto2")]
    pub gphoto2: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_simulated_capture_ms")]
    pub simulated_capture_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: default_camera_backend(),
            gphoto2: default_gphoto2(),
            output_dir: default_output_dir(),
            subject: default_subject(),
            owner: default_owner(),
            queue_capacity: default_queue_capacity(),
            simulated_capture_ms: default_simulated_capture_ms(),
        }
    }
}

/// One stepper driver and the scan bounds of the axis it moves.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StepperConfig {
    #[serde(default)]
    pub axis: Option<AxisId>,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default = "default_current_limit")]
    pub current_limit: u8,
    #[serde(default = "default_max_speed")]
    pub max_speed: u32,
    #[serde(default)]
    pub min_position: Option<i32>,
    #[serde(default)]
    pub max_position: Option<i32>,
    #[serde(default)]
    pub divisions: Option<u32>,
}

impl StepperConfig {
    pub fn for_axis(axis: AxisId) -> Self {
        Self {
            axis: Some(axis),
            current_limit: default_current_limit(),
            max_speed: default_max_speed(),
            ..Self::default()
        }
    }

    pub fn parameters(&self) -> AxisParameters {
        AxisParameters {
            min_position: self.min_position,
            max_position: self.max_position,
            divisions: self.divisions,
        }
    }

    pub fn set_parameters(&mut self, parameters: AxisParameters) {
        self.min_position = parameters.min_position;
        self.max_position = parameters.max_position;
        self.divisions = parameters.divisions;
    }
}

/// Parses the `<N>` out of a `stepper_<N>` section name.
pub fn stepper_index(name: &str) -> Option<u8> {
    name.strip_prefix("stepper_")?.parse().ok()
}

impl Config {
    /// Axis driven by the named stepper: explicit `axis`, else its index.
    pub fn resolve_axis(name: &str, stepper: &StepperConfig) -> Option<AxisId> {
        stepper
            .axis
            .or_else(|| stepper_index(name).and_then(AxisId::from_index))
    }

    /// Steppers with a resolvable axis, in nesting order.
    pub fn axis_assignments(&self) -> Vec<(AxisId, &str, &StepperConfig)> {
        let mut assignments: Vec<_> = self
            .steppers
            .iter()
            .filter_map(|(name, stepper)| {
                Self::resolve_axis(name, stepper).map(|axis| (axis, name.as_str(), stepper))
            })
            .collect();
        assignments.sort_by_key(|(axis, _, _)| axis.nesting_level());
        assignments
    }

    pub fn stepper_for(&self, axis: AxisId) -> Option<&StepperConfig> {
        self.axis_assignments()
            .into_iter()
            .find(|(a, _, _)| *a == axis)
            .map(|(_, _, stepper)| stepper)
    }

    pub fn stepper_for_mut(&mut self, axis: AxisId) -> Option<&mut StepperConfig> {
        self.steppers
            .iter_mut()
            .find(|(name, stepper)| Self::resolve_axis(name, stepper) == Some(axis))
            .map(|(_, stepper)| stepper)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scanner.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scanner.tick_interval_ms must be greater than 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.scanner.position_tolerance) {
            return Err(ConfigError::Invalid(format!(
                "scanner.position_tolerance {} must be in [0, 1)",
                self.scanner.position_tolerance
            )));
        }
        if self.scanner.dwell_secs < 0.0 {
            return Err(ConfigError::Invalid(
                "scanner.dwell_secs must not be negative".to_string(),
            ));
        }
        Duration::try_from_secs_f64(self.scanner.dwell_secs).map_err(|e| {
            ConfigError::Invalid(format!(
                "scanner.dwell_secs {} is not a usable duration: {}",
                self.scanner.dwell_secs, e
            ))
        })?;
        let mut seen = HashSet::new();
        for (name, stepper) in &self.steppers {
            let axis = Self::resolve_axis(name, stepper).ok_or_else(|| {
                ConfigError::Invalid(format!("steppers.{} has no axis assigned", name))
            })?;
            if !seen.insert(axis) {
                return Err(ConfigError::Invalid(format!(
                    "axis {} is assigned to more than one stepper",
                    axis
                )));
            }
            if stepper.current_limit as usize >= CURRENT_LIMIT_TABLE_MA.len() {
                return Err(ConfigError::Invalid(format!(
                    "steppers.{}.current_limit {} is above the maximum code {}",
                    name,
                    stepper.current_limit,
                    CURRENT_LIMIT_TABLE_MA.len() - 1
                )));
            }
        }
        Ok(())
    }
}

fn default_steppers() -> BTreeMap<String, StepperConfig> {
    AxisId::NESTING_ORDER
        .iter()
        .map(|axis| (format!("stepper_{}", axis.index()), StepperConfig::for_axis(*axis)))
        .collect()
}
fn default_name() -> String { "scant".to_string() }
fn default_tick_interval_ms() -> u64 { 100 }
fn default_dwell_secs() -> f64 { 2.0 }
fn default_position_tolerance() -> f64 { 0.05 }
fn default_trigger_axis() -> AxisId { AxisId::Forward }
fn default_true() -> bool { true }
fn default_ticcmd() -> String { "ticcmd".to_string() }
fn default_worker_poll_ms() -> u64 { 50 }
fn default_command_queue() -> usize { 32 }
fn default_simulated_speed() -> i32 { 50 }
fn default_camera_backend() -> CameraBackend { CameraBackend::Simulated }
fn default_gphoto2() -> String { "gphoto2".to_string() }
fn default_output_dir() -> PathBuf { PathBuf::from("./results") }
fn default_subject() -> String { "Scan".to_string() }
fn default_owner() -> String { "User".to_string() }
fn default_queue_capacity() -> usize { 16 }
fn default_simulated_capture_ms() -> u64 { 250 }
fn default_current_limit() -> u8 { DEFAULT_CURRENT_LIMIT_CODE }
fn default_max_speed() -> u32 { DEFAULT_MAX_SPEED }

/// Loads and validates the configuration file at `path`.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_config(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("scanner.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "{}", contents).unwrap();
        file.flush().unwrap();
        let path = file_path.to_str().unwrap().to_string();
        (dir, path)
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.scanner.tick_interval_ms, 100);
        assert_eq!(config.scanner.dwell(), Duration::from_secs(2));
        assert_eq!(config.scanner.position_tolerance, 0.05);
        assert_eq!(config.scanner.trigger_axis, AxisId::Forward);
        assert!(config.scanner.abort_on_fault);
        assert!(!config.scanner.gate_on_capture);
        assert!(config.hardware.simulate);
        assert_eq!(config.camera.backend, CameraBackend::Simulated);
        assert_eq!(config.steppers.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_success() {
        let (_dir, path) = write_config(
            "[scanner]\ndwell_secs = 0.5\n\n\
             [steppers.stepper_2]\nserial = '00425333'\n\
             min_position = -100\nmax_position = 100\ndivisions = 3",
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.scanner.dwell(), Duration::from_millis(500));
        // Defaults for missing fields
        assert_eq!(config.scanner.tick_interval_ms, 100);
        let tilt = config.stepper_for(AxisId::Tilt).unwrap();
        assert_eq!(tilt.serial.as_deref(), Some("00425333"));
        assert_eq!(tilt.parameters(), AxisParameters::new(-100, 100, 3));
        assert_eq!(tilt.current_limit, DEFAULT_CURRENT_LIMIT_CODE);
        assert!(config.stepper_for(AxisId::Forward).is_none());
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("nonexistent_file.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let (_dir, path) = write_config("not a valid toml");
        assert!(matches!(load_config(&path), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_duplicate_axis_rejected() {
        let (_dir, path) = write_config(
            "[steppers.stepper_1]\naxis = 'yaw'\n\n[steppers.stepper_3]\n",
        );
        assert!(matches!(load_config(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_tolerance_and_current_limit_bounds() {
        let mut config = Config::default();
        config.scanner.position_tolerance = 1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.stepper_for_mut(AxisId::Yaw).unwrap().current_limit = 33;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.scanner.tick_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unusable_dwell_rejected() {
        for dwell_secs in [f64::INFINITY, f64::NAN, 1e30, -0.5] {
            let mut config = Config::default();
            config.scanner.dwell_secs = dwell_secs;
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "dwell_secs = {} accepted",
                dwell_secs
            );
            // Building tuning from an unvalidated config must not panic either.
            let stepper = StepperConfig::for_axis(AxisId::Forward);
            config.scanner.axis_tuning(&stepper);
        }

        let (_dir, path) = write_config("[scanner]\ndwell_secs = inf\n");
        assert!(matches!(load_config(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_axis_tuning_carries_stepper_limits() {
        let mut config = Config::default();
        config.scanner.position_tolerance = 0.1;
        let yaw = config.stepper_for_mut(AxisId::Yaw).unwrap();
        yaw.current_limit = 12;
        yaw.max_speed = 400;
        let tuning = config.scanner.axis_tuning(config.stepper_for(AxisId::Yaw).unwrap());
        assert_eq!(tuning.tolerance, 0.1);
        assert_eq!(tuning.current_limit, 12);
        assert_eq!(tuning.max_speed, 400);
        assert_eq!(tuning.dwell, Duration::from_secs(2));
    }

    #[test]
    fn test_axis_assignments_follow_nesting_order() {
        let mut config = Config::default();
        config.steppers.clear();
        config.steppers.insert("a".to_string(), StepperConfig::for_axis(AxisId::Yaw));
        config.steppers.insert("b".to_string(), StepperConfig::for_axis(AxisId::Forward));
        let axes: Vec<AxisId> = config.axis_assignments().iter().map(|(a, _, _)| *a).collect();
        assert_eq!(axes, vec![AxisId::Forward, AxisId::Yaw]);
    }
}
