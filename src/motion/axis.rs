// src/motion/axis.rs - Per-axis move/settle/dwell state machine
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::positions::{PositionSequence, compute_positions};
use crate::error::ScanError;
use crate::hardware::{DEFAULT_CURRENT_LIMIT_CODE, HardwareError, MotorHandle, clamp_max_speed};
use crate::scheduler::TimeInterface;

pub const DEFAULT_POSITION_TOLERANCE: f64 = 0.05;
pub const DEFAULT_DWELL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_SPEED: u32 = 1000;
/// Upper bound on divisions per axis; each one is a stored stop.
pub const MAX_DIVISIONS: u32 = 100_000;

/// Logical axis of the scanner rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisId {
    Forward,
    Tilt,
    Yaw,
}

impl AxisId {
    /// Innermost (fastest cycling) first.
    pub const NESTING_ORDER: [AxisId; 3] = [AxisId::Forward, AxisId::Tilt, AxisId::Yaw];

    /// Stepper index used in settings files, 1..=3.
    pub fn index(self) -> u8 {
        match self {
            AxisId::Forward => 1,
            AxisId::Tilt => 2,
            AxisId::Yaw => 3,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            1 => Some(AxisId::Forward),
            2 => Some(AxisId::Tilt),
            3 => Some(AxisId::Yaw),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AxisId::Forward => "forward",
            AxisId::Tilt => "tilt",
            AxisId::Yaw => "yaw",
        }
    }

    /// Position of this axis in [`AxisId::NESTING_ORDER`].
    pub fn nesting_level(self) -> usize {
        self.index() as usize - 1
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for AxisId {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" | "1" => Ok(AxisId::Forward),
            "tilt" | "2" => Ok(AxisId::Tilt),
            "yaw" | "3" => Ok(AxisId::Yaw),
            other => Err(ScanError::InvalidScanParameters(format!(
                "unknown axis '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Idle,
    Moving,
    Waiting,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScanState::Idle => "idle",
            ScanState::Moving => "moving",
            ScanState::Waiting => "waiting",
        })
    }
}

/// User-set scan bounds for one axis. Fields stay optional because they come
/// from free-form input and may be incomplete until a scan is started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisParameters {
    pub min_position: Option<i32>,
    pub max_position: Option<i32>,
    pub divisions: Option<u32>,
}

impl AxisParameters {
    pub fn new(min_position: i32, max_position: i32, divisions: u32) -> Self {
        Self {
            min_position: Some(min_position),
            max_position: Some(max_position),
            divisions: Some(divisions),
        }
    }

    /// Returns `(min, max, divisions)` when the parameters describe a scan.
    pub fn validate(&self) -> Result<(i32, i32, u32), ScanError> {
        let min = self
            .min_position
            .ok_or_else(|| ScanError::InvalidScanParameters("min position missing".to_string()))?;
        let max = self
            .max_position
            .ok_or_else(|| ScanError::InvalidScanParameters("max position missing".to_string()))?;
        let divisions = self
            .divisions
            .ok_or_else(|| ScanError::InvalidScanParameters("divisions missing".to_string()))?;
        if divisions == 0 {
            return Err(ScanError::InvalidScanParameters(
                "divisions must be at least 1".to_string(),
            ));
        }
        if divisions > MAX_DIVISIONS {
            return Err(ScanError::InvalidScanParameters(format!(
                "{} divisions is above the limit of {}",
                divisions, MAX_DIVISIONS
            )));
        }
        if max <= min {
            return Err(ScanError::InvalidScanParameters(format!(
                "max position {} must be greater than min position {}",
                max, min
            )));
        }
        Ok((min, max, divisions))
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn positions(&self) -> Result<PositionSequence, ScanError> {
        let (min, max, divisions) = self.validate()?;
        Ok(compute_positions(min, max, divisions))
    }

    /// Stops this axis contributes to a nested scan. A single division holds
    /// the axis at `min`.
    pub fn grid_stops(&self) -> Result<usize, ScanError> {
        let positions = self.positions()?;
        Ok(if self.divisions == Some(1) { 1 } else { positions.len() })
    }
}

/// Parses `min:max:divisions`. Empty fields are left unset.
impl FromStr for AxisParameters {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(ScanError::InvalidScanParameters(format!(
                "expected min:max:divisions, got '{}'",
                s
            )));
        }
        fn field<T: FromStr>(name: &str, value: &str) -> Result<Option<T>, ScanError> {
            if value.is_empty() {
                return Ok(None);
            }
            value.parse::<T>().map(Some).map_err(|_| {
                ScanError::InvalidScanParameters(format!("{} '{}' is not a number", name, value))
            })
        }
        Ok(Self {
            min_position: field("min position", fields[0])?,
            max_position: field("max position", fields[1])?,
            divisions: field("divisions", fields[2])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisTuning {
    /// Fraction of `|target|` within which a move counts as arrived.
    pub tolerance: f64,
    pub dwell: Duration,
    pub current_limit: u8,
    /// Steps per second.
    pub max_speed: u32,
}

impl Default for AxisTuning {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_POSITION_TOLERANCE,
            dwell: DEFAULT_DWELL,
            current_limit: DEFAULT_CURRENT_LIMIT_CODE,
            max_speed: DEFAULT_MAX_SPEED,
        }
    }
}

/// Arrival test. A zero target has no relative band, so it needs an exact hit.
pub fn position_reached(current: i32, target: i32, tolerance: f64) -> bool {
    if target == 0 {
        return current == 0;
    }
    let error = (i64::from(current) - i64::from(target)).unsigned_abs() as f64;
    error <= tolerance * f64::from(target).abs()
}

/// Division-weighted progress in `[0, 1]`: completed divisions plus the
/// travelled fraction of the move towards the current one.
pub fn movement_progress(
    division: usize,
    total: usize,
    start: i32,
    current: i32,
    target: i32,
) -> f64 {
    if total == 0 {
        return 0.0;
    }
    if division >= total {
        return 1.0;
    }
    let span = (i64::from(target) - i64::from(start)).abs() as f64;
    let travelled = if span > 0.0 {
        let remaining = (i64::from(target) - i64::from(current)).abs() as f64;
        ((span - remaining) / span).clamp(0.0, 1.0)
    } else {
        1.0
    };
    ((division as f64 + travelled) / total as f64).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq)]
pub enum AxisEvent {
    Settled {
        axis: AxisId,
        position: i32,
        division: usize,
    },
    Faulted {
        axis: AxisId,
        error: ScanError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueOutcome {
    Advanced { division: usize, target: i32 },
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisStatus {
    pub axis: AxisId,
    pub serial_number: String,
    pub state: ScanState,
    pub energized: bool,
    pub parameters: AxisParameters,
    pub current_position: i32,
    pub target_position: i32,
    pub division: usize,
    pub total_divisions: usize,
    pub settle_count: u64,
    pub scan_completed: bool,
    pub fault: Option<String>,
    pub progress: f64,
}

/// Drives one stepper through its position sequence.
///
/// The controller never blocks: motor handles are expected to answer from a
/// cache or queue (see `MotorWorker`). It owns its motor exclusively.
pub struct AxisController {
    id: AxisId,
    motor: Box<dyn MotorHandle>,
    clock: Arc<dyn TimeInterface>,
    tuning: AxisTuning,
    parameters: AxisParameters,
    positions: PositionSequence,
    grid_stops: usize,
    state: ScanState,
    energized: bool,
    current_position: i32,
    target_position: i32,
    move_start_position: i32,
    division: usize,
    dwell_started: Option<Instant>,
    settle_count: u64,
    scan_completed: bool,
    fault: Option<String>,
}

impl AxisController {
    pub fn new(
        id: AxisId,
        motor: Box<dyn MotorHandle>,
        clock: Arc<dyn TimeInterface>,
        tuning: AxisTuning,
    ) -> Self {
        Self {
            id,
            motor,
            clock,
            tuning,
            parameters: AxisParameters::default(),
            positions: PositionSequence::default(),
            grid_stops: 0,
            state: ScanState::Idle,
            energized: false,
            current_position: 0,
            target_position: 0,
            move_start_position: 0,
            division: 0,
            dwell_started: None,
            settle_count: 0,
            scan_completed: false,
            fault: None,
        }
    }

    pub fn id(&self) -> AxisId {
        self.id
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_energized(&self) -> bool {
        self.energized
    }

    pub fn parameters(&self) -> AxisParameters {
        self.parameters
    }

    pub fn positions(&self) -> &PositionSequence {
        &self.positions
    }

    pub fn division(&self) -> usize {
        self.division
    }

    pub fn current_position(&self) -> i32 {
        self.current_position
    }

    pub fn target_position(&self) -> i32 {
        self.target_position
    }

    /// Number of times this axis has settled since it was created.
    pub fn settle_count(&self) -> u64 {
        self.settle_count
    }

    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub fn configure(&mut self, parameters: AxisParameters) -> Result<(), ScanError> {
        if self.state != ScanState::Idle {
            return Err(ScanError::InvalidState {
                operation: "configure",
                state: self.state,
            });
        }
        tracing::debug!("Axis {} configured: {:?}", self.id, parameters);
        self.parameters = parameters;
        Ok(())
    }

    pub fn validate_parameters(&self) -> bool {
        self.parameters.is_valid()
    }

    pub fn set_tuning(&mut self, tuning: AxisTuning) {
        self.tuning = tuning;
    }

    /// Brings the driver into a known state and enables it.
    pub fn energize(&mut self) -> Result<(), ScanError> {
        let position = self.motor.get_current_position()?;
        self.motor.halt_and_set_position(position)?;
        self.motor.set_current_limit(self.tuning.current_limit)?;
        self.motor.set_max_speed(clamp_max_speed(self.tuning.max_speed))?;
        self.motor.energize()?;
        self.motor.exit_safe_start()?;
        self.current_position = position;
        self.target_position = position;
        self.energized = true;
        self.fault = None;
        tracing::info!(
            "Axis {} energized on motor {} at {}",
            self.id,
            self.motor.serial_number(),
            position
        );
        Ok(())
    }

    pub fn deenergize(&mut self) -> Result<(), ScanError> {
        if self.state != ScanState::Idle {
            self.stop_scan();
        }
        self.motor.deenergize()?;
        self.energized = false;
        tracing::info!("Axis {} de-energized", self.id);
        Ok(())
    }

    pub fn start_scan(&mut self) -> Result<(), ScanError> {
        if self.state != ScanState::Idle {
            return Err(ScanError::InvalidState {
                operation: "start scan",
                state: self.state,
            });
        }
        if !self.energized {
            return Err(ScanError::DeviceUnavailable(format!(
                "axis {} is not energized",
                self.id
            )));
        }
        let positions = self.parameters.positions()?;
        let grid_stops = self.parameters.grid_stops()?;
        let Some(first) = positions.first() else {
            return Err(ScanError::InvalidScanParameters(format!(
                "axis {} has no positions to visit",
                self.id
            )));
        };
        self.command_move(first)?;

        self.positions = positions;
        self.grid_stops = grid_stops;
        self.division = 0;
        self.scan_completed = false;
        self.fault = None;
        self.state = ScanState::Moving;
        tracing::info!(
            "Axis {} scan started over {:?}",
            self.id,
            self.positions.as_slice()
        );
        Ok(())
    }

    /// Advances the Moving -> Waiting transition. Waiting and Idle are left to
    /// the caller.
    pub fn tick(&mut self) -> Option<AxisEvent> {
        if self.state != ScanState::Moving {
            return None;
        }
        match self.motor.get_current_position() {
            Ok(position) => {
                self.current_position = position;
                if !position_reached(position, self.target_position, self.tuning.tolerance) {
                    return None;
                }
                self.state = ScanState::Waiting;
                self.dwell_started = Some(self.clock.now_monotonic());
                self.settle_count += 1;
                tracing::debug!(
                    "Axis {} settled at {} (target {}, division {})",
                    self.id,
                    position,
                    self.target_position,
                    self.division
                );
                Some(AxisEvent::Settled {
                    axis: self.id,
                    position,
                    division: self.division,
                })
            }
            Err(e) => Some(AxisEvent::Faulted {
                axis: self.id,
                error: self.fail(e),
            }),
        }
    }

    pub fn dwell_elapsed(&self) -> bool {
        match (self.state, self.dwell_started) {
            (ScanState::Waiting, Some(started)) => {
                self.clock
                    .now_monotonic()
                    .saturating_duration_since(started)
                    >= self.tuning.dwell
            }
            _ => false,
        }
    }

    pub fn continue_scan(&mut self) -> Result<ContinueOutcome, ScanError> {
        if self.state != ScanState::Waiting {
            return Err(ScanError::InvalidState {
                operation: "continue scan",
                state: self.state,
            });
        }
        let next = self.division + 1;
        let Some(target) = self.positions.get(next) else {
            self.division = next;
            self.complete();
            return Ok(ContinueOutcome::Completed);
        };
        self.command_move(target)?;
        self.division = next;
        self.state = ScanState::Moving;
        tracing::debug!("Axis {} advancing to division {} at {}", self.id, next, target);
        Ok(ContinueOutcome::Advanced {
            division: next,
            target,
        })
    }

    /// Sends a settled axis back to the first stop of its sequence.
    pub fn restart_sequence(&mut self) -> Result<(), ScanError> {
        if self.state != ScanState::Waiting {
            return Err(ScanError::InvalidState {
                operation: "restart sequence",
                state: self.state,
            });
        }
        let Some(first) = self.positions.first() else {
            return Err(ScanError::InvalidScanParameters(format!(
                "axis {} has no positions to visit",
                self.id
            )));
        };
        self.command_move(first)?;
        self.division = 0;
        self.state = ScanState::Moving;
        tracing::debug!("Axis {} restarting sequence at {}", self.id, first);
        Ok(())
    }

    /// Ends a scan that the caller has decided is over.
    pub fn finish_scan(&mut self) -> Result<(), ScanError> {
        match self.state {
            ScanState::Idle => Ok(()),
            ScanState::Waiting => {
                self.complete();
                Ok(())
            }
            ScanState::Moving => Err(ScanError::InvalidState {
                operation: "finish scan",
                state: self.state,
            }),
        }
    }

    /// Halts the motor where it is and returns to Idle. Safe in any state.
    pub fn stop_scan(&mut self) {
        if let Err(e) = self.motor.halt_and_hold() {
            tracing::warn!("Axis {} halt failed: {}", self.id, e);
        }
        match self.motor.get_current_position() {
            Ok(position) => self.current_position = position,
            Err(e) => tracing::warn!("Axis {} position unknown after halt: {}", self.id, e),
        }
        self.target_position = self.current_position;
        self.dwell_started = None;
        if self.state != ScanState::Idle {
            tracing::info!("Axis {} scan stopped at {}", self.id, self.current_position);
        }
        self.state = ScanState::Idle;
    }

    /// Redefines the current physical position as 0.
    pub fn zero(&mut self) -> Result<(), ScanError> {
        if !self.energized {
            return Err(ScanError::DeviceUnavailable(format!(
                "axis {} is not energized",
                self.id
            )));
        }
        if self.state != ScanState::Idle {
            self.stop_scan();
        }
        self.motor.halt_and_set_position(0)?;
        self.current_position = 0;
        self.target_position = 0;
        self.move_start_position = 0;
        self.division = 0;
        tracing::info!("Axis {} zeroed", self.id);
        Ok(())
    }

    /// Manual move outside of a scan.
    pub fn jog_to(&mut self, position: i32) -> Result<(), ScanError> {
        if self.state != ScanState::Idle {
            return Err(ScanError::InvalidState {
                operation: "jog",
                state: self.state,
            });
        }
        if !self.energized {
            return Err(ScanError::DeviceUnavailable(format!(
                "axis {} is not energized",
                self.id
            )));
        }
        self.command_move(position)
    }

    /// Re-reads the motor position while no scan is running.
    pub fn refresh_position(&mut self) -> Result<i32, ScanError> {
        let position = self.motor.get_current_position()?;
        self.current_position = position;
        Ok(position)
    }

    /// Stops in the nested grid. See [`AxisParameters::grid_stops`].
    pub fn grid_stops(&self) -> usize {
        self.grid_stops
    }

    pub fn is_grid_exhausted(&self) -> bool {
        self.division + 1 >= self.grid_stops
    }

    pub fn status(&self) -> AxisStatus {
        AxisStatus {
            axis: self.id,
            serial_number: self.motor.serial_number().to_string(),
            state: self.state,
            energized: self.energized,
            parameters: self.parameters,
            current_position: self.current_position,
            target_position: self.target_position,
            division: self.division,
            total_divisions: self.positions.len(),
            settle_count: self.settle_count,
            scan_completed: self.scan_completed,
            fault: self.fault.clone(),
            progress: if self.scan_completed {
                1.0
            } else {
                movement_progress(
                    self.division,
                    self.positions.len(),
                    self.move_start_position,
                    self.current_position,
                    self.target_position,
                )
            },
        }
    }

    fn command_move(&mut self, target: i32) -> Result<(), ScanError> {
        if let Err(e) = self.motor.set_target_position(target) {
            return Err(self.fail(e));
        }
        self.move_start_position = self.current_position;
        self.target_position = target;
        self.dwell_started = None;
        Ok(())
    }

    fn complete(&mut self) {
        self.state = ScanState::Idle;
        self.dwell_started = None;
        self.scan_completed = true;
        tracing::info!("Axis {} scan complete", self.id);
    }

    /// Leaves the axis Idle with the fault recorded. Division counters are
    /// untouched.
    fn fail(&mut self, error: HardwareError) -> ScanError {
        tracing::error!("Axis {} device fault: {}", self.id, error);
        if self.state != ScanState::Idle {
            if let Err(e) = self.motor.halt_and_hold() {
                tracing::warn!("Axis {} halt after fault failed: {}", self.id, e);
            }
        }
        self.state = ScanState::Idle;
        self.dwell_started = None;
        self.fault = Some(error.to_string());
        error.into()
    }
}

impl fmt::Debug for AxisController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AxisController")
            .field("id", &self.id)
            .field("serial_number", &self.motor.serial_number())
            .field("state", &self.state)
            .field("division", &self.division)
            .field("current_position", &self.current_position)
            .field("target_position", &self.target_position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedMotor;
    use crate::scheduler::ManualClock;

    fn axis_with(steps_per_poll: i32) -> (AxisController, SimulatedMotor, ManualClock) {
        let motor = SimulatedMotor::new("00000007", steps_per_poll);
        let clock = ManualClock::new();
        let axis = AxisController::new(
            AxisId::Forward,
            Box::new(motor.clone()),
            Arc::new(clock.clone()),
            AxisTuning::default(),
        );
        (axis, motor, clock)
    }

    #[test]
    fn test_tolerance_band() {
        assert!(position_reached(96, 100, 0.05));
        assert!(position_reached(105, 100, 0.05));
        assert!(!position_reached(94, 100, 0.05));
        assert!(position_reached(-97, -100, 0.05));
        assert!(position_reached(0, 0, 0.05));
        assert!(!position_reached(1, 0, 0.05));
    }

    #[test]
    fn test_axis_parameters_parse() {
        let parsed: AxisParameters = "0:100:5".parse().unwrap();
        assert_eq!(parsed, AxisParameters::new(0, 100, 5));
        let partial: AxisParameters = "-50::3".parse().unwrap();
        assert_eq!(partial.max_position, None);
        assert!(!partial.is_valid());
        assert!("a:100:5".parse::<AxisParameters>().is_err());
        assert!("0:100".parse::<AxisParameters>().is_err());
    }

    #[test]
    fn test_validation_rules() {
        assert!(AxisParameters::new(0, 100, 1).is_valid());
        assert!(!AxisParameters::new(0, 100, 0).is_valid());
        assert!(!AxisParameters::new(100, 100, 3).is_valid());
        assert!(!AxisParameters::default().is_valid());
        assert!(AxisParameters::new(0, 100, MAX_DIVISIONS).is_valid());
        assert!(matches!(
            AxisParameters::new(0, 100, 4_000_000_000).positions(),
            Err(ScanError::InvalidScanParameters(_))
        ));
    }

    #[test]
    fn test_grid_stops() {
        assert_eq!(AxisParameters::new(0, 100, 1).grid_stops().unwrap(), 1);
        assert_eq!(AxisParameters::new(0, 100, 4).grid_stops().unwrap(), 4);
    }

    #[test]
    fn test_axis_id_round_trip() {
        for axis in AxisId::NESTING_ORDER {
            assert_eq!(AxisId::from_index(axis.index()), Some(axis));
            assert_eq!(axis.to_string().parse::<AxisId>().unwrap(), axis);
        }
        assert_eq!("Yaw".parse::<AxisId>().unwrap(), AxisId::Yaw);
        assert!("roll".parse::<AxisId>().is_err());
    }

    #[test]
    fn test_energize_applies_tuning_to_driver() {
        let motor = SimulatedMotor::new("00000008", 10);
        let tuning = AxisTuning {
            current_limit: 9,
            max_speed: 250_000,
            ..AxisTuning::default()
        };
        let mut axis = AxisController::new(
            AxisId::Tilt,
            Box::new(motor.clone()),
            Arc::new(ManualClock::new()),
            tuning,
        );
        axis.energize().unwrap();
        let state = motor.snapshot();
        assert_eq!(state.current_limit, 9);
        assert_eq!(state.max_speed, 50_000);
        assert!(state.energized);
        assert!(!state.safe_start_latched);
    }

    #[test]
    fn test_start_requires_energized_motor() {
        let (mut axis, _, _) = axis_with(1000);
        axis.configure(AxisParameters::new(0, 100, 3)).unwrap();
        assert!(matches!(
            axis.start_scan(),
            Err(ScanError::DeviceUnavailable(_))
        ));
        assert_eq!(axis.state(), ScanState::Idle);
    }

    #[test]
    fn test_configure_rejected_while_scanning() {
        let (mut axis, _, _) = axis_with(1000);
        axis.energize().unwrap();
        axis.configure(AxisParameters::new(0, 100, 3)).unwrap();
        axis.start_scan().unwrap();
        assert_eq!(
            axis.configure(AxisParameters::new(0, 10, 2)),
            Err(ScanError::InvalidState {
                operation: "configure",
                state: ScanState::Moving
            })
        );
        assert_eq!(axis.parameters(), AxisParameters::new(0, 100, 3));
    }

    #[test]
    fn test_dwell_uses_injected_clock() {
        let (mut axis, _, clock) = axis_with(1000);
        axis.energize().unwrap();
        axis.configure(AxisParameters::new(0, 100, 3)).unwrap();
        axis.start_scan().unwrap();
        assert!(matches!(axis.tick(), Some(AxisEvent::Settled { position: 0, .. })));
        assert!(!axis.dwell_elapsed());
        clock.advance(Duration::from_millis(1999));
        assert!(!axis.dwell_elapsed());
        clock.advance(Duration::from_millis(1));
        assert!(axis.dwell_elapsed());
    }

    #[test]
    fn test_waiting_tick_is_level_not_edge() {
        let (mut axis, _, _) = axis_with(1000);
        axis.energize().unwrap();
        axis.configure(AxisParameters::new(0, 100, 2)).unwrap();
        axis.start_scan().unwrap();
        assert!(axis.tick().is_some());
        assert!(axis.tick().is_none());
        assert_eq!(axis.settle_count(), 1);
    }

    #[test]
    fn test_failed_move_keeps_division() {
        let (mut axis, motor, _) = axis_with(1000);
        axis.energize().unwrap();
        axis.configure(AxisParameters::new(0, 100, 3)).unwrap();
        axis.start_scan().unwrap();
        axis.tick();
        motor.set_disconnected(true);
        assert!(matches!(
            axis.continue_scan(),
            Err(ScanError::DeviceUnavailable(_))
        ));
        assert_eq!(axis.division(), 0);
        assert_eq!(axis.state(), ScanState::Idle);
        assert!(axis.fault().is_some());
    }

    #[test]
    fn test_progress_tracks_divisions_and_travel() {
        assert_eq!(movement_progress(0, 0, 0, 0, 0), 0.0);
        assert_eq!(movement_progress(4, 4, 0, 100, 100), 1.0);
        assert!((movement_progress(1, 4, 25, 30, 50) - 0.3).abs() < 1e-9);
        assert!((movement_progress(2, 4, 50, 50, 50) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_zero_stops_scan_and_resets_position() {
        let (mut axis, motor, _) = axis_with(10);
        axis.energize().unwrap();
        axis.configure(AxisParameters::new(0, 500, 2)).unwrap();
        axis.start_scan().unwrap();
        axis.tick();
        axis.continue_scan().unwrap();
        axis.tick();
        axis.zero().unwrap();
        assert_eq!(axis.state(), ScanState::Idle);
        assert_eq!(axis.current_position(), 0);
        assert_eq!(motor.snapshot().current_position, 0);
    }
}
