// src/motion/mod.rs - Axis positions and per-axis scan control
pub mod axis;
pub mod positions;

pub use axis::{
    AxisController, AxisEvent, AxisId, AxisParameters, AxisStatus, AxisTuning, ContinueOutcome,
    DEFAULT_DWELL, DEFAULT_MAX_SPEED, DEFAULT_POSITION_TOLERANCE, MAX_DIVISIONS, ScanState,
    movement_progress, position_reached,
};
pub use positions::{PositionSequence, compute_positions};
