//! Three-axis stepper and camera coordinator for automated photogrammetry
//! scanning.
//!
//! A scan moves the Forward, Tilt and Yaw axes through a nested grid of stop
//! positions, waits for every axis to settle, requests a photo and dwells
//! before moving on. The pieces, leaf first:
//!
//! - [`motion::compute_positions`] turns `(min, max, divisions)` into stops.
//! - [`motion::AxisController`] moves one stepper and detects settling.
//! - [`capture::CaptureCoordinator`] turns settles into camera requests.
//! - [`scan::ScanSequencer`] runs the nested traversal across all axes.
//! - [`scanner::Scanner`] hosts the sequencer on a tokio tick loop.

pub mod capture;
pub mod config;
pub mod error;
pub mod hardware;
pub mod motion;
pub mod scan;
pub mod scanner;
pub mod scheduler;
pub mod settings;

pub use config::{Config, ConfigError, load_config};
pub use error::ScanError;
pub use motion::{AxisController, AxisId, AxisParameters, ScanState, compute_positions};
pub use scan::{ScanEvent, ScanSequencer, SequencerState, StopHandle};
pub use scanner::{Scanner, ScannerError, ScannerHandle};
