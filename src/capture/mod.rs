//! # Capture coordination
//!
//! The [`CaptureCoordinator`] turns settle events of the trigger axis into
//! [`CaptureRequest`]s on a bounded channel and tracks their completions. It
//! never waits for the camera: the request is queued with `try_send` and the
//! camera worker (see [`camera::run_camera_worker`]) reports back on a second
//! channel that is drained once per scan tick.
//!
//! A request fires at most once per settle of the trigger axis, however many
//! ticks the axis spends waiting.

pub mod camera;

pub use camera::{
    Camera, CameraError, CameraInfo, Gphoto2Camera, SimulatedCamera, detect_cameras,
    file_name_for, parse_auto_detect, run_camera_worker,
};

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

use crate::error::ScanError;
use crate::motion::AxisId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisCoordinate {
    pub division: usize,
    pub position: i32,
}

/// Where every participating axis stood when a capture was requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridPoint {
    pub forward: Option<AxisCoordinate>,
    pub tilt: Option<AxisCoordinate>,
    pub yaw: Option<AxisCoordinate>,
}

impl GridPoint {
    pub fn get(&self, axis: AxisId) -> Option<AxisCoordinate> {
        match axis {
            AxisId::Forward => self.forward,
            AxisId::Tilt => self.tilt,
            AxisId::Yaw => self.yaw,
        }
    }

    pub fn set(&mut self, axis: AxisId, coordinate: AxisCoordinate) {
        let slot = match axis {
            AxisId::Forward => &mut self.forward,
            AxisId::Tilt => &mut self.tilt,
            AxisId::Yaw => &mut self.yaw,
        };
        *slot = Some(coordinate);
    }

    /// Divisions as `(forward, tilt, yaw)`, unset axes reading 0.
    pub fn divisions(&self) -> (usize, usize, usize) {
        let division = |c: Option<AxisCoordinate>| c.map_or(0, |c| c.division);
        (division(self.forward), division(self.tilt), division(self.yaw))
    }

    pub fn position(&self, axis: AxisId) -> i32 {
        self.get(axis).map_or(0, |c| c.position)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    /// Monotonic per coordinator; completions refer back to it.
    pub sequence: u64,
    pub axis: AxisId,
    pub position: i32,
    pub grid: GridPoint,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureOutcome {
    Saved(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureCompletion {
    pub sequence: u64,
    pub outcome: CaptureOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub requested: u64,
    pub dropped: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
}

pub struct CaptureCoordinator {
    trigger_axis: AxisId,
    requests: mpsc::Sender<CaptureRequest>,
    completions: mpsc::Receiver<CaptureCompletion>,
    last_fired_settle: Option<u64>,
    next_sequence: u64,
    outstanding: BTreeSet<u64>,
    stats: CaptureStats,
}

impl CaptureCoordinator {
    pub fn new(
        trigger_axis: AxisId,
        requests: mpsc::Sender<CaptureRequest>,
        completions: mpsc::Receiver<CaptureCompletion>,
    ) -> Self {
        Self {
            trigger_axis,
            requests,
            completions,
            last_fired_settle: None,
            next_sequence: 1,
            outstanding: BTreeSet::new(),
            stats: CaptureStats::default(),
        }
    }

    /// Builds a coordinator together with the camera side of both channels.
    pub fn with_channels(
        trigger_axis: AxisId,
        capacity: usize,
    ) -> (
        Self,
        mpsc::Receiver<CaptureRequest>,
        mpsc::Sender<CaptureCompletion>,
    ) {
        let (request_tx, request_rx) = mpsc::channel(capacity.max(1));
        let (completion_tx, completion_rx) = mpsc::channel(capacity.max(1));
        (
            Self::new(trigger_axis, request_tx, completion_rx),
            request_rx,
            completion_tx,
        )
    }

    pub fn trigger_axis(&self) -> AxisId {
        self.trigger_axis
    }

    pub fn set_trigger_axis(&mut self, axis: AxisId) {
        self.trigger_axis = axis;
        self.last_fired_settle = None;
    }

    /// Requests a photo if `axis` is the trigger axis and this settle has not
    /// fired yet. `settle_count` identifies the settle event.
    ///
    /// A full or closed request channel drops the request; the settle still
    /// counts as handled so it is never retried.
    pub fn on_axis_settled(
        &mut self,
        axis: AxisId,
        position: i32,
        settle_count: u64,
        grid: GridPoint,
    ) -> Result<Option<CaptureRequest>, ScanError> {
        if axis != self.trigger_axis || self.last_fired_settle == Some(settle_count) {
            return Ok(None);
        }
        self.last_fired_settle = Some(settle_count);

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let request = CaptureRequest {
            sequence,
            axis,
            position,
            grid,
            requested_at: Utc::now(),
        };
        match self.requests.try_send(request.clone()) {
            Ok(()) => {
                self.stats.requested += 1;
                self.outstanding.insert(sequence);
                tracing::debug!("Capture {} requested at {} {}", sequence, axis, position);
                Ok(Some(request))
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.stats.dropped += 1;
                tracing::warn!(
                    "Capture {} at {} {} dropped: camera queue unavailable",
                    sequence,
                    axis,
                    position
                );
                Err(ScanError::CaptureChannelFull { sequence })
            }
        }
    }

    /// Drains completions reported by the camera worker.
    pub fn poll_completions(&mut self) -> Vec<CaptureCompletion> {
        let mut drained = Vec::new();
        loop {
            match self.completions.try_recv() {
                Ok(completion) => {
                    if !self.outstanding.remove(&completion.sequence) {
                        tracing::warn!("Completion for unknown capture {}", completion.sequence);
                        continue;
                    }
                    match &completion.outcome {
                        CaptureOutcome::Saved(path) => {
                            self.stats.completed += 1;
                            tracing::info!(
                                "Capture {} saved to {}",
                                completion.sequence,
                                path.display()
                            );
                        }
                        CaptureOutcome::Failed(reason) => {
                            self.stats.failed += 1;
                            tracing::warn!("Capture {} failed: {}", completion.sequence, reason);
                        }
                    }
                    drained.push(completion);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        drained
    }

    pub fn pending(&self) -> usize {
        self.outstanding.len()
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            pending: self.outstanding.len() as u64,
            ..self.stats
        }
    }

    pub fn reset_stats(&mut self) {
        self.stats = CaptureStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(forward: i32) -> GridPoint {
        let mut grid = GridPoint::default();
        grid.set(
            AxisId::Forward,
            AxisCoordinate {
                division: 0,
                position: forward,
            },
        );
        grid
    }

    #[test]
    fn test_fires_once_per_settle() {
        let (mut coordinator, mut requests, _completions) =
            CaptureCoordinator::with_channels(AxisId::Forward, 4);
        assert!(coordinator.on_axis_settled(AxisId::Forward, 10, 1, grid(10)).unwrap().is_some());
        assert!(coordinator.on_axis_settled(AxisId::Forward, 10, 1, grid(10)).unwrap().is_none());
        assert!(coordinator.on_axis_settled(AxisId::Forward, 20, 2, grid(20)).unwrap().is_some());
        assert_eq!(requests.try_recv().unwrap().position, 10);
        assert_eq!(requests.try_recv().unwrap().sequence, 2);
        assert!(requests.try_recv().is_err());
    }

    #[test]
    fn test_ignores_other_axes() {
        let (mut coordinator, _requests, _completions) =
            CaptureCoordinator::with_channels(AxisId::Forward, 4);
        assert_eq!(coordinator.on_axis_settled(AxisId::Tilt, 10, 1, grid(0)), Ok(None));
        assert_eq!(coordinator.stats().requested, 0);
    }

    #[test]
    fn test_full_channel_drops_request() {
        let (mut coordinator, _requests, _completions) =
            CaptureCoordinator::with_channels(AxisId::Forward, 1);
        coordinator.on_axis_settled(AxisId::Forward, 0, 1, grid(0)).unwrap();
        assert_eq!(
            coordinator.on_axis_settled(AxisId::Forward, 5, 2, grid(5)),
            Err(ScanError::CaptureChannelFull { sequence: 2 })
        );
        // The dropped settle is not retried.
        assert_eq!(coordinator.on_axis_settled(AxisId::Forward, 5, 2, grid(5)), Ok(None));
        let stats = coordinator.stats();
        assert_eq!((stats.requested, stats.dropped, stats.pending), (1, 1, 1));
    }

    #[test]
    fn test_completions_update_stats() {
        let (mut coordinator, _requests, completions) =
            CaptureCoordinator::with_channels(AxisId::Forward, 4);
        coordinator.on_axis_settled(AxisId::Forward, 0, 1, grid(0)).unwrap();
        coordinator.on_axis_settled(AxisId::Forward, 5, 2, grid(5)).unwrap();
        completions
            .try_send(CaptureCompletion {
                sequence: 1,
                outcome: CaptureOutcome::Saved(PathBuf::from("a.jpg")),
            })
            .unwrap();
        completions
            .try_send(CaptureCompletion {
                sequence: 2,
                outcome: CaptureOutcome::Failed("busy".to_string()),
            })
            .unwrap();
        assert_eq!(coordinator.poll_completions().len(), 2);
        let stats = coordinator.stats();
        assert_eq!((stats.completed, stats.failed, stats.pending), (1, 1, 0));
    }

    #[test]
    fn test_grid_point_accessors() {
        let mut point = GridPoint::default();
        point.set(AxisId::Yaw, AxisCoordinate { division: 2, position: -40 });
        assert_eq!(point.divisions(), (0, 0, 2));
        assert_eq!(point.position(AxisId::Yaw), -40);
        assert_eq!(point.position(AxisId::Tilt), 0);
    }
}
