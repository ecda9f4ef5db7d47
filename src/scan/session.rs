// src/scan/session.rs - Bookkeeping for one full scan
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::capture::{CaptureStats, GridPoint};
use crate::motion::AxisId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionOutcome {
    Completed,
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub axes: Vec<AxisId>,
    pub expected_points: usize,
    /// Grid points reached with every participating axis settled, in order.
    pub visited: Vec<GridPoint>,
    pub captures: CaptureStats,
    pub outcome: Option<SessionOutcome>,
}

impl ScanSession {
    pub fn new(axes: Vec<AxisId>, expected_points: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            axes,
            expected_points,
            visited: Vec::new(),
            captures: CaptureStats::default(),
            outcome: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.outcome.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.outcome == Some(SessionOutcome::Completed)
    }

    pub fn record_visit(&mut self, point: GridPoint) {
        self.visited.push(point);
    }

    pub fn finish(&mut self, outcome: SessionOutcome, captures: CaptureStats) {
        self.finished_at = Some(Utc::now());
        self.captures = captures;
        self.outcome = Some(outcome);
    }

    pub fn progress(&self) -> f64 {
        if self.is_complete() {
            return 1.0;
        }
        if self.expected_points == 0 {
            return 0.0;
        }
        (self.visited.len() as f64 / self.expected_points as f64).clamp(0.0, 1.0)
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_and_outcome() {
        let mut session = ScanSession::new(vec![AxisId::Forward, AxisId::Tilt], 4);
        assert!(session.is_active());
        assert_eq!(session.progress(), 0.0);
        session.record_visit(GridPoint::default());
        assert_eq!(session.progress(), 0.25);
        session.finish(SessionOutcome::Aborted("stop".to_string()), CaptureStats::default());
        assert!(!session.is_active());
        assert!(!session.is_complete());
        assert!(session.finished_at.is_some());
        assert_eq!(session.progress(), 0.25);
    }

    #[test]
    fn test_completed_session_reports_full_progress() {
        let mut session = ScanSession::new(vec![AxisId::Yaw], 0);
        session.finish(SessionOutcome::Completed, CaptureStats::default());
        assert_eq!(session.progress(), 1.0);
        assert!(session.elapsed() >= chrono::Duration::zero());
    }
}
