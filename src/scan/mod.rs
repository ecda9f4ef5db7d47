//! # Scan sequencing
//!
//! [`ScanSequencer`] drives up to three [`AxisController`]s through a nested
//! traversal of their position grids. Forward is the innermost loop and Yaw
//! the outermost; Forward returns to its first stop each time an outer axis
//! advances.
//!
//! Every tick the sequencer lets each participating axis update its own
//! Moving -> Waiting transition, then acts only once **all** of them are
//! Waiting. At that barrier it asks the [`CaptureCoordinator`] for a photo,
//! and once every dwell timer has run out it moves exactly one axis (plus the
//! restart of the axes inside it).
//!
//! ```text
//!   tick ─▶ completions ─▶ axis ticks ─▶ all Waiting?
//!        ─▶ capture ─▶ dwell done? ─▶ advance
//! ```
//!
//! An emergency stop can be requested from anywhere through a [`StopHandle`]
//! and is applied at the start of the next tick.

pub mod session;

pub use session::{ScanSession, SessionOutcome};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::capture::{
    AxisCoordinate, CaptureCompletion, CaptureCoordinator, CaptureRequest, CaptureStats, GridPoint,
};
use crate::error::ScanError;
use crate::motion::{
    AxisController, AxisEvent, AxisId, AxisParameters, AxisStatus, ContinueOutcome, ScanState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequencerState {
    NotScanning,
    Scanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerConfig {
    pub trigger_axis: AxisId,
    /// Hold advancement until every requested capture has completed.
    pub gate_on_capture: bool,
    /// Stop the whole scan on a device fault instead of dropping the axis.
    pub abort_on_fault: bool,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            trigger_axis: AxisId::Forward,
            gate_on_capture: false,
            abort_on_fault: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ScanEvent {
    ScanStarted {
        session: Uuid,
        axes: Vec<AxisId>,
        expected_points: usize,
    },
    AxisSettled {
        axis: AxisId,
        position: i32,
        division: usize,
    },
    CaptureRequested(CaptureRequest),
    CaptureDropped {
        sequence: u64,
    },
    CaptureFinished(CaptureCompletion),
    AxisAdvanced {
        axis: AxisId,
        division: usize,
        target: i32,
    },
    AxisRestarted {
        axis: AxisId,
    },
    AxisFaulted {
        axis: AxisId,
        error: String,
    },
    ScanCompleted {
        session: Uuid,
        captures: CaptureStats,
    },
    ScanAborted {
        session: Uuid,
        reason: String,
    },
}

/// Emergency-stop request that can be raised from outside the tick loop.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequencerStatus {
    pub state: SequencerState,
    pub participating: Vec<AxisId>,
    pub axes: Vec<AxisStatus>,
    pub captures: CaptureStats,
    pub session: Option<ScanSession>,
    pub progress: f64,
}

pub struct ScanSequencer {
    axes: Vec<AxisController>,
    capture: CaptureCoordinator,
    config: SequencerConfig,
    state: SequencerState,
    participating: Vec<AxisId>,
    session: Option<ScanSession>,
    stop: StopHandle,
}

impl ScanSequencer {
    /// Axes are kept in nesting order; a second controller for the same axis
    /// replaces the first.
    pub fn new(
        axes: Vec<AxisController>,
        capture: CaptureCoordinator,
        config: SequencerConfig,
    ) -> Self {
        let mut ordered: Vec<AxisController> = Vec::with_capacity(axes.len());
        for axis in axes {
            if let Some(index) = ordered.iter().position(|a| a.id() == axis.id()) {
                tracing::warn!("Duplicate controller for axis {}, keeping the last", axis.id());
                ordered[index] = axis;
            } else {
                ordered.push(axis);
            }
        }
        ordered.sort_by_key(|a| a.id().nesting_level());
        Self {
            axes: ordered,
            capture,
            config,
            state: SequencerState::NotScanning,
            participating: Vec::new(),
            session: None,
            stop: StopHandle::default(),
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.state == SequencerState::Scanning
    }

    pub fn config(&self) -> SequencerConfig {
        self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn participating(&self) -> &[AxisId] {
        &self.participating
    }

    /// Current session, or the last one once the scan has ended.
    pub fn session(&self) -> Option<&ScanSession> {
        self.session.as_ref()
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.capture.stats()
    }

    pub fn axis(&self, id: AxisId) -> Option<&AxisController> {
        self.axes.iter().find(|a| a.id() == id)
    }

    pub fn axes(&self) -> impl Iterator<Item = &AxisController> {
        self.axes.iter()
    }

    fn axis_mut(&mut self, id: AxisId) -> Result<&mut AxisController, ScanError> {
        self.axes
            .iter_mut()
            .find(|a| a.id() == id)
            .ok_or_else(|| {
                ScanError::DeviceUnavailable(format!("no motor assigned to axis {}", id))
            })
    }

    pub fn configure_axis(
        &mut self,
        id: AxisId,
        parameters: AxisParameters,
    ) -> Result<(), ScanError> {
        self.axis_mut(id)?.configure(parameters)
    }

    pub fn energize_axis(&mut self, id: AxisId) -> Result<(), ScanError> {
        self.axis_mut(id)?.energize()
    }

    /// Energizes every axis, reporting the first failure after trying all.
    pub fn energize_all(&mut self) -> Result<(), ScanError> {
        let mut first_error = None;
        for axis in &mut self.axes {
            if let Err(e) = axis.energize() {
                tracing::error!("Failed to energize axis {}: {}", axis.id(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn deenergize_all(&mut self) {
        for axis in &mut self.axes {
            if let Err(e) = axis.deenergize() {
                tracing::warn!("Failed to de-energize axis {}: {}", axis.id(), e);
            }
        }
    }

    pub fn zero_axis(&mut self, id: AxisId) -> Result<(), ScanError> {
        if self.is_scanning() && self.participating.contains(&id) {
            let state = self.axis_mut(id)?.state();
            return Err(ScanError::InvalidState {
                operation: "zero a scanning axis",
                state,
            });
        }
        self.axis_mut(id)?.zero()
    }

    pub fn jog_axis(&mut self, id: AxisId, position: i32) -> Result<(), ScanError> {
        self.axis_mut(id)?.jog_to(position)
    }

    /// Starts every axis whose parameters validate. Axes that do not validate
    /// sit the scan out.
    pub fn start_full_scan(&mut self) -> Result<Vec<ScanEvent>, ScanError> {
        if let Some(axis) = self.axes.iter().find(|a| a.state() != ScanState::Idle) {
            return Err(ScanError::InvalidState {
                operation: "start full scan",
                state: axis.state(),
            });
        }
        let candidates: Vec<AxisId> = self
            .axes
            .iter()
            .filter(|a| a.validate_parameters())
            .map(|a| a.id())
            .collect();
        if candidates.is_empty() {
            return Err(ScanError::InvalidScanParameters(
                "no axis has valid scan parameters".to_string(),
            ));
        }

        self.stop.take();
        let mut started = Vec::with_capacity(candidates.len());
        for id in &candidates {
            let result = self.axis_mut(*id)?.start_scan();
            if let Err(e) = result {
                tracing::error!("Axis {} could not start: {}", id, e);
                for started_id in started {
                    self.axis_mut(started_id)?.stop_scan();
                }
                return Err(e);
            }
            started.push(*id);
        }

        let expected_points: usize = self
            .axes
            .iter()
            .filter(|a| candidates.contains(&a.id()))
            .map(|a| a.grid_stops())
            .product();
        self.participating = candidates;
        self.capture.reset_stats();
        self.retarget_capture();
        let session = ScanSession::new(self.participating.clone(), expected_points);
        tracing::info!(
            "Scan {} started on {:?}, {} grid points",
            session.id,
            self.participating,
            expected_points
        );
        let event = ScanEvent::ScanStarted {
            session: session.id,
            axes: self.participating.clone(),
            expected_points,
        };
        self.session = Some(session);
        self.state = SequencerState::Scanning;
        Ok(vec![event])
    }

    /// One scheduler pass. Never blocks.
    pub fn tick(&mut self) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        if self.stop.take() {
            events.extend(self.emergency_stop());
            return events;
        }

        for completion in self.capture.poll_completions() {
            events.push(ScanEvent::CaptureFinished(completion));
        }
        if !self.is_scanning() {
            return events;
        }

        let mut faults = Vec::new();
        for axis in self.axes.iter_mut().filter(|a| self.participating.contains(&a.id())) {
            match axis.tick() {
                Some(AxisEvent::Settled {
                    axis,
                    position,
                    division,
                }) => events.push(ScanEvent::AxisSettled {
                    axis,
                    position,
                    division,
                }),
                Some(AxisEvent::Faulted { axis, error }) => faults.push((axis, error)),
                None => {}
            }
        }
        for (axis, error) in faults {
            if !self.handle_fault(axis, error, &mut events) {
                return events;
            }
        }

        if !self.all_waiting() {
            return events;
        }
        self.request_capture(&mut events);

        if !self.ready_to_advance() {
            return events;
        }
        self.advance(&mut events);
        events
    }

    /// Halts every axis and ends the scan. Safe at any time.
    pub fn emergency_stop(&mut self) -> Vec<ScanEvent> {
        for axis in &mut self.axes {
            axis.stop_scan();
        }
        self.stop.take();
        if !self.is_scanning() {
            return Vec::new();
        }
        tracing::warn!("Emergency stop");
        self.end_scan(SessionOutcome::Aborted("emergency stop".to_string()))
            .into_iter()
            .collect()
    }

    pub fn status(&self) -> SequencerStatus {
        SequencerStatus {
            state: self.state,
            participating: self.participating.clone(),
            axes: self.axes.iter().map(AxisController::status).collect(),
            captures: self.capture.stats(),
            session: self.session.clone(),
            progress: self.session.as_ref().map_or(0.0, ScanSession::progress),
        }
    }

    fn participating_axes(&self) -> impl Iterator<Item = &AxisController> {
        self.axes
            .iter()
            .filter(|a| self.participating.contains(&a.id()))
    }

    fn all_waiting(&self) -> bool {
        !self.participating.is_empty()
            && self
                .participating_axes()
                .all(|a| a.state() == ScanState::Waiting)
    }

    fn ready_to_advance(&self) -> bool {
        let dwell_done = self.participating_axes().all(AxisController::dwell_elapsed);
        dwell_done && (!self.config.gate_on_capture || self.capture.pending() == 0)
    }

    /// The configured trigger axis, or the innermost participating axis when
    /// the configured one sits the scan out.
    fn effective_trigger(&self) -> Option<AxisId> {
        if self.participating.contains(&self.config.trigger_axis) {
            Some(self.config.trigger_axis)
        } else {
            self.participating.first().copied()
        }
    }

    fn retarget_capture(&mut self) {
        if let Some(trigger) = self.effective_trigger() {
            if trigger != self.capture.trigger_axis() {
                tracing::info!("Captures now triggered by axis {}", trigger);
                self.capture.set_trigger_axis(trigger);
            }
        }
    }

    fn grid_point(&self) -> GridPoint {
        let mut point = GridPoint::default();
        for axis in self.participating_axes() {
            point.set(
                axis.id(),
                AxisCoordinate {
                    division: axis.division(),
                    position: axis.current_position(),
                },
            );
        }
        point
    }

    fn request_capture(&mut self, events: &mut Vec<ScanEvent>) {
        let Some(trigger) = self.effective_trigger() else {
            return;
        };
        let Some((position, settle_count)) = self
            .axis(trigger)
            .map(|a| (a.current_position(), a.settle_count()))
        else {
            return;
        };
        let grid = self.grid_point();
        let result = self
            .capture
            .on_axis_settled(trigger, position, settle_count, grid);
        match result {
            Ok(Some(request)) => {
                self.record_visit(grid);
                events.push(ScanEvent::CaptureRequested(request));
            }
            Ok(None) => {}
            Err(ScanError::CaptureChannelFull { sequence }) => {
                self.record_visit(grid);
                events.push(ScanEvent::CaptureDropped { sequence });
            }
            Err(e) => tracing::warn!("Capture request failed: {}", e),
        }
    }

    fn record_visit(&mut self, grid: GridPoint) {
        if let Some(session) = self.session.as_mut() {
            session.record_visit(grid);
        }
    }

    fn advance(&mut self, events: &mut Vec<ScanEvent>) {
        let next = self
            .participating_axes()
            .find(|a| !a.is_grid_exhausted())
            .map(AxisController::id);
        let Some(next) = next else {
            events.extend(self.complete_scan());
            return;
        };

        let inner: Vec<AxisId> = self
            .participating
            .iter()
            .copied()
            .filter(|id| id.nesting_level() < next.nesting_level())
            .collect();
        for id in inner {
            let result = match self.axis_mut(id) {
                Ok(axis) => axis.restart_sequence(),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => events.push(ScanEvent::AxisRestarted { axis: id }),
                Err(e) => {
                    if !self.handle_fault(id, e, events) {
                        return;
                    }
                }
            }
        }

        let result = match self.axis_mut(next) {
            Ok(axis) => axis.continue_scan(),
            Err(e) => Err(e),
        };
        match result {
            Ok(ContinueOutcome::Advanced { division, target }) => {
                events.push(ScanEvent::AxisAdvanced {
                    axis: next,
                    division,
                    target,
                });
            }
            Ok(ContinueOutcome::Completed) => {
                tracing::warn!("Axis {} ran past its grid", next);
                self.participating.retain(|id| *id != next);
            }
            Err(e) => {
                self.handle_fault(next, e, events);
            }
        }
    }

    /// Returns false when the fault ended the scan.
    fn handle_fault(
        &mut self,
        axis: AxisId,
        error: ScanError,
        events: &mut Vec<ScanEvent>,
    ) -> bool {
        tracing::error!("Axis {} faulted during scan: {}", axis, error);
        events.push(ScanEvent::AxisFaulted {
            axis,
            error: error.to_string(),
        });
        if self.config.abort_on_fault {
            for controller in &mut self.axes {
                controller.stop_scan();
            }
            events.extend(self.end_scan(SessionOutcome::Aborted(format!(
                "axis {} fault: {}",
                axis, error
            ))));
            return false;
        }
        self.participating.retain(|id| *id != axis);
        if self.participating.is_empty() {
            events.extend(self.end_scan(SessionOutcome::Aborted(
                "every participating axis faulted".to_string(),
            )));
            return false;
        }
        self.retarget_capture();
        true
    }

    fn complete_scan(&mut self) -> Option<ScanEvent> {
        let participating = self.participating.clone();
        for id in participating {
            if let Ok(axis) = self.axis_mut(id) {
                if let Err(e) = axis.finish_scan() {
                    tracing::warn!("Axis {} did not finish cleanly: {}", id, e);
                    axis.stop_scan();
                }
            }
        }
        self.end_scan(SessionOutcome::Completed)
    }

    fn end_scan(&mut self, outcome: SessionOutcome) -> Option<ScanEvent> {
        self.state = SequencerState::NotScanning;
        let captures = self.capture.stats();
        let session = self.session.as_mut()?;
        session.finish(outcome.clone(), captures);
        let event = match outcome {
            SessionOutcome::Completed => {
                tracing::info!(
                    "Scan {} complete: {} grid points, {} captures requested",
                    session.id,
                    session.visited.len(),
                    captures.requested
                );
                ScanEvent::ScanCompleted {
                    session: session.id,
                    captures,
                }
            }
            SessionOutcome::Aborted(reason) => {
                tracing::warn!("Scan {} aborted: {}", session.id, reason);
                ScanEvent::ScanAborted {
                    session: session.id,
                    reason,
                }
            }
        };
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedMotor;
    use crate::motion::AxisTuning;
    use crate::scheduler::ManualClock;
    use std::time::Duration;

    type Requests = tokio::sync::mpsc::Receiver<CaptureRequest>;

    fn sequencer(params: &[(AxisId, AxisParameters)]) -> (ScanSequencer, ManualClock, Requests) {
        let clock = ManualClock::new();
        let axes = params
            .iter()
            .map(|(id, p)| {
                let motor = SimulatedMotor::new(format!("0000000{}", id.index()), 1_000_000);
                let mut axis = AxisController::new(
                    *id,
                    Box::new(motor),
                    Arc::new(clock.clone()),
                    AxisTuning::default(),
                );
                axis.configure(*p).unwrap();
                axis
            })
            .collect();
        let (capture, requests, _completions) =
            CaptureCoordinator::with_channels(AxisId::Forward, 64);
        let mut sequencer = ScanSequencer::new(axes, capture, SequencerConfig::default());
        sequencer.energize_all().unwrap();
        (sequencer, clock, requests)
    }

    fn forward_only(parameters: AxisParameters) -> (ScanSequencer, ManualClock, Requests) {
        sequencer(&[(AxisId::Forward, parameters)])
    }

    #[test]
    fn test_start_requires_a_valid_axis() {
        let (mut sequencer, _, _requests) = forward_only(AxisParameters::new(0, 100, 0));
        assert!(matches!(
            sequencer.start_full_scan(),
            Err(ScanError::InvalidScanParameters(_))
        ));
        assert_eq!(sequencer.state(), SequencerState::NotScanning);
    }

    #[test]
    fn test_invalid_axes_sit_out() {
        let (mut sequencer, _, _requests) = sequencer(&[
            (AxisId::Forward, AxisParameters::new(0, 100, 2)),
            (AxisId::Tilt, AxisParameters::default()),
        ]);
        sequencer.start_full_scan().unwrap();
        assert_eq!(sequencer.participating(), &[AxisId::Forward]);
        assert_eq!(sequencer.axis(AxisId::Tilt).unwrap().state(), ScanState::Idle);
    }

    #[test]
    fn test_barrier_waits_for_dwell() {
        let (mut sequencer, clock, _requests) = forward_only(AxisParameters::new(0, 100, 3));
        sequencer.start_full_scan().unwrap();
        let events = sequencer.tick();
        assert!(events.iter().any(|e| matches!(e, ScanEvent::CaptureRequested(_))));
        assert!(!events.iter().any(|e| matches!(e, ScanEvent::AxisAdvanced { .. })));
        clock.advance(Duration::from_secs(2));
        let events = sequencer.tick();
        assert!(events.contains(&ScanEvent::AxisAdvanced {
            axis: AxisId::Forward,
            division: 1,
            target: 50
        }));
    }

    #[test]
    fn test_stop_handle_applies_on_next_tick() {
        let (mut sequencer, _, _requests) = forward_only(AxisParameters::new(0, 100, 3));
        sequencer.start_full_scan().unwrap();
        let handle = sequencer.stop_handle();
        handle.request_stop();
        let events = sequencer.tick();
        assert!(matches!(events.as_slice(), [ScanEvent::ScanAborted { .. }]));
        assert!(!handle.is_requested());
        assert_eq!(sequencer.state(), SequencerState::NotScanning);
    }

    #[test]
    fn test_zero_rejected_for_scanning_axis() {
        let (mut sequencer, _, _requests) = forward_only(AxisParameters::new(0, 100, 3));
        sequencer.start_full_scan().unwrap();
        assert!(matches!(
            sequencer.zero_axis(AxisId::Forward),
            Err(ScanError::InvalidState { .. })
        ));
        assert!(matches!(
            sequencer.zero_axis(AxisId::Yaw),
            Err(ScanError::DeviceUnavailable(_))
        ));
    }
}
