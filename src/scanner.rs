// src/scanner.rs - Async host owning the scan sequencer and camera worker
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::capture::{
    Camera, CameraError, CaptureCompletion, CaptureCoordinator, CaptureRequest, Gphoto2Camera,
    SimulatedCamera, run_camera_worker,
};
use crate::config::{CameraBackend, Config};
use crate::error::ScanError;
use crate::hardware::{
    HardwareError, MotorHandle, MotorRegistry, MotorWorker, SimulatedMotor, SimulatedRegistry,
    TicCmdMotor, TicCmdRegistry,
};
use crate::motion::{AxisController, AxisId, AxisParameters};
use crate::scan::{ScanEvent, ScanSequencer, SequencerStatus, StopHandle};
use crate::scheduler::TimeInterface;

#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("No motors available for any axis")]
    NoMotors,
    #[error("Scanner task has stopped")]
    Stopped,
}

/// Requests handled by the scanner task between ticks.
#[derive(Debug)]
pub enum ScannerCommand {
    StartScan {
        respond_to: oneshot::Sender<Result<Uuid, ScanError>>,
    },
    ConfigureAxis {
        axis: AxisId,
        parameters: AxisParameters,
        respond_to: oneshot::Sender<Result<(), ScanError>>,
    },
    ZeroAxis {
        axis: AxisId,
        respond_to: oneshot::Sender<Result<(), ScanError>>,
    },
    JogAxis {
        axis: AxisId,
        position: i32,
        respond_to: oneshot::Sender<Result<(), ScanError>>,
    },
    GetStatus {
        respond_to: oneshot::Sender<SequencerStatus>,
    },
}

/// Clonable front door to a running [`Scanner`].
#[derive(Debug, Clone)]
pub struct ScannerHandle {
    commands: mpsc::Sender<ScannerCommand>,
    events: broadcast::Sender<ScanEvent>,
    shutdown: broadcast::Sender<()>,
    stop: StopHandle,
}

impl ScannerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ScannerCommand,
    ) -> Result<T, ScannerError> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(build(respond_to))
            .await
            .map_err(|_| ScannerError::Stopped)?;
        response.await.map_err(|_| ScannerError::Stopped)
    }

    pub async fn start_scan(&self) -> Result<Uuid, ScannerError> {
        Ok(self
            .request(|respond_to| ScannerCommand::StartScan { respond_to })
            .await??)
    }

    pub async fn configure_axis(
        &self,
        axis: AxisId,
        parameters: AxisParameters,
    ) -> Result<(), ScannerError> {
        Ok(self
            .request(|respond_to| ScannerCommand::ConfigureAxis {
                axis,
                parameters,
                respond_to,
            })
            .await??)
    }

    pub async fn zero_axis(&self, axis: AxisId) -> Result<(), ScannerError> {
        Ok(self
            .request(|respond_to| ScannerCommand::ZeroAxis { axis, respond_to })
            .await??)
    }

    pub async fn jog_axis(&self, axis: AxisId, position: i32) -> Result<(), ScannerError> {
        Ok(self
            .request(|respond_to| ScannerCommand::JogAxis {
                axis,
                position,
                respond_to,
            })
            .await??)
    }

    pub async fn status(&self) -> Result<SequencerStatus, ScannerError> {
        self.request(|respond_to| ScannerCommand::GetStatus { respond_to })
            .await
    }

    /// Takes effect on the next tick; does not wait for the scanner task.
    pub fn emergency_stop(&self) {
        self.stop.request_stop();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

pub struct Scanner {
    sequencer: ScanSequencer,
    tick_interval: Duration,
    commands: mpsc::Receiver<ScannerCommand>,
    events: broadcast::Sender<ScanEvent>,
    shutdown_rx: broadcast::Receiver<()>,
    camera_worker: Option<JoinHandle<()>>,
}

impl Scanner {
    pub fn new(sequencer: ScanSequencer, tick_interval: Duration) -> (Self, ScannerHandle) {
        let (command_tx, commands) = mpsc::channel(32);
        let (events, _) = broadcast::channel(256);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let handle = ScannerHandle {
            commands: command_tx,
            events: events.clone(),
            shutdown,
            stop: sequencer.stop_handle(),
        };
        let scanner = Self {
            sequencer,
            tick_interval,
            commands,
            events,
            shutdown_rx,
            camera_worker: None,
        };
        (scanner, handle)
    }

    /// Starts `camera` on its own task, consuming `requests` and answering on
    /// `completions`. It stops with the scanner.
    pub fn attach_camera(
        &mut self,
        handle: &ScannerHandle,
        camera: Box<dyn Camera>,
        requests: mpsc::Receiver<CaptureRequest>,
        completions: mpsc::Sender<CaptureCompletion>,
    ) {
        let shutdown = handle.shutdown.subscribe();
        self.camera_worker = Some(tokio::spawn(run_camera_worker(
            camera,
            requests,
            completions,
            shutdown,
        )));
    }

    /// Builds motors, axes, camera and host from `config` and energizes the
    /// motors.
    pub async fn from_config(
        config: &Config,
        clock: Arc<dyn TimeInterface>,
    ) -> Result<(Self, ScannerHandle), ScannerError> {
        let registry: Box<dyn MotorRegistry> = if config.hardware.simulate {
            Box::new(simulated_registry(config))
        } else {
            Box::new(TicCmdRegistry::new(config.hardware.ticcmd.clone()))
        };
        let (mut sequencer, requests, completions) =
            build_sequencer(config, registry.as_ref(), clock)?;
        if let Err(e) = sequencer.energize_all() {
            tracing::warn!("Not every axis could be energized: {}", e);
        }
        let camera = build_camera(config).await?;

        let (mut scanner, handle) = Scanner::new(sequencer, config.scanner.tick_interval());
        scanner.attach_camera(&handle, camera, requests, completions);
        Ok((scanner, handle))
    }

    pub fn spawn(self) -> JoinHandle<ScanSequencer> {
        tokio::spawn(self.run())
    }

    /// Runs until shutdown is signalled or every handle is dropped. On exit
    /// all axes are stopped and de-energized; the sequencer is handed back.
    pub async fn run(mut self) -> ScanSequencer {
        tracing::info!("Scanner running, tick every {:?}", self.tick_interval);
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    tracing::info!("Scanner shutting down");
                    break;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        tracing::info!("All scanner handles dropped");
                        break;
                    };
                    self.handle_command(command);
                }
                _ = interval.tick() => {
                    let events = self.sequencer.tick();
                    self.publish(events);
                }
            }
        }

        let events = self.sequencer.emergency_stop();
        self.publish(events);
        self.sequencer.deenergize_all();
        if let Some(worker) = self.camera_worker.take() {
            worker.abort();
            let _ = worker.await;
        }
        self.sequencer
    }

    fn handle_command(&mut self, command: ScannerCommand) {
        match command {
            ScannerCommand::StartScan { respond_to } => {
                let result = self.sequencer.start_full_scan().map(|events| {
                    let id = self.sequencer.session().map(|s| s.id).unwrap_or_default();
                    self.publish(events);
                    id
                });
                let _ = respond_to.send(result);
            }
            ScannerCommand::ConfigureAxis {
                axis,
                parameters,
                respond_to,
            } => {
                let _ = respond_to.send(self.sequencer.configure_axis(axis, parameters));
            }
            ScannerCommand::ZeroAxis { axis, respond_to } => {
                let _ = respond_to.send(self.sequencer.zero_axis(axis));
            }
            ScannerCommand::JogAxis {
                axis,
                position,
                respond_to,
            } => {
                let _ = respond_to.send(self.sequencer.jog_axis(axis, position));
            }
            ScannerCommand::GetStatus { respond_to } => {
                let _ = respond_to.send(self.sequencer.status());
            }
        }
    }

    fn publish(&self, events: Vec<ScanEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

/// Serial numbers configured for simulated steppers, or placeholders.
fn simulated_registry(config: &Config) -> SimulatedRegistry {
    let serials = config
        .axis_assignments()
        .into_iter()
        .map(|(axis, _, stepper)| {
            stepper
                .serial
                .clone()
                .unwrap_or_else(|| format!("sim-{}", axis))
        })
        .collect();
    SimulatedRegistry::new(serials)
}

/// Opens one motor per configured axis. Axes without a configured serial
/// take the next unclaimed serial from `registry`; axes left without a
/// motor are skipped.
pub fn build_sequencer(
    config: &Config,
    registry: &dyn MotorRegistry,
    clock: Arc<dyn TimeInterface>,
) -> Result<
    (
        ScanSequencer,
        mpsc::Receiver<CaptureRequest>,
        mpsc::Sender<CaptureCompletion>,
    ),
    ScannerError,
> {
    let available = registry.list_serial_numbers()?;
    tracing::info!("Found {} motor(s): {:?}", available.len(), available);

    let assignments = config.axis_assignments();
    let mut claimed: Vec<String> = assignments
        .iter()
        .filter_map(|(_, _, stepper)| stepper.serial.clone())
        .collect();
    let mut axes = Vec::new();
    for (axis, name, stepper) in assignments {
        let serial = match &stepper.serial {
            Some(serial) => {
                if !available.contains(serial) {
                    tracing::warn!("Motor {} for {} ({}) not found", serial, name, axis);
                    continue;
                }
                serial.clone()
            }
            None => match available.iter().find(|s| !claimed.contains(s)) {
                Some(serial) => {
                    claimed.push(serial.clone());
                    serial.clone()
                }
                None => {
                    tracing::warn!("No motor left for {} ({})", name, axis);
                    continue;
                }
            },
        };

        let motor = open_motor(config, &serial)?;
        let mut controller = AxisController::new(
            axis,
            motor,
            clock.clone(),
            config.scanner.axis_tuning(stepper),
        );
        controller.configure(stepper.parameters())?;
        tracing::info!("Axis {} bound to motor {}", axis, serial);
        axes.push(controller);
    }
    if axes.is_empty() {
        return Err(ScannerError::NoMotors);
    }

    let (capture, requests, completions) = CaptureCoordinator::with_channels(
        config.scanner.trigger_axis,
        config.camera.queue_capacity,
    );
    let sequencer = ScanSequencer::new(axes, capture, config.scanner.sequencer_config());
    Ok((sequencer, requests, completions))
}

fn open_motor(config: &Config, serial: &str) -> Result<Box<dyn MotorHandle>, ScannerError> {
    let hardware = &config.hardware;
    if hardware.simulate {
        let motor = SimulatedMotor::new(serial, hardware.simulated_speed)
            .with_landing_noise(hardware.simulated_noise);
        return Ok(Box::new(motor));
    }
    let motor = TicCmdMotor::new(hardware.ticcmd.clone(), serial);
    let worker = MotorWorker::spawn(
        Box::new(motor),
        hardware.worker_poll_interval(),
        hardware.command_queue,
    )?;
    Ok(Box::new(worker))
}

pub async fn build_camera(config: &Config) -> Result<Box<dyn Camera>, CameraError> {
    let camera = &config.camera;
    Ok(match camera.backend {
        CameraBackend::Simulated => Box::new(
            SimulatedCamera::new(
                camera.output_dir.clone(),
                camera.subject.clone(),
                Duration::from_millis(camera.simulated_capture_ms),
            )
            .with_owner(camera.owner.clone()),
        ),
        CameraBackend::Gphoto2 => Box::new(
            Gphoto2Camera::detect(
                camera.gphoto2.clone(),
                camera.output_dir.clone(),
                camera.subject.clone(),
            )
            .await?
            .with_owner(camera.owner.clone()),
        ),
    })
}
