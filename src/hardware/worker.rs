// src/hardware/worker.rs - Runs a blocking motor handle on its own thread
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, TrySendError, bounded};

use super::{HardwareError, MotorHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerCommand {
    SetTarget(i32),
    HaltAndHold,
    HaltAndSetPosition(i32),
    Energize,
    Deenergize,
    SetCurrentLimit(u8),
    SetMaxSpeed(u32),
    ExitSafeStart,
    Shutdown,
}

#[derive(Debug)]
struct SharedStatus {
    position: AtomicI32,
    alive: AtomicBool,
    last_error: Mutex<Option<HardwareError>>,
}

impl SharedStatus {
    fn record_error(&self, error: HardwareError) {
        let mut slot = self.last_error.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(error);
    }

    fn take_error(&self) -> Option<HardwareError> {
        self.last_error.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// Owns a blocking [`MotorHandle`] on a dedicated thread.
///
/// Commands are queued without waiting for the device; position reads return
/// the value from the most recent poll. Errors raised by the device on the
/// worker thread are reported by the next `get_current_position` call.
pub struct MotorWorker {
    serial_number: String,
    commands: Sender<WorkerCommand>,
    status: Arc<SharedStatus>,
    thread: Option<JoinHandle<()>>,
}

impl MotorWorker {
    pub fn spawn(
        mut motor: Box<dyn MotorHandle>,
        poll_interval: Duration,
        queue_capacity: usize,
    ) -> Result<Self, HardwareError> {
        let serial_number = motor.serial_number().to_string();
        let initial = motor.get_current_position()?;
        let status = Arc::new(SharedStatus {
            position: AtomicI32::new(initial),
            alive: AtomicBool::new(true),
            last_error: Mutex::new(None),
        });
        let (commands, inbox) = bounded(queue_capacity.max(1));

        let thread_status = status.clone();
        let thread = std::thread::Builder::new()
            .name(format!("motor-{}", serial_number))
            .spawn(move || {
                loop {
                    match inbox.recv_timeout(poll_interval) {
                        Ok(WorkerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Ok(command) => {
                            if let Err(e) = execute(motor.as_mut(), command) {
                                tracing::warn!(
                                    "Motor {} command {:?} failed: {}",
                                    motor.serial_number(),
                                    command,
                                    e
                                );
                                thread_status.record_error(e);
                            } else if let WorkerCommand::HaltAndSetPosition(position) = command {
                                thread_status.position.store(position, Ordering::SeqCst);
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => match motor.get_current_position() {
                            Ok(position) => {
                                thread_status.position.store(position, Ordering::SeqCst)
                            }
                            Err(e) => thread_status.record_error(e),
                        },
                    }
                }
                thread_status.alive.store(false, Ordering::SeqCst);
                tracing::debug!("Motor worker {} stopped", motor.serial_number());
            })
            .map_err(|e| HardwareError::CommandFailed {
                command: "spawn worker".to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            serial_number,
            commands,
            status,
            thread: Some(thread),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.status.alive.load(Ordering::SeqCst)
    }

    fn enqueue(&self, command: WorkerCommand) -> Result<(), HardwareError> {
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(HardwareError::QueueFull(self.serial_number.clone())),
            Err(TrySendError::Disconnected(_)) => {
                Err(HardwareError::WorkerStopped(self.serial_number.clone()))
            }
        }
    }
}

fn execute(motor: &mut dyn MotorHandle, command: WorkerCommand) -> Result<(), HardwareError> {
    match command {
        WorkerCommand::SetTarget(position) => motor.set_target_position(position),
        WorkerCommand::HaltAndHold => motor.halt_and_hold(),
        WorkerCommand::HaltAndSetPosition(position) => motor.halt_and_set_position(position),
        WorkerCommand::Energize => motor.energize(),
        WorkerCommand::Deenergize => motor.deenergize(),
        WorkerCommand::SetCurrentLimit(code) => motor.set_current_limit(code),
        WorkerCommand::SetMaxSpeed(speed) => motor.set_max_speed(speed),
        WorkerCommand::ExitSafeStart => motor.exit_safe_start(),
        WorkerCommand::Shutdown => Ok(()),
    }
}

impl MotorHandle for MotorWorker {
    fn serial_number(&self) -> &str {
        &self.serial_number
    }

    fn get_current_position(&mut self) -> Result<i32, HardwareError> {
        if let Some(error) = self.status.take_error() {
            return Err(error);
        }
        if !self.is_alive() {
            return Err(HardwareError::WorkerStopped(self.serial_number.clone()));
        }
        Ok(self.status.position.load(Ordering::SeqCst))
    }

    fn set_target_position(&mut self, position: i32) -> Result<(), HardwareError> {
        self.enqueue(WorkerCommand::SetTarget(position))
    }

    fn halt_and_hold(&mut self) -> Result<(), HardwareError> {
        self.enqueue(WorkerCommand::HaltAndHold)
    }

    fn halt_and_set_position(&mut self, position: i32) -> Result<(), HardwareError> {
        self.enqueue(WorkerCommand::HaltAndSetPosition(position))?;
        self.status.position.store(position, Ordering::SeqCst);
        Ok(())
    }

    fn energize(&mut self) -> Result<(), HardwareError> {
        self.enqueue(WorkerCommand::Energize)
    }

    fn deenergize(&mut self) -> Result<(), HardwareError> {
        self.enqueue(WorkerCommand::Deenergize)
    }

    fn set_current_limit(&mut self, code: u8) -> Result<(), HardwareError> {
        self.enqueue(WorkerCommand::SetCurrentLimit(code))
    }

    fn set_max_speed(&mut self, steps_per_second: u32) -> Result<(), HardwareError> {
        self.enqueue(WorkerCommand::SetMaxSpeed(steps_per_second))
    }

    fn exit_safe_start(&mut self) -> Result<(), HardwareError> {
        self.enqueue(WorkerCommand::ExitSafeStart)
    }
}

impl Drop for MotorWorker {
    fn drop(&mut self) {
        // Blocking send: the shutdown must not be lost behind a full queue.
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedMotor;

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn cached_position(worker: &mut MotorWorker) -> i32 {
        worker.get_current_position().unwrap()
    }

    #[test]
    fn test_worker_moves_motor_in_background() {
        let device = SimulatedMotor::new("00000042", 25);
        let mut worker =
            MotorWorker::spawn(Box::new(device.clone()), Duration::from_millis(2), 8).unwrap();
        worker.energize().unwrap();
        worker.exit_safe_start().unwrap();
        worker.set_target_position(100).unwrap();
        assert!(wait_for(|| device.snapshot().current_position == 100));
        assert!(wait_for(|| worker.status.position.load(Ordering::SeqCst) == 100));
        assert_eq!(worker.get_current_position().unwrap(), 100);
    }

    #[test]
    fn test_worker_reports_device_errors() {
        let device = SimulatedMotor::new("00000043", 10);
        let mut worker =
            MotorWorker::spawn(Box::new(device.clone()), Duration::from_millis(2), 8).unwrap();
        device.set_disconnected(true);
        assert!(wait_for(|| worker.status.last_error.lock().unwrap().is_some()));
        assert!(matches!(
            worker.get_current_position(),
            Err(HardwareError::NotConnected(_))
        ));
    }

    #[test]
    fn test_halt_and_set_position_updates_cache() {
        let device = SimulatedMotor::new("00000044", 10);
        let mut worker =
            MotorWorker::spawn(Box::new(device), Duration::from_millis(50), 8).unwrap();
        worker.halt_and_set_position(0).unwrap();
        worker.halt_and_set_position(250).unwrap();
        assert!(wait_for(|| worker.status.position.load(Ordering::SeqCst) == 250));
        assert_eq!(cached_position(&mut worker), 250);
    }

    #[test]
    fn test_max_speed_reaches_device() {
        let device = SimulatedMotor::new("00000045", 10);
        let mut worker =
            MotorWorker::spawn(Box::new(device.clone()), Duration::from_millis(2), 4).unwrap();
        worker.set_max_speed(1200).unwrap();
        assert!(wait_for(|| device.snapshot().max_speed == 1200));
    }
}
