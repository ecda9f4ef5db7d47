// src/capture/camera.rs - Camera backends and the capture worker task
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};

use super::{CaptureCompletion, CaptureOutcome, CaptureRequest};
use crate::motion::AxisId;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("No camera detected")]
    NotDetected,
    #[error("Camera command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Simulated capture failure: {0}")]
    Simulated(String),
}

#[async_trait]
pub trait Camera: Send {
    fn name(&self) -> &str;
    async fn capture(&mut self, request: &CaptureRequest) -> Result<PathBuf, CameraError>;
}

fn file_safe(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// `<timestamp>_<subject>_<owner>_yaw<Y>_tilt<T>_forward<F>.jpg`; a blank
/// owner is left out.
pub fn file_name_for(subject: &str, owner: &str, request: &CaptureRequest) -> String {
    let mut label = file_safe(subject);
    if !owner.trim().is_empty() {
        label.push('_');
        label.push_str(&file_safe(owner));
    }
    format!(
        "{}_{}_yaw{}_tilt{}_forward{}.jpg",
        request.requested_at.format("%Y%m%d_%H%M%S"),
        label,
        request.grid.position(AxisId::Yaw),
        request.grid.position(AxisId::Tilt),
        request.grid.position(AxisId::Forward),
    )
}

/// Consumes capture requests until the request channel closes or shutdown is
/// signalled. Each request produces exactly one completion.
pub async fn run_camera_worker(
    mut camera: Box<dyn Camera>,
    mut requests: mpsc::Receiver<CaptureRequest>,
    completions: mpsc::Sender<CaptureCompletion>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!("Camera worker started for {}", camera.name());
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Camera worker shutting down");
                break;
            }
            request = requests.recv() => {
                let Some(request) = request else {
                    tracing::debug!("Capture request channel closed");
                    break;
                };
                let outcome = match camera.capture(&request).await {
                    Ok(path) => CaptureOutcome::Saved(path),
                    Err(e) => {
                        tracing::error!(
                            "Capture {} failed on {}: {}",
                            request.sequence,
                            camera.name(),
                            e
                        );
                        CaptureOutcome::Failed(e.to_string())
                    }
                };
                let completion = CaptureCompletion { sequence: request.sequence, outcome };
                if completions.send(completion).await.is_err() {
                    tracing::debug!("Capture completion channel closed");
                    break;
                }
            }
        }
    }
}

/// Camera stand-in: waits, optionally fails, and records what it was asked
/// to shoot. No files are written.
#[derive(Debug, Clone)]
pub struct SimulatedCamera {
    name: String,
    output_dir: PathBuf,
    subject: String,
    owner: String,
    delay: Duration,
    failure_rate: f64,
    captured: Arc<Mutex<Vec<CaptureRequest>>>,
}

impl SimulatedCamera {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        subject: impl Into<String>,
        delay: Duration,
    ) -> Self {
        Self {
            name: "Simulated Camera".to_string(),
            output_dir: output_dir.into(),
            subject: subject.into(),
            owner: String::new(),
            delay,
            failure_rate: 0.0,
            captured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    /// Requests captured so far, shared between clones.
    pub fn captured(&self) -> Vec<CaptureRequest> {
        self.captured
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Camera for SimulatedCamera {
    fn name(&self) -> &str {
        &self.name
    }

    async fn capture(&mut self, request: &CaptureRequest) -> Result<PathBuf, CameraError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failure_rate > 0.0 && rand::rng().random_bool(self.failure_rate) {
            return Err(CameraError::Simulated(format!(
                "request {} at {} {}",
                request.sequence, request.axis, request.position
            )));
        }
        self.captured
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        let file_name = file_name_for(&self.subject, &self.owner, request);
        Ok(self.output_dir.join(file_name))
    }
}

/// Tethered camera driven through the `gphoto2` command line tool.
#[derive(Debug, Clone)]
pub struct Gphoto2Camera {
    program: String,
    model: String,
    output_dir: PathBuf,
    subject: String,
    owner: String,
}

impl Gphoto2Camera {
    pub fn new(
        program: impl Into<String>,
        model: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
            output_dir: output_dir.into(),
            subject: subject.into(),
            owner: String::new(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Binds to the first camera `gphoto2 --auto-detect` reports.
    pub async fn detect(
        program: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        subject: impl Into<String>,
    ) -> Result<Self, CameraError> {
        let program = program.into();
        let camera = detect_cameras(&program)
            .await?
            .into_iter()
            .next()
            .ok_or(CameraError::NotDetected)?;
        tracing::info!("Using camera {} on {}", camera.model, camera.port);
        Ok(Self::new(program, camera.model, output_dir, subject))
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[async_trait]
impl Camera for Gphoto2Camera {
    fn name(&self) -> &str {
        &self.model
    }

    async fn capture(&mut self, request: &CaptureRequest) -> Result<PathBuf, CameraError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let file_name = file_name_for(&self.subject, &self.owner, request);
        let path = self.output_dir.join(file_name);
        let target = path.to_string_lossy().into_owned();
        run_gphoto2(
            &self.program,
            &[
                "--capture-image-and-download",
                "--force-overwrite",
                "--filename",
                &target,
            ],
        )
        .await?;
        Ok(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub model: String,
    pub port: String,
}

/// Parses `gphoto2 --auto-detect`: two header lines, then
/// `<model>   usb:<bus>,<device>` per camera.
pub fn parse_auto_detect(output: &str) -> Vec<CameraInfo> {
    output
        .lines()
        .skip(2)
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.find("usb:") {
            Some(index) => CameraInfo {
                model: line[..index].trim().to_string(),
                port: line[index..].trim().to_string(),
            },
            None => CameraInfo {
                model: line.trim().to_string(),
                port: String::new(),
            },
        })
        .filter(|camera| !camera.model.is_empty())
        .collect()
}

pub async fn detect_cameras(program: &str) -> Result<Vec<CameraInfo>, CameraError> {
    let stdout = run_gphoto2(program, &["--auto-detect"]).await?;
    Ok(parse_auto_detect(&stdout))
}

async fn run_gphoto2(program: &str, args: &[&str]) -> Result<String, CameraError> {
    let command_line = format!("{} {}", program, args.join(" "));
    tracing::trace!("exec: {}", command_line);
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| CameraError::CommandFailed {
            command: command_line.clone(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(CameraError::CommandFailed {
            command: command_line,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
