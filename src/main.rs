// src/main.rs - scant-host command line entry point
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use scant_rs::capture::detect_cameras;
use scant_rs::config::{self, CameraBackend, Config, StepperConfig};
use scant_rs::hardware::{MotorRegistry, SimulatedRegistry, TicCmdRegistry, current_limit_ma};
use scant_rs::motion::{AxisId, AxisParameters, compute_positions};
use scant_rs::scan::ScanEvent;
use scant_rs::scanner::Scanner;
use scant_rs::scheduler::SystemClock;
use scant_rs::settings::Settings;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Parser, Debug)]
#[command(name = "scant-host", version, about = "Three-axis photogrammetry scan host.")]
struct Cli {
    /// Path to the TOML host configuration
    #[arg(short, long, default_value = "scanner.toml")]
    config: PathBuf,

    /// Path to the persisted stepper settings
    #[arg(short, long, default_value = "settings.json")]
    settings: PathBuf,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a full scan
    Scan {
        /// Forward axis as MIN:MAX:DIVISIONS
        #[arg(long)]
        forward: Option<AxisParameters>,
        /// Tilt axis as MIN:MAX:DIVISIONS
        #[arg(long)]
        tilt: Option<AxisParameters>,
        /// Yaw axis as MIN:MAX:DIVISIONS
        #[arg(long)]
        yaw: Option<AxisParameters>,
        /// Use simulated motors and camera regardless of the config
        #[arg(long)]
        simulate: bool,
        /// Print every scan event as a JSON line
        #[arg(long)]
        json: bool,
    },
    /// Print the stops each axis would visit
    Plan,
    /// List attached stepper drivers
    ListMotors,
    /// List attached cameras
    ListCameras,
    /// Redefine an axis' current position as 0
    Zero {
        #[arg(long)]
        axis: AxisId,
    },
    /// Update persisted settings for one stepper
    Set {
        /// Stepper index, 1 to 3
        #[arg(long)]
        stepper: u8,
        #[arg(long)]
        axis: Option<AxisId>,
        #[arg(long)]
        serial: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        min: Option<i32>,
        #[arg(long, allow_negative_numbers = true)]
        max: Option<i32>,
        #[arg(long)]
        divisions: Option<u32>,
        #[arg(long)]
        current_limit: Option<u8>,
        #[arg(long)]
        max_speed: Option<u32>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        owner: Option<String>,
    },
}

fn load(cli: &Cli) -> Result<(Config, Settings), BoxError> {
    let mut config = if cli.config.exists() {
        tracing::info!("Loading configuration from: {}", cli.config.display());
        config::load_config(&cli.config.to_string_lossy()).map_err(|e| {
            tracing::error!("Failed to load config from '{}': {}", cli.config.display(), e);
            Box::new(e) as BoxError
        })?
    } else {
        tracing::info!("No configuration at {}, using defaults", cli.config.display());
        Config::default()
    };
    let settings = Settings::load(&cli.settings);
    settings.apply_to(&mut config);
    config.validate()?;
    Ok((config, settings))
}

fn describe(axis: AxisId, stepper: &StepperConfig) -> String {
    let parameters = stepper.parameters();
    match parameters.validate() {
        Ok((min, max, divisions)) => format!(
            "{:<8} {:?} ({} to {}, {} divisions)",
            axis,
            compute_positions(min, max, divisions).as_slice(),
            min,
            max,
            divisions
        ),
        Err(e) => format!("{:<8} not scanned: {}", axis, e),
    }
}

async fn run_scan(
    mut config: Config,
    overrides: [(AxisId, Option<AxisParameters>); 3],
    simulate: bool,
    json: bool,
) -> Result<(), BoxError> {
    if simulate {
        config.hardware.simulate = true;
        config.camera.backend = CameraBackend::Simulated;
    }
    for (axis, parameters) in overrides {
        if let Some(parameters) = parameters {
            match config.stepper_for_mut(axis) {
                Some(stepper) => stepper.set_parameters(parameters),
                None => {
                    tracing::warn!("No stepper configured for axis {}, ignoring override", axis)
                }
            }
        }
    }

    tracing::info!("Scanner: {}", config.scanner.name);
    for (axis, _, stepper) in config.axis_assignments() {
        tracing::info!("{}", describe(axis, stepper));
    }

    let (scanner, handle) = Scanner::from_config(&config, Arc::new(SystemClock)).await?;
    let mut events = handle.subscribe();
    let task = scanner.spawn();

    let session = handle.start_scan().await?;
    tracing::info!("Scan {} running, press Ctrl-C to stop", session);

    let mut result: Result<(), BoxError> = Ok(());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, stopping all axes");
                handle.emergency_stop();
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Missed {} scan events", n);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                }
                match event {
                    ScanEvent::CaptureRequested(request) if !json => {
                        let (f, t, y) = request.grid.divisions();
                        println!(
                            "capture {:>4}  forward[{}]={:<7} tilt[{}]={:<7} yaw[{}]={}",
                            request.sequence,
                            f,
                            request.grid.position(AxisId::Forward),
                            t,
                            request.grid.position(AxisId::Tilt),
                            y,
                            request.grid.position(AxisId::Yaw),
                        );
                    }
                    ScanEvent::ScanCompleted { captures, .. } => {
                        tracing::info!(
                            "Scan complete: {} requested, {} dropped",
                            captures.requested,
                            captures.dropped
                        );
                        break;
                    }
                    ScanEvent::ScanAborted { reason, .. } => {
                        result = Err(format!("scan aborted: {}", reason).into());
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let status = handle.status().await?;
    tracing::info!(
        "Captures: {} completed, {} failed, {} pending",
        status.captures.completed,
        status.captures.failed,
        status.captures.pending
    );
    handle.shutdown();
    task.await?;
    result
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => tracing::Level::WARN,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let (config, mut settings) = load(&cli)?;

    match cli.command {
        Commands::Scan {
            forward,
            tilt,
            yaw,
            simulate,
            json,
        } => {
            run_scan(
                config,
                [
                    (AxisId::Forward, forward),
                    (AxisId::Tilt, tilt),
                    (AxisId::Yaw, yaw),
                ],
                simulate,
                json,
            )
            .await?;
        }
        Commands::Plan => {
            let mut points = 1usize;
            for (axis, _, stepper) in config.axis_assignments() {
                println!("{}", describe(axis, stepper));
                if let Ok(stops) = stepper.parameters().grid_stops() {
                    points *= stops;
                }
            }
            println!("{} grid points", points);
        }
        Commands::ListMotors => {
            let registry: Box<dyn MotorRegistry> = if config.hardware.simulate {
                Box::new(SimulatedRegistry::new(
                    config
                        .axis_assignments()
                        .into_iter()
                        .map(|(axis, _, stepper)| {
                            stepper.serial.clone().unwrap_or_else(|| format!("sim-{}", axis))
                        })
                        .collect(),
                ))
            } else {
                Box::new(TicCmdRegistry::new(config.hardware.ticcmd.clone()))
            };
            for serial in registry.list_serial_numbers()? {
                println!("{}", serial);
            }
        }
        Commands::ListCameras => {
            let cameras = detect_cameras(&config.camera.gphoto2).await?;
            if cameras.is_empty() {
                println!("No cameras detected");
            }
            for camera in cameras {
                println!("{:<30} {}", camera.model, camera.port);
            }
        }
        Commands::Zero { axis } => {
            let (scanner, handle) = Scanner::from_config(&config, Arc::new(SystemClock)).await?;
            let task = scanner.spawn();
            let outcome = handle.zero_axis(axis).await;
            handle.shutdown();
            task.await?;
            outcome?;
            tracing::info!("Axis {} zeroed", axis);
        }
        Commands::Set {
            stepper,
            axis,
            serial,
            min,
            max,
            divisions,
            current_limit,
            max_speed,
            subject,
            owner,
        } => {
            let entry = settings.stepper_mut(stepper)?;
            if let Some(axis) = axis {
                entry.axis = axis;
            }
            if let Some(serial) = serial {
                entry.serial = serial;
            }
            if let Some(code) = current_limit {
                if current_limit_ma(code).is_none() {
                    return Err(format!("current limit code {} is out of range", code).into());
                }
                entry.current_limit = code;
            }
            if let Some(max_speed) = max_speed {
                entry.max_speed = max_speed;
            }
            let mut parameters = entry.parameters();
            parameters.min_position = min.or(parameters.min_position);
            parameters.max_position = max.or(parameters.max_position);
            parameters.divisions = divisions.or(parameters.divisions);
            if let Err(e) = parameters.validate() {
                tracing::warn!("Stepper {} will not scan yet: {}", stepper, e);
            }
            entry.set_parameters(parameters);
            if let Some(subject) = subject {
                settings.camera_mut().subject = subject;
            }
            if let Some(owner) = owner {
                settings.camera_mut().owner = owner;
            }
            settings.save()?;
            tracing::info!("Saved settings to {}", settings.path().display());
        }
    }
    Ok(())
}
