//! CLI entry point for the scan simulation: runs a full scan against
//! simulated motors on a manual clock and reports every capture.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use scant_rs::capture::{
    CaptureCompletion, CaptureCoordinator, CaptureOutcome, CaptureRequest, file_name_for,
};
use scant_rs::hardware::SimulatedMotor;
use scant_rs::motion::{AxisController, AxisId, AxisParameters, AxisTuning};
use scant_rs::scan::{ScanEvent, ScanSequencer, SequencerConfig};
use scant_rs::scheduler::ManualClock;

/// Scan Simulation CLI
#[derive(Parser, Debug)]
#[command(
    name = "scan-sim",
    about = "Simulated three-axis scan for checking grids and timing."
)]
struct Cli {
    /// Forward axis as MIN:MAX:DIVISIONS
    #[arg(long)]
    forward: Option<AxisParameters>,

    /// Tilt axis as MIN:MAX:DIVISIONS
    #[arg(long)]
    tilt: Option<AxisParameters>,

    /// Yaw axis as MIN:MAX:DIVISIONS
    #[arg(long)]
    yaw: Option<AxisParameters>,

    /// Steps travelled per tick
    #[arg(long, default_value_t = 50)]
    speed: i32,

    /// Maximum landing error in steps
    #[arg(long, default_value_t = 0)]
    noise: i32,

    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    #[arg(long, default_value_t = 2000)]
    dwell_ms: u64,

    /// Wait for each capture before advancing
    #[arg(long)]
    gate_on_capture: bool,

    /// Simulated ticks each capture takes to complete
    #[arg(long, default_value_t = 5)]
    capture_ticks: u64,

    /// Give up after this much simulated time, in seconds
    #[arg(long, default_value_t = 3600)]
    timeout_secs: u64,

    #[arg(long, default_value = "Sim")]
    subject: String,

    #[arg(long, default_value = "")]
    owner: String,

    /// Write one CSV row per capture to this file
    #[arg(long)]
    csv: Option<PathBuf>,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CaptureRow {
    sequence: u64,
    seconds: f64,
    forward_division: usize,
    forward_position: i32,
    tilt_division: usize,
    tilt_position: i32,
    yaw_division: usize,
    yaw_position: i32,
    file: String,
}

impl CaptureRow {
    fn new(request: &CaptureRequest, at: Duration, file: String) -> Self {
        let coordinate = |axis| {
            request
                .grid
                .get(axis)
                .map_or((0, 0), |c| (c.division, c.position))
        };
        let (forward_division, forward_position) = coordinate(AxisId::Forward);
        let (tilt_division, tilt_position) = coordinate(AxisId::Tilt);
        let (yaw_division, yaw_position) = coordinate(AxisId::Yaw);
        Self {
            sequence: request.sequence,
            seconds: at.as_secs_f64(),
            forward_division,
            forward_position,
            tilt_division,
            tilt_position,
            yaw_division,
            yaw_position,
            file,
        }
    }
}

fn write_rows(path: &Path, rows: &[CaptureRow]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::WARN,
        (false, 1) => tracing::Level::INFO,
        (false, 2) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let clock = ManualClock::new();
    let tuning = AxisTuning {
        dwell: Duration::from_millis(cli.dwell_ms),
        ..AxisTuning::default()
    };
    let mut axes = Vec::new();
    for (axis, parameters) in [
        (AxisId::Forward, cli.forward),
        (AxisId::Tilt, cli.tilt),
        (AxisId::Yaw, cli.yaw),
    ] {
        let Some(parameters) = parameters else {
            continue;
        };
        let motor = SimulatedMotor::new(format!("sim-{}", axis), cli.speed)
            .with_landing_noise(cli.noise);
        let mut controller =
            AxisController::new(axis, Box::new(motor), Arc::new(clock.clone()), tuning);
        controller.configure(parameters)?;
        axes.push(controller);
    }
    if axes.is_empty() {
        return Err("give at least one of --forward, --tilt or --yaw".into());
    }

    let (capture, mut requests, completions) =
        CaptureCoordinator::with_channels(AxisId::Forward, 64);
    let config = SequencerConfig {
        gate_on_capture: cli.gate_on_capture,
        ..SequencerConfig::default()
    };
    let mut sequencer = ScanSequencer::new(axes, capture, config);
    sequencer.energize_all()?;
    sequencer.start_full_scan()?;

    let tick = Duration::from_millis(cli.tick_ms.max(1));
    let timeout = Duration::from_secs(cli.timeout_secs);
    let mut elapsed = Duration::ZERO;
    let mut in_flight: Vec<(u64, u64)> = Vec::new();
    let mut rows = Vec::new();
    let mut tick_count = 0u64;
    let outcome = 'scan: loop {
        for event in sequencer.tick() {
            match event {
                ScanEvent::CaptureRequested(request) => {
                    let file = file_name_for(&cli.subject, &cli.owner, &request);
                    rows.push(CaptureRow::new(&request, elapsed, file));
                }
                ScanEvent::ScanCompleted { .. } => break 'scan "completed".to_string(),
                ScanEvent::ScanAborted { reason, .. } => {
                    break 'scan format!("aborted: {}", reason);
                }
                _ => {}
            }
        }

        // Stand-in camera: every request finishes a fixed number of ticks later.
        while let Ok(request) = requests.try_recv() {
            in_flight.push((request.sequence, tick_count + cli.capture_ticks));
        }
        in_flight.retain(|(sequence, due)| {
            if *due > tick_count {
                return true;
            }
            let _ = completions.try_send(CaptureCompletion {
                sequence: *sequence,
                outcome: CaptureOutcome::Saved(PathBuf::from(format!("capture_{}.jpg", sequence))),
            });
            false
        });

        if elapsed >= timeout {
            sequencer.emergency_stop();
            break 'scan "timed out".to_string();
        }
        clock.advance(tick);
        elapsed += tick;
        tick_count += 1;
    };

    for row in &rows {
        println!(
            "{:>4}  t={:>8.1}s  forward[{}]={:<7} tilt[{}]={:<7} yaw[{}]={:<7} {}",
            row.sequence,
            row.seconds,
            row.forward_division,
            row.forward_position,
            row.tilt_division,
            row.tilt_position,
            row.yaw_division,
            row.yaw_position,
            row.file
        );
    }
    let stats = sequencer.capture_stats();
    println!(
        "Scan {} after {:.1}s simulated: {} captures ({} dropped)",
        outcome,
        elapsed.as_secs_f64(),
        stats.requested,
        stats.dropped
    );

    if let Some(path) = cli.csv {
        write_rows(&path, &rows)?;
        println!("Wrote {} rows to {}", rows.len(), path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(sequence: u64, file: &str) -> CaptureRow {
        CaptureRow {
            sequence,
            seconds: 12.5,
            forward_division: 1,
            forward_position: 100,
            tilt_division: 0,
            tilt_position: -20,
            yaw_division: 2,
            yaw_position: 450,
            file: file.to_string(),
        }
    }

    #[test]
    fn test_csv_rows_survive_commas_and_quotes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("captures.csv");
        let rows = vec![
            row(1, "20240517_093005_Skull, left_yaw450_tilt-20_forward100.jpg"),
            row(2, "say \"cheese\".jpg"),
        ];
        write_rows(&path, &rows).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), 9);
        assert_eq!(&headers[8], "file");
        let read: Vec<CaptureRow> = reader.deserialize().map(Result::unwrap).collect();
        assert_eq!(read, rows);
    }

    #[test]
    fn test_cli_parses_axes_and_verbosity() {
        let cli = Cli::try_parse_from([
            "scan-sim",
            "--forward",
            "0:100:2",
            "--tilt=-50:50:3",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.forward, Some(AxisParameters::new(0, 100, 2)));
        assert_eq!(cli.tilt, Some(AxisParameters::new(-50, 50, 3)));
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }
}
