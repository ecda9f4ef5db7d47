// Integration tests for capture coordination and the camera worker

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast;

    use scant_rs::ScanError;
    use scant_rs::capture::{
        AxisCoordinate, CaptureCoordinator, CaptureOutcome, GridPoint, SimulatedCamera,
        file_name_for, parse_auto_detect, run_camera_worker,
    };
    use scant_rs::motion::AxisId;

    fn point(forward: i32, tilt: i32, yaw: i32) -> GridPoint {
        let mut grid = GridPoint::default();
        for (axis, position) in [
            (AxisId::Forward, forward),
            (AxisId::Tilt, tilt),
            (AxisId::Yaw, yaw),
        ] {
            grid.set(axis, AxisCoordinate { division: 0, position });
        }
        grid
    }

    async fn drain_until(coordinator: &mut CaptureCoordinator, expected: usize) -> usize {
        let mut seen = 0;
        for _ in 0..200 {
            seen += coordinator.poll_completions().len();
            if seen >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        seen
    }

    #[tokio::test]
    async fn test_worker_completes_every_request() {
        let (mut coordinator, requests, completions) =
            CaptureCoordinator::with_channels(AxisId::Forward, 8);
        let camera = SimulatedCamera::new("/tmp/scans", "Bust 01", Duration::from_millis(1));
        let recorder = camera.clone();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = tokio::spawn(run_camera_worker(
            Box::new(camera),
            requests,
            completions,
            shutdown_rx,
        ));

        for settle in 1..=3u64 {
            let position = settle as i32 * 10;
            let request = coordinator
                .on_axis_settled(AxisId::Forward, position, settle, point(position, 0, 0))
                .unwrap();
            assert!(request.is_some());
        }
        assert_eq!(coordinator.pending(), 3);

        assert_eq!(drain_until(&mut coordinator, 3).await, 3);
        let stats = coordinator.stats();
        assert_eq!(stats.requested, 3);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.pending, 0);

        let captured: Vec<i32> = recorder.captured().iter().map(|r| r.position).collect();
        assert_eq!(captured, vec![10, 20, 30]);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_captures_are_counted() {
        let (mut coordinator, requests, completions) =
            CaptureCoordinator::with_channels(AxisId::Tilt, 8);
        let camera =
            SimulatedCamera::new("/tmp/scans", "Vase", Duration::ZERO).with_failure_rate(1.0);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = tokio::spawn(run_camera_worker(
            Box::new(camera),
            requests,
            completions,
            shutdown_rx,
        ));

        coordinator
            .on_axis_settled(AxisId::Tilt, 5, 1, point(0, 5, 0))
            .unwrap();
        let mut outcomes = Vec::new();
        for _ in 0..200 {
            outcomes.extend(coordinator.poll_completions());
            if !outcomes.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(outcomes[0].outcome, CaptureOutcome::Failed(_)));
        assert_eq!(coordinator.stats().failed, 1);

        // Dropping the coordinator closes the request channel and ends the worker.
        drop(coordinator);
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_camera_drops_requests() {
        let (mut coordinator, requests, _completions) =
            CaptureCoordinator::with_channels(AxisId::Forward, 8);
        drop(requests);
        assert_eq!(
            coordinator.on_axis_settled(AxisId::Forward, 0, 1, point(0, 0, 0)),
            Err(ScanError::CaptureChannelFull { sequence: 1 })
        );
        // Same settle is not retried.
        assert_eq!(
            coordinator.on_axis_settled(AxisId::Forward, 0, 1, point(0, 0, 0)),
            Ok(None)
        );
        assert_eq!(coordinator.stats().dropped, 1);
    }

    #[test]
    fn test_saved_file_name_carries_grid_position() {
        let (mut coordinator, _requests, _completions) =
            CaptureCoordinator::with_channels(AxisId::Forward, 1);
        let request = coordinator
            .on_axis_settled(AxisId::Forward, 100, 1, point(100, -20, 45))
            .unwrap()
            .unwrap();
        let name = file_name_for("Bust 01", "", &request);
        assert!(name.ends_with("_Bust_01_yaw45_tilt-20_forward100.jpg"), "{}", name);
        assert_eq!(
            name.len(),
            "YYYYmmdd_HHMMSS".len() + "_Bust_01_yaw45_tilt-20_forward100.jpg".len()
        );

        let named = file_name_for("Bust 01", "Museum Lab", &request);
        assert!(
            named.ends_with("_Bust_01_Museum_Lab_yaw45_tilt-20_forward100.jpg"),
            "{}",
            named
        );
    }

    #[test]
    fn test_auto_detect_listing() {
        let listing = "Model                          Port\n\
                       ----------------------------------------------------------\n\
                       Canon EOS 5D Mark III          usb:001,004\n";
        let cameras = parse_auto_detect(listing);
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].model, "Canon EOS 5D Mark III");
        assert_eq!(cameras[0].port, "usb:001,004");
    }
}
