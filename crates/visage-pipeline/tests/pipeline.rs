// crates/visage-pipeline/tests/pipeline.rs
//
// End-to-end lifecycle scenarios: state ordering, checkpoint gating,
// backpressure, ordered output emission, and emergency stop.

mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use serde_json::json;

use common::{init_logging, test_frame, wait_for, SharedSink};
use visage_pipeline::{
    FrameServer, FrameStatus, OutputDriver, PipelineConfig, PipelineError, Status, WorkerPool,
    WorkerPoolParameters,
};

fn offline_server() -> (Arc<Status>, Arc<FrameServer>) {
    init_logging();
    let status = Arc::new(Status::new(false));
    let server = FrameServer::new(&PipelineConfig::default(), Arc::clone(&status), false).unwrap();
    (status, server)
}

#[test]
fn single_frame_walks_every_state_in_order() {
    let (_status, server) = offline_server();

    let (events_tx, events_rx) = unbounded();
    for state in FrameStatus::ALL {
        let tx = events_tx.clone();
        server.on_frame_status_change_event(
            state,
            Box::new(move |timestamps, status| {
                let _ = tx.send((timestamps.frame_number, status));
            }),
        );
    }
    let (drained_tx, drained_rx) = unbounded();
    server.on_frame_server_drained_event(Box::new(move || {
        let _ = drained_tx.send(());
    }));

    server.insert_new_frame(test_frame(0.0, 0.033)).unwrap();
    server.set_draining();

    drained_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("server never drained");
    // Exactly once per registered callback.
    assert!(drained_rx.try_recv().is_err());

    let observed: Vec<_> = events_rx.try_iter().collect();
    let expected: Vec<_> = FrameStatus::ALL.iter().map(|s| (1u64, *s)).collect();
    assert_eq!(observed, expected);
}

#[test]
fn frames_enter_states_in_frame_number_order() {
    let (_status, server) = offline_server();
    server
        .register_frame_status_checkpoint(FrameStatus::Processing, "x.ran")
        .unwrap();

    let (preview_tx, preview_rx) = unbounded();
    server.on_frame_status_change_event(
        FrameStatus::PreviewDisplay,
        Box::new(move |timestamps, _| {
            let _ = preview_tx.send(timestamps.frame_number);
        }),
    );
    let (drained_tx, drained_rx) = unbounded();
    server.on_frame_server_drained_event(Box::new(move || {
        let _ = drained_tx.send(());
    }));

    server.insert_new_frame(test_frame(0.0, 0.033)).unwrap();
    server.insert_new_frame(test_frame(0.033, 0.066)).unwrap();
    for n in [1, 2] {
        let server = Arc::clone(&server);
        wait_for("frame in Processing", Duration::from_secs(2), move || {
            server.get_working_frame(n).unwrap().status == FrameStatus::Processing
        });
    }

    // Satisfy the gate for frame 2 first. Frame 2 must still wait for frame 1.
    server
        .set_working_frame_status_checkpoint(2, FrameStatus::Processing, "x.ran")
        .unwrap();
    server
        .set_working_frame_status_checkpoint(1, FrameStatus::Processing, "x.ran")
        .unwrap();

    let first = preview_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = preview_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!((first, second), (1, 2));

    server.set_draining();
    drained_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn low_latency_insert_blocks_at_max_queue_depth() {
    init_logging();
    let config = PipelineConfig::from_json_str(
        r#"{ "frameServer": { "lowLatency": { "maxQueueDepth": 4 } } }"#,
    )
    .unwrap();
    let status = Arc::new(Status::new(true));
    let server = FrameServer::new(&config, Arc::clone(&status), true).unwrap();
    // Park every frame at Draining so the store actually fills up.
    server
        .register_frame_status_checkpoint(FrameStatus::Draining, "test.hold")
        .unwrap();

    for n in 1..=4u64 {
        server
            .insert_new_frame(test_frame(n as f64 * 0.033, (n + 1) as f64 * 0.033))
            .unwrap();
    }
    for n in 1..=4u64 {
        let server = Arc::clone(&server);
        wait_for("frame in Draining", Duration::from_secs(2), move || {
            server.get_working_frame(n).unwrap().status == FrameStatus::Draining
        });
    }

    let (inserted_tx, inserted_rx) = unbounded();
    let insert_server = Arc::clone(&server);
    let inserter = std::thread::spawn(move || {
        insert_server
            .insert_new_frame(test_frame(0.165, 0.198))
            .unwrap();
        let _ = inserted_tx.send(Instant::now());
    });

    // The fifth insert must not return while the store is at depth.
    std::thread::sleep(Duration::from_millis(150));
    assert!(
        inserted_rx.try_recv().is_err(),
        "insert returned while the store was still full"
    );

    // Completing frame 1 releases it.
    let released_at = Instant::now();
    server
        .set_working_frame_status_checkpoint(1, FrameStatus::Draining, "test.hold")
        .unwrap();
    let returned_at = inserted_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("insert never unblocked");
    assert!(returned_at >= released_at);
    inserter.join().unwrap();

    // Drain out: release the remaining held frames as they arrive at Draining.
    for n in 2..=5u64 {
        let server_poll = Arc::clone(&server);
        wait_for("frame in Draining", Duration::from_secs(2), move || {
            server_poll.get_working_frame(n).unwrap().status == FrameStatus::Draining
        });
        server
            .set_working_frame_status_checkpoint(n, FrameStatus::Draining, "test.hold")
            .unwrap();
    }
    let (drained_tx, drained_rx) = unbounded();
    server.on_frame_server_drained_event(Box::new(move || {
        let _ = drained_tx.send(());
    }));
    server.set_draining();
    drained_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn output_driver_emits_in_frame_number_order() {
    let (status, server) = offline_server();
    let driver = OutputDriver::new(Arc::clone(&status), &server).unwrap();
    driver.register_frame_data("pose").unwrap();
    driver.register_frame_data("trackers").unwrap();
    let sink = SharedSink::new();
    driver.add_sink(Box::new(sink.clone()));

    for n in 1..=3u64 {
        server
            .insert_new_frame(test_frame(n as f64 * 0.033, (n + 1) as f64 * 0.033))
            .unwrap();
    }
    for n in 1..=3u64 {
        let server = Arc::clone(&server);
        wait_for("frame in Draining", Duration::from_secs(2), move || {
            server.get_working_frame(n).unwrap().status == FrameStatus::Draining
        });
    }

    let trackers = json!({ "BrowLeft": { "position": { "x": 0.1, "y": 0.2, "z": 0.3 } } });
    let pose = json!({
        "rotation":    { "x": 0.0, "y": 0.0, "z": 0.0 },
        "translation": { "x": 1.0, "y": 2.0, "z": 3.0 },
    });
    for n in [2u64, 1, 3] {
        driver.insert_frame_data("trackers", trackers.clone(), n).unwrap();
    }
    for n in [3u64, 1, 2] {
        driver.insert_frame_data("pose", pose.clone(), n).unwrap();
    }

    let (drained_tx, drained_rx) = unbounded();
    server.on_frame_server_drained_event(Box::new(move || {
        let _ = drained_tx.send(());
    }));
    server.set_draining();
    drained_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let last_basis = driver.last_basis().expect("no basis frame was recorded");
    assert_eq!(last_basis["meta"]["frameNumber"].as_u64(), Some(1));
    drop(driver);

    let lines = sink.lines();
    let numbers: Vec<u64> = lines
        .iter()
        .map(|line| line["meta"]["frameNumber"].as_u64().unwrap())
        .collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    // First complete frame carries the automatic basis flag; later ones do
    // not unless explicitly requested.
    assert_eq!(lines[0]["meta"]["basis"], json!(true));
    assert_eq!(lines[1]["meta"]["basis"], json!(false));
    assert_eq!(lines[2]["meta"]["basis"], json!(false));
    assert_eq!(lines[1]["pose"], pose);
    assert_eq!(lines[2]["trackers"], trackers);
}

#[test]
fn checkpoint_api_rejects_misuse() {
    let (_status, server) = offline_server();

    server
        .register_frame_status_checkpoint(FrameStatus::New, "n.hold")
        .unwrap();
    server
        .register_frame_status_checkpoint(FrameStatus::New, "n.hold2")
        .unwrap();
    server
        .register_frame_status_checkpoint(FrameStatus::Processing, "p.ran")
        .unwrap();

    // Duplicate registration is rejected.
    assert!(matches!(
        server.register_frame_status_checkpoint(FrameStatus::New, "n.hold"),
        Err(PipelineError::DuplicateCheckpoint { .. })
    ));
    // Nothing may gate Gone.
    assert!(matches!(
        server.register_frame_status_checkpoint(FrameStatus::Gone, "g.never"),
        Err(PipelineError::CheckpointOnGone)
    ));

    server.insert_new_frame(test_frame(0.0, 0.033)).unwrap();

    // Registration window has closed.
    assert!(matches!(
        server.register_frame_status_checkpoint(FrameStatus::Processing, "late.key"),
        Err(PipelineError::RegistrationAfterInsert)
    ));
    // Unknown frame.
    assert!(matches!(
        server.set_working_frame_status_checkpoint(99, FrameStatus::New, "n.hold"),
        Err(PipelineError::UnknownFrame(99))
    ));
    // The frame sits in New (n.hold/n.hold2 unsatisfied), so a Processing
    // checkpoint cannot be satisfied yet.
    assert!(matches!(
        server.set_working_frame_status_checkpoint(1, FrameStatus::Processing, "p.ran"),
        Err(PipelineError::CheckpointStatusMismatch { .. })
    ));
    // Unregistered key.
    assert!(matches!(
        server.set_working_frame_status_checkpoint(1, FrameStatus::New, "n.missing"),
        Err(PipelineError::UnknownCheckpoint { .. })
    ));
    // Double satisfaction.
    server
        .set_working_frame_status_checkpoint(1, FrameStatus::New, "n.hold")
        .unwrap();
    assert!(matches!(
        server.set_working_frame_status_checkpoint(1, FrameStatus::New, "n.hold"),
        Err(PipelineError::CheckpointAlreadySet { .. })
    ));

    // Unblock and drain cleanly.
    server
        .set_working_frame_status_checkpoint(1, FrameStatus::New, "n.hold2")
        .unwrap();
    let server_poll = Arc::clone(&server);
    wait_for("frame in Processing", Duration::from_secs(2), move || {
        server_poll.get_working_frame(1).unwrap().status == FrameStatus::Processing
    });
    server
        .set_working_frame_status_checkpoint(1, FrameStatus::Processing, "p.ran")
        .unwrap();
    let (drained_tx, drained_rx) = unbounded();
    server.on_frame_server_drained_event(Box::new(move || {
        let _ = drained_tx.send(());
    }));
    server.set_draining();
    drained_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn insert_fails_while_draining() {
    let (_status, server) = offline_server();
    server.insert_new_frame(test_frame(0.0, 0.033)).unwrap();
    server.set_draining();
    assert!(matches!(
        server.insert_new_frame(test_frame(0.033, 0.066)),
        Err(PipelineError::Draining)
    ));
    let server_poll = Arc::clone(&server);
    wait_for("drain", Duration::from_secs(5), move || {
        server_poll.is_drained()
    });
}

#[test]
fn mirror_mode_flips_the_preview_only() {
    let (_status, server) = offline_server();
    server
        .register_frame_status_checkpoint(FrameStatus::New, "test.hold")
        .unwrap();
    server.set_mirror_mode(true);

    // 2x1 frame: red then blue.
    let image = visage_pipeline::ImageBuffer::from_rgba(
        2,
        1,
        vec![255, 0, 0, 255, 0, 0, 255, 255],
    );
    server
        .insert_new_frame(visage_pipeline::VideoFrame {
            image,
            start_timestamp: 0.0,
            estimated_end_timestamp: 0.033,
        })
        .unwrap();

    let view = server.get_working_frame(1).unwrap();
    let native = view.frame.as_ref().unwrap();
    let preview = view.preview_frame.lock().unwrap().clone();
    assert_eq!(&preview, &native.flipped_horizontal());

    server
        .set_working_frame_status_checkpoint(1, FrameStatus::New, "test.hold")
        .unwrap();
    server.set_draining();
    let server_poll = Arc::clone(&server);
    wait_for("drain", Duration::from_secs(5), move || {
        server_poll.is_drained()
    });
}

#[test]
fn image_sequence_writes_numbered_previews() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("preview").to_string_lossy().to_string();

    let status = Arc::new(Status::new(false));
    let config = PipelineConfig::default();
    let server = FrameServer::new(&config, Arc::clone(&status), false).unwrap();
    let sequence =
        visage_pipeline::ImageSequence::new(&config, &status, &server, &prefix).unwrap();

    let (drained_tx, drained_rx) = unbounded();
    server.on_frame_server_drained_event(Box::new(move || {
        let _ = drained_tx.send(());
    }));

    server.insert_new_frame(test_frame(0.0, 0.033)).unwrap();
    server.insert_new_frame(test_frame(0.033, 0.066)).unwrap();
    server.set_draining();
    drained_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // Joining the writer pool guarantees in-flight PNG encodes have landed.
    drop(sequence);

    for n in [1, 2] {
        let path = format!("{prefix}-{n:06}.png");
        assert!(
            std::path::Path::new(&path).exists(),
            "missing preview file {path}"
        );
    }
}

#[test]
fn emergency_stop_unwinds_every_pool() {
    init_logging();
    let status = Arc::new(Status::new(false));
    let server = FrameServer::new(&PipelineConfig::default(), Arc::clone(&status), false).unwrap();
    server
        .register_frame_status_checkpoint(FrameStatus::Processing, "faceDetector.ran")
        .unwrap();

    // A detector stand-in whose handler blows up on the first frame it sees.
    let pending: Arc<Mutex<VecDeque<u64>>> = Arc::new(Mutex::new(VecDeque::new()));
    let handler_pending = Arc::clone(&pending);
    let detector_pool = WorkerPool::new(
        &status,
        &server,
        WorkerPoolParameters::with_handler(
            "FaceDetector",
            1,
            Box::new(move |_worker| {
                let Some(frame_number) = handler_pending.lock().unwrap().pop_front() else {
                    return Ok(false);
                };
                anyhow::bail!("detection blew up on frame #{frame_number}")
            }),
        ),
    )
    .unwrap();
    let signal = detector_pool.signal_handle();
    let callback_pending = Arc::clone(&pending);
    server.on_frame_status_change_event(
        FrameStatus::Processing,
        Box::new(move |timestamps, _| {
            callback_pending
                .lock()
                .unwrap()
                .push_back(timestamps.frame_number);
            signal.signal();
        }),
    );

    server.insert_new_frame(test_frame(0.0, 0.033)).unwrap();
    server.insert_new_frame(test_frame(0.033, 0.066)).unwrap();

    let status_poll = Arc::clone(&status);
    wait_for("emergency flag", Duration::from_secs(2), move || {
        status_poll.emergency()
    });

    // Every pool must unwind within roughly one condvar timeout, and the
    // FrameServer destructor must not deadlock on its herder.
    let started = Instant::now();
    drop(detector_pool);
    drop(server);
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "shutdown took {:?}",
        started.elapsed()
    );
}
