// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the capture pipeline against the virtual device

use camera_pipeline::backends::v4l2::controls::{
    V4L2_CID_BRIGHTNESS, V4L2_CID_EXPOSURE_AUTO, V4L2_CID_POWER_LINE_FREQUENCY,
};
use camera_pipeline::{
    ActiveFormat, CanonicalFormat, CapturePipeline, DriveMode, PipelineConfig, PipelineError,
    PipelineEvent, StreamState, VirtualDevice, VirtualProvider,
};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn config(width: u32, height: u32, drive_mode: DriveMode) -> PipelineConfig {
    PipelineConfig {
        width,
        height,
        drive_mode,
        ..Default::default()
    }
}

fn pipeline(device: &Arc<VirtualDevice>, config: PipelineConfig) -> CapturePipeline {
    CapturePipeline::with_provider(config, Arc::new(VirtualProvider::new(Arc::clone(device))))
        .unwrap()
}

/// Poll until a frame reaches the callback
fn poll_one(pipeline: &CapturePipeline) {
    for _ in 0..20 {
        if pipeline.poll_frame().unwrap() {
            return;
        }
    }
    panic!("no frame delivered");
}

fn wait_for<F>(events: &Receiver<PipelineEvent>, mut pred: F) -> PipelineEvent
where
    F: FnMut(&PipelineEvent) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) if pred(&event) => return event,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    panic!("expected event not received");
}

fn drain(events: &Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    events.try_iter().collect()
}

fn size(active: Option<ActiveFormat>) -> Option<(u32, u32)> {
    active.map(|a| (a.width, a.height))
}

#[test]
fn test_polled_capture_delivers_frames() {
    let device = Arc::new(VirtualDevice::new());
    let pipeline = pipeline(&device, config(1280, 720, DriveMode::Polled));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    pipeline.set_frame_callback(move |frame| {
        sink.lock().unwrap().push((frame.descriptor, frame.bytes_used()));
        Ok(())
    });

    pipeline.start().unwrap();
    assert_eq!(pipeline.state(), StreamState::Streaming);
    poll_one(&pipeline);
    poll_one(&pipeline);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0.format, CanonicalFormat::Yuyv);
    assert_eq!(seen[0].1, 1280 * 720 * 2);
    assert_eq!(pipeline.active_format().unwrap().fps, 30.0);
}

#[test]
fn test_poll_frame_requires_polled_mode() {
    let device = Arc::new(VirtualDevice::new());
    let pipeline = pipeline(&device, config(640, 480, DriveMode::Thread));
    assert!(matches!(
        pipeline.poll_frame(),
        Err(PipelineError::InvalidState { .. })
    ));
}

#[test]
fn test_resize_last_write_wins() {
    let device = Arc::new(VirtualDevice::new());
    let pipeline = pipeline(&device, config(640, 480, DriveMode::Polled));
    let events = pipeline.events().unwrap();
    pipeline.start().unwrap();
    poll_one(&pipeline);
    drain(&events);

    pipeline.resize(1280, 720, None).unwrap();
    pipeline.resize(1920, 1080, None).unwrap();
    poll_one(&pipeline);

    assert_eq!(size(pipeline.active_format()), Some((1920, 1080)));
    let resized: Vec<_> = drain(&events)
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::Resized(active) => Some((active.width, active.height)),
            _ => None,
        })
        .collect();
    assert_eq!(resized, vec![(1920, 1080)]);
    assert_eq!(device.stream_on_count(), 2);
}

#[test]
fn test_failed_resize_restores_previous_format() {
    let device = Arc::new(VirtualDevice::new());
    device.fail_set_format_for(1920, 1080);
    let pipeline = pipeline(&device, config(640, 480, DriveMode::Polled));
    let events = pipeline.events().unwrap();
    pipeline.start().unwrap();
    poll_one(&pipeline);

    pipeline.resize(1920, 1080, None).unwrap();
    poll_one(&pipeline);

    assert_eq!(pipeline.state(), StreamState::Streaming);
    assert_eq!(size(pipeline.active_format()), Some((640, 480)));
    let failed = drain(&events).into_iter().find_map(|e| match e {
        PipelineEvent::ResizeFailed { restored, .. } => Some(restored),
        _ => None,
    });
    assert_eq!(size(failed), Some((640, 480)));
    assert_eq!(device.current_format().width, 640);
}

#[test]
fn test_unhinted_resize_searches_every_format() {
    let device = Arc::new(VirtualDevice::new());
    let pipeline = pipeline(&device, config(640, 480, DriveMode::Polled));
    pipeline.start().unwrap();
    poll_one(&pipeline);
    assert_eq!(pipeline.default_format(), Some(CanonicalFormat::Yuyv));

    // YUYV has no 800x600; the stepwise NV12 entry does
    pipeline.resize(800, 600, None).unwrap();
    poll_one(&pipeline);

    let active = pipeline.active_format().unwrap();
    assert_eq!((active.width, active.height), (800, 600));
    assert_eq!(active.format, CanonicalFormat::Nv12);
    assert_eq!(pipeline.default_format(), Some(CanonicalFormat::Nv12));
}

#[test]
fn test_failing_callback_keeps_buffers_cycling() {
    let device = Arc::new(VirtualDevice::new());
    let mut cfg = config(640, 480, DriveMode::Polled);
    cfg.buffer_count = 2;
    let pipeline = pipeline(&device, cfg);
    let calls = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&calls);
    pipeline.set_frame_callback(move |_| {
        *counter.lock().unwrap() += 1;
        Err("display gone".to_string())
    });

    pipeline.start().unwrap();
    assert_eq!(device.allocated_buffers(), 2);
    for _ in 0..5 {
        poll_one(&pipeline);
    }
    assert_eq!(*calls.lock().unwrap(), 5);
    assert_eq!(pipeline.state(), StreamState::Streaming);

    pipeline.stop();
    assert_eq!(pipeline.state(), StreamState::Closed);
    assert_eq!(device.allocated_buffers(), 0);
    assert!(!device.is_streaming());
}

#[test]
fn test_resize_before_start_changes_request() {
    let device = Arc::new(VirtualDevice::new());
    let pipeline = pipeline(&device, config(640, 480, DriveMode::Polled));
    pipeline.resize(1280, 720, None).unwrap();
    pipeline.start().unwrap();
    assert_eq!(size(pipeline.active_format()), Some((1280, 720)));
    assert!(pipeline.resize(0, 720, None).is_err());
}

#[test]
fn test_stop_closes_device() {
    let device = Arc::new(VirtualDevice::new());
    let pipeline = pipeline(&device, config(640, 480, DriveMode::Polled));
    pipeline.start().unwrap();
    poll_one(&pipeline);

    pipeline.stop();
    assert_eq!(pipeline.state(), StreamState::Closed);
    assert!(!pipeline.is_running());
    assert!(!device.is_streaming());
    assert_eq!(device.allocated_buffers(), 0);
    assert!(matches!(pipeline.controls(), Err(PipelineError::NotOpen)));

    // Idempotent
    pipeline.stop();
    assert_eq!(pipeline.state(), StreamState::Closed);
}

#[test]
fn test_find_format_first_match_becomes_default() {
    let device = Arc::new(VirtualDevice::new());
    let pipeline = pipeline(&device, config(640, 480, DriveMode::Polled));
    pipeline.open().unwrap();

    let found = pipeline.find_format(1920, 1080, None, 24.0, 31.0).unwrap();
    assert_eq!(found.format, CanonicalFormat::Yuyv);
    assert_eq!((found.width, found.height), (1920, 1080));
    assert_eq!(found.interval.fps(), 30.0);
    assert_eq!(pipeline.default_format(), Some(CanonicalFormat::Yuyv));

    // Nothing at 60 fps and above for YUYV, and the bound is exclusive
    assert!(
        pipeline
            .find_format(1920, 1080, Some(CanonicalFormat::Yuyv), 31.0, 60.0)
            .is_err()
    );
}

#[test]
fn test_fewer_buffers_granted_is_success() {
    let device = Arc::new(VirtualDevice::new());
    device.set_grant_cap(Some(2));
    let mut cfg = config(640, 480, DriveMode::Polled);
    cfg.buffer_count = 4;
    let pipeline = pipeline(&device, cfg);

    pipeline.start().unwrap();
    assert_eq!(device.allocated_buffers(), 2);
    poll_one(&pipeline);
    poll_one(&pipeline);
    poll_one(&pipeline);
}

#[test]
fn test_frame_size_mismatch_rejected() {
    let device = Arc::new(VirtualDevice::new());
    device.set_bytes_used_override(Some(100));
    let pipeline = pipeline(&device, config(640, 480, DriveMode::Polled));
    let events = pipeline.events().unwrap();
    let called = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&called);
    pipeline.set_frame_callback(move |_| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    pipeline.start().unwrap();
    for _ in 0..3 {
        assert!(!pipeline.poll_frame().unwrap());
    }
    assert_eq!(*called.lock().unwrap(), 0);
    let rejected = drain(&events).into_iter().find_map(|e| match e {
        PipelineEvent::FrameRejected(err) => Some(err),
        _ => None,
    });
    assert_eq!(
        rejected,
        Some(PipelineError::FrameSizeMismatch {
            expected: 640 * 480 * 2,
            actual: 100,
        })
    );
    // Buffers keep cycling
    assert_eq!(pipeline.state(), StreamState::Streaming);
}

#[test]
fn test_controls_roundtrip() {
    let device = Arc::new(VirtualDevice::new());
    let pipeline = pipeline(&device, config(640, 480, DriveMode::Polled));
    pipeline.open().unwrap();

    let controls = pipeline.controls().unwrap();
    assert!(controls.iter().all(|c| c.name != "Gamma"));
    let power = controls
        .iter()
        .find(|c| c.id == V4L2_CID_POWER_LINE_FREQUENCY)
        .unwrap();
    assert_eq!(power.menu_label(1).as_deref(), Some("50 Hz"));

    assert_eq!(pipeline.set_control(V4L2_CID_BRIGHTNESS, 10).unwrap(), 10);
    assert_eq!(pipeline.get_control(V4L2_CID_BRIGHTNESS).unwrap(), 10);
    assert_eq!(pipeline.set_control(V4L2_CID_POWER_LINE_FREQUENCY, 2).unwrap(), 2);
    assert!(matches!(
        pipeline.set_control(V4L2_CID_EXPOSURE_AUTO, 2),
        Err(PipelineError::NotSupported(_))
    ));
}

#[test]
fn test_thread_mode_streams_and_stops() {
    let device = Arc::new(VirtualDevice::new());
    let pipeline = pipeline(&device, config(640, 480, DriveMode::Thread));
    let events = pipeline.events().unwrap();
    let (frame_tx, frame_rx) = std::sync::mpsc::channel();
    pipeline.set_frame_callback(move |frame| {
        let _ = frame_tx.send(frame.sequence);
        Ok(())
    });

    pipeline.start().unwrap();
    wait_for(&events, |e| matches!(e, PipelineEvent::Streaming(_)));
    for _ in 0..3 {
        frame_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    pipeline.resize(1280, 720, None).unwrap();
    let resized = wait_for(&events, |e| matches!(e, PipelineEvent::Resized(_)));
    assert!(matches!(
        resized,
        PipelineEvent::Resized(ActiveFormat {
            width: 1280,
            height: 720,
            ..
        })
    ));

    pipeline.stop();
    wait_for(&events, |e| matches!(e, PipelineEvent::Stopped));
    assert_eq!(pipeline.state(), StreamState::Closed);
    assert!(!device.is_streaming());
}

#[test]
fn test_thread_startup_failure_unwinds_to_open() {
    let device = Arc::new(VirtualDevice::new());
    device.set_fail_stream_on(true);
    let pipeline = pipeline(&device, config(640, 480, DriveMode::Thread));
    let events = pipeline.events().unwrap();

    pipeline.start().unwrap();
    wait_for(&events, |e| matches!(e, PipelineEvent::Error(_)));

    let deadline = Instant::now() + Duration::from_secs(5);
    while pipeline.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!pipeline.is_running());
    assert_eq!(pipeline.state(), StreamState::Open);
    assert_eq!(device.allocated_buffers(), 0);
}

#[test]
fn test_capability_report_from_open_pipeline() {
    let device = Arc::new(VirtualDevice::new());
    let pipeline = pipeline(&device, config(640, 480, DriveMode::Polled));
    assert!(matches!(
        pipeline.capability_report(),
        Err(PipelineError::NotOpen)
    ));
    pipeline.open().unwrap();
    let report = pipeline.capability_report().unwrap();
    assert_eq!(report.device, "/dev/video0");
    assert!(report.supports(CanonicalFormat::Mjpeg, 1920, 1080, 60.0));
    assert!(!report.controls.is_empty());
}
