// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for configuration module

use camera_pipeline::{CanonicalFormat, DriveMode, PipelineConfig, PipelineError};
use std::path::PathBuf;

#[test]
fn test_config_default() {
    let config = PipelineConfig::default();
    assert_eq!(config.device_path, PathBuf::from("/dev/video0"));
    assert_eq!(config.buffer_count, 4);
    assert_eq!(config.format, None);
    assert_eq!(config.drive_mode, DriveMode::Thread);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_from_options() {
    let config = PipelineConfig::from_options([
        ("device", "/dev/video2"),
        ("width", "1920"),
        ("height", "1080"),
        ("fps_min", "24"),
        ("fps_max", "31"),
        ("format", "NV12"),
        ("buffers", "6"),
        ("drive", "polled"),
        ("dma_device", "/dev/dma_heap/system"),
    ])
    .unwrap();

    assert_eq!(config.device_path, PathBuf::from("/dev/video2"));
    assert_eq!((config.width, config.height), (1920, 1080));
    assert_eq!((config.fps.min, config.fps.max), (24.0, 31.0));
    assert_eq!(config.format, Some(CanonicalFormat::Nv12));
    assert_eq!(config.buffer_count, 6);
    assert_eq!(config.drive_mode, DriveMode::Polled);
    assert_eq!(config.dma_path, Some(PathBuf::from("/dev/dma_heap/system")));
}

#[test]
fn test_config_options_rejected() {
    let bad = [
        ("width", "wide"),
        ("format", "ZZZZ"),
        ("drive", "sometimes"),
        ("colour", "red"),
        ("buffers", "0"),
    ];
    for (key, value) in bad {
        assert!(
            matches!(
                PipelineConfig::from_options([(key, value)]),
                Err(PipelineError::Config(_))
            ),
            "{}={} should be rejected",
            key,
            value
        );
    }
}

#[test]
fn test_config_from_json() {
    let config = PipelineConfig::from_json(
        r#"{ "width": 640, "height": 480, "format": "Yuyv", "fps": { "min": 10.0, "max": 20.0 } }"#,
    )
    .unwrap();
    assert_eq!((config.width, config.height), (640, 480));
    assert_eq!(config.format, Some(CanonicalFormat::Yuyv));
    assert!(config.fps.contains(15.0));
    assert!(!config.fps.contains(20.0));
    // Unspecified keys keep their defaults
    assert_eq!(config.buffer_count, 4);

    assert!(PipelineConfig::from_json(r#"{ "fps": { "min": 30.0, "max": 30.0 } }"#).is_err());
}

#[test]
fn test_config_json_round_trip() {
    let config = PipelineConfig {
        format: Some(CanonicalFormat::Mjpeg),
        drive_mode: DriveMode::Polled,
        ..Default::default()
    };
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(PipelineConfig::from_json(&json).unwrap(), config);
}
