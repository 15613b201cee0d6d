// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline construction options

use crate::constants::{buffers, capture};
use crate::errors::{PipelineError, PipelineResult};
use crate::formats::{CanonicalFormat, FourCc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the capture engine is driven
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum DriveMode {
    /// A dedicated capture thread spawned by `start`
    #[default]
    Thread,
    /// The caller drives the engine with `poll_frame`
    Polled,
}

/// Requested frame rate window, `[min, max)`
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct FpsRange {
    pub min: f64,
    pub max: f64,
}

impl FpsRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Check a rate against the half-open window
    pub fn contains(&self, fps: f64) -> bool {
        fps >= self.min && fps < self.max
    }

    /// Check whether `[lo, hi]` shares any rate with the window
    pub fn intersects(&self, lo: f64, hi: f64) -> bool {
        lo < self.max && hi >= self.min
    }
}

impl Default for FpsRange {
    fn default() -> Self {
        Self {
            min: capture::DEFAULT_FPS_MIN,
            max: capture::DEFAULT_FPS_MAX,
        }
    }
}

/// Capture pipeline configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capture device node
    pub device_path: PathBuf,
    /// Optional DMA-region device supplying buffer backing (e.g. a DMA heap)
    pub dma_path: Option<PathBuf>,
    /// Number of capture buffers to request
    pub buffer_count: u32,
    /// Requested frame width
    pub width: u32,
    /// Requested frame height
    pub height: u32,
    /// Requested frame rate window
    pub fps: FpsRange,
    /// Preferred pixel format; `None` takes the first match
    pub format: Option<CanonicalFormat>,
    /// Dedicated thread or caller polling
    pub drive_mode: DriveMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(capture::DEFAULT_DEVICE),
            dma_path: None,
            buffer_count: buffers::DEFAULT_COUNT,
            width: capture::DEFAULT_WIDTH,
            height: capture::DEFAULT_HEIGHT,
            fps: FpsRange::default(),
            format: None,
            drive_mode: DriveMode::default(),
        }
    }
}

impl PipelineConfig {
    /// Build a configuration from plain key-value options
    ///
    /// Recognised keys: `device`, `dma_device`, `buffers`, `width`, `height`,
    /// `fps_min`, `fps_max`, `format` (a FourCC such as `YUYV`) and `drive`
    /// (`thread` or `polled`). Missing keys keep their defaults.
    pub fn from_options<I, K, V>(options: I) -> PipelineResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in options {
            let key = key.as_ref().trim();
            let value = value.as_ref().trim();
            match key {
                "device" => config.device_path = PathBuf::from(value),
                "dma_device" => {
                    config.dma_path = (!value.is_empty()).then(|| PathBuf::from(value))
                }
                "buffers" => config.buffer_count = parse_value(key, value)?,
                "width" => config.width = parse_value(key, value)?,
                "height" => config.height = parse_value(key, value)?,
                "fps_min" => config.fps.min = parse_value(key, value)?,
                "fps_max" => config.fps.max = parse_value(key, value)?,
                "format" => {
                    let code: FourCc = value.parse().map_err(PipelineError::Config)?;
                    let format = CanonicalFormat::from_fourcc(code);
                    if format == CanonicalFormat::Unknown {
                        return Err(PipelineError::Config(format!(
                            "unknown pixel format {}",
                            code
                        )));
                    }
                    config.format = Some(format);
                }
                "drive" => {
                    config.drive_mode = match value {
                        "thread" => DriveMode::Thread,
                        "polled" => DriveMode::Polled,
                        other => {
                            return Err(PipelineError::Config(format!(
                                "unknown drive mode {:?}",
                                other
                            )));
                        }
                    }
                }
                other => {
                    return Err(PipelineError::Config(format!("unknown option {:?}", other)));
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON configuration document
    pub fn from_json(json: &str) -> PipelineResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> PipelineResult<()> {
        if self.buffer_count == 0 || self.buffer_count > buffers::MAX_COUNT {
            return Err(PipelineError::Config(format!(
                "buffer count {} outside 1..={}",
                self.buffer_count,
                buffers::MAX_COUNT
            )));
        }
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::Config(format!(
                "invalid size {}x{}",
                self.width, self.height
            )));
        }
        if !(self.fps.min >= 0.0 && self.fps.max > self.fps.min) {
            return Err(PipelineError::Config(format!(
                "invalid fps range [{}, {})",
                self.fps.min, self.fps.max
            )));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> PipelineResult<T> {
    value
        .parse()
        .map_err(|_| PipelineError::Config(format!("invalid value {:?} for {}", value, key)))
}
