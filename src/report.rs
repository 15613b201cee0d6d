// SPDX-License-Identifier: GPL-3.0-only

//! Serializable description of what a device can capture

use crate::backends::device::{
    CaptureDevice, DeviceCapabilities, FrameIntervalEntry, FrameSizeEntry,
};
use crate::errors::PipelineResult;
use crate::formats::{CanonicalFormat, FourCc};
use crate::pipeline::ControlDescriptor;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One advertised frame rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateReport {
    Discrete {
        numerator: u32,
        denominator: u32,
        fps: f64,
    },
    Range {
        min_fps: f64,
        max_fps: f64,
    },
}

impl RateReport {
    fn from_entry(entry: &FrameIntervalEntry) -> Self {
        match *entry {
            FrameIntervalEntry::Discrete(frac) => RateReport::Discrete {
                numerator: frac.numerator,
                denominator: frac.denominator,
                fps: frac.fps(),
            },
            FrameIntervalEntry::Stepwise { min, max, .. } => RateReport::Range {
                min_fps: max.fps().min(min.fps()),
                max_fps: min.fps().max(max.fps()),
            },
        }
    }

    fn covers(&self, fps: f64) -> bool {
        match *self {
            RateReport::Discrete { fps: rate, .. } => (rate - fps).abs() < 0.01,
            RateReport::Range { min_fps, max_fps } => fps >= min_fps && fps <= max_fps,
        }
    }
}

/// One advertised frame size with its rates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SizeReport {
    Discrete {
        width: u32,
        height: u32,
        rates: Vec<RateReport>,
    },
    Stepwise {
        min_width: u32,
        max_width: u32,
        step_width: u32,
        min_height: u32,
        max_height: u32,
        step_height: u32,
        /// Rates reported at the largest size
        rates: Vec<RateReport>,
    },
}

impl SizeReport {
    fn entry(&self) -> FrameSizeEntry {
        match *self {
            SizeReport::Discrete { width, height, .. } => FrameSizeEntry::Discrete { width, height },
            SizeReport::Stepwise {
                min_width,
                max_width,
                step_width,
                min_height,
                max_height,
                step_height,
                ..
            } => FrameSizeEntry::Stepwise {
                min_width,
                max_width,
                step_width,
                min_height,
                max_height,
                step_height,
            },
        }
    }

    pub fn rates(&self) -> &[RateReport] {
        match self {
            SizeReport::Discrete { rates, .. } | SizeReport::Stepwise { rates, .. } => rates,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatReport {
    pub fourcc: FourCc,
    pub format: CanonicalFormat,
    pub description: String,
    pub compressed: bool,
    /// False when the driver could not enumerate sizes for this format
    pub sizes_enumerable: bool,
    pub sizes: Vec<SizeReport>,
}

/// Formats x sizes x rates of one device, plus its controls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub device: String,
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub expbuf_capable: bool,
    pub dma_import: bool,
    pub formats: Vec<FormatReport>,
    pub controls: Vec<ControlDescriptor>,
    /// Version of the library that produced the report
    pub version: String,
}

fn rates_for(device: &dyn CaptureDevice, fourcc: FourCc, width: u32, height: u32) -> Vec<RateReport> {
    device
        .enum_frame_intervals(fourcc, width, height)
        .map(|entries| entries.iter().map(RateReport::from_entry).collect())
        .unwrap_or_default()
}

impl CapabilityReport {
    /// Walk the device's formats, sizes and rates
    pub fn collect(
        path: &Path,
        caps: DeviceCapabilities,
        device: &dyn CaptureDevice,
        controls: Vec<ControlDescriptor>,
    ) -> PipelineResult<Self> {
        let mut formats = Vec::new();
        for entry in device.enum_formats()? {
            let sizes = device.enum_frame_sizes(entry.fourcc);
            let sizes_enumerable = sizes.is_ok();
            let sizes = sizes
                .unwrap_or_default()
                .into_iter()
                .map(|size| match size {
                    FrameSizeEntry::Discrete { width, height } => SizeReport::Discrete {
                        width,
                        height,
                        rates: rates_for(device, entry.fourcc, width, height),
                    },
                    FrameSizeEntry::Stepwise {
                        min_width,
                        max_width,
                        step_width,
                        min_height,
                        max_height,
                        step_height,
                    } => SizeReport::Stepwise {
                        min_width,
                        max_width,
                        step_width,
                        min_height,
                        max_height,
                        step_height,
                        rates: rates_for(device, entry.fourcc, max_width, max_height),
                    },
                })
                .collect();

            formats.push(FormatReport {
                fourcc: entry.fourcc,
                format: CanonicalFormat::from_fourcc(entry.fourcc),
                description: entry.description,
                compressed: entry.compressed,
                sizes_enumerable,
                sizes,
            });
        }

        Ok(Self {
            device: path.display().to_string(),
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus_info,
            expbuf_capable: caps.expbuf_capable,
            dma_import: caps.dma_import,
            formats,
            controls,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Check whether the report lists a size at a rate for a format
    pub fn supports(&self, format: CanonicalFormat, width: u32, height: u32, fps: f64) -> bool {
        self.formats
            .iter()
            .filter(|f| f.format == format)
            .flat_map(|f| f.sizes.iter())
            .filter(|s| s.entry().matches(width, height))
            .any(|s| s.rates().iter().any(|r| r.covers(fps)))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
