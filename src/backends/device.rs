// SPDX-License-Identifier: GPL-3.0-only

//! Capture device abstraction
//!
//! [`CaptureDevice`] is the seam between the pipeline and the kernel. The V4L2
//! implementation talks to a real `/dev/videoN` node; the virtual device in
//! [`super::virtual_device`] implements the same contract in memory.
//!
//! Every method takes `&self` so the capture thread can wait on a device
//! without holding the pipeline's state lock.

use crate::errors::PipelineResult;
use crate::formats::FourCc;
use serde::{Deserialize, Serialize};
use std::os::fd::{OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::mmap::MappedRegion;

/// Identity and feature bits reported when the device is opened
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    /// Supports single-planar video capture
    pub video_capture: bool,
    /// Supports streaming I/O
    pub streaming: bool,
    /// Driver-mapped buffers exist, which VIDIOC_EXPBUF needs. The export
    /// itself can still fail; callers fall back to plain mapping.
    pub expbuf_capable: bool,
    /// Driver accepts DMA-BUF backed buffers
    pub dma_import: bool,
}

/// One advertised pixel format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatEntry {
    pub fourcc: FourCc,
    pub description: String,
    pub compressed: bool,
}

/// One advertised frame size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSizeEntry {
    Discrete {
        width: u32,
        height: u32,
    },
    /// Range of sizes on a step grid (continuous when both steps are 1)
    Stepwise {
        min_width: u32,
        max_width: u32,
        step_width: u32,
        min_height: u32,
        max_height: u32,
        step_height: u32,
    },
}

impl FrameSizeEntry {
    /// Check whether the requested size is one of the sizes this entry describes
    pub fn matches(&self, width: u32, height: u32) -> bool {
        match *self {
            FrameSizeEntry::Discrete { width: w, height: h } => w == width && h == height,
            FrameSizeEntry::Stepwise {
                min_width,
                max_width,
                step_width,
                min_height,
                max_height,
                step_height,
            } => {
                let on_grid = |v: u32, min: u32, step: u32| step <= 1 || (v - min) % step == 0;
                (min_width..=max_width).contains(&width)
                    && (min_height..=max_height).contains(&height)
                    && on_grid(width, min_width, step_width)
                    && on_grid(height, min_height, step_height)
            }
        }
    }
}

/// Frame interval as a fraction of a second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fraction {
    pub numerator: u32,
    pub denominator: u32,
}

impl Fraction {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Interval for an integer frame rate (30 -> 1/30)
    pub fn from_fps(fps: u32) -> Self {
        Self::new(1, fps.max(1))
    }

    /// Reciprocal of the interval, in frames per second
    pub fn fps(&self) -> f64 {
        if self.numerator == 0 {
            0.0
        } else {
            self.denominator as f64 / self.numerator as f64
        }
    }
}

/// One advertised frame interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameIntervalEntry {
    Discrete(Fraction),
    Stepwise {
        min: Fraction,
        max: Fraction,
        step: Fraction,
    },
}

/// Active format as set by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

/// Buffer memory model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Driver-allocated, mapped into the process
    Mmap,
    /// Caller-supplied DMA-BUF file descriptors
    DmaBuf,
}

/// Placement of a driver-allocated buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    pub length: u32,
    pub offset: u32,
}

/// Buffer to hand back to the driver
#[derive(Debug, Clone, Copy)]
pub struct QueueSlot {
    pub index: u32,
    pub memory: MemoryType,
    /// Backing descriptor for `MemoryType::DmaBuf`
    pub dmabuf_fd: Option<RawFd>,
    pub length: u32,
}

/// A filled buffer returned by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp: Duration,
}

/// Raw control description as reported by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub id: u32,
    pub name: String,
    pub ctrl_type: u32,
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
}

/// One entry of a menu-typed control
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MenuOption {
    /// Text label (menu controls)
    Label(String),
    /// Integer value (integer-menu controls)
    Value(i64),
}

/// Kernel video-capture device
pub trait CaptureDevice: Send + Sync {
    /// Identity and feature bits
    fn capabilities(&self) -> PipelineResult<DeviceCapabilities>;

    /// Advertised pixel formats
    fn enum_formats(&self) -> PipelineResult<Vec<FormatEntry>>;

    /// Advertised sizes for a format
    ///
    /// An error means enumeration failed on its very first entry; a driver
    /// that fails part way returns the entries seen so far.
    fn enum_frame_sizes(&self, fourcc: FourCc) -> PipelineResult<Vec<FrameSizeEntry>>;

    /// Advertised intervals for a format and size, with the same error contract
    fn enum_frame_intervals(
        &self,
        fourcc: FourCc,
        width: u32,
        height: u32,
    ) -> PipelineResult<Vec<FrameIntervalEntry>>;

    fn get_format(&self) -> PipelineResult<DeviceFormat>;

    /// Set the capture format; the driver may adjust the request
    fn set_format(&self, fourcc: FourCc, width: u32, height: u32) -> PipelineResult<DeviceFormat>;

    /// Set the frame interval; returns the interval the driver applied
    fn set_frame_interval(&self, interval: Fraction) -> PipelineResult<Fraction>;

    /// Request `count` buffers (0 frees them); returns the granted count
    fn request_buffers(&self, count: u32, memory: MemoryType) -> PipelineResult<u32>;

    fn query_buffer(&self, index: u32, memory: MemoryType) -> PipelineResult<BufferInfo>;

    /// Map a driver-allocated buffer into the process
    fn map_buffer(&self, info: &BufferInfo) -> PipelineResult<MappedRegion>;

    /// Export a driver-allocated buffer as a DMA-BUF descriptor
    fn export_buffer(&self, index: u32) -> PipelineResult<OwnedFd>;

    fn queue_buffer(&self, slot: &QueueSlot) -> PipelineResult<()>;

    fn dequeue_buffer(&self, memory: MemoryType) -> PipelineResult<DequeuedBuffer>;

    /// Wait until a filled buffer is ready; `Ok(false)` on timeout
    fn wait_for_frame(&self, timeout: Duration) -> PipelineResult<bool>;

    fn stream_on(&self) -> PipelineResult<()>;

    fn stream_off(&self) -> PipelineResult<()>;

    /// Query one control; `id` may carry the next-control flag to enumerate
    fn query_control(&self, id: u32) -> PipelineResult<ControlInfo>;

    fn query_menu(&self, id: u32, index: u32) -> PipelineResult<MenuOption>;

    fn get_control(&self, id: u32) -> PipelineResult<i32>;

    /// Set a control; returns the value the driver kept
    fn set_control(&self, id: u32, value: i32) -> PipelineResult<i32>;
}

/// Opens capture devices by path
pub trait DeviceProvider: Send + Sync {
    fn open(&self, path: &Path) -> PipelineResult<Arc<dyn CaptureDevice>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stepwise_size_matching() {
        let entry = FrameSizeEntry::Stepwise {
            min_width: 160,
            max_width: 1920,
            step_width: 16,
            min_height: 120,
            max_height: 1080,
            step_height: 8,
        };
        assert!(entry.matches(1920, 1080));
        assert!(entry.matches(640, 480));
        assert!(!entry.matches(641, 480));
        assert!(!entry.matches(3840, 2160));
    }

    #[test]
    fn test_fraction_fps() {
        assert_eq!(Fraction::new(1, 30).fps(), 30.0);
        assert!((Fraction::new(1001, 60000).fps() - 59.94).abs() < 0.01);
        assert_eq!(Fraction::new(0, 30).fps(), 0.0);
    }
}
