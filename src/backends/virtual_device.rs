// SPDX-License-Identifier: GPL-3.0-only

//! In-memory capture device
//!
//! Implements the [`CaptureDevice`] contract without hardware: buffers are
//! memfd-backed so the pipeline maps and exports them exactly as it would a
//! driver's, and frames are written into whichever buffer is at the head of
//! the queue. Formats, buffer grants and failures are scripted through the
//! builder methods and can be changed while the device is streaming.

use super::device::{
    BufferInfo, CaptureDevice, ControlInfo, DequeuedBuffer, DeviceCapabilities, DeviceFormat,
    DeviceProvider, FormatEntry, Fraction, FrameIntervalEntry, FrameSizeEntry, MemoryType,
    MenuOption, QueueSlot,
};
use super::mmap::{MappedRegion, page_align};
use super::v4l2::controls::*;
use super::v4l2::ioctl::V4L2_CTRL_FLAG_NEXT_CTRL;
use crate::constants::buffers;
use crate::errors::{PipelineError, PipelineResult};
use crate::formats::{CanonicalFormat, FourCc};
use std::collections::{BTreeMap, VecDeque};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Produces the bytes of frame `sequence` for the active format
pub type FrameSource = Arc<dyn Fn(&DeviceFormat, u32) -> Vec<u8> + Send + Sync>;

/// One advertised format with its sizes and intervals
#[derive(Debug, Clone)]
pub struct VirtualFormat {
    pub fourcc: FourCc,
    pub sizes: Vec<FrameSizeEntry>,
    /// Intervals advertised for every size of this format
    pub intervals: Vec<FrameIntervalEntry>,
    /// Size enumeration fails on its first entry
    pub fail_size_enum: bool,
    /// Interval enumeration fails on its first entry
    pub fail_interval_enum: bool,
}

impl VirtualFormat {
    /// Discrete sizes, each offered at the given integer rates
    pub fn discrete(fourcc: &[u8; 4], sizes: &[(u32, u32)], rates: &[u32]) -> Self {
        Self {
            fourcc: FourCc::new(fourcc),
            sizes: sizes
                .iter()
                .map(|&(width, height)| FrameSizeEntry::Discrete { width, height })
                .collect(),
            intervals: rates
                .iter()
                .map(|&fps| FrameIntervalEntry::Discrete(Fraction::from_fps(fps)))
                .collect(),
            fail_size_enum: false,
            fail_interval_enum: false,
        }
    }

    pub fn with_failing_size_enum(mut self) -> Self {
        self.fail_size_enum = true;
        self
    }

    pub fn with_failing_interval_enum(mut self) -> Self {
        self.fail_interval_enum = true;
        self
    }
}

#[derive(Debug)]
struct VirtualControl {
    info: ControlInfo,
    value: i32,
    /// Menu entries by index; `None` marks an index the driver skips
    menu: Vec<Option<MenuOption>>,
}

#[derive(Clone)]
struct Script {
    formats: Vec<VirtualFormat>,
    grant_cap: Option<u32>,
    buffer_limit: Option<u32>,
    failing_sizes: Vec<(u32, u32)>,
    fail_stream_on: bool,
    fail_dequeue: bool,
    fail_export: bool,
    bytes_used_override: Option<u32>,
    frame_period: Duration,
    expbuf_capable: bool,
    dma_import: bool,
    frame_source: Option<FrameSource>,
}

struct MmapBuffer {
    fd: OwnedFd,
    length: u32,
}

struct QueuedSlot {
    index: u32,
    dmabuf_fd: Option<RawFd>,
    length: u32,
}

struct DeviceState {
    format: DeviceFormat,
    interval: Fraction,
    memory: MemoryType,
    allocated: u32,
    mmap_buffers: Vec<MmapBuffer>,
    queue: VecDeque<QueuedSlot>,
    streaming: bool,
    sequence: u32,
    stream_on_count: u32,
    controls: BTreeMap<u32, VirtualControl>,
}

/// Scripted capture device backed by anonymous shared memory
pub struct VirtualDevice {
    script: Mutex<Script>,
    state: Mutex<DeviceState>,
}

fn errno(op: &'static str, code: i32) -> PipelineError {
    PipelineError::DriverError { op, code }
}

fn memfd(len: usize) -> PipelineResult<OwnedFd> {
    let fd = unsafe { libc::memfd_create(c"virtual-capture".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(PipelineError::last_os_error("memfd_create"));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } < 0 {
        return Err(PipelineError::last_os_error("ftruncate"));
    }
    Ok(fd)
}

/// Driver view of a format: stride and image size
fn device_format(fourcc: FourCc, width: u32, height: u32) -> DeviceFormat {
    let canonical = CanonicalFormat::from_fourcc(fourcc);
    let size_image = canonical
        .frame_size(width, height)
        .unwrap_or(width as usize * height as usize * 2) as u32;
    let bytes_per_line = match canonical.family() {
        crate::formats::FormatFamily::PackedYuv => width.div_ceil(2) * 4,
        _ => canonical
            .bytes_per_pixel()
            .map(|bpp| width * bpp as u32)
            .unwrap_or(if canonical.is_compressed() { 0 } else { width }),
    };
    DeviceFormat {
        width,
        height,
        fourcc,
        bytes_per_line,
        size_image,
    }
}

/// Deterministic test pattern: diagonal ramp shifted by the frame sequence
fn pattern_frame(format: &DeviceFormat, sequence: u32) -> Vec<u8> {
    (0..format.size_image as usize)
        .map(|i| ((i as u32).wrapping_add(sequence) % 251) as u8)
        .collect()
}

fn default_formats() -> Vec<VirtualFormat> {
    vec![
        VirtualFormat::discrete(
            b"YUYV",
            &[(640, 480), (1280, 720), (1920, 1080)],
            &[30, 15],
        ),
        VirtualFormat::discrete(b"MJPG", &[(1280, 720), (1920, 1080)], &[60, 30]),
        VirtualFormat {
            fourcc: FourCc::new(b"NV12"),
            sizes: vec![FrameSizeEntry::Stepwise {
                min_width: 160,
                max_width: 3840,
                step_width: 16,
                min_height: 120,
                max_height: 2160,
                step_height: 8,
            }],
            intervals: vec![FrameIntervalEntry::Stepwise {
                min: Fraction::new(1, 60),
                max: Fraction::new(1, 5),
                step: Fraction::new(1, 600),
            }],
            fail_size_enum: false,
            fail_interval_enum: false,
        },
    ]
}

fn control(
    id: u32,
    name: &str,
    ctrl_type: u32,
    (minimum, maximum, step, default_value): (i32, i32, i32, i32),
    flags: u32,
    menu: Vec<Option<MenuOption>>,
) -> (u32, VirtualControl) {
    (
        id,
        VirtualControl {
            info: ControlInfo {
                id,
                name: name.to_string(),
                ctrl_type,
                minimum,
                maximum,
                step,
                default_value,
                flags,
            },
            value: default_value,
            menu,
        },
    )
}

fn default_controls() -> BTreeMap<u32, VirtualControl> {
    let label = |s: &str| Some(MenuOption::Label(s.to_string()));
    BTreeMap::from([
        control(
            V4L2_CID_BRIGHTNESS,
            "Brightness",
            V4L2_CTRL_TYPE_INTEGER,
            (-64, 64, 1, 0),
            0,
            Vec::new(),
        ),
        control(
            V4L2_CID_CONTRAST,
            "Contrast",
            V4L2_CTRL_TYPE_INTEGER,
            (0, 100, 5, 50),
            0,
            Vec::new(),
        ),
        control(
            V4L2_CID_AUTO_WHITE_BALANCE,
            "White Balance, Automatic",
            V4L2_CTRL_TYPE_BOOLEAN,
            (0, 1, 1, 1),
            0,
            Vec::new(),
        ),
        control(
            V4L2_CID_GAMMA,
            "Gamma",
            V4L2_CTRL_TYPE_INTEGER,
            (72, 500, 1, 100),
            V4L2_CTRL_FLAG_DISABLED,
            Vec::new(),
        ),
        control(
            V4L2_CID_POWER_LINE_FREQUENCY,
            "Power Line Frequency",
            V4L2_CTRL_TYPE_MENU,
            (0, 2, 1, 1),
            0,
            vec![label("Disabled"), label("50 Hz"), label("60 Hz")],
        ),
        control(
            V4L2_CID_EXPOSURE_AUTO,
            "Auto Exposure",
            V4L2_CTRL_TYPE_MENU,
            (0, 3, 1, 3),
            0,
            vec![None, label("Manual Mode"), None, label("Aperture Priority Mode")],
        ),
        control(
            V4L2_CID_ZOOM_ABSOLUTE,
            "Zoom, Absolute",
            V4L2_CTRL_TYPE_INTEGER_MENU,
            (0, 2, 1, 0),
            0,
            vec![
                Some(MenuOption::Value(100)),
                Some(MenuOption::Value(200)),
                Some(MenuOption::Value(400)),
            ],
        ),
    ])
}

impl Default for VirtualDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDevice {
    /// A webcam-like device: YUYV and MJPEG at fixed sizes, NV12 stepwise
    pub fn new() -> Self {
        Self::with_formats(default_formats())
    }

    pub fn with_formats(formats: Vec<VirtualFormat>) -> Self {
        let format = formats
            .first()
            .and_then(|f| match f.sizes.first() {
                Some(FrameSizeEntry::Discrete { width, height }) => {
                    Some(device_format(f.fourcc, *width, *height))
                }
                Some(FrameSizeEntry::Stepwise {
                    min_width,
                    min_height,
                    ..
                }) => Some(device_format(f.fourcc, *min_width, *min_height)),
                None => None,
            })
            .unwrap_or_else(|| device_format(FourCc::new(b"YUYV"), 640, 480));

        Self {
            script: Mutex::new(Script {
                formats,
                grant_cap: None,
                buffer_limit: None,
                failing_sizes: Vec::new(),
                fail_stream_on: false,
                fail_dequeue: false,
                fail_export: false,
                bytes_used_override: None,
                frame_period: Duration::from_millis(2),
                expbuf_capable: true,
                dma_import: true,
                frame_source: None,
            }),
            state: Mutex::new(DeviceState {
                format,
                interval: Fraction::from_fps(30),
                memory: MemoryType::Mmap,
                allocated: 0,
                mmap_buffers: Vec::new(),
                queue: VecDeque::new(),
                streaming: false,
                sequence: 0,
                stream_on_count: 0,
                controls: default_controls(),
            }),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Grant at most `cap` buffers per request
    pub fn set_grant_cap(&self, cap: Option<u32>) -> &Self {
        self.script().grant_cap = cap;
        self
    }

    /// Refuse with ENOMEM any request for more than `limit` buffers
    pub fn set_buffer_limit(&self, limit: Option<u32>) -> &Self {
        self.script().buffer_limit = limit;
        self
    }

    /// Make `set_format` fail with EINVAL for this size
    pub fn fail_set_format_for(&self, width: u32, height: u32) -> &Self {
        self.script().failing_sizes.push((width, height));
        self
    }

    pub fn set_fail_stream_on(&self, fail: bool) -> &Self {
        self.script().fail_stream_on = fail;
        self
    }

    /// Make every dequeue fail with EIO
    pub fn set_fail_dequeue(&self, fail: bool) -> &Self {
        self.script().fail_dequeue = fail;
        self
    }

    pub fn set_fail_export(&self, fail: bool) -> &Self {
        self.script().fail_export = fail;
        self
    }

    /// Report this byte count for every delivered frame
    pub fn set_bytes_used_override(&self, bytes: Option<u32>) -> &Self {
        self.script().bytes_used_override = bytes;
        self
    }

    /// Advertise (or hide) buffer export and DMA-BUF import
    pub fn set_dma_support(&self, export: bool, import: bool) -> &Self {
        {
            let mut script = self.script();
            script.expbuf_capable = export;
            script.dma_import = import;
        }
        self
    }

    pub fn set_frame_period(&self, period: Duration) -> &Self {
        self.script().frame_period = period;
        self
    }

    /// Generate frame contents with `source` instead of the ramp pattern
    pub fn set_frame_source(&self, source: FrameSource) -> &Self {
        self.script().frame_source = Some(source);
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    /// Buffers currently granted by the last request
    pub fn allocated_buffers(&self) -> u32 {
        self.state().allocated
    }

    pub fn queued_buffers(&self) -> usize {
        self.state().queue.len()
    }

    pub fn current_format(&self) -> DeviceFormat {
        self.state().format
    }

    pub fn current_interval(&self) -> Fraction {
        self.state().interval
    }

    pub fn current_memory(&self) -> MemoryType {
        self.state().memory
    }

    /// Number of successful stream starts since creation
    pub fn stream_on_count(&self) -> u32 {
        self.state().stream_on_count
    }

    fn find_format(&self, fourcc: FourCc) -> Option<VirtualFormat> {
        self.script()
            .formats
            .iter()
            .find(|f| f.fourcc == fourcc)
            .cloned()
    }
}

impl CaptureDevice for VirtualDevice {
    fn capabilities(&self) -> PipelineResult<DeviceCapabilities> {
        let script = self.script();
        Ok(DeviceCapabilities {
            driver: "virtual".to_string(),
            card: "Virtual Camera".to_string(),
            bus_info: "platform:virtual".to_string(),
            video_capture: true,
            streaming: true,
            expbuf_capable: script.expbuf_capable,
            dma_import: script.dma_import,
        })
    }

    fn enum_formats(&self) -> PipelineResult<Vec<FormatEntry>> {
        Ok(self
            .script()
            .formats
            .iter()
            .map(|f| {
                let canonical = CanonicalFormat::from_fourcc(f.fourcc);
                FormatEntry {
                    fourcc: f.fourcc,
                    description: canonical.name().to_string(),
                    compressed: canonical.is_compressed(),
                }
            })
            .collect())
    }

    fn enum_frame_sizes(&self, fourcc: FourCc) -> PipelineResult<Vec<FrameSizeEntry>> {
        let format = self
            .find_format(fourcc)
            .ok_or(errno("VIDIOC_ENUM_FRAMESIZES", libc::EINVAL))?;
        if format.fail_size_enum {
            return Err(errno("VIDIOC_ENUM_FRAMESIZES", libc::ENOTTY));
        }
        Ok(format.sizes)
    }

    fn enum_frame_intervals(
        &self,
        fourcc: FourCc,
        width: u32,
        height: u32,
    ) -> PipelineResult<Vec<FrameIntervalEntry>> {
        let format = self
            .find_format(fourcc)
            .ok_or(errno("VIDIOC_ENUM_FRAMEINTERVALS", libc::EINVAL))?;
        if format.fail_interval_enum {
            return Err(errno("VIDIOC_ENUM_FRAMEINTERVALS", libc::ENOTTY));
        }
        if !format.fail_size_enum && !format.sizes.iter().any(|s| s.matches(width, height)) {
            return Err(errno("VIDIOC_ENUM_FRAMEINTERVALS", libc::EINVAL));
        }
        Ok(format.intervals)
    }

    fn get_format(&self) -> PipelineResult<DeviceFormat> {
        Ok(self.state().format)
    }

    fn set_format(&self, fourcc: FourCc, width: u32, height: u32) -> PipelineResult<DeviceFormat> {
        let (failing, format) = {
            let script = self.script();
            (
                script.failing_sizes.contains(&(width, height)),
                script
                    .formats
                    .iter()
                    .find(|f| f.fourcc == fourcc)
                    .or(script.formats.first())
                    .cloned(),
            )
        };
        if failing {
            return Err(errno("VIDIOC_S_FMT", libc::EINVAL));
        }
        let format = format.ok_or(errno("VIDIOC_S_FMT", libc::EINVAL))?;

        let mut state = self.state();
        if state.allocated > 0 {
            return Err(errno("VIDIOC_S_FMT", libc::EBUSY));
        }

        // Like a driver, adjust an unsupported request instead of refusing it
        let (w, h) = if format.fail_size_enum || format.sizes.iter().any(|s| s.matches(width, height)) {
            (width, height)
        } else {
            match format.sizes.first() {
                Some(FrameSizeEntry::Discrete { width, height }) => (*width, *height),
                Some(FrameSizeEntry::Stepwise {
                    min_width,
                    max_width,
                    min_height,
                    max_height,
                    ..
                }) => (
                    width.clamp(*min_width, *max_width),
                    height.clamp(*min_height, *max_height),
                ),
                None => (width, height),
            }
        };
        state.format = device_format(format.fourcc, w, h);
        debug!(format = %state.format.fourcc, width = w, height = h, "Virtual device format set");
        Ok(state.format)
    }

    fn set_frame_interval(&self, interval: Fraction) -> PipelineResult<Fraction> {
        if interval.denominator == 0 {
            return Err(errno("VIDIOC_S_PARM", libc::EINVAL));
        }
        let mut state = self.state();
        state.interval = interval;
        Ok(interval)
    }

    fn request_buffers(&self, count: u32, memory: MemoryType) -> PipelineResult<u32> {
        let (limit, cap, dma_import) = {
            let script = self.script();
            (script.buffer_limit, script.grant_cap, script.dma_import)
        };

        let mut state = self.state();
        if state.streaming {
            return Err(errno("VIDIOC_REQBUFS", libc::EBUSY));
        }
        if count == 0 {
            state.allocated = 0;
            state.mmap_buffers.clear();
            state.queue.clear();
            return Ok(0);
        }
        if memory == MemoryType::DmaBuf && !dma_import {
            return Err(errno("VIDIOC_REQBUFS", libc::EINVAL));
        }
        if limit.is_some_and(|limit| count > limit) {
            return Err(errno("VIDIOC_REQBUFS", libc::ENOMEM));
        }

        let granted = count.min(cap.unwrap_or(buffers::MAX_COUNT));
        state.mmap_buffers.clear();
        state.queue.clear();
        if memory == MemoryType::Mmap {
            let length = page_align(state.format.size_image as usize);
            for _ in 0..granted {
                state.mmap_buffers.push(MmapBuffer {
                    fd: memfd(length)?,
                    length: length as u32,
                });
            }
        }
        state.allocated = granted;
        state.memory = memory;
        Ok(granted)
    }

    fn query_buffer(&self, index: u32, memory: MemoryType) -> PipelineResult<BufferInfo> {
        let state = self.state();
        if memory != state.memory || index >= state.allocated {
            return Err(errno("VIDIOC_QUERYBUF", libc::EINVAL));
        }
        let length = match memory {
            MemoryType::Mmap => state.mmap_buffers[index as usize].length,
            MemoryType::DmaBuf => state.format.size_image,
        };
        Ok(BufferInfo {
            index,
            length,
            offset: 0,
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> PipelineResult<MappedRegion> {
        let state = self.state();
        let buffer = state
            .mmap_buffers
            .get(info.index as usize)
            .ok_or(errno("mmap", libc::EINVAL))?;
        MappedRegion::map(buffer.fd.as_fd(), info.length as usize, info.offset as u64)
    }

    fn export_buffer(&self, index: u32) -> PipelineResult<OwnedFd> {
        let (export, fail) = {
            let script = self.script();
            (script.expbuf_capable, script.fail_export)
        };
        if !export || fail {
            return Err(errno("VIDIOC_EXPBUF", libc::ENOTTY));
        }
        let state = self.state();
        let buffer = state
            .mmap_buffers
            .get(index as usize)
            .ok_or(errno("VIDIOC_EXPBUF", libc::EINVAL))?;
        buffer
            .fd
            .try_clone()
            .map_err(|e| PipelineError::from_io("VIDIOC_EXPBUF", &e))
    }

    fn queue_buffer(&self, slot: &QueueSlot) -> PipelineResult<()> {
        let mut state = self.state();
        if slot.memory != state.memory || slot.index >= state.allocated {
            return Err(errno("VIDIOC_QBUF", libc::EINVAL));
        }
        if state.queue.iter().any(|q| q.index == slot.index) {
            return Err(errno("VIDIOC_QBUF", libc::EINVAL));
        }
        if slot.memory == MemoryType::DmaBuf
            && (slot.dmabuf_fd.is_none() || slot.length < state.format.size_image)
        {
            return Err(errno("VIDIOC_QBUF", libc::EINVAL));
        }
        state.queue.push_back(QueuedSlot {
            index: slot.index,
            dmabuf_fd: slot.dmabuf_fd,
            length: slot.length,
        });
        Ok(())
    }

    fn dequeue_buffer(&self, memory: MemoryType) -> PipelineResult<DequeuedBuffer> {
        let (fail, bytes_override, source) = {
            let script = self.script();
            (
                script.fail_dequeue,
                script.bytes_used_override,
                script.frame_source.clone(),
            )
        };
        if fail {
            return Err(errno("VIDIOC_DQBUF", libc::EIO));
        }

        let mut state = self.state();
        if !state.streaming || memory != state.memory {
            return Err(errno("VIDIOC_DQBUF", libc::EINVAL));
        }
        let slot = state
            .queue
            .pop_front()
            .ok_or(errno("VIDIOC_DQBUF", libc::EAGAIN))?;

        let sequence = state.sequence;
        state.sequence = state.sequence.wrapping_add(1);
        let format = state.format;
        let data = match &source {
            Some(source) => source(&format, sequence),
            None => pattern_frame(&format, sequence),
        };

        let written = match slot.dmabuf_fd {
            Some(fd) => {
                // SAFETY: the queued descriptor stays open until the pipeline
                // releases its buffers, which only happens after dequeueing stops
                let fd = unsafe { BorrowedFd::borrow_raw(fd) };
                MappedRegion::map(fd, slot.length as usize, 0)?.write(&data)
            }
            None => {
                let buffer = &state.mmap_buffers[slot.index as usize];
                MappedRegion::map(buffer.fd.as_fd(), buffer.length as usize, 0)?.write(&data)
            }
        };

        Ok(DequeuedBuffer {
            index: slot.index,
            bytes_used: bytes_override.unwrap_or(written as u32),
            sequence,
            timestamp: Duration::from_micros(sequence as u64 * 33_333),
        })
    }

    fn wait_for_frame(&self, timeout: Duration) -> PipelineResult<bool> {
        let period = self.script().frame_period;
        let ready = {
            let state = self.state();
            state.streaming && !state.queue.is_empty()
        };
        if ready {
            std::thread::sleep(period.min(timeout));
            Ok(true)
        } else {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
            Ok(false)
        }
    }

    fn stream_on(&self) -> PipelineResult<()> {
        if self.script().fail_stream_on {
            return Err(errno("VIDIOC_STREAMON", libc::EIO));
        }
        let mut state = self.state();
        if state.allocated == 0 {
            return Err(errno("VIDIOC_STREAMON", libc::EINVAL));
        }
        state.streaming = true;
        state.stream_on_count += 1;
        Ok(())
    }

    fn stream_off(&self) -> PipelineResult<()> {
        let mut state = self.state();
        state.streaming = false;
        state.queue.clear();
        Ok(())
    }

    fn query_control(&self, id: u32) -> PipelineResult<ControlInfo> {
        let state = self.state();
        let found = if id & V4L2_CTRL_FLAG_NEXT_CTRL != 0 {
            let after = id & !V4L2_CTRL_FLAG_NEXT_CTRL;
            state.controls.range(after + 1..).next().map(|(_, c)| c)
        } else {
            state.controls.get(&id)
        };
        found
            .map(|c| c.info.clone())
            .ok_or(errno("VIDIOC_QUERYCTRL", libc::EINVAL))
    }

    fn query_menu(&self, id: u32, index: u32) -> PipelineResult<MenuOption> {
        let state = self.state();
        state
            .controls
            .get(&id)
            .and_then(|c| c.menu.get(index as usize).cloned().flatten())
            .ok_or(errno("VIDIOC_QUERYMENU", libc::EINVAL))
    }

    fn get_control(&self, id: u32) -> PipelineResult<i32> {
        let state = self.state();
        state
            .controls
            .get(&id)
            .map(|c| c.value)
            .ok_or(errno("VIDIOC_G_CTRL", libc::EINVAL))
    }

    fn set_control(&self, id: u32, value: i32) -> PipelineResult<i32> {
        let mut state = self.state();
        let control = state
            .controls
            .get_mut(&id)
            .ok_or(errno("VIDIOC_S_CTRL", libc::EINVAL))?;
        let info = &control.info;
        if info.flags & (V4L2_CTRL_FLAG_DISABLED | V4L2_CTRL_FLAG_READ_ONLY) != 0 {
            return Err(errno("VIDIOC_S_CTRL", libc::EACCES));
        }
        let kind = ControlKind::from(info.ctrl_type);
        let applied = if kind.has_menu() {
            let valid = (info.minimum..=info.maximum).contains(&value)
                && control.menu.get(value as usize).is_some_and(|m| m.is_some());
            if !valid {
                return Err(errno("VIDIOC_S_CTRL", libc::EINVAL));
            }
            value
        } else {
            let clamped = value.clamp(info.minimum, info.maximum);
            let step = info.step.max(1);
            info.minimum + (clamped - info.minimum) / step * step
        };
        control.value = applied;
        Ok(applied)
    }
}

/// Hands out one shared [`VirtualDevice`] for every open
#[derive(Clone)]
pub struct VirtualProvider {
    device: Arc<VirtualDevice>,
}

impl VirtualProvider {
    pub fn new(device: Arc<VirtualDevice>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<VirtualDevice> {
        &self.device
    }
}

impl DeviceProvider for VirtualProvider {
    fn open(&self, path: &Path) -> PipelineResult<Arc<dyn CaptureDevice>> {
        debug!(path = %path.display(), "Opening virtual device");
        Ok(self.device.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(index: u32) -> QueueSlot {
        QueueSlot {
            index,
            memory: MemoryType::Mmap,
            dmabuf_fd: None,
            length: 0,
        }
    }

    #[test]
    fn test_mmap_frames_land_in_mapped_buffer() {
        let dev = VirtualDevice::new();
        dev.set_format(FourCc::new(b"YUYV"), 640, 480).unwrap();
        assert_eq!(dev.request_buffers(2, MemoryType::Mmap).unwrap(), 2);
        let info = dev.query_buffer(1, MemoryType::Mmap).unwrap();
        let region = dev.map_buffer(&info).unwrap();

        dev.queue_buffer(&slot(1)).unwrap();
        dev.stream_on().unwrap();
        assert!(dev.wait_for_frame(Duration::from_millis(100)).unwrap());
        let buf = dev.dequeue_buffer(MemoryType::Mmap).unwrap();
        assert_eq!(buf.index, 1);
        assert_eq!(buf.bytes_used, 640 * 480 * 2);
        assert_eq!(region.bytes(4), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_grant_cap_and_limit() {
        let dev = VirtualDevice::new();
        dev.set_grant_cap(Some(2));
        assert_eq!(dev.request_buffers(4, MemoryType::Mmap).unwrap(), 2);

        dev.set_buffer_limit(Some(1));
        let err = dev.request_buffers(3, MemoryType::Mmap).unwrap_err();
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn test_unsupported_size_is_adjusted() {
        let dev = VirtualDevice::new();
        let fmt = dev.set_format(FourCc::new(b"YUYV"), 333, 222).unwrap();
        assert_eq!((fmt.width, fmt.height), (640, 480));
    }

    #[test]
    fn test_control_walk_and_menu_gaps() {
        let dev = VirtualDevice::new();
        let mut ids = Vec::new();
        let mut id = 0;
        while let Ok(info) = dev.query_control(next_control(id)) {
            ids.push(info.id);
            id = info.id;
        }
        assert_eq!(ids.len(), 7);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        assert!(dev.query_menu(V4L2_CID_EXPOSURE_AUTO, 0).is_err());
        assert_eq!(
            dev.query_menu(V4L2_CID_EXPOSURE_AUTO, 1).unwrap(),
            MenuOption::Label("Manual Mode".to_string())
        );
    }

    #[test]
    fn test_set_control_clamps_to_step() {
        let dev = VirtualDevice::new();
        assert_eq!(dev.set_control(V4L2_CID_CONTRAST, 73).unwrap(), 70);
        assert_eq!(dev.set_control(V4L2_CID_BRIGHTNESS, 500).unwrap(), 64);
        assert!(dev.set_control(V4L2_CID_GAMMA, 120).is_err());
        assert!(dev.set_control(V4L2_CID_EXPOSURE_AUTO, 2).is_err());
    }
}
