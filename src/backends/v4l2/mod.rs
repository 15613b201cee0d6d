// SPDX-License-Identifier: GPL-3.0-only

//! Kernel V4L2 capture device
//!
//! Enumeration and format negotiation go through the `v4l` crate; the buffer
//! queue, DMA-BUF export, streaming and controls use raw ioctls on the same
//! descriptor so the pipeline keeps full control over buffer backing.

pub mod controls;
pub mod ioctl;

use crate::backends::device::{
    BufferInfo, CaptureDevice, ControlInfo, DequeuedBuffer, DeviceCapabilities, DeviceFormat,
    DeviceProvider, FormatEntry, Fraction, FrameIntervalEntry, FrameSizeEntry, MemoryType,
    MenuOption, QueueSlot,
};
use crate::backends::mmap::MappedRegion;
use crate::errors::{PipelineError, PipelineResult};
use crate::formats::FourCc;
use ioctl::*;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use v4l::video::Capture;

fn memory_code(memory: MemoryType) -> u32 {
    match memory {
        MemoryType::Mmap => V4L2_MEMORY_MMAP,
        MemoryType::DmaBuf => V4L2_MEMORY_DMABUF,
    }
}

/// An open `/dev/videoN` capture node
pub struct V4l2Device {
    device: v4l::Device,
    path: PathBuf,
    caps: DeviceCapabilities,
}

impl V4l2Device {
    pub fn open(path: &Path) -> PipelineResult<Self> {
        let device =
            v4l::Device::with_path(path).map_err(|e| PipelineError::from_io("open", &e))?;
        let fd = device.handle().fd();

        let mut cap: V4l2Capability = unsafe { std::mem::zeroed() };
        unsafe { xioctl(fd, "VIDIOC_QUERYCAP", VIDIOC_QUERYCAP, &mut cap as *mut V4l2Capability)? };
        let node_caps = cap.node_caps();

        // REQBUFS with count 0 frees nothing but reports the buffer capabilities
        let mut req = V4l2RequestBuffers::new(0, V4L2_MEMORY_MMAP);
        let buf_caps = match unsafe {
            xioctl(fd, "VIDIOC_REQBUFS", VIDIOC_REQBUFS, &mut req as *mut V4l2RequestBuffers)
        } {
            Ok(()) => req.capabilities,
            Err(e) => {
                debug!(error = %e, "Buffer capability probe failed");
                0
            }
        };

        let caps = DeviceCapabilities {
            driver: c_str(&cap.driver),
            card: c_str(&cap.card),
            bus_info: c_str(&cap.bus_info),
            video_capture: node_caps & V4L2_CAP_VIDEO_CAPTURE != 0,
            streaming: node_caps & V4L2_CAP_STREAMING != 0,
            // EXPBUF works on MMAP buffers; there is no separate capability bit
            expbuf_capable: buf_caps & V4L2_BUF_CAP_SUPPORTS_MMAP != 0,
            dma_import: buf_caps & V4L2_BUF_CAP_SUPPORTS_DMABUF != 0,
        };

        info!(
            path = %path.display(),
            driver = %caps.driver,
            card = %caps.card,
            expbuf_capable = caps.expbuf_capable,
            dma_import = caps.dma_import,
            "Opened V4L2 device"
        );

        Ok(Self {
            device,
            path: path.to_path_buf(),
            caps,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.device.handle().fd()
    }

    fn stream_ioctl(&self, op: &'static str, request: libc::c_ulong) -> PipelineResult<()> {
        let mut buf_type: libc::c_int = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        unsafe { xioctl(self.fd(), op, request, &mut buf_type as *mut libc::c_int) }
    }
}

impl CaptureDevice for V4l2Device {
    fn capabilities(&self) -> PipelineResult<DeviceCapabilities> {
        Ok(self.caps.clone())
    }

    fn enum_formats(&self) -> PipelineResult<Vec<FormatEntry>> {
        let descriptions = self
            .device
            .enum_formats()
            .map_err(|e| PipelineError::from_io("VIDIOC_ENUM_FMT", &e))?;
        Ok(descriptions
            .into_iter()
            .map(|desc| FormatEntry {
                fourcc: desc.fourcc.into(),
                compressed: desc
                    .flags
                    .contains(v4l::format::description::Flags::COMPRESSED),
                description: desc.description,
            })
            .collect())
    }

    fn enum_frame_sizes(&self, fourcc: FourCc) -> PipelineResult<Vec<FrameSizeEntry>> {
        let sizes = self
            .device
            .enum_framesizes(fourcc.into())
            .map_err(|e| PipelineError::from_io("VIDIOC_ENUM_FRAMESIZES", &e))?;
        Ok(sizes
            .into_iter()
            .map(|size| match size.size {
                v4l::framesize::FrameSizeEnum::Discrete(d) => FrameSizeEntry::Discrete {
                    width: d.width,
                    height: d.height,
                },
                v4l::framesize::FrameSizeEnum::Stepwise(s) => FrameSizeEntry::Stepwise {
                    min_width: s.min_width,
                    max_width: s.max_width,
                    step_width: s.step_width,
                    min_height: s.min_height,
                    max_height: s.max_height,
                    step_height: s.step_height,
                },
            })
            .collect())
    }

    fn enum_frame_intervals(
        &self,
        fourcc: FourCc,
        width: u32,
        height: u32,
    ) -> PipelineResult<Vec<FrameIntervalEntry>> {
        let intervals = self
            .device
            .enum_frameintervals(fourcc.into(), width, height)
            .map_err(|e| PipelineError::from_io("VIDIOC_ENUM_FRAMEINTERVALS", &e))?;
        let frac = |f: v4l::Fraction| Fraction::new(f.numerator, f.denominator);
        Ok(intervals
            .into_iter()
            .map(|interval| match interval.interval {
                v4l::frameinterval::FrameIntervalEnum::Discrete(f) => {
                    FrameIntervalEntry::Discrete(frac(f))
                }
                v4l::frameinterval::FrameIntervalEnum::Stepwise(s) => {
                    FrameIntervalEntry::Stepwise {
                        min: frac(s.min),
                        max: frac(s.max),
                        step: frac(s.step),
                    }
                }
            })
            .collect())
    }

    fn get_format(&self) -> PipelineResult<DeviceFormat> {
        let fmt = self
            .device
            .format()
            .map_err(|e| PipelineError::from_io("VIDIOC_G_FMT", &e))?;
        Ok(DeviceFormat {
            width: fmt.width,
            height: fmt.height,
            fourcc: fmt.fourcc.into(),
            bytes_per_line: fmt.stride,
            size_image: fmt.size,
        })
    }

    fn set_format(&self, fourcc: FourCc, width: u32, height: u32) -> PipelineResult<DeviceFormat> {
        let request = v4l::Format::new(width, height, fourcc.into());
        let fmt = self
            .device
            .set_format(&request)
            .map_err(|e| PipelineError::from_io("VIDIOC_S_FMT", &e))?;
        Ok(DeviceFormat {
            width: fmt.width,
            height: fmt.height,
            fourcc: fmt.fourcc.into(),
            bytes_per_line: fmt.stride,
            size_image: fmt.size,
        })
    }

    fn set_frame_interval(&self, interval: Fraction) -> PipelineResult<Fraction> {
        let params = v4l::video::capture::Parameters::new(v4l::Fraction::new(
            interval.numerator,
            interval.denominator,
        ));
        let applied = self
            .device
            .set_params(&params)
            .map_err(|e| PipelineError::from_io("VIDIOC_S_PARM", &e))?;
        Ok(Fraction::new(
            applied.interval.numerator,
            applied.interval.denominator,
        ))
    }

    fn request_buffers(&self, count: u32, memory: MemoryType) -> PipelineResult<u32> {
        let mut req = V4l2RequestBuffers::new(count, memory_code(memory));
        unsafe {
            xioctl(
                self.fd(),
                "VIDIOC_REQBUFS",
                VIDIOC_REQBUFS,
                &mut req as *mut V4l2RequestBuffers,
            )?
        };
        Ok(req.count)
    }

    fn query_buffer(&self, index: u32, memory: MemoryType) -> PipelineResult<BufferInfo> {
        let mut buf = V4l2Buffer::new(index, memory_code(memory));
        unsafe {
            xioctl(
                self.fd(),
                "VIDIOC_QUERYBUF",
                VIDIOC_QUERYBUF,
                &mut buf as *mut V4l2Buffer,
            )?
        };
        Ok(BufferInfo {
            index: buf.index,
            length: buf.length,
            offset: buf.offset(),
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> PipelineResult<MappedRegion> {
        // SAFETY: the descriptor is owned by `self.device` and outlives this call
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd()) };
        MappedRegion::map(fd, info.length as usize, info.offset as u64)
    }

    fn export_buffer(&self, index: u32) -> PipelineResult<OwnedFd> {
        let mut exp = V4l2ExportBuffer {
            buf_type: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            index,
            plane: 0,
            flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            fd: -1,
            reserved: [0; 11],
        };
        unsafe {
            xioctl(
                self.fd(),
                "VIDIOC_EXPBUF",
                VIDIOC_EXPBUF,
                &mut exp as *mut V4l2ExportBuffer,
            )?
        };
        Ok(unsafe { OwnedFd::from_raw_fd(exp.fd) })
    }

    fn queue_buffer(&self, slot: &QueueSlot) -> PipelineResult<()> {
        let mut buf = V4l2Buffer::new(slot.index, memory_code(slot.memory));
        if slot.memory == MemoryType::DmaBuf {
            let fd = slot.dmabuf_fd.ok_or_else(|| {
                PipelineError::NotSupported("DMA-BUF slot without a descriptor".to_string())
            })?;
            buf.m = V4l2BufferM { fd };
            buf.length = slot.length;
        }
        unsafe { xioctl(self.fd(), "VIDIOC_QBUF", VIDIOC_QBUF, &mut buf as *mut V4l2Buffer) }
    }

    fn dequeue_buffer(&self, memory: MemoryType) -> PipelineResult<DequeuedBuffer> {
        let mut buf = V4l2Buffer::new(0, memory_code(memory));
        unsafe { xioctl(self.fd(), "VIDIOC_DQBUF", VIDIOC_DQBUF, &mut buf as *mut V4l2Buffer)? };
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            timestamp: Duration::from_secs(buf.timestamp.tv_sec.max(0) as u64)
                + Duration::from_micros(buf.timestamp.tv_usec.max(0) as u64),
        })
    }

    fn wait_for_frame(&self, timeout: Duration) -> PipelineResult<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let ready = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(false);
            }
            return Err(PipelineError::from_io("poll", &err));
        }
        if pfd.revents & libc::POLLERR != 0 {
            return Err(PipelineError::DriverError {
                op: "poll",
                code: libc::EIO,
            });
        }
        Ok(ready > 0 && pfd.revents & libc::POLLIN != 0)
    }

    fn stream_on(&self) -> PipelineResult<()> {
        self.stream_ioctl("VIDIOC_STREAMON", VIDIOC_STREAMON)
    }

    fn stream_off(&self) -> PipelineResult<()> {
        self.stream_ioctl("VIDIOC_STREAMOFF", VIDIOC_STREAMOFF)
    }

    fn query_control(&self, id: u32) -> PipelineResult<ControlInfo> {
        controls::query_control(self.fd(), id)
    }

    fn query_menu(&self, id: u32, index: u32) -> PipelineResult<MenuOption> {
        let info = controls::query_control(self.fd(), id)?;
        controls::query_menu(self.fd(), id, index, info.ctrl_type.into())
    }

    fn get_control(&self, id: u32) -> PipelineResult<i32> {
        controls::get_control(self.fd(), id)
    }

    fn set_control(&self, id: u32, value: i32) -> PipelineResult<i32> {
        controls::set_control(self.fd(), id, value)
    }
}

/// Opens real V4L2 device nodes
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2Provider;

impl DeviceProvider for V4l2Provider {
    fn open(&self, path: &Path) -> PipelineResult<Arc<dyn CaptureDevice>> {
        Ok(Arc::new(V4l2Device::open(path)?))
    }
}
