// SPDX-License-Identifier: GPL-3.0-only

//! Raw V4L2 structures and ioctl numbers
//!
//! Only the calls the `v4l` crate does not cover for our buffer model are
//! declared here: buffer request/query/queue/dequeue, DMA-BUF export,
//! stream on/off and controls.

use std::mem::size_of;
use std::os::fd::RawFd;

// ===== ioctl number encoding =====
// (dir << 30) | (size << 16) | (type << 8) | nr
// where dir: 2=READ, 1=WRITE, 3=READ|WRITE

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((ty as libc::c_ulong) << 8) | nr as libc::c_ulong
}

pub const fn ior(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    ioc(IOC_READ, ty, nr, size)
}

pub const fn iow(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    ioc(IOC_WRITE, ty, nr, size)
}

pub const fn iowr(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size)
}

pub const VIDIOC_QUERYCAP: libc::c_ulong = ior(b'V', 0, size_of::<V4l2Capability>());
pub const VIDIOC_REQBUFS: libc::c_ulong = iowr(b'V', 8, size_of::<V4l2RequestBuffers>());
pub const VIDIOC_QUERYBUF: libc::c_ulong = iowr(b'V', 9, size_of::<V4l2Buffer>());
pub const VIDIOC_QBUF: libc::c_ulong = iowr(b'V', 15, size_of::<V4l2Buffer>());
pub const VIDIOC_EXPBUF: libc::c_ulong = iowr(b'V', 16, size_of::<V4l2ExportBuffer>());
pub const VIDIOC_DQBUF: libc::c_ulong = iowr(b'V', 17, size_of::<V4l2Buffer>());
pub const VIDIOC_STREAMON: libc::c_ulong = iow(b'V', 18, size_of::<libc::c_int>());
pub const VIDIOC_STREAMOFF: libc::c_ulong = iow(b'V', 19, size_of::<libc::c_int>());
pub const VIDIOC_G_CTRL: libc::c_ulong = iowr(b'V', 27, size_of::<V4l2Control>());
pub const VIDIOC_S_CTRL: libc::c_ulong = iowr(b'V', 28, size_of::<V4l2Control>());
pub const VIDIOC_QUERYCTRL: libc::c_ulong = iowr(b'V', 36, size_of::<V4l2Queryctrl>());
pub const VIDIOC_QUERYMENU: libc::c_ulong = iowr(b'V', 37, size_of::<V4l2Querymenu>());

// ===== Constants =====

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;

pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_MEMORY_DMABUF: u32 = 4;

pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

pub const V4L2_BUF_CAP_SUPPORTS_MMAP: u32 = 1 << 0;
pub const V4L2_BUF_CAP_SUPPORTS_DMABUF: u32 = 1 << 2;

pub const V4L2_CTRL_FLAG_NEXT_CTRL: u32 = 0x8000_0000;

// ===== Structures =====

/// VIDIOC_QUERYCAP payload
#[repr(C)]
pub struct V4l2Capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

impl V4l2Capability {
    /// Capabilities of this node (falls back to the physical device's)
    pub fn node_caps(&self) -> u32 {
        if self.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            self.device_caps
        } else {
            self.capabilities
        }
    }
}

/// VIDIOC_REQBUFS payload
#[repr(C)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub buf_type: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

impl V4l2RequestBuffers {
    pub fn new(count: u32, memory: u32) -> Self {
        Self {
            count,
            buf_type: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory,
            capabilities: 0,
            flags: 0,
            reserved: [0; 3],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Timecode {
    pub tc_type: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2BufferM {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub fd: i32,
}

/// Single-planar `struct v4l2_buffer`
#[repr(C)]
pub struct V4l2Buffer {
    pub index: u32,
    pub buf_type: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: V4l2BufferM,
    pub length: u32,
    pub reserved2: u32,
    pub reserved: u32,
}

impl V4l2Buffer {
    pub fn new(index: u32, memory: u32) -> Self {
        // SAFETY: all-zero is a valid bit pattern for this plain C struct
        let mut buf: Self = unsafe { std::mem::zeroed() };
        buf.index = index;
        buf.buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = memory;
        buf
    }

    pub fn offset(&self) -> u32 {
        // SAFETY: every union member is plain data
        unsafe { self.m.offset }
    }
}

/// VIDIOC_EXPBUF payload
#[repr(C)]
pub struct V4l2ExportBuffer {
    pub buf_type: u32,
    pub index: u32,
    pub plane: u32,
    pub flags: u32,
    pub fd: RawFd,
    pub reserved: [u32; 11],
}

/// Control get/set
#[repr(C)]
pub struct V4l2Control {
    pub id: u32,
    pub value: i32,
}

/// Control description
#[repr(C)]
pub struct V4l2Queryctrl {
    pub id: u32,
    pub ctrl_type: u32,
    pub name: [u8; 32],
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
    pub reserved: [u32; 2],
}

/// Menu entry; `name` doubles as the little-endian `value` of integer menus
#[repr(C)]
#[repr(packed)]
pub struct V4l2Querymenu {
    pub id: u32,
    pub index: u32,
    pub name: [u8; 32],
    pub reserved: u32,
}

/// Issue an ioctl, mapping failure to the calling thread's errno
///
/// # Safety
///
/// `arg` must point to the structure `request` expects.
pub unsafe fn xioctl<T>(
    fd: RawFd,
    op: &'static str,
    request: libc::c_ulong,
    arg: *mut T,
) -> crate::errors::PipelineResult<()> {
    loop {
        let result = unsafe { libc::ioctl(fd, request as _, arg) };
        if result >= 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(crate::errors::PipelineError::from_io(op, &err));
        }
    }
}

/// Extract a NUL-terminated string from a fixed-size byte array
pub fn c_str(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_size_ioctl_numbers() {
        assert_eq!(VIDIOC_QUERYCAP, 0x80685600);
        assert_eq!(VIDIOC_REQBUFS, 0xC0145608);
        assert_eq!(VIDIOC_EXPBUF, 0xC0405610);
        assert_eq!(VIDIOC_STREAMON, 0x40045612);
        assert_eq!(VIDIOC_STREAMOFF, 0x40045613);
        assert_eq!(VIDIOC_G_CTRL, 0xC008561B);
        assert_eq!(VIDIOC_S_CTRL, 0xC008561C);
        assert_eq!(VIDIOC_QUERYCTRL, 0xC0445624);
        assert_eq!(VIDIOC_QUERYMENU, 0xC02C5625);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_buffer_ioctl_numbers_64bit() {
        assert_eq!(size_of::<V4l2Buffer>(), 88);
        assert_eq!(VIDIOC_QUERYBUF, 0xC0585609);
        assert_eq!(VIDIOC_QBUF, 0xC058560F);
        assert_eq!(VIDIOC_DQBUF, 0xC0585611);
    }

    #[test]
    fn test_c_str() {
        assert_eq!(c_str(b"uvcvideo\0\0\0\0"), "uvcvideo");
        assert_eq!(c_str(b"full"), "full");
    }
}
