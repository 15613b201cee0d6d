// SPDX-License-Identifier: GPL-3.0-only

//! DMA-region device used as capture buffer backing
//!
//! A DMA heap (`/dev/dma_heap/*`) hands out page-aligned, physically
//! shareable buffers as DMA-BUF descriptors. Buffers allocated here are
//! queued with `MemoryType::DmaBuf`, so the same descriptor can later be
//! imported by the GPU without a copy.

use super::v4l2::ioctl::iowr;
use crate::errors::{PipelineError, PipelineResult};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use tracing::debug;

#[repr(C)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

const DMA_HEAP_IOCTL_ALLOC: libc::c_ulong =
    iowr(b'H', 0x0, std::mem::size_of::<DmaHeapAllocationData>());

/// An open DMA heap
#[derive(Debug)]
pub struct DmaHeap {
    file: File,
    path: PathBuf,
}

impl DmaHeap {
    pub fn open(path: &Path) -> PipelineResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| PipelineError::from_io("open dma heap", &e))?;
        debug!(path = %path.display(), "Opened DMA heap");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate one buffer of at least `len` bytes
    pub fn allocate(&self, len: usize) -> PipelineResult<OwnedFd> {
        let mut data = DmaHeapAllocationData {
            len: len as u64,
            fd: 0,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            heap_flags: 0,
        };
        let result = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                DMA_HEAP_IOCTL_ALLOC as _,
                &mut data as *mut DmaHeapAllocationData,
            )
        };
        if result < 0 {
            return Err(PipelineError::last_os_error("DMA_HEAP_IOCTL_ALLOC"));
        }
        Ok(unsafe { OwnedFd::from_raw_fd(data.fd as i32) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_ioctl_number() {
        // _IOWR('H', 0x0, struct dma_heap_allocation_data)
        assert_eq!(DMA_HEAP_IOCTL_ALLOC, 0xC018_4800);
    }

    #[test]
    fn test_open_missing_heap_fails() {
        let err = DmaHeap::open(Path::new("/nonexistent/dma_heap/system")).unwrap_err();
        assert!(matches!(err, PipelineError::DriverError { .. }));
    }
}
