// SPDX-License-Identifier: GPL-3.0-only

//! Shared memory mappings for capture buffers

use crate::errors::{PipelineError, PipelineResult};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::NonNull;

/// A `MAP_SHARED` mapping, unmapped on drop
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain shared memory owned by this value; access is
// synchronized by the buffer queue protocol (the driver only writes to a slot
// while it is queued, the pipeline only reads it while dequeued).
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of `fd` starting at `offset`
    pub fn map(fd: BorrowedFd<'_>, len: usize, offset: u64) -> PipelineResult<Self> {
        if len == 0 {
            return Err(PipelineError::NotSupported(
                "zero-length buffer mapping".to_string(),
            ));
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PipelineError::last_os_error("mmap"));
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(PipelineError::DriverError {
            op: "mmap",
            code: libc::EFAULT,
        })?;
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the first `len` bytes (clamped to the mapping)
    pub fn bytes(&self, len: usize) -> &[u8] {
        let len = len.min(self.len);
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), len) }
    }

    /// Copy `data` into the start of the region, truncating to its length
    pub fn write(&self, data: &[u8]) -> usize {
        let n = data.len().min(self.len);
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), n) };
        n
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MappedRegion({} bytes)", self.len)
    }
}

/// Round `len` up to a whole number of pages
pub fn page_align(len: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page > 0 { page as usize } else { 4096 };
    len.div_ceil(page) * page
}
