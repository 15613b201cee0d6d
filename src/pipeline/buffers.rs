// SPDX-License-Identifier: GPL-3.0-only

//! Capture buffer allocation
//!
//! Buffers are backed, in order of preference, by:
//!
//! 1. a DMA heap region we allocate and hand to the driver (`DmaRegion`)
//! 2. driver memory exported as DMA-BUF descriptors (`DriverDma`)
//! 3. driver memory that is only mapped (`Mmap`)
//!
//! The first two carry a descriptor the renderer can import without a copy.

use crate::backends::device::{CaptureDevice, MemoryType, QueueSlot};
use crate::backends::dma_heap::DmaHeap;
use crate::backends::mmap::{MappedRegion, page_align};
use crate::errors::{PipelineError, PipelineResult};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use tracing::{debug, info, warn};

/// Where a buffer's memory comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    DmaRegion,
    DriverDma,
    Mmap,
}

impl BackingKind {
    fn memory(self) -> MemoryType {
        match self {
            BackingKind::DmaRegion => MemoryType::DmaBuf,
            BackingKind::DriverDma | BackingKind::Mmap => MemoryType::Mmap,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackingKind::DmaRegion => "dma-region",
            BackingKind::DriverDma => "driver-dma",
            BackingKind::Mmap => "mmap",
        }
    }
}

/// One capture slot
#[derive(Debug)]
pub struct CaptureBuffer {
    pub index: u32,
    pub kind: BackingKind,
    region: MappedRegion,
    fd: Option<OwnedFd>,
}

impl CaptureBuffer {
    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// The first `bytes_used` bytes of the slot
    pub fn data(&self, bytes_used: usize) -> &[u8] {
        self.region.bytes(bytes_used)
    }

    /// DMA-BUF descriptor backing this slot, if any
    pub fn dmabuf_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }
}

/// Owns every capture slot; all are created and destroyed together
#[derive(Debug, Default)]
pub struct BufferManager {
    buffers: Vec<CaptureBuffer>,
    memory: Option<MemoryType>,
}

/// Request up to `count` buffers, stepping down while the driver refuses
fn request_with_retry(
    device: &dyn CaptureDevice,
    count: u32,
    memory: MemoryType,
) -> PipelineResult<u32> {
    let mut requested = count.max(1);
    loop {
        match device.request_buffers(requested, memory) {
            Ok(granted) if granted > 0 => {
                if granted < count {
                    info!(requested = count, granted, "Driver granted fewer buffers");
                }
                return Ok(granted);
            }
            Ok(_) => {}
            Err(e) if e.is_out_of_memory() => {}
            Err(e) => return Err(e),
        }
        if requested == 1 {
            return Err(PipelineError::OutOfMemory);
        }
        warn!(requested, "Driver refused buffer request, retrying with fewer");
        requested -= 1;
    }
}

impl BufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Backing of the current slots
    pub fn kind(&self) -> Option<BackingKind> {
        self.buffers.first().map(|b| b.kind)
    }

    pub fn memory(&self) -> Option<MemoryType> {
        self.memory
    }

    pub fn get(&self, index: u32) -> Option<&CaptureBuffer> {
        self.buffers.get(index as usize)
    }

    /// Allocate `count` slots of at least `frame_size` bytes
    ///
    /// Returns the granted count, which may be lower than requested.
    pub fn allocate(
        &mut self,
        device: &dyn CaptureDevice,
        count: u32,
        frame_size: usize,
        dma_path: Option<&Path>,
    ) -> PipelineResult<u32> {
        self.release(device);

        let caps = device.capabilities()?;
        let mut strategies = Vec::with_capacity(3);
        if dma_path.is_some() && caps.dma_import {
            strategies.push(BackingKind::DmaRegion);
        }
        if caps.expbuf_capable {
            strategies.push(BackingKind::DriverDma);
        }
        strategies.push(BackingKind::Mmap);

        let mut last_error = PipelineError::OutOfMemory;
        for kind in strategies {
            match self.try_allocate(device, kind, count, frame_size, dma_path) {
                Ok(granted) => {
                    info!(
                        strategy = kind.name(),
                        requested = count,
                        granted,
                        frame_size,
                        "Allocated capture buffers"
                    );
                    return Ok(granted);
                }
                Err(PipelineError::OutOfMemory) => {
                    self.release(device);
                    return Err(PipelineError::OutOfMemory);
                }
                Err(e) => {
                    warn!(strategy = kind.name(), error = %e, "Buffer strategy failed, falling back");
                    self.release(device);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn try_allocate(
        &mut self,
        device: &dyn CaptureDevice,
        kind: BackingKind,
        count: u32,
        frame_size: usize,
        dma_path: Option<&Path>,
    ) -> PipelineResult<u32> {
        // Open the heap before touching the driver so a missing heap costs nothing
        let heap = match (kind, dma_path) {
            (BackingKind::DmaRegion, Some(path)) => Some(DmaHeap::open(path)?),
            _ => None,
        };

        let memory = kind.memory();
        let granted = request_with_retry(device, count, memory)?;
        self.memory = Some(memory);

        for index in 0..granted {
            let buffer = match &heap {
                Some(heap) => {
                    let length = page_align(frame_size.max(1));
                    let fd = heap.allocate(length)?;
                    let region = MappedRegion::map(fd.as_fd(), length, 0)?;
                    CaptureBuffer {
                        index,
                        kind,
                        region,
                        fd: Some(fd),
                    }
                }
                None => {
                    let info = device.query_buffer(index, memory)?;
                    let fd = match kind {
                        BackingKind::DriverDma => Some(device.export_buffer(index)?),
                        _ => None,
                    };
                    let region = device.map_buffer(&info)?;
                    CaptureBuffer {
                        index,
                        kind,
                        region,
                        fd,
                    }
                }
            };
            debug!(index, length = buffer.len(), strategy = kind.name(), "Prepared buffer");
            self.buffers.push(buffer);
        }
        Ok(granted)
    }

    /// Queue descriptor for slot `index`
    pub fn slot(&self, index: u32) -> PipelineResult<QueueSlot> {
        let buffer = self
            .get(index)
            .ok_or_else(|| PipelineError::NotSupported(format!("no buffer slot {}", index)))?;
        let memory = buffer.kind.memory();
        Ok(QueueSlot {
            index,
            memory,
            dmabuf_fd: match memory {
                MemoryType::DmaBuf => buffer.fd.as_ref().map(|fd| fd.as_raw_fd()),
                MemoryType::Mmap => None,
            },
            length: buffer.len() as u32,
        })
    }

    /// Hand every slot to the driver
    pub fn queue_all(&self, device: &dyn CaptureDevice) -> PipelineResult<()> {
        for buffer in &self.buffers {
            device.queue_buffer(&self.slot(buffer.index)?)?;
        }
        Ok(())
    }

    /// Unmap and close every slot and free the driver's buffers
    ///
    /// Safe on partial state and when nothing was allocated.
    pub fn release(&mut self, device: &dyn CaptureDevice) {
        let had_buffers = !self.buffers.is_empty();
        self.buffers.clear();
        if let Some(memory) = self.memory.take() {
            if let Err(e) = device.request_buffers(0, memory) {
                warn!(error = %e, "Failed to free driver buffers");
            }
        }
        if had_buffers {
            debug!("Released capture buffers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::virtual_device::VirtualDevice;
    use crate::formats::FourCc;

    fn device() -> VirtualDevice {
        let dev = VirtualDevice::new();
        dev.set_format(FourCc::new(b"YUYV"), 640, 480).unwrap();
        dev
    }

    const FRAME: usize = 640 * 480 * 2;

    #[test]
    fn test_fewer_granted_is_success() {
        let dev = device();
        dev.set_grant_cap(Some(2));
        let mut manager = BufferManager::new();
        assert_eq!(manager.allocate(&dev, 4, FRAME, None).unwrap(), 2);
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.kind(), Some(BackingKind::DriverDma));
        assert!(manager.get(1).unwrap().dmabuf_fd().is_some());
    }

    #[test]
    fn test_retry_with_decreasing_count() {
        let dev = device();
        dev.set_buffer_limit(Some(3));
        let mut manager = BufferManager::new();
        assert_eq!(manager.allocate(&dev, 8, FRAME, None).unwrap(), 3);
        assert_eq!(dev.allocated_buffers(), 3);
    }

    #[test]
    fn test_out_of_memory_when_single_buffer_refused() {
        let dev = device();
        dev.set_buffer_limit(Some(0));
        let mut manager = BufferManager::new();
        assert_eq!(
            manager.allocate(&dev, 4, FRAME, None).unwrap_err(),
            PipelineError::OutOfMemory
        );
        assert!(manager.is_empty());
        assert_eq!(manager.memory(), None);
    }

    #[test]
    fn test_export_failure_falls_back_to_mmap() {
        let dev = device();
        dev.set_fail_export(true);
        let mut manager = BufferManager::new();
        assert_eq!(manager.allocate(&dev, 4, FRAME, None).unwrap(), 4);
        assert_eq!(manager.kind(), Some(BackingKind::Mmap));
        assert!(manager.get(0).unwrap().dmabuf_fd().is_none());
    }

    #[test]
    fn test_without_mapped_buffers_export_is_skipped() {
        let dev = device();
        dev.set_dma_support(false, false);
        assert!(!dev.capabilities().unwrap().expbuf_capable);
        let mut manager = BufferManager::new();
        assert_eq!(manager.allocate(&dev, 3, FRAME, None).unwrap(), 3);
        assert_eq!(manager.kind(), Some(BackingKind::Mmap));
    }

    #[test]
    fn test_missing_heap_falls_through() {
        let dev = device();
        let mut manager = BufferManager::new();
        manager
            .allocate(&dev, 2, FRAME, Some(Path::new("/nonexistent/dma_heap")))
            .unwrap();
        assert_eq!(manager.kind(), Some(BackingKind::DriverDma));
    }

    #[test]
    fn test_release_is_idempotent() {
        let dev = device();
        let mut manager = BufferManager::new();
        manager.allocate(&dev, 4, FRAME, None).unwrap();
        manager.queue_all(&dev).unwrap();
        assert_eq!(dev.queued_buffers(), 4);

        manager.release(&dev);
        manager.release(&dev);
        assert!(manager.is_empty());
        assert_eq!(dev.allocated_buffers(), 0);
    }

    #[test]
    fn test_slot_descriptor() {
        let dev = device();
        dev.set_dma_support(false, false);
        let mut manager = BufferManager::new();
        manager.allocate(&dev, 1, FRAME, None).unwrap();
        let slot = manager.slot(0).unwrap();
        assert_eq!(slot.memory, MemoryType::Mmap);
        assert!(slot.dmabuf_fd.is_none());
        assert!(slot.length as usize >= FRAME);
        assert!(manager.slot(1).is_err());
    }
}
