// SPDX-License-Identifier: GPL-3.0-only

//! Capture device backends
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               CapturePipeline                │
//! └──────────────────────┬───────────────────────┘
//!                        │ CaptureDevice
//! ┌──────────────────────┴───────────────────────┐
//! │  ┌──────────────┐        ┌────────────────┐  │
//! │  │  V4l2Device  │        │ VirtualDevice  │  │
//! │  │ (v4l + ioctl)│        │    (memfd)     │  │
//! │  └──────────────┘        └────────────────┘  │
//! │            ┌────────────────────┐            │
//! │            │  DmaHeap (backing) │            │
//! │            └────────────────────┘            │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! - [`device`]: the device trait and its value types
//! - [`v4l2`]: kernel V4L2 nodes
//! - [`virtual_device`]: scripted in-memory device
//! - [`dma_heap`]: DMA-BUF allocator used as buffer backing
//! - [`mmap`]: shared mappings of buffer memory

pub mod device;
pub mod dma_heap;
pub mod mmap;
pub mod v4l2;
pub mod virtual_device;

pub use device::{CaptureDevice, DeviceProvider};
pub use v4l2::V4l2Provider;
pub use virtual_device::{VirtualDevice, VirtualProvider};
