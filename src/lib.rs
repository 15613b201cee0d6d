// SPDX-License-Identifier: MPL-2.0

//! Camera capture and GPU frame conversion
//!
//! Drives a V4L2 capture device from open to streaming, negotiates format,
//! size and rate, manages the capture buffers and delivers each filled frame
//! to a callback. Frames can then be decoded (MJPEG), converted in software,
//! or drawn on the GPU through a per-format conversion program into RGBA.
//!
//! # Architecture
//!
//! - [`formats`]: pixel format registry and frame geometry
//! - [`backends`]: the capture device trait, V4L2 and virtual devices
//! - [`pipeline`]: state machine, negotiation, buffers and the capture engine
//! - [`convert`]: MJPEG decoding and software raw-to-raw conversion
//! - [`render`]: GPU renderer, zero-copy import and the frame presenter
//! - [`shaders`]: WGSL programs and the per-format texture table
//! - [`report`]: serializable device capability report
//! - [`config`]: pipeline construction options
//!
//! # Example
//!
//! ```no_run
//! use camera_pipeline::{CapturePipeline, PipelineConfig};
//!
//! let pipeline = CapturePipeline::new(PipelineConfig::default())?;
//! pipeline.set_frame_callback(|frame| {
//!     println!("frame {} ({})", frame.sequence, frame.descriptor);
//!     Ok(())
//! });
//! pipeline.start()?;
//! # Ok::<(), camera_pipeline::PipelineError>(())
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod convert;
pub mod errors;
pub mod formats;
pub mod gpu;
pub mod pipeline;
pub mod render;
pub mod report;
pub mod shaders;

// Re-export commonly used types
pub use backends::{CaptureDevice, DeviceProvider, V4l2Provider, VirtualDevice, VirtualProvider};
pub use config::{DriveMode, FpsRange, PipelineConfig};
pub use convert::{DecodeTarget, DecodedFrame, ImageMut, ImageRef, MjpegDecoder};
pub use errors::{ConvertError, DecodeError, PipelineError, PipelineResult, RenderError};
pub use formats::{CanonicalFormat, FormatFamily, FourCc, FrameDescriptor};
pub use gpu::{GpuContext, create_device, create_device_blocking};
pub use pipeline::{
    ActiveFormat, CapturePipeline, CapturedFrame, ControlDescriptor, FrameCallback,
    PipelineEvent, StreamState,
};
pub use render::{Presenter, RenderFrame, Renderer, Transform};
pub use report::CapabilityReport;
