// SPDX-License-Identifier: MPL-2.0

//! Error types for the capture pipeline

use std::fmt;
use std::io;

/// Result type alias using PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors raised by the capture side of the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Operation needs an open device
    NotOpen,
    /// Operation is not valid in the current stream state
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    /// Missing capability, format or control
    NotSupported(String),
    /// A kernel call failed
    DriverError {
        /// Name of the failing operation (e.g. "VIDIOC_REQBUFS")
        op: &'static str,
        /// OS error code (errno)
        code: i32,
    },
    /// Buffer allocation exhausted, even a single buffer was refused
    OutOfMemory,
    /// Delivered byte count disagrees with the negotiated frame size
    FrameSizeMismatch { expected: usize, actual: usize },
    /// Invalid configuration value
    Config(String),
}

impl PipelineError {
    /// Build a driver error from the calling thread's errno
    pub fn last_os_error(op: &'static str) -> Self {
        Self::from_io(op, &io::Error::last_os_error())
    }

    /// Build a driver error from an io::Error, keeping its OS code
    pub fn from_io(op: &'static str, err: &io::Error) -> Self {
        PipelineError::DriverError {
            op,
            code: err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// True when the driver refused for lack of memory
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            PipelineError::OutOfMemory => true,
            PipelineError::DriverError { code, .. } => *code == libc::ENOMEM,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::NotOpen => write!(f, "Device is not open"),
            PipelineError::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, currently {}", expected, actual)
            }
            PipelineError::NotSupported(what) => write!(f, "Not supported: {}", what),
            PipelineError::DriverError { op, code } => write!(
                f,
                "{} failed: {}",
                op,
                io::Error::from_raw_os_error(*code)
            ),
            PipelineError::OutOfMemory => write!(f, "Out of memory: no capture buffers available"),
            PipelineError::FrameSizeMismatch { expected, actual } => write!(
                f,
                "Frame size mismatch: expected {} bytes, got {}",
                expected, actual
            ),
            PipelineError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

/// Errors from compressed frame decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input is not a decodable compressed frame
    InvalidData(String),
    /// Requested target format cannot be produced
    UnsupportedTarget(String),
    /// Every decode strategy failed
    Failed(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidData(msg) => write!(f, "Invalid compressed data: {}", msg),
            DecodeError::UnsupportedTarget(msg) => write!(f, "Unsupported decode target: {}", msg),
            DecodeError::Failed(msg) => write!(f, "Decode failed: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors from software raw-to-raw conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    /// No converter exists for this pair
    Unsupported { from: String, to: String },
    /// Source and destination dimensions differ
    DimensionMismatch,
    /// A buffer is smaller than its descriptor requires
    BufferTooSmall { expected: usize, actual: usize },
}

impl fmt::Display for ConvertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertError::Unsupported { from, to } => {
                write!(f, "No conversion from {} to {}", from, to)
            }
            ConvertError::DimensionMismatch => {
                write!(f, "Source and destination dimensions differ")
            }
            ConvertError::BufferTooSmall { expected, actual } => write!(
                f,
                "Buffer too small: need {} bytes, have {}",
                expected, actual
            ),
        }
    }
}

impl std::error::Error for ConvertError {}

/// Errors from the GPU renderer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// No adapter or device could be created
    NoDevice(String),
    /// Frame format has no render path
    UnsupportedFormat(String),
    /// Frame data does not match its descriptor
    FrameSizeMismatch { expected: usize, actual: usize },
    /// Compressed frame could not be decoded for display
    Decode(DecodeError),
    /// A plane texture would exceed the device's texture size limit
    TextureTooLarge { width: u32, height: u32, limit: u32 },
    /// GPU readback failed
    Readback(String),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::NoDevice(msg) => write!(f, "No GPU device: {}", msg),
            RenderError::UnsupportedFormat(fmt_name) => {
                write!(f, "No render path for format {}", fmt_name)
            }
            RenderError::FrameSizeMismatch { expected, actual } => write!(
                f,
                "Frame size mismatch: expected {} bytes, got {}",
                expected, actual
            ),
            RenderError::Decode(e) => write!(f, "Decode error: {}", e),
            RenderError::TextureTooLarge {
                width,
                height,
                limit,
            } => write!(
                f,
                "Texture {}x{} exceeds the device limit of {}",
                width, height, limit
            ),
            RenderError::Readback(msg) => write!(f, "Readback failed: {}", msg),
        }
    }
}

impl std::error::Error for RenderError {}

impl From<DecodeError> for RenderError {
    fn from(err: DecodeError) -> Self {
        RenderError::Decode(err)
    }
}

impl From<ConvertError> for DecodeError {
    fn from(err: ConvertError) -> Self {
        DecodeError::UnsupportedTarget(err.to_string())
    }
}
