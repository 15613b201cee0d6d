// SPDX-License-Identifier: GPL-3.0-only

//! Format conversion
//!
//! - [`MjpegDecoder`]: compressed frames to a raw format, natively to
//!   semi-planar YUV when libjpeg-turbo is available, else to RGBA
//! - [`convert`]: software raw-to-raw conversion between described images

pub mod mjpeg;
pub mod software;

pub use mjpeg::{DecodeTarget, MjpegDecoder};
pub use software::{convert, convert_to_vec};

use crate::errors::DecodeError;
use crate::formats::FrameDescriptor;

/// Borrowed source image
#[derive(Debug, Clone, Copy)]
pub struct ImageRef<'a> {
    pub descriptor: FrameDescriptor,
    pub data: &'a [u8],
}

impl<'a> ImageRef<'a> {
    pub fn new(descriptor: FrameDescriptor, data: &'a [u8]) -> Self {
        Self { descriptor, data }
    }
}

/// Borrowed destination image
#[derive(Debug)]
pub struct ImageMut<'a> {
    pub descriptor: FrameDescriptor,
    pub data: &'a mut [u8],
}

impl<'a> ImageMut<'a> {
    pub fn new(descriptor: FrameDescriptor, data: &'a mut [u8]) -> Self {
        Self { descriptor, data }
    }
}

/// Output of one decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub descriptor: FrameDescriptor,
    pub data: Vec<u8>,
    /// The decoded format differs from the one the decoder was locked to
    pub format_changed: bool,
}

impl DecodedFrame {
    pub fn as_image(&self) -> ImageRef<'_> {
        ImageRef::new(self.descriptor, &self.data)
    }
}

/// Decode one compressed frame with a throwaway decoder
pub fn decode(compressed: &[u8], target: DecodeTarget) -> Result<DecodedFrame, DecodeError> {
    MjpegDecoder::new(target).decode(compressed)
}
