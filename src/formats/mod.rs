// SPDX-License-Identifier: GPL-3.0-only

//! Pixel format registry
//!
//! Maps device FourCC codes onto [`CanonicalFormat`] and knows the byte
//! layout of every raw format: plane geometry and expected frame size.

mod fourcc;

pub use fourcc::FourCc;

use crate::errors::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal pixel layout tag, independent of device-specific codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonicalFormat {
    /// Packed 4:2:2, Y0 U Y1 V
    Yuyv,
    /// Packed 4:2:2, Y0 V Y1 U
    Yvyu,
    /// Packed 4:2:2, U Y0 V Y1
    Uyvy,
    /// Packed 4:2:2, V Y0 U Y1
    Vyuy,
    /// Semi-planar 4:2:0, interleaved UV
    Nv12,
    /// Semi-planar 4:2:0, interleaved VU
    Nv21,
    /// Semi-planar 4:2:2, interleaved UV
    Nv16,
    /// Semi-planar 4:2:2, interleaved VU
    Nv61,
    /// Semi-planar 4:4:4, interleaved UV
    Nv24,
    /// Planar 4:2:0, Y then U then V
    I420,
    /// Planar 4:2:0, Y then V then U
    Yv12,
    /// Planar 4:2:2, Y then U then V
    I422,
    /// 8-bit luma only
    Gray8,
    /// 16-bit little-endian luma only
    Y16,
    /// 16-bit RGB 5:6:5, little-endian
    Rgb565,
    /// R G B byte order
    Rgb24,
    /// B G R byte order
    Bgr24,
    /// R G B A byte order
    Rgba32,
    /// B G R A byte order
    Bgra32,
    /// 8-bit Bayer, R G / G B
    BayerRggb,
    /// 8-bit Bayer, B G / G R
    BayerBggr,
    /// 8-bit Bayer, G R / B G
    BayerGrbg,
    /// 8-bit Bayer, G B / R G
    BayerGbrg,
    /// Motion JPEG, one JPEG image per frame
    Mjpeg,
    /// H.264 elementary stream
    H264,
    /// Code with no mapping; format-specific paths are disabled
    Unknown,
}

/// Broad layout class of a format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatFamily {
    /// Several pixels' components interleave within one texel
    PackedYuv,
    /// Full luma plane plus one interleaved chroma plane
    SemiPlanar,
    /// Full luma plane plus separate U and V planes
    Planar,
    Gray,
    Rgb,
    Bayer,
    Compressed,
    Unknown,
}

/// Device code table. The first row for a format is its primary code;
/// later rows for the same format are aliases that decode to it.
const FOURCC_TABLE: &[(FourCc, CanonicalFormat)] = &[
    (FourCc::new(b"YUYV"), CanonicalFormat::Yuyv),
    (FourCc::new(b"YVYU"), CanonicalFormat::Yvyu),
    (FourCc::new(b"UYVY"), CanonicalFormat::Uyvy),
    (FourCc::new(b"VYUY"), CanonicalFormat::Vyuy),
    (FourCc::new(b"NV12"), CanonicalFormat::Nv12),
    (FourCc::new(b"NV21"), CanonicalFormat::Nv21),
    (FourCc::new(b"NV16"), CanonicalFormat::Nv16),
    (FourCc::new(b"NV61"), CanonicalFormat::Nv61),
    (FourCc::new(b"NV24"), CanonicalFormat::Nv24),
    (FourCc::new(b"YU12"), CanonicalFormat::I420),
    (FourCc::new(b"YV12"), CanonicalFormat::Yv12),
    (FourCc::new(b"422P"), CanonicalFormat::I422),
    (FourCc::new(b"GREY"), CanonicalFormat::Gray8),
    (FourCc::new(b"Y16 "), CanonicalFormat::Y16),
    (FourCc::new(b"RGBP"), CanonicalFormat::Rgb565),
    (FourCc::new(b"RGB3"), CanonicalFormat::Rgb24),
    (FourCc::new(b"BGR3"), CanonicalFormat::Bgr24),
    (FourCc::new(b"AB24"), CanonicalFormat::Rgba32),
    (FourCc::new(b"AR24"), CanonicalFormat::Bgra32),
    (FourCc::new(b"RGGB"), CanonicalFormat::BayerRggb),
    (FourCc::new(b"BA81"), CanonicalFormat::BayerBggr),
    (FourCc::new(b"GRBG"), CanonicalFormat::BayerGrbg),
    (FourCc::new(b"GBRG"), CanonicalFormat::BayerGbrg),
    (FourCc::new(b"MJPG"), CanonicalFormat::Mjpeg),
    (FourCc::new(b"H264"), CanonicalFormat::H264),
    // Aliases
    (FourCc::new(b"YUY2"), CanonicalFormat::Yuyv),
    (FourCc::new(b"Y800"), CanonicalFormat::Gray8),
    (FourCc::new(b"XB24"), CanonicalFormat::Rgba32),
    (FourCc::new(b"XR24"), CanonicalFormat::Bgra32),
    (FourCc::new(b"BGR4"), CanonicalFormat::Bgra32),
    (FourCc::new(b"JPEG"), CanonicalFormat::Mjpeg),
    (FourCc::new(b"AVC1"), CanonicalFormat::H264),
];

impl CanonicalFormat {
    /// Every mapped format (excludes `Unknown`)
    pub const ALL: [CanonicalFormat; 25] = [
        Self::Yuyv,
        Self::Yvyu,
        Self::Uyvy,
        Self::Vyuy,
        Self::Nv12,
        Self::Nv21,
        Self::Nv16,
        Self::Nv61,
        Self::Nv24,
        Self::I420,
        Self::Yv12,
        Self::I422,
        Self::Gray8,
        Self::Y16,
        Self::Rgb565,
        Self::Rgb24,
        Self::Bgr24,
        Self::Rgba32,
        Self::Bgra32,
        Self::BayerRggb,
        Self::BayerBggr,
        Self::BayerGrbg,
        Self::BayerGbrg,
        Self::Mjpeg,
        Self::H264,
    ];

    /// Map a device code; unmapped codes become `Unknown`
    pub fn from_fourcc(code: FourCc) -> Self {
        FOURCC_TABLE
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, f)| *f)
            .unwrap_or(CanonicalFormat::Unknown)
    }

    /// Primary device code for this format
    pub fn fourcc(self) -> Option<FourCc> {
        FOURCC_TABLE
            .iter()
            .find(|(_, f)| *f == self)
            .map(|(c, _)| *c)
    }

    /// Device codes that decode to this format, primary first
    pub fn all_fourccs(self) -> impl Iterator<Item = FourCc> {
        FOURCC_TABLE
            .iter()
            .filter(move |(_, f)| *f == self)
            .map(|(c, _)| *c)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Yuyv => "YUYV",
            Self::Yvyu => "YVYU",
            Self::Uyvy => "UYVY",
            Self::Vyuy => "VYUY",
            Self::Nv12 => "NV12",
            Self::Nv21 => "NV21",
            Self::Nv16 => "NV16",
            Self::Nv61 => "NV61",
            Self::Nv24 => "NV24",
            Self::I420 => "I420",
            Self::Yv12 => "YV12",
            Self::I422 => "I422",
            Self::Gray8 => "GRAY8",
            Self::Y16 => "Y16",
            Self::Rgb565 => "RGB565",
            Self::Rgb24 => "RGB24",
            Self::Bgr24 => "BGR24",
            Self::Rgba32 => "RGBA32",
            Self::Bgra32 => "BGRA32",
            Self::BayerRggb => "BayerRGGB",
            Self::BayerBggr => "BayerBGGR",
            Self::BayerGrbg => "BayerGRBG",
            Self::BayerGbrg => "BayerGBRG",
            Self::Mjpeg => "MJPEG",
            Self::H264 => "H264",
            Self::Unknown => "Unknown",
        }
    }

    pub fn family(self) -> FormatFamily {
        match self {
            Self::Yuyv | Self::Yvyu | Self::Uyvy | Self::Vyuy => FormatFamily::PackedYuv,
            Self::Nv12 | Self::Nv21 | Self::Nv16 | Self::Nv61 | Self::Nv24 => {
                FormatFamily::SemiPlanar
            }
            Self::I420 | Self::Yv12 | Self::I422 => FormatFamily::Planar,
            Self::Gray8 | Self::Y16 => FormatFamily::Gray,
            Self::Rgb565 | Self::Rgb24 | Self::Bgr24 | Self::Rgba32 | Self::Bgra32 => {
                FormatFamily::Rgb
            }
            Self::BayerRggb | Self::BayerBggr | Self::BayerGrbg | Self::BayerGbrg => {
                FormatFamily::Bayer
            }
            Self::Mjpeg | Self::H264 => FormatFamily::Compressed,
            Self::Unknown => FormatFamily::Unknown,
        }
    }

    pub fn is_compressed(self) -> bool {
        self.family() == FormatFamily::Compressed
    }

    pub fn is_yuv(self) -> bool {
        matches!(
            self.family(),
            FormatFamily::PackedYuv | FormatFamily::SemiPlanar | FormatFamily::Planar
        )
    }

    /// Horizontal and vertical chroma subsampling divisors for YUV formats
    pub fn chroma_subsampling(self) -> Option<(u32, u32)> {
        match self {
            Self::Yuyv | Self::Yvyu | Self::Uyvy | Self::Vyuy => Some((2, 1)),
            Self::Nv12 | Self::Nv21 | Self::I420 | Self::Yv12 => Some((2, 2)),
            Self::Nv16 | Self::Nv61 | Self::I422 => Some((2, 1)),
            Self::Nv24 => Some((1, 1)),
            _ => None,
        }
    }

    /// Dimensions of one chroma plane (in chroma samples)
    pub fn chroma_dimensions(self, width: u32, height: u32) -> Option<(u32, u32)> {
        self.chroma_subsampling()
            .map(|(h, v)| (width.div_ceil(h), height.div_ceil(v)))
    }

    /// True when both dimensions are whole multiples of the chroma
    /// subsampling, i.e. every chroma sample covers a full pixel block
    pub fn fits_subsampling(self, width: u32, height: u32) -> bool {
        match self.chroma_subsampling() {
            Some((h, v)) => width % h == 0 && height % v == 0,
            None => true,
        }
    }

    /// Bytes per pixel for single-plane formats
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            Self::Gray8 | Self::BayerRggb | Self::BayerBggr | Self::BayerGrbg | Self::BayerGbrg => {
                Some(1)
            }
            Self::Y16 | Self::Rgb565 => Some(2),
            Self::Rgb24 | Self::Bgr24 => Some(3),
            Self::Rgba32 | Self::Bgra32 => Some(4),
            _ => None,
        }
    }

    /// Exact byte size of one tightly packed frame
    ///
    /// A function of the pixel area only. For subsampled formats it matches
    /// the plane layout whenever [`fits_subsampling`](Self::fits_subsampling)
    /// holds; other sizes have no layout and are refused by negotiation, the
    /// converter and the renderer. `None` for compressed and unknown formats,
    /// whose size varies per frame.
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let luma = width as usize * height as usize;
        match self.family() {
            FormatFamily::PackedYuv => Some(luma * 2),
            FormatFamily::SemiPlanar | FormatFamily::Planar => {
                let (h, v) = self.chroma_subsampling()?;
                let block = (h * v) as usize;
                Some(luma + 2 * luma.div_ceil(block))
            }
            FormatFamily::Gray | FormatFamily::Rgb | FormatFamily::Bayer => {
                self.bytes_per_pixel().map(|bpp| luma * bpp)
            }
            FormatFamily::Compressed | FormatFamily::Unknown => None,
        }
    }
}

impl fmt::Display for CanonicalFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Frame geometry plus its expected byte size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: CanonicalFormat,
}

impl FrameDescriptor {
    pub fn new(width: u32, height: u32, format: CanonicalFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// Expected byte size, `None` when it varies per frame
    pub fn expected_size(&self) -> Option<usize> {
        self.format.frame_size(self.width, self.height)
    }

    /// Reject a frame whose byte count disagrees with the descriptor
    ///
    /// Compressed frames only need to be non-empty.
    pub fn validate(&self, actual: usize) -> PipelineResult<()> {
        match self.expected_size() {
            Some(expected) if expected != actual => {
                Err(PipelineError::FrameSizeMismatch { expected, actual })
            }
            None if actual == 0 => Err(PipelineError::FrameSizeMismatch {
                expected: 1,
                actual,
            }),
            _ => Ok(()),
        }
    }

    /// Fail fast when the frame has no usable memory layout
    pub fn require_layout(&self) -> PipelineResult<()> {
        if self.format == CanonicalFormat::Unknown {
            return Err(PipelineError::NotSupported(
                "unmapped pixel format".to_string(),
            ));
        }
        if !self.format.fits_subsampling(self.width, self.height) {
            return Err(PipelineError::NotSupported(format!(
                "{}x{} is not a whole number of {} chroma blocks",
                self.width, self.height, self.format
            )));
        }
        Ok(())
    }
}

impl fmt::Display for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}
