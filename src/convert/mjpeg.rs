// SPDX-License-Identifier: GPL-3.0-only

//! MJPEG frame decoding
//!
//! Two strategies, tried in order:
//! 1. libjpeg-turbo decodes to the JPEG's native planar YUV, which is
//!    repacked to semi-planar (4:2:0 -> NV12, 4:2:2 -> NV16, 4:4:4 -> NV24,
//!    gray -> GRAY8). Needs the `turbojpeg` feature.
//! 2. The pure Rust `image` decoder produces RGBA32.

use super::{DecodedFrame, ImageRef, software};
use crate::errors::DecodeError;
use crate::formats::{CanonicalFormat, FrameDescriptor};
use tracing::{debug, info, warn};

/// Which raw format decoded frames should have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeTarget {
    /// Whatever the stream decodes to natively; locks onto the first
    /// frame's format
    #[default]
    Any,
    /// Always this format, converting after decode when needed
    Format(CanonicalFormat),
}

/// Stateful decoder for one MJPEG stream
pub struct MjpegDecoder {
    target: DecodeTarget,
    locked: Option<CanonicalFormat>,
    frames: u64,
    #[cfg(feature = "turbojpeg")]
    native: NativeDecoder,
}

impl MjpegDecoder {
    pub fn new(target: DecodeTarget) -> Self {
        Self {
            target,
            locked: None,
            frames: 0,
            #[cfg(feature = "turbojpeg")]
            native: NativeDecoder::default(),
        }
    }

    pub fn target(&self) -> DecodeTarget {
        self.target
    }

    /// Format the decoder is currently locked to
    pub fn locked_format(&self) -> Option<CanonicalFormat> {
        self.locked
    }

    /// Frames decoded since construction or the last reset
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Forget the locked format, e.g. after the stream was renegotiated
    pub fn reset(&mut self) {
        self.locked = None;
        self.frames = 0;
    }

    /// Decode one compressed frame
    pub fn decode(&mut self, jpeg: &[u8]) -> Result<DecodedFrame, DecodeError> {
        if jpeg.len() < 4 || jpeg[0] != 0xFF || jpeg[1] != 0xD8 {
            return Err(DecodeError::InvalidData(
                "missing JPEG start-of-image marker".to_string(),
            ));
        }

        let (descriptor, data) = self.decode_natural(jpeg)?;
        let (descriptor, data) = match self.target {
            DecodeTarget::Format(format) if format != descriptor.format => {
                let converted = software::convert_to_vec(&ImageRef::new(descriptor, &data), format)?;
                (
                    FrameDescriptor::new(descriptor.width, descriptor.height, format),
                    converted,
                )
            }
            _ => (descriptor, data),
        };

        let format_changed = self.locked.is_some_and(|f| f != descriptor.format);
        if self.locked.is_none() {
            info!(
                width = descriptor.width,
                height = descriptor.height,
                format = %descriptor.format,
                jpeg_size = jpeg.len(),
                "First MJPEG frame decoded"
            );
        } else if format_changed {
            info!(
                from = ?self.locked,
                to = %descriptor.format,
                "MJPEG decode format changed"
            );
        }
        self.locked = Some(descriptor.format);
        self.frames += 1;

        Ok(DecodedFrame {
            descriptor,
            data,
            format_changed,
        })
    }

    fn decode_natural(&mut self, jpeg: &[u8]) -> Result<(FrameDescriptor, Vec<u8>), DecodeError> {
        #[cfg(feature = "turbojpeg")]
        {
            match self.native.decode(jpeg) {
                Ok(decoded) => return Ok(decoded),
                Err(e) => {
                    if self.frames == 0 {
                        warn!(error = %e, "Native MJPEG decode failed, using RGBA fallback");
                    } else {
                        debug!(error = %e, "Native MJPEG decode failed, using RGBA fallback");
                    }
                }
            }
        }
        decode_rgba(jpeg).map_err(|e| {
            debug!(error = %e, frame = self.frames, "MJPEG decode failed");
            DecodeError::Failed(e)
        })
    }
}

fn decode_rgba(jpeg: &[u8]) -> Result<(FrameDescriptor, Vec<u8>), String> {
    let img = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| e.to_string())?
        .to_rgba8();
    let (width, height) = img.dimensions();
    Ok((
        FrameDescriptor::new(width, height, CanonicalFormat::Rgba32),
        img.into_raw(),
    ))
}

/// libjpeg-turbo state, created on first use
#[cfg(feature = "turbojpeg")]
#[derive(Default)]
struct NativeDecoder {
    decompressor: Option<turbojpeg::Decompressor>,
    unavailable: bool,
    /// Reused planar output buffer
    yuv_buf: Vec<u8>,
}

#[cfg(feature = "turbojpeg")]
impl NativeDecoder {
    fn decode(&mut self, jpeg: &[u8]) -> Result<(FrameDescriptor, Vec<u8>), DecodeError> {
        if self.unavailable {
            return Err(DecodeError::Failed("libjpeg-turbo unavailable".to_string()));
        }
        if self.decompressor.is_none() {
            match turbojpeg::Decompressor::new() {
                Ok(d) => self.decompressor = Some(d),
                Err(e) => {
                    self.unavailable = true;
                    warn!(error = %e, "turbojpeg init failed");
                    return Err(DecodeError::Failed(format!("turbojpeg init: {e}")));
                }
            }
        }
        let Some(decompressor) = self.decompressor.as_mut() else {
            return Err(DecodeError::Failed("libjpeg-turbo unavailable".to_string()));
        };

        let header = decompressor
            .read_header(jpeg)
            .map_err(|e| DecodeError::InvalidData(e.to_string()))?;
        let (width, height) = (header.width, header.height);

        let (format, hsub, vsub) = match header.subsamp {
            turbojpeg::Subsamp::Sub2x2 => (CanonicalFormat::Nv12, 2, 2),
            turbojpeg::Subsamp::Sub2x1 => (CanonicalFormat::Nv16, 2, 1),
            turbojpeg::Subsamp::None => (CanonicalFormat::Nv24, 1, 1),
            turbojpeg::Subsamp::Gray => (CanonicalFormat::Gray8, 1, 1),
            other => {
                return Err(DecodeError::UnsupportedTarget(format!(
                    "{:?} chroma subsampling",
                    other
                )));
            }
        };

        if !format.fits_subsampling(width as u32, height as u32) {
            return Err(DecodeError::UnsupportedTarget(format!(
                "{}x{} does not split into {} chroma blocks",
                width, height, format
            )));
        }

        let align = 1;
        let len = turbojpeg::yuv_pixels_len(width, align, height, header.subsamp)
            .map_err(|e| DecodeError::Failed(e.to_string()))?;
        self.yuv_buf.resize(len, 0);
        decompressor
            .decompress_to_yuv(
                jpeg,
                turbojpeg::YuvImage {
                    pixels: &mut self.yuv_buf[..],
                    width,
                    align,
                    height,
                    subsamp: header.subsamp,
                },
            )
            .map_err(|e| DecodeError::Failed(e.to_string()))?;

        let descriptor = FrameDescriptor::new(width as u32, height as u32, format);
        let data = if format == CanonicalFormat::Gray8 {
            // Luma plane is padded to the MCU width for gray too
            let stride = len / height.max(1);
            copy_rows(&self.yuv_buf, stride, width, height)
        } else {
            planar_to_semi_planar(&self.yuv_buf, width, height, hsub, vsub)?
        };
        Ok((descriptor, data))
    }
}

#[cfg(feature = "turbojpeg")]
fn copy_rows(src: &[u8], stride: usize, width: usize, height: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(width * height);
    for row in src.chunks(stride).take(height) {
        out.extend_from_slice(&row[..width.min(row.len())]);
    }
    out
}

/// Interleave libjpeg-turbo's separate U and V planes
///
/// The luma plane is padded to a multiple of the subsampling factor; the
/// output is tightly packed.
#[cfg(feature = "turbojpeg")]
fn planar_to_semi_planar(
    planes: &[u8],
    width: usize,
    height: usize,
    hsub: usize,
    vsub: usize,
) -> Result<Vec<u8>, DecodeError> {
    let luma_stride = width.div_ceil(hsub) * hsub;
    let luma_rows = height.div_ceil(vsub) * vsub;
    let (cw, ch) = (width.div_ceil(hsub), height.div_ceil(vsub));
    let plane = cw * ch;
    let needed = luma_stride * luma_rows + 2 * plane;
    if planes.len() < needed {
        return Err(DecodeError::Failed(format!(
            "YUV planes too small: {} < {}",
            planes.len(),
            needed
        )));
    }

    let mut out = copy_rows(planes, luma_stride, width, height);
    out.reserve(2 * plane);
    let u = &planes[luma_stride * luma_rows..][..plane];
    let v = &planes[luma_stride * luma_rows + plane..][..plane];
    for (u, v) in u.iter().zip(v) {
        out.push(*u);
        out.push(*v);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
    use std::io::Cursor;

    fn encode(img: DynamicImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    fn gray_jpeg(w: u32, h: u32, level: u8) -> Vec<u8> {
        encode(DynamicImage::ImageLuma8(GrayImage::from_pixel(w, h, Luma([level]))))
    }

    fn color_jpeg(w: u32, h: u32) -> Vec<u8> {
        encode(DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([40, 120, 200]))))
    }

    #[test]
    fn test_rejects_non_jpeg() {
        let mut decoder = MjpegDecoder::new(DecodeTarget::Any);
        assert!(matches!(
            decoder.decode(&[0, 1, 2, 3, 4]),
            Err(DecodeError::InvalidData(_))
        ));
        assert!(matches!(
            decoder.decode(&[0xFF, 0xD8, 0xFF, 0x00, 0x00]),
            Err(DecodeError::Failed(_))
        ));
        assert_eq!(decoder.locked_format(), None);
    }

    #[test]
    fn test_any_locks_onto_first_format() {
        let mut decoder = MjpegDecoder::new(DecodeTarget::Any);
        let jpeg = color_jpeg(64, 48);
        let first = decoder.decode(&jpeg).unwrap();
        assert!(!first.format_changed);
        assert_eq!((first.descriptor.width, first.descriptor.height), (64, 48));
        assert_eq!(first.descriptor.validate(first.data.len()), Ok(()));

        let second = decoder.decode(&jpeg).unwrap();
        assert!(!second.format_changed);
        assert_eq!(second.descriptor, first.descriptor);
        assert_eq!(decoder.locked_format(), Some(first.descriptor.format));
    }

    #[test]
    fn test_reset_unlocks_format() {
        let mut decoder = MjpegDecoder::new(DecodeTarget::Any);
        decoder.decode(&color_jpeg(32, 16)).unwrap();
        decoder.decode(&color_jpeg(32, 16)).unwrap();
        assert_eq!(decoder.frames(), 2);

        decoder.reset();
        assert_eq!(decoder.locked_format(), None);
        assert_eq!(decoder.frames(), 0);
        let gray = decoder.decode(&gray_jpeg(32, 16, 60)).unwrap();
        assert!(!gray.format_changed);
        assert_eq!(decoder.frames(), 1);
    }

    #[test]
    fn test_odd_sized_frame_has_usable_layout() {
        let mut decoder = MjpegDecoder::new(DecodeTarget::Any);
        let frame = decoder.decode(&color_jpeg(15, 9)).unwrap();
        assert_eq!((frame.descriptor.width, frame.descriptor.height), (15, 9));
        assert_eq!(frame.descriptor.require_layout(), Ok(()));
        assert_eq!(frame.descriptor.validate(frame.data.len()), Ok(()));
    }

    #[cfg(feature = "turbojpeg")]
    #[test]
    fn test_native_decode_is_semi_planar() {
        let mut decoder = MjpegDecoder::new(DecodeTarget::Any);
        let frame = decoder.decode(&color_jpeg(64, 48)).unwrap();
        assert_eq!(
            frame.descriptor.format.family(),
            crate::formats::FormatFamily::SemiPlanar
        );

        let gray = decoder.decode(&gray_jpeg(64, 48, 90)).unwrap();
        assert_eq!(gray.descriptor.format, CanonicalFormat::Gray8);
        assert!(gray.format_changed);
        assert_eq!(gray.data.len(), 64 * 48);
        assert!(gray.data.iter().all(|&y| y.abs_diff(90) <= 2));
    }

    #[test]
    fn test_explicit_target_converts() {
        let mut decoder = MjpegDecoder::new(DecodeTarget::Format(CanonicalFormat::Rgba32));
        let frame = decoder.decode(&gray_jpeg(16, 16, 128)).unwrap();
        assert_eq!(frame.descriptor.format, CanonicalFormat::Rgba32);
        assert_eq!(frame.data.len(), 16 * 16 * 4);
        let px = &frame.data[..4];
        assert!(px[0].abs_diff(128) <= 3 && px[0] == px[1] && px[1] == px[2]);
        assert_eq!(px[3], 255);

        let again = decoder.decode(&color_jpeg(16, 16)).unwrap();
        assert!(!again.format_changed);
    }

    #[test]
    fn test_one_shot_decode() {
        let frame = crate::convert::decode(&color_jpeg(8, 8), DecodeTarget::Format(CanonicalFormat::Rgb24)).unwrap();
        assert_eq!(frame.data.len(), 8 * 8 * 3);
        let [r, g, b] = [frame.data[0], frame.data[1], frame.data[2]];
        assert!(r.abs_diff(40) < 16 && g.abs_diff(120) < 16 && b.abs_diff(200) < 16);
    }
}
