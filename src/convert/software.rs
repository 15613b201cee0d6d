// SPDX-License-Identifier: GPL-3.0-only
//! Software raw-to-raw pixel conversion
//!
//! Supported pairs:
//! - any raw format to RGBA32, BGRA32 or RGB24
//! - YUV to YUV with the same chroma subsampling (NV12 <-> I420 <-> YV12,
//!   YUYV <-> NV16 <-> I422, ...)
//! - identity copies
//!
//! YUV uses full-range BT.601 coefficients, the same as the GPU shaders.

use super::{ImageMut, ImageRef};
use crate::errors::ConvertError;
use crate::formats::{CanonicalFormat, FormatFamily};

/// Convert one YUV sample to RGB (BT.601)
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    [
        (y + 1.402 * v).clamp(0.0, 255.0) as u8,
        (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8,
        (y + 1.772 * u).clamp(0.0, 255.0) as u8,
    ]
}

/// Byte positions of the components in a packed 4:2:2 macropixel
#[derive(Debug, Clone, Copy)]
struct Macropixel {
    y0: usize,
    y1: usize,
    u: usize,
    v: usize,
}

#[derive(Debug, Clone, Copy)]
enum Planes {
    Packed(Macropixel),
    SemiPlanar { v_first: bool },
    Planar { v_first: bool },
}

/// Index arithmetic for one YUV image
#[derive(Debug, Clone, Copy)]
struct YuvLayout {
    planes: Planes,
    width: usize,
    height: usize,
    hsub: usize,
    vsub: usize,
    chroma_width: usize,
    chroma_height: usize,
}

impl YuvLayout {
    fn of(format: CanonicalFormat, width: u32, height: u32) -> Option<Self> {
        use CanonicalFormat::*;
        let planes = match format {
            Yuyv => Planes::Packed(Macropixel { y0: 0, u: 1, y1: 2, v: 3 }),
            Yvyu => Planes::Packed(Macropixel { y0: 0, v: 1, y1: 2, u: 3 }),
            Uyvy => Planes::Packed(Macropixel { u: 0, y0: 1, v: 2, y1: 3 }),
            Vyuy => Planes::Packed(Macropixel { v: 0, y0: 1, u: 2, y1: 3 }),
            Nv12 | Nv16 | Nv24 => Planes::SemiPlanar { v_first: false },
            Nv21 | Nv61 => Planes::SemiPlanar { v_first: true },
            I420 | I422 => Planes::Planar { v_first: false },
            Yv12 => Planes::Planar { v_first: true },
            _ => return None,
        };
        let (hsub, vsub) = format.chroma_subsampling()?;
        let (chroma_width, chroma_height) = format.chroma_dimensions(width, height)?;
        Some(Self {
            planes,
            width: width as usize,
            height: height as usize,
            hsub: hsub as usize,
            vsub: vsub as usize,
            chroma_width: chroma_width as usize,
            chroma_height: chroma_height as usize,
        })
    }

    fn packed_stride(&self) -> usize {
        self.width.div_ceil(2) * 4
    }

    fn luma_index(&self, x: usize, y: usize) -> usize {
        match self.planes {
            Planes::Packed(mp) => {
                let base = y * self.packed_stride() + (x / 2) * 4;
                base + if x % 2 == 0 { mp.y0 } else { mp.y1 }
            }
            _ => y * self.width + x,
        }
    }

    /// Indices of the U and V bytes of chroma sample (cx, cy)
    fn chroma_index(&self, cx: usize, cy: usize) -> (usize, usize) {
        let luma = self.width * self.height;
        match self.planes {
            Planes::Packed(mp) => {
                let base = cy * self.packed_stride() + cx * 4;
                (base + mp.u, base + mp.v)
            }
            Planes::SemiPlanar { v_first } => {
                let base = luma + (cy * self.chroma_width + cx) * 2;
                if v_first {
                    (base + 1, base)
                } else {
                    (base, base + 1)
                }
            }
            Planes::Planar { v_first } => {
                let plane = self.chroma_width * self.chroma_height;
                let i = cy * self.chroma_width + cx;
                if v_first {
                    (luma + plane + i, luma + i)
                } else {
                    (luma + i, luma + plane + i)
                }
            }
        }
    }

    #[inline]
    fn rgb(&self, data: &[u8], x: usize, y: usize) -> [u8; 3] {
        let (ui, vi) = self.chroma_index(x / self.hsub, y / self.vsub);
        yuv_to_rgb(data[self.luma_index(x, y)], data[ui], data[vi])
    }
}

/// Color channel at each position of a 2x2 Bayer tile
fn bayer_tile(format: CanonicalFormat) -> Option<[[usize; 2]; 2]> {
    const R: usize = 0;
    const G: usize = 1;
    const B: usize = 2;
    match format {
        CanonicalFormat::BayerRggb => Some([[R, G], [G, B]]),
        CanonicalFormat::BayerBggr => Some([[B, G], [G, R]]),
        CanonicalFormat::BayerGrbg => Some([[G, R], [B, G]]),
        CanonicalFormat::BayerGbrg => Some([[G, B], [R, G]]),
        _ => None,
    }
}

/// Nearest-neighbor demosaic: every pixel of a tile gets the tile's color
fn bayer_rgb(tile: [[usize; 2]; 2], data: &[u8], w: usize, h: usize, x: usize, y: usize) -> [u8; 3] {
    let bx = x & !1;
    let by = y & !1;
    let mut sums = [0u32; 3];
    let mut counts = [0u32; 3];
    for (dy, row) in tile.iter().enumerate() {
        for (dx, &channel) in row.iter().enumerate() {
            let sx = (bx + dx).min(w - 1);
            let sy = (by + dy).min(h - 1);
            sums[channel] += data[sy * w + sx] as u32;
            counts[channel] += 1;
        }
    }
    [
        (sums[0] / counts[0]) as u8,
        (sums[1] / counts[1]) as u8,
        (sums[2] / counts[2]) as u8,
    ]
}

/// Read one pixel of a non-YUV raw image as RGB
fn direct_rgb(format: CanonicalFormat, data: &[u8], w: usize, h: usize, x: usize, y: usize) -> [u8; 3] {
    let i = y * w + x;
    match format {
        CanonicalFormat::Gray8 => [data[i]; 3],
        CanonicalFormat::Y16 => [data[i * 2 + 1]; 3],
        CanonicalFormat::Rgb565 => {
            let p = u16::from_le_bytes([data[i * 2], data[i * 2 + 1]]);
            let r = ((p >> 11) & 0x1f) as u8;
            let g = ((p >> 5) & 0x3f) as u8;
            let b = (p & 0x1f) as u8;
            [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
        }
        CanonicalFormat::Rgb24 => [data[i * 3], data[i * 3 + 1], data[i * 3 + 2]],
        CanonicalFormat::Bgr24 => [data[i * 3 + 2], data[i * 3 + 1], data[i * 3]],
        CanonicalFormat::Rgba32 => [data[i * 4], data[i * 4 + 1], data[i * 4 + 2]],
        CanonicalFormat::Bgra32 => [data[i * 4 + 2], data[i * 4 + 1], data[i * 4]],
        other => match bayer_tile(other) {
            Some(tile) => bayer_rgb(tile, data, w, h, x, y),
            None => [0, 0, 0],
        },
    }
}

fn unsupported(from: CanonicalFormat, to: CanonicalFormat) -> ConvertError {
    ConvertError::Unsupported {
        from: from.name().to_string(),
        to: to.name().to_string(),
    }
}

fn check_len(format: CanonicalFormat, width: u32, height: u32, actual: usize) -> Result<usize, ConvertError> {
    let expected = format
        .frame_size(width, height)
        .ok_or_else(|| unsupported(format, format))?;
    if actual < expected {
        return Err(ConvertError::BufferTooSmall { expected, actual });
    }
    Ok(expected)
}

fn write_rgb(dst_format: CanonicalFormat, out: &mut [u8], [r, g, b]: [u8; 3]) {
    match dst_format {
        CanonicalFormat::Rgba32 => out.copy_from_slice(&[r, g, b, 255]),
        CanonicalFormat::Bgra32 => out.copy_from_slice(&[b, g, r, 255]),
        _ => out.copy_from_slice(&[r, g, b]),
    }
}

/// Convert `src` into `dst`; both descriptors must have the same dimensions
pub fn convert(src: &ImageRef<'_>, dst: &mut ImageMut<'_>) -> Result<(), ConvertError> {
    let (from, to) = (src.descriptor.format, dst.descriptor.format);
    let (width, height) = (src.descriptor.width, src.descriptor.height);
    if (width, height) != (dst.descriptor.width, dst.descriptor.height) {
        return Err(ConvertError::DimensionMismatch);
    }
    if !can_convert(from, to)
        || !from.fits_subsampling(width, height)
        || !to.fits_subsampling(width, height)
    {
        return Err(unsupported(from, to));
    }
    let src_len = check_len(from, width, height, src.data.len())?;
    let dst_len = check_len(to, width, height, dst.data.len())?;

    if from == to {
        dst.data[..dst_len].copy_from_slice(&src.data[..src_len]);
        return Ok(());
    }

    let (w, h) = (width as usize, height as usize);
    let src_yuv = YuvLayout::of(from, width, height);

    match to {
        CanonicalFormat::Rgba32 | CanonicalFormat::Bgra32 | CanonicalFormat::Rgb24 => {
            let bpp = to.bytes_per_pixel().unwrap_or(4);
            for y in 0..h {
                for x in 0..w {
                    let rgb = match &src_yuv {
                        Some(layout) => layout.rgb(src.data, x, y),
                        None => direct_rgb(from, src.data, w, h, x, y),
                    };
                    let i = (y * w + x) * bpp;
                    write_rgb(to, &mut dst.data[i..i + bpp], rgb);
                }
            }
            Ok(())
        }
        _ => {
            let dst_yuv = YuvLayout::of(to, width, height);
            match (src_yuv, dst_yuv) {
                (Some(s), Some(d)) if (s.hsub, s.vsub) == (d.hsub, d.vsub) => {
                    repack_yuv(&s, src.data, &d, dst.data);
                    Ok(())
                }
                _ => Err(unsupported(from, to)),
            }
        }
    }
}

fn repack_yuv(src: &YuvLayout, src_data: &[u8], dst: &YuvLayout, dst_data: &mut [u8]) {
    for y in 0..src.height {
        for x in 0..src.width {
            dst_data[dst.luma_index(x, y)] = src_data[src.luma_index(x, y)];
        }
    }
    for cy in 0..src.chroma_height {
        for cx in 0..src.chroma_width {
            let (su, sv) = src.chroma_index(cx, cy);
            let (du, dv) = dst.chroma_index(cx, cy);
            dst_data[du] = src_data[su];
            dst_data[dv] = src_data[sv];
        }
    }
}

/// Convert into a newly allocated buffer of `format`
pub fn convert_to_vec(src: &ImageRef<'_>, format: CanonicalFormat) -> Result<Vec<u8>, ConvertError> {
    let d = src.descriptor;
    let len = format
        .frame_size(d.width, d.height)
        .ok_or_else(|| unsupported(d.format, format))?;
    let mut out = vec![0u8; len];
    let mut dst = ImageMut::new(crate::formats::FrameDescriptor::new(d.width, d.height, format), &mut out);
    convert(src, &mut dst)?;
    Ok(out)
}

/// True when [`convert`] handles the pair
pub fn can_convert(from: CanonicalFormat, to: CanonicalFormat) -> bool {
    let raw = |f: CanonicalFormat| {
        !matches!(f.family(), FormatFamily::Compressed | FormatFamily::Unknown)
    };
    if !raw(from) || !raw(to) {
        return false;
    }
    from == to
        || matches!(
            to,
            CanonicalFormat::Rgba32 | CanonicalFormat::Bgra32 | CanonicalFormat::Rgb24
        )
        || (from.is_yuv() && to.is_yuv() && from.chroma_subsampling() == to.chroma_subsampling())
}
