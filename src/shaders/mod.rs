// SPDX-License-Identifier: GPL-3.0-only
//! Frame shader programs and the per-format texture table
//!
//! Every raw format maps to one row of [`FORMAT_TABLE`]: the program that
//! converts it to RGBA, a variant selecting component order inside that
//! program, and the texture planes the frame bytes are uploaded into.
//! Adding a format means adding one row.
//!
//! Programs share `common.wgsl` (vertex stage, uniform, BT.601 helpers),
//! concatenated in front of each program's fragment stage.

use crate::formats::CanonicalFormat;
use wgpu::TextureFormat;

/// Vertex stage, bindings and helpers shared by all programs
pub const COMMON_WGSL: &str = include_str!("wgsl/common.wgsl");

/// One vertex/fragment program pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Program {
    PackedYuv,
    SemiPlanar,
    Planar,
    Rgb,
    Gray,
    Bayer,
}

impl Program {
    pub const ALL: [Program; 6] = [
        Program::PackedYuv,
        Program::SemiPlanar,
        Program::Planar,
        Program::Rgb,
        Program::Gray,
        Program::Bayer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Program::PackedYuv => "packed_yuv",
            Program::SemiPlanar => "semi_planar",
            Program::Planar => "planar",
            Program::Rgb => "rgb",
            Program::Gray => "gray",
            Program::Bayer => "bayer",
        }
    }

    fn fragment_source(self) -> &'static str {
        match self {
            Program::PackedYuv => include_str!("wgsl/packed_yuv.wgsl"),
            Program::SemiPlanar => include_str!("wgsl/semi_planar.wgsl"),
            Program::Planar => include_str!("wgsl/planar.wgsl"),
            Program::Rgb => include_str!("wgsl/rgb.wgsl"),
            Program::Gray => include_str!("wgsl/gray.wgsl"),
            Program::Bayer => include_str!("wgsl/bayer.wgsl"),
        }
    }

    /// Complete WGSL module (`vs_main` + `fs_main`)
    pub fn source(self) -> String {
        [COMMON_WGSL, self.fragment_source()].join("\n")
    }
}

/// Texture extent of a plane, relative to the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneExtent {
    /// width x height
    Full,
    /// One texel per two-pixel macropixel: ceil(width / 2) x height
    Macropixels,
    /// Chroma plane size
    Chroma,
    /// Two chroma planes stacked vertically
    StackedChroma,
    /// Three single-byte texels per pixel: 3 * width x height
    Triple,
}

/// One texture the frame is uploaded into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub extent: PlaneExtent,
    pub texture_format: TextureFormat,
}

impl PlaneLayout {
    const fn new(extent: PlaneExtent, texture_format: TextureFormat) -> Self {
        Self {
            extent,
            texture_format,
        }
    }

    pub fn bytes_per_texel(&self) -> u32 {
        match self.texture_format {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rg8Unorm => 2,
            _ => 4,
        }
    }

    /// Texture size for a frame of `format`
    pub fn size(&self, format: CanonicalFormat, width: u32, height: u32) -> (u32, u32) {
        let chroma = format
            .chroma_dimensions(width, height)
            .unwrap_or((width, height));
        match self.extent {
            PlaneExtent::Full => (width, height),
            PlaneExtent::Macropixels => (width.div_ceil(2), height),
            PlaneExtent::Chroma => chroma,
            PlaneExtent::StackedChroma => (chroma.0, chroma.1 * 2),
            PlaneExtent::Triple => (width.saturating_mul(3), height),
        }
    }

    /// Bytes of frame data this plane consumes
    pub fn byte_len(&self, format: CanonicalFormat, width: u32, height: u32) -> usize {
        let (w, h) = self.size(format, width, height);
        w as usize * h as usize * self.bytes_per_texel() as usize
    }

    /// Tightly packed row length in bytes
    pub fn row_bytes(&self, format: CanonicalFormat, width: u32, height: u32) -> u32 {
        self.size(format, width, height).0 * self.bytes_per_texel()
    }
}

/// How one format is drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRow {
    pub format: CanonicalFormat,
    pub program: Program,
    /// Passed to the program to select component order
    pub variant: u32,
    /// Planes in the order they appear in the frame bytes
    pub planes: &'static [PlaneLayout],
}

use PlaneExtent::*;

const PACKED: &[PlaneLayout] = &[PlaneLayout::new(Macropixels, TextureFormat::Rgba8Unorm)];
const SEMI_PLANAR: &[PlaneLayout] = &[
    PlaneLayout::new(Full, TextureFormat::R8Unorm),
    PlaneLayout::new(Chroma, TextureFormat::Rg8Unorm),
];
const PLANAR: &[PlaneLayout] = &[
    PlaneLayout::new(Full, TextureFormat::R8Unorm),
    PlaneLayout::new(StackedChroma, TextureFormat::R8Unorm),
];
const R8: &[PlaneLayout] = &[PlaneLayout::new(Full, TextureFormat::R8Unorm)];
const RG8: &[PlaneLayout] = &[PlaneLayout::new(Full, TextureFormat::Rg8Unorm)];
const TRIPLE: &[PlaneLayout] = &[PlaneLayout::new(Triple, TextureFormat::R8Unorm)];
const RGBA8: &[PlaneLayout] = &[PlaneLayout::new(Full, TextureFormat::Rgba8Unorm)];
const BGRA8: &[PlaneLayout] = &[PlaneLayout::new(Full, TextureFormat::Bgra8Unorm)];

const fn row(
    format: CanonicalFormat,
    program: Program,
    variant: u32,
    planes: &'static [PlaneLayout],
) -> FormatRow {
    FormatRow {
        format,
        program,
        variant,
        planes,
    }
}

/// Render path for every raw format
pub static FORMAT_TABLE: &[FormatRow] = &[
    row(CanonicalFormat::Yuyv, Program::PackedYuv, 0, PACKED),
    row(CanonicalFormat::Yvyu, Program::PackedYuv, 1, PACKED),
    row(CanonicalFormat::Uyvy, Program::PackedYuv, 2, PACKED),
    row(CanonicalFormat::Vyuy, Program::PackedYuv, 3, PACKED),
    row(CanonicalFormat::Nv12, Program::SemiPlanar, 0, SEMI_PLANAR),
    row(CanonicalFormat::Nv21, Program::SemiPlanar, 1, SEMI_PLANAR),
    row(CanonicalFormat::Nv16, Program::SemiPlanar, 0, SEMI_PLANAR),
    row(CanonicalFormat::Nv61, Program::SemiPlanar, 1, SEMI_PLANAR),
    row(CanonicalFormat::Nv24, Program::SemiPlanar, 0, SEMI_PLANAR),
    row(CanonicalFormat::I420, Program::Planar, 0, PLANAR),
    row(CanonicalFormat::Yv12, Program::Planar, 1, PLANAR),
    row(CanonicalFormat::I422, Program::Planar, 0, PLANAR),
    row(CanonicalFormat::Gray8, Program::Gray, 0, R8),
    row(CanonicalFormat::Y16, Program::Gray, 1, RG8),
    row(CanonicalFormat::Rgb565, Program::Rgb, 3, RG8),
    row(CanonicalFormat::Rgb24, Program::Rgb, 1, TRIPLE),
    row(CanonicalFormat::Bgr24, Program::Rgb, 2, TRIPLE),
    row(CanonicalFormat::Rgba32, Program::Rgb, 0, RGBA8),
    row(CanonicalFormat::Bgra32, Program::Rgb, 0, BGRA8),
    row(CanonicalFormat::BayerRggb, Program::Bayer, 0, R8),
    row(CanonicalFormat::BayerBggr, Program::Bayer, 1, R8),
    row(CanonicalFormat::BayerGrbg, Program::Bayer, 2, R8),
    row(CanonicalFormat::BayerGbrg, Program::Bayer, 3, R8),
];

/// Table row for a format; `None` for compressed and unknown formats
pub fn lookup(format: CanonicalFormat) -> Option<&'static FormatRow> {
    FORMAT_TABLE.iter().find(|row| row.format == format)
}

/// Uniform block shared by every program; must match `Frame` in common.wgsl
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameUniform {
    /// Column-major clip-space transform of the frame quad
    pub transform: [[f32; 4]; 4],
    pub frame_size: [u32; 2],
    pub chroma_size: [u32; 2],
    /// Horizontal and vertical chroma subsampling divisors
    pub subsampling: [u32; 2],
    pub variant: u32,
    pub _pad0: u32,
}

impl FrameUniform {
    pub fn new(row: &FormatRow, width: u32, height: u32, transform: [[f32; 4]; 4]) -> Self {
        let (hsub, vsub) = row.format.chroma_subsampling().unwrap_or((1, 1));
        let chroma = row
            .format
            .chroma_dimensions(width, height)
            .unwrap_or((width, height));
        Self {
            transform,
            frame_size: [width, height],
            chroma_size: [chroma.0, chroma.1],
            subsampling: [hsub, vsub],
            variant: row.variant,
            _pad0: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validate that a WGSL shader compiles successfully using naga
    fn validate_shader(name: &str, source: &str) {
        let result = naga::front::wgsl::parse_str(source);
        match result {
            Ok(module) => {
                let info = naga::valid::Validator::new(
                    naga::valid::ValidationFlags::all(),
                    naga::valid::Capabilities::all(),
                )
                .validate(&module);

                if let Err(e) = info {
                    panic!("Shader '{}' validation failed: {:?}", name, e);
                }
            }
            Err(e) => {
                panic!("Shader '{}' parse failed: {:?}", name, e);
            }
        }
    }

    #[test]
    fn test_every_program_validates() {
        for program in Program::ALL {
            validate_shader(program.name(), &program.source());
        }
    }

    #[test]
    fn test_every_raw_format_has_one_row() {
        for format in CanonicalFormat::ALL {
            let rows = FORMAT_TABLE.iter().filter(|r| r.format == format).count();
            let expected = usize::from(!format.is_compressed());
            assert_eq!(rows, expected, "{}", format);
        }
        assert!(lookup(CanonicalFormat::Unknown).is_none());
    }

    #[test]
    fn test_planes_cover_frame_bytes() {
        for row in FORMAT_TABLE {
            for (w, h) in [(640, 480), (1920, 1080), (3, 3), (2, 1), (6, 2)] {
                if !row.format.fits_subsampling(w, h) {
                    continue;
                }
                let planes: usize = row.planes.iter().map(|p| p.byte_len(row.format, w, h)).sum();
                assert_eq!(
                    Some(planes),
                    row.format.frame_size(w, h),
                    "{} at {}x{}",
                    row.format,
                    w,
                    h
                );
            }
        }
    }

    #[test]
    fn test_plane_geometry() {
        let nv12 = lookup(CanonicalFormat::Nv12).unwrap();
        assert_eq!(nv12.planes.len(), 2);
        assert_eq!(nv12.planes[1].size(CanonicalFormat::Nv12, 1920, 1080), (960, 540));

        let nv16 = lookup(CanonicalFormat::Nv16).unwrap();
        assert_eq!(nv16.planes[1].size(CanonicalFormat::Nv16, 1920, 1080), (960, 1080));

        let i420 = lookup(CanonicalFormat::I420).unwrap();
        assert_eq!(i420.planes[1].size(CanonicalFormat::I420, 640, 480), (320, 480));

        let yuyv = lookup(CanonicalFormat::Yuyv).unwrap();
        assert_eq!(yuyv.planes.len(), 1);
        assert_eq!(yuyv.planes[0].size(CanonicalFormat::Yuyv, 1920, 1080), (960, 1080));
        assert_eq!(yuyv.planes[0].row_bytes(CanonicalFormat::Yuyv, 1920, 1080), 3840);
    }

    #[test]
    fn test_uniform_layout() {
        assert_eq!(std::mem::size_of::<FrameUniform>(), 96);
        let row = lookup(CanonicalFormat::Nv21).unwrap();
        let u = FrameUniform::new(row, 3, 3, [[0.0; 4]; 4]);
        assert_eq!(u.chroma_size, [2, 2]);
        assert_eq!(u.subsampling, [2, 2]);
        assert_eq!(u.variant, 1);
    }
}
