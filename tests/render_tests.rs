// SPDX-License-Identifier: GPL-3.0-only

//! GPU renderer tests
//!
//! These need a Vulkan adapter and print "Skipping" without one.

use camera_pipeline::backends::device::DeviceFormat;
use camera_pipeline::convert::{ImageRef, convert_to_vec};
use camera_pipeline::render::{ImportRequest, TextureImporter, ZeroCopyState};
use camera_pipeline::shaders::{FORMAT_TABLE, Program};
use camera_pipeline::{
    CanonicalFormat, CapturePipeline, DriveMode, FrameDescriptor, GpuContext, PipelineConfig,
    Presenter, RenderError, RenderFrame, Renderer, Transform, VirtualDevice, VirtualProvider,
    create_device,
};
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex};

async fn gpu() -> Option<GpuContext> {
    match create_device("render_tests").await {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            println!("Skipping test (no GPU): {}", e);
            None
        }
    }
}

/// Deterministic noise so every channel and plane gets distinct values
fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

fn frame_of(format: CanonicalFormat, width: u32, height: u32, seed: u32) -> (FrameDescriptor, Vec<u8>) {
    let descriptor = FrameDescriptor::new(width, height, format);
    let data = noise(descriptor.expected_size().unwrap(), seed);
    (descriptor, data)
}

fn assert_rgb_close(format: CanonicalFormat, gpu: &[u8], cpu: &[u8], tolerance: u8) {
    assert_eq!(gpu.len(), cpu.len(), "{}", format);
    for (i, (g, c)) in gpu.chunks_exact(4).zip(cpu.chunks_exact(4)).enumerate() {
        for ch in 0..3 {
            assert!(
                g[ch].abs_diff(c[ch]) <= tolerance,
                "{}: pixel {} channel {}: gpu {} cpu {}",
                format,
                i,
                ch,
                g[ch],
                c[ch]
            );
        }
        assert_eq!(g[3], 255, "{}: pixel {} alpha", format, i);
    }
}

#[tokio::test]
async fn test_every_format_matches_software_conversion() {
    let Some(ctx) = gpu().await else { return };
    let mut renderer = Renderer::with_importer(&ctx, None);

    for (seed, row) in FORMAT_TABLE.iter().enumerate() {
        let (descriptor, data) = frame_of(row.format, 64, 32, seed as u32 + 1);
        renderer
            .draw(&RenderFrame::new(descriptor, &data), Transform::IDENTITY)
            .unwrap();
        let gpu = renderer.read_rgba_async().await.unwrap();
        let cpu = convert_to_vec(&ImageRef::new(descriptor, &data), CanonicalFormat::Rgba32).unwrap();
        assert_rgb_close(row.format, &gpu, &cpu, 3);
    }
}

#[tokio::test]
async fn test_textures_rebuilt_only_on_geometry_change() {
    let Some(ctx) = gpu().await else { return };
    let mut renderer = Renderer::with_importer(&ctx, None);

    let (nv12, data) = frame_of(CanonicalFormat::Nv12, 64, 32, 7);
    renderer.draw(&RenderFrame::new(nv12, &data), Transform::IDENTITY).unwrap();
    renderer.draw(&RenderFrame::new(nv12, &data), Transform::IDENTITY).unwrap();
    assert_eq!(renderer.rebuilds(), 1);
    assert_eq!(renderer.plane_count(), 2);
    assert_eq!(renderer.active_program(), Some(Program::SemiPlanar));

    // Same program, new component order
    let (nv21, data) = frame_of(CanonicalFormat::Nv21, 64, 32, 8);
    renderer.draw(&RenderFrame::new(nv21, &data), Transform::IDENTITY).unwrap();
    assert_eq!(renderer.rebuilds(), 2);
    assert_eq!(renderer.compiled_programs(), 1);

    let (yuyv, data) = frame_of(CanonicalFormat::Yuyv, 128, 32, 9);
    renderer.draw(&RenderFrame::new(yuyv, &data), Transform::IDENTITY).unwrap();
    assert_eq!(renderer.rebuilds(), 3);
    assert_eq!(renderer.plane_count(), 1);
    assert_eq!(renderer.compiled_programs(), 2);
    assert_eq!(renderer.output_texture().unwrap().width(), 128);
}

#[tokio::test]
async fn test_draw_rejects_bad_frames() {
    let Some(ctx) = gpu().await else { return };
    let mut renderer = Renderer::with_importer(&ctx, None);

    let mjpeg = FrameDescriptor::new(64, 32, CanonicalFormat::Mjpeg);
    assert!(matches!(
        renderer.draw(&RenderFrame::new(mjpeg, &[0xff, 0xd8]), Transform::IDENTITY),
        Err(RenderError::UnsupportedFormat(_))
    ));

    let yuyv = FrameDescriptor::new(64, 32, CanonicalFormat::Yuyv);
    let short = vec![0u8; 64 * 32];
    assert_eq!(
        renderer
            .draw(&RenderFrame::new(yuyv, &short), Transform::IDENTITY)
            .unwrap_err(),
        RenderError::FrameSizeMismatch {
            expected: 64 * 32 * 2,
            actual: 64 * 32,
        }
    );
    assert_eq!(renderer.rebuilds(), 0);
    assert!(matches!(
        renderer.read_rgba_async().await,
        Err(RenderError::Readback(_))
    ));
}

#[tokio::test]
async fn test_draw_rejects_textures_past_device_limit() {
    let Some(ctx) = gpu().await else { return };
    let mut renderer = Renderer::with_importer(&ctx, None);
    let limit = renderer.max_texture_dimension();

    // RGB24 is uploaded as one R8 texel per byte, three per pixel
    let width = limit / 3 + 1;
    let rgb = FrameDescriptor::new(width, 1, CanonicalFormat::Rgb24);
    let data = vec![0u8; rgb.expected_size().unwrap()];
    assert_eq!(
        renderer
            .draw(&RenderFrame::new(rgb, &data), Transform::IDENTITY)
            .unwrap_err(),
        RenderError::TextureTooLarge {
            width: width * 3,
            height: 1,
            limit,
        }
    );

    let tall = FrameDescriptor::new(2, limit + 2, CanonicalFormat::Yuyv);
    let data = vec![0u8; tall.expected_size().unwrap()];
    assert!(matches!(
        renderer.draw(&RenderFrame::new(tall, &data), Transform::IDENTITY),
        Err(RenderError::TextureTooLarge { .. })
    ));

    // 3x4 NV12 splits its 2x2 chroma blocks
    let odd = FrameDescriptor::new(3, 4, CanonicalFormat::Nv12);
    let data = vec![0u8; odd.expected_size().unwrap()];
    assert!(matches!(
        renderer.draw(&RenderFrame::new(odd, &data), Transform::IDENTITY),
        Err(RenderError::UnsupportedFormat(_))
    ));
    assert_eq!(renderer.rebuilds(), 0);
}

#[tokio::test]
async fn test_transform_mirrors_output() {
    let Some(ctx) = gpu().await else { return };
    let mut renderer = Renderer::with_importer(&ctx, None);

    // Left half black, right half white
    let (w, h) = (8u32, 2u32);
    let data: Vec<u8> = (0..h)
        .flat_map(|_| (0..w).map(|x| if x < w / 2 { 0 } else { 255 }))
        .collect();
    let gray = FrameDescriptor::new(w, h, CanonicalFormat::Gray8);

    renderer
        .draw(&RenderFrame::new(gray, &data), Transform::mirror_horizontal())
        .unwrap();
    let out = renderer.read_rgba_async().await.unwrap();
    assert_eq!(out[0], 255);
    assert_eq!(out[((w - 1) * 4) as usize], 0);
}

struct FailingImporter {
    attempts: Arc<Mutex<u32>>,
}

impl TextureImporter for FailingImporter {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn available(&self, _device: &wgpu::Device) -> bool {
        true
    }

    fn import(
        &mut self,
        _device: &wgpu::Device,
        _request: &ImportRequest<'_>,
    ) -> Result<wgpu::Texture, String> {
        *self.attempts.lock().unwrap() += 1;
        Err("import refused".to_string())
    }
}

#[tokio::test]
async fn test_import_failure_falls_back_to_upload() {
    let Some(ctx) = gpu().await else { return };
    let attempts = Arc::new(Mutex::new(0));
    let importer = FailingImporter {
        attempts: Arc::clone(&attempts),
    };
    let mut renderer = Renderer::with_importer(&ctx, Some(Box::new(importer)));
    assert_eq!(renderer.zero_copy_state(), ZeroCopyState::Enabled);

    let file = std::fs::File::open("/dev/null").unwrap();
    let (descriptor, data) = frame_of(CanonicalFormat::Yuyv, 64, 32, 3);
    let frame = RenderFrame {
        descriptor,
        data: &data,
        dmabuf_fd: Some(file.as_fd()),
        slot: Some(0),
    };

    renderer.draw(&frame, Transform::IDENTITY).unwrap();
    renderer.draw(&frame, Transform::IDENTITY).unwrap();
    assert_eq!(renderer.zero_copy_state(), ZeroCopyState::Disabled);
    assert_eq!(*attempts.lock().unwrap(), 1);

    let gpu = renderer.read_rgba_async().await.unwrap();
    let cpu = convert_to_vec(&ImageRef::new(descriptor, &data), CanonicalFormat::Rgba32).unwrap();
    assert_rgb_close(CanonicalFormat::Yuyv, &gpu, &cpu, 3);
}

#[tokio::test]
async fn test_presenter_decodes_mjpeg_capture() {
    let Some(ctx) = gpu().await else { return };

    let device = Arc::new(VirtualDevice::new());
    device.set_frame_source(Arc::new(|format: &DeviceFormat, _sequence| {
        let image = image::RgbImage::from_pixel(format.width, format.height, image::Rgb([200, 60, 30]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }));
    let config = PipelineConfig {
        width: 1280,
        height: 720,
        format: Some(CanonicalFormat::Mjpeg),
        drive_mode: DriveMode::Polled,
        ..Default::default()
    };
    let pipeline =
        CapturePipeline::with_provider(config, Arc::new(VirtualProvider::new(Arc::clone(&device))))
            .unwrap();

    let presenter = Arc::new(Mutex::new(Presenter::new(Renderer::with_importer(&ctx, None))));
    pipeline.set_frame_callback(Presenter::shared_callback(Arc::clone(&presenter)));
    pipeline.start().unwrap();

    for _ in 0..100 {
        if presenter.lock().unwrap().presented() >= 2 {
            break;
        }
        pipeline.poll_frame().unwrap();
    }
    pipeline.stop();

    let presenter = presenter.lock().unwrap();
    assert!(presenter.presented() >= 2);
    let renderer = presenter.renderer();
    // The first frame fixes the decoded format; later frames reuse it
    assert_eq!(renderer.rebuilds(), 1);
    assert_eq!(renderer.compiled_programs(), 1);
    if cfg!(feature = "turbojpeg") {
        assert_eq!(renderer.active_program(), Some(Program::SemiPlanar));
        assert_eq!(renderer.plane_count(), 2);
    } else {
        assert_eq!(renderer.active_program(), Some(Program::Rgb));
        assert_eq!(renderer.plane_count(), 1);
    }

    let rgba = renderer.read_rgba_async().await.unwrap();
    let center = ((360 * 1280 + 640) * 4) as usize;
    let pixel = &rgba[center..center + 3];
    for (got, want) in pixel.iter().zip([200u8, 60, 30]) {
        assert!(got.abs_diff(want) <= 12, "pixel {:?}", pixel);
    }
}

#[tokio::test]
async fn test_presenter_resets_decoder_after_resize() {
    let Some(ctx) = gpu().await else { return };

    let device = Arc::new(VirtualDevice::new());
    device.set_frame_source(Arc::new(|format: &DeviceFormat, _sequence| {
        let image = image::RgbImage::from_pixel(format.width, format.height, image::Rgb([20, 90, 160]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }));
    let config = PipelineConfig {
        width: 1280,
        height: 720,
        format: Some(CanonicalFormat::Mjpeg),
        drive_mode: DriveMode::Polled,
        ..Default::default()
    };
    let pipeline =
        CapturePipeline::with_provider(config, Arc::new(VirtualProvider::new(Arc::clone(&device))))
            .unwrap();
    let presenter = Arc::new(Mutex::new(Presenter::new(Renderer::with_importer(&ctx, None))));
    pipeline.set_frame_callback(Presenter::shared_callback(Arc::clone(&presenter)));
    pipeline.start().unwrap();

    let present_until = |count: u64| {
        for _ in 0..100 {
            if presenter.lock().unwrap().presented() >= count {
                return;
            }
            pipeline.poll_frame().unwrap();
        }
        panic!("presenter stalled before {} frames", count);
    };

    present_until(2);
    assert_eq!(presenter.lock().unwrap().decoder().frames(), 2);

    pipeline
        .resize(1920, 1080, Some(CanonicalFormat::Mjpeg))
        .unwrap();
    present_until(3);
    pipeline.stop();

    let presenter = presenter.lock().unwrap();
    assert_eq!(presenter.decoder().frames(), 1);
    assert_eq!(presenter.renderer().rebuilds(), 2);
    assert_eq!(presenter.renderer().output_texture().unwrap().width(), 1920);
}
