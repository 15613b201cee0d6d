// SPDX-License-Identifier: GPL-3.0-only

//! Command-line operations (no GUI)

use crate::DeviceArgs;
use camera_pipeline::convert::{self, DecodeTarget};
use camera_pipeline::{
    CanonicalFormat, CapturePipeline, FrameDescriptor, PipelineConfig, RenderFrame, Renderer,
    Transform, VirtualDevice, VirtualProvider, create_device_blocking,
};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Longest wait for the requested number of frames
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);

fn build_config(args: &DeviceArgs) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => PipelineConfig::default(),
    };
    if !args.options.is_empty() {
        let mut pairs = Vec::new();
        for option in &args.options {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", option))?;
            pairs.push((key.to_string(), value.to_string()));
        }
        // Only the keys given on the command line override the file
        let overrides = PipelineConfig::from_options(pairs.iter().map(|(k, v)| (k, v)))?;
        for (key, _) in &pairs {
            match key.trim() {
                "device" => config.device_path = overrides.device_path.clone(),
                "dma_device" => config.dma_path = overrides.dma_path.clone(),
                "buffers" => config.buffer_count = overrides.buffer_count,
                "width" => config.width = overrides.width,
                "height" => config.height = overrides.height,
                "fps_min" => config.fps.min = overrides.fps.min,
                "fps_max" => config.fps.max = overrides.fps.max,
                "format" => config.format = overrides.format,
                "drive" => config.drive_mode = overrides.drive_mode,
                _ => {}
            }
        }
    }
    if let Some(device) = &args.device {
        config.device_path = device.clone();
    }
    config.validate()?;
    Ok(config)
}

fn open_pipeline(args: &DeviceArgs) -> Result<CapturePipeline, Box<dyn std::error::Error>> {
    let config = build_config(args)?;
    let pipeline = if args.use_virtual {
        CapturePipeline::with_provider(
            config,
            Arc::new(VirtualProvider::new(Arc::new(VirtualDevice::new()))),
        )?
    } else {
        CapturePipeline::new(config)?
    };
    Ok(pipeline)
}

pub fn print_report(args: &DeviceArgs) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = open_pipeline(args)?;
    pipeline.open()?;
    let report = pipeline.capability_report()?;
    println!("{}", report.to_json()?);
    Ok(())
}

pub fn list_controls(args: &DeviceArgs) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = open_pipeline(args)?;
    pipeline.open()?;
    let controls = pipeline.controls()?;
    if controls.is_empty() {
        println!("No controls.");
        return Ok(());
    }
    for control in controls {
        let value = pipeline.get_control(control.id);
        let shown = match &value {
            Ok(v) => control.menu_label(*v).unwrap_or_else(|| v.to_string()),
            Err(e) => format!("<{}>", e),
        };
        println!(
            "  {:#010x} {:<28} {:>8}  [{}..{} step {}, default {}]{}",
            control.id,
            control.name,
            shown,
            control.minimum,
            control.maximum,
            control.step,
            control.default_value,
            if control.is_inactive() { " (inactive)" } else { "" }
        );
        for entry in &control.menu {
            println!("      {}: {}", entry.index, control.menu_label(entry.index as i32).unwrap_or_default());
        }
    }
    Ok(())
}

/// Last frame seen by the callback
struct FrameCopy {
    descriptor: FrameDescriptor,
    data: Vec<u8>,
}

pub fn capture(
    args: &DeviceArgs,
    frames: u64,
    output: Option<PathBuf>,
    software: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = open_pipeline(args)?;
    let last: Arc<Mutex<Option<FrameCopy>>> = Arc::new(Mutex::new(None));
    let (done_tx, done_rx) = mpsc::channel();

    let sink = Arc::clone(&last);
    let mut count = 0u64;
    pipeline.set_frame_callback(move |frame| {
        count += 1;
        *sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(FrameCopy {
            descriptor: frame.descriptor,
            data: frame.data.to_vec(),
        });
        if count == frames.max(1) {
            let _ = done_tx.send(());
        }
        Ok(())
    });

    pipeline.start()?;
    let finished = done_rx.recv_timeout(CAPTURE_TIMEOUT).is_ok();
    let active = pipeline.active_format();
    pipeline.stop();

    if !finished {
        warn!(frames, "Capture ended before the requested frame count");
    }
    if let Some(active) = active {
        println!(
            "Captured {}x{} {} at {:.2} fps",
            active.width, active.height, active.format, active.fps
        );
    }

    let Some(output) = output else {
        return Ok(());
    };
    let frame = last
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .ok_or("no frame was captured")?;

    let rgba = if software {
        software_rgba(&frame)?
    } else {
        match gpu_rgba(&frame) {
            Ok(rgba) => rgba,
            Err(e) => {
                warn!(error = %e, "GPU conversion unavailable, converting on the CPU");
                software_rgba(&frame)?
            }
        }
    };
    let (width, height) = (rgba.descriptor.width, rgba.descriptor.height);
    let image = image::RgbaImage::from_raw(width, height, rgba.data)
        .ok_or("converted frame has the wrong size")?;
    image.save(&output)?;
    info!(path = %output.display(), "Saved frame");
    println!("Saved {}", output.display());
    Ok(())
}

fn decode_if_compressed(frame: &FrameCopy) -> Result<FrameCopy, Box<dyn std::error::Error>> {
    if frame.descriptor.format.is_compressed() {
        let decoded = convert::decode(&frame.data, DecodeTarget::Any)?;
        Ok(FrameCopy {
            descriptor: decoded.descriptor,
            data: decoded.data,
        })
    } else {
        Ok(FrameCopy {
            descriptor: frame.descriptor,
            data: frame.data.clone(),
        })
    }
}

fn software_rgba(frame: &FrameCopy) -> Result<FrameCopy, Box<dyn std::error::Error>> {
    let raw = decode_if_compressed(frame)?;
    let image = convert::ImageRef::new(raw.descriptor, &raw.data);
    let data = convert::convert_to_vec(&image, CanonicalFormat::Rgba32)?;
    Ok(FrameCopy {
        descriptor: FrameDescriptor::new(raw.descriptor.width, raw.descriptor.height, CanonicalFormat::Rgba32),
        data,
    })
}

fn gpu_rgba(frame: &FrameCopy) -> Result<FrameCopy, Box<dyn std::error::Error>> {
    let raw = decode_if_compressed(frame)?;
    let ctx = create_device_blocking("camera-pipeline cli")?;
    let mut renderer = Renderer::new(&ctx);
    renderer.draw(&RenderFrame::new(raw.descriptor, &raw.data), Transform::IDENTITY)?;
    let data = renderer.read_rgba()?;
    Ok(FrameCopy {
        descriptor: FrameDescriptor::new(raw.descriptor.width, raw.descriptor.height, CanonicalFormat::Rgba32),
        data,
    })
}
