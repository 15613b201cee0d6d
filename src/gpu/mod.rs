// SPDX-License-Identifier: GPL-3.0-only

//! GPU device creation for the frame renderer.

use crate::errors::RenderError;
use std::sync::Arc;
use tracing::{debug, info};

pub use wgpu;

/// Information about the created GPU device
#[derive(Debug, Clone)]
pub struct GpuDeviceInfo {
    /// Name of the GPU adapter
    pub adapter_name: String,
    /// Backend being used
    pub backend: wgpu::Backend,
    pub driver: String,
}

/// Device, queue and adapter details shared by renderers
#[derive(Debug, Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub info: GpuDeviceInfo,
}

/// Create a Vulkan device and queue.
///
/// Fails with [`RenderError::NoDevice`] when no adapter is present, which
/// is the normal case on headless machines.
pub async fn create_device(label: &str) -> Result<GpuContext, RenderError> {
    info!(label = label, "Creating GPU device");

    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::VULKAN,
        ..Default::default()
    });

    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
        .map_err(|e| RenderError::NoDevice(format!("No suitable GPU adapter: {}", e)))?;

    let adapter_info = adapter.get_info();
    info!(
        adapter = %adapter_info.name,
        backend = ?adapter_info.backend,
        driver = %adapter_info.driver,
        "GPU adapter selected"
    );

    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some(label),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        })
        .await
        .map_err(|e| RenderError::NoDevice(format!("Failed to create GPU device: {}", e)))?;

    debug!(label = label, "GPU device created");

    Ok(GpuContext {
        device: Arc::new(device),
        queue: Arc::new(queue),
        info: GpuDeviceInfo {
            adapter_name: adapter_info.name,
            backend: adapter_info.backend,
            driver: adapter_info.driver,
        },
    })
}

/// Blocking variant of [`create_device`] for callers without an executor
pub fn create_device_blocking(label: &str) -> Result<GpuContext, RenderError> {
    pollster::block_on(create_device(label))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_device() {
        // This test requires a GPU, so it may be skipped in CI
        match create_device("test_device").await {
            Ok(ctx) => {
                println!("Created device: {:?}", ctx.info);
                assert!(!ctx.info.adapter_name.is_empty());
                assert_eq!(ctx.info.backend, wgpu::Backend::Vulkan);
            }
            Err(e) => {
                println!("Skipping test (no GPU): {}", e);
            }
        }
    }
}
