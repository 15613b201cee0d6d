// SPDX-License-Identifier: GPL-3.0-only

//! DMA-BUF texture import
//!
//! Whether capture buffers can be imported straight into GPU textures is
//! decided once, when the renderer is built. After that, the first import
//! failure disables the path for the rest of the renderer's life and frames
//! go through a CPU upload instead.

use crate::shaders::FormatRow;
use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use tracing::{debug, info, warn};

/// Description of one buffer to import as a single texture
#[derive(Debug, Clone, Copy)]
pub struct ImportRequest<'a> {
    pub fd: BorrowedFd<'a>,
    pub width: u32,
    pub height: u32,
    pub texture_format: wgpu::TextureFormat,
    /// Row pitch in bytes
    pub stride: u32,
    /// Total byte size of the buffer
    pub size: u64,
}

/// Turns a DMA-BUF into a sampled texture on a specific device
pub trait TextureImporter: Send {
    fn name(&self) -> &'static str;

    /// Whether the device has what the importer needs
    fn available(&self, device: &wgpu::Device) -> bool;

    fn import(
        &mut self,
        device: &wgpu::Device,
        request: &ImportRequest<'_>,
    ) -> Result<wgpu::Texture, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroCopyState {
    /// No importer, or the device lacks the extensions
    Unavailable,
    Enabled,
    /// An import failed; upload is used from now on
    Disabled,
}

/// Zero-copy capability plus the textures imported so far, keyed by slot
pub struct ZeroCopyGate {
    importer: Option<Box<dyn TextureImporter>>,
    state: ZeroCopyState,
    imported: HashMap<u32, wgpu::Texture>,
}

impl ZeroCopyGate {
    /// Resolve the capability for `device`
    pub fn resolve(importer: Option<Box<dyn TextureImporter>>, device: &wgpu::Device) -> Self {
        let state = match &importer {
            Some(imp) if imp.available(device) => {
                info!(importer = imp.name(), "Zero-copy texture import enabled");
                ZeroCopyState::Enabled
            }
            Some(imp) => {
                info!(importer = imp.name(), "Zero-copy import unavailable on this device");
                ZeroCopyState::Unavailable
            }
            None => {
                debug!("No zero-copy importer configured");
                ZeroCopyState::Unavailable
            }
        };
        Self {
            importer,
            state,
            imported: HashMap::new(),
        }
    }

    pub fn state(&self) -> ZeroCopyState {
        self.state
    }

    /// Only single-texture formats are imported directly
    pub fn eligible(&self, row: &FormatRow) -> bool {
        self.state == ZeroCopyState::Enabled && row.planes.len() == 1
    }

    pub fn disable(&mut self, reason: &str) {
        if self.state == ZeroCopyState::Enabled {
            warn!(reason, "Zero-copy import disabled, falling back to upload");
        }
        self.state = ZeroCopyState::Disabled;
        self.imported.clear();
    }

    /// Drop imported textures; they belong to the previous geometry
    pub fn clear(&mut self) {
        self.imported.clear();
    }

    /// Texture for `slot`, importing it on first use
    ///
    /// Returns `None` once the path is off, including when this call is the
    /// one that failed.
    pub fn texture(
        &mut self,
        device: &wgpu::Device,
        slot: u32,
        request: &ImportRequest<'_>,
    ) -> Option<&wgpu::Texture> {
        if self.state != ZeroCopyState::Enabled {
            return None;
        }
        if !self.imported.contains_key(&slot) {
            let importer = self.importer.as_mut()?;
            match importer.import(device, request) {
                Ok(texture) => {
                    debug!(slot, width = request.width, height = request.height, "Imported DMA-BUF");
                    self.imported.insert(slot, texture);
                }
                Err(e) => {
                    self.disable(&e);
                    return None;
                }
            }
        }
        self.imported.get(&slot)
    }
}

/// The importer compiled into this build, if any
pub fn default_importer() -> Option<Box<dyn TextureImporter>> {
    #[cfg(feature = "dmabuf-import")]
    {
        Some(Box::new(vulkan::VulkanDmaBufImporter))
    }
    #[cfg(not(feature = "dmabuf-import"))]
    {
        None
    }
}

#[cfg(feature = "dmabuf-import")]
pub use vulkan::VulkanDmaBufImporter;

#[cfg(feature = "dmabuf-import")]
mod vulkan {
    use super::{ImportRequest, TextureImporter};
    use ash::vk;
    use std::ffi::CStr;
    use std::os::fd::{AsRawFd, IntoRawFd};
    use tracing::debug;

    const EXT_EXTERNAL_MEMORY_DMA_BUF: &CStr = c"VK_EXT_external_memory_dma_buf";
    const KHR_EXTERNAL_MEMORY_FD: &CStr = c"VK_KHR_external_memory_fd";
    const EXT_IMAGE_DRM_FORMAT_MODIFIER: &CStr = c"VK_EXT_image_drm_format_modifier";

    const DRM_FORMAT_MOD_LINEAR: u64 = 0;

    fn vk_format(format: wgpu::TextureFormat) -> Result<vk::Format, String> {
        match format {
            wgpu::TextureFormat::R8Unorm => Ok(vk::Format::R8_UNORM),
            wgpu::TextureFormat::Rg8Unorm => Ok(vk::Format::R8G8_UNORM),
            wgpu::TextureFormat::Rgba8Unorm => Ok(vk::Format::R8G8B8A8_UNORM),
            wgpu::TextureFormat::Bgra8Unorm => Ok(vk::Format::B8G8R8A8_UNORM),
            other => Err(format!("no Vulkan format for {:?}", other)),
        }
    }

    unsafe fn find_memory_type_index(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        let props = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        (0..props.memory_type_count).find(|&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize].property_flags.contains(flags)
        })
    }

    /// Linear single-plane import through wgpu's Vulkan HAL
    pub struct VulkanDmaBufImporter;

    impl TextureImporter for VulkanDmaBufImporter {
        fn name(&self) -> &'static str {
            "vulkan-dmabuf"
        }

        fn available(&self, device: &wgpu::Device) -> bool {
            // SAFETY: the HAL device is only inspected, not used for commands
            let Some(hal_device) = (unsafe { device.as_hal::<wgpu::hal::api::Vulkan>() }) else {
                return false;
            };
            let extensions = hal_device.enabled_device_extensions();
            extensions.contains(&EXT_EXTERNAL_MEMORY_DMA_BUF)
                && extensions.contains(&KHR_EXTERNAL_MEMORY_FD)
        }

        fn import(
            &mut self,
            device: &wgpu::Device,
            request: &ImportRequest<'_>,
        ) -> Result<wgpu::Texture, String> {
            // SAFETY: the fd is duplicated before Vulkan takes ownership and the
            // image is destroyed by the texture's drop callback
            unsafe { import_linear(device, request) }
        }
    }

    unsafe fn import_linear(
        device: &wgpu::Device,
        request: &ImportRequest<'_>,
    ) -> Result<wgpu::Texture, String> {
        let hal_device = unsafe { device.as_hal::<wgpu::hal::api::Vulkan>() }
            .ok_or_else(|| "device is not using the Vulkan backend".to_string())?;

        let has_drm_modifier = hal_device
            .enabled_device_extensions()
            .contains(&EXT_IMAGE_DRM_FORMAT_MODIFIER);
        let tight_stride =
            request.width * request.texture_format.block_copy_size(None).unwrap_or(4);
        if !has_drm_modifier && request.stride != tight_stride {
            return Err(format!(
                "padded stride {} needs VK_EXT_image_drm_format_modifier",
                request.stride
            ));
        }

        let vk_device = hal_device.raw_device();
        let physical_device = hal_device.raw_physical_device();
        let instance = hal_device.shared_instance().raw_instance();

        let mut external_memory_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

        let plane_layout = vk::SubresourceLayout {
            offset: 0,
            size: request.size,
            row_pitch: request.stride as u64,
            array_pitch: 0,
            depth_pitch: 0,
        };
        let mut drm_modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
            .drm_format_modifier(DRM_FORMAT_MOD_LINEAR)
            .plane_layouts(std::slice::from_ref(&plane_layout));

        let mut image_create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format(request.texture_format)?)
            .extent(vk::Extent3D {
                width: request.width,
                height: request.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .usage(vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut external_memory_info);

        image_create_info = if has_drm_modifier {
            image_create_info
                .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
                .push_next(&mut drm_modifier_info)
        } else {
            image_create_info.tiling(vk::ImageTiling::LINEAR)
        };

        let vk_image = unsafe { vk_device.create_image(&image_create_info, None) }
            .map_err(|e| format!("vkCreateImage failed: {:?}", e))?;

        let requirements = unsafe { vk_device.get_image_memory_requirements(vk_image) };
        let memory_type_index = unsafe {
            find_memory_type_index(
                instance,
                physical_device,
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .or_else(|| {
                find_memory_type_index(
                    instance,
                    physical_device,
                    requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::empty(),
                )
            })
        };
        let Some(memory_type_index) = memory_type_index else {
            unsafe { vk_device.destroy_image(vk_image, None) };
            return Err("no memory type for DMA-BUF import".to_string());
        };

        // Vulkan owns the fd on success; the capture slot keeps its own
        let owned = match request.fd.try_clone_to_owned() {
            Ok(fd) => fd,
            Err(e) => {
                unsafe { vk_device.destroy_image(vk_image, None) };
                return Err(format!("dup of DMA-BUF fd failed: {}", e));
            }
        };
        let mut import_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(owned.as_raw_fd());
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut import_info);

        let memory = match unsafe { vk_device.allocate_memory(&allocate_info, None) } {
            Ok(memory) => {
                let _ = owned.into_raw_fd();
                memory
            }
            Err(e) => {
                unsafe { vk_device.destroy_image(vk_image, None) };
                return Err(format!("vkAllocateMemory (DMA-BUF import) failed: {:?}", e));
            }
        };

        if let Err(e) = unsafe { vk_device.bind_image_memory(vk_image, memory, 0) } {
            unsafe {
                vk_device.free_memory(memory, None);
                vk_device.destroy_image(vk_image, None);
            }
            return Err(format!("vkBindImageMemory failed: {:?}", e));
        }

        let size = wgpu::Extent3d {
            width: request.width,
            height: request.height,
            depth_or_array_layers: 1,
        };
        let hal_desc = wgpu::hal::TextureDescriptor {
            label: Some("camera-pipeline dmabuf texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: request.texture_format,
            usage: wgpu::TextureUses::RESOURCE,
            memory_flags: wgpu::hal::MemoryFlags::empty(),
            view_formats: vec![],
        };

        let callback_device = vk_device.clone();
        let drop_callback: wgpu::hal::DropCallback = Box::new(move || {
            debug!("Releasing imported DMA-BUF image");
            // SAFETY: image and memory were created above and are released once
            unsafe {
                callback_device.destroy_image(vk_image, None);
                callback_device.free_memory(memory, None);
            }
        });

        let hal_texture = unsafe {
            hal_device.texture_from_raw(
                vk_image,
                &hal_desc,
                Some(drop_callback),
                wgpu::hal::vulkan::TextureMemory::External,
            )
        };
        drop(hal_device);

        let desc = wgpu::TextureDescriptor {
            label: Some("camera-pipeline dmabuf texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: request.texture_format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        };
        Ok(unsafe { device.create_texture_from_hal::<wgpu::hal::api::Vulkan>(hal_texture, &desc) })
    }
}
