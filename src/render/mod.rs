// SPDX-License-Identifier: GPL-3.0-only

//! GPU frame renderer
//!
//! Uploads (or imports) each raw frame into the textures its format needs and
//! draws it through the matching conversion program into an RGBA target.
//! Textures are rebuilt only when width, height or format change; compiled
//! programs are kept for the renderer's lifetime.

pub mod presenter;
pub mod zero_copy;

pub use presenter::Presenter;
pub use zero_copy::{ImportRequest, TextureImporter, ZeroCopyGate, ZeroCopyState};

use crate::constants::render::CLEAR_COLOR;
use crate::convert::DecodedFrame;
use crate::errors::RenderError;
use crate::formats::FrameDescriptor;
use crate::gpu::GpuContext;
use crate::pipeline::CapturedFrame;
use crate::shaders::{self, FormatRow, FrameUniform, Program};
use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use tracing::{debug, info};

pub use crate::constants::render::OUTPUT_FORMAT;

/// One frame handed to [`Renderer::draw`]
#[derive(Debug, Clone, Copy)]
pub struct RenderFrame<'a> {
    pub descriptor: FrameDescriptor,
    pub data: &'a [u8],
    /// DMA-BUF backing the data, if the capture buffer has one
    pub dmabuf_fd: Option<BorrowedFd<'a>>,
    /// Capture slot the frame came from; imported textures are cached per slot
    pub slot: Option<u32>,
}

impl<'a> RenderFrame<'a> {
    pub fn new(descriptor: FrameDescriptor, data: &'a [u8]) -> Self {
        Self {
            descriptor,
            data,
            dmabuf_fd: None,
            slot: None,
        }
    }
}

impl<'a> From<&CapturedFrame<'a>> for RenderFrame<'a> {
    fn from(frame: &CapturedFrame<'a>) -> Self {
        Self {
            descriptor: frame.descriptor,
            data: frame.data,
            dmabuf_fd: frame.dmabuf_fd,
            slot: Some(frame.index),
        }
    }
}

impl<'a> From<&'a DecodedFrame> for RenderFrame<'a> {
    fn from(frame: &'a DecodedFrame) -> Self {
        Self::new(frame.descriptor, &frame.data)
    }
}

/// Clip-space transform applied to the frame quad (column-major)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform(pub [[f32; 4]; 4]);

impl Transform {
    pub const IDENTITY: Transform = Transform([
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]);

    pub fn scale(x: f32, y: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.0[0][0] = x;
        m.0[1][1] = y;
        m
    }

    pub fn mirror_horizontal() -> Self {
        Self::scale(-1.0, 1.0)
    }

    /// Letterbox a `src` aspect ratio inside a `dst` viewport
    pub fn fit(src_width: u32, src_height: u32, dst_width: u32, dst_height: u32) -> Self {
        if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
            return Self::IDENTITY;
        }
        let src_aspect = src_width as f32 / src_height as f32;
        let dst_aspect = dst_width as f32 / dst_height as f32;
        if src_aspect > dst_aspect {
            Self::scale(1.0, dst_aspect / src_aspect)
        } else {
            Self::scale(src_aspect / dst_aspect, 1.0)
        }
    }

    /// `self` followed by `next`
    pub fn then(self, next: Transform) -> Self {
        let mut out = [[0.0f32; 4]; 4];
        for (c, column) in out.iter_mut().enumerate() {
            for (r, value) in column.iter_mut().enumerate() {
                *value = (0..4).map(|k| next.0[k][r] * self.0[c][k]).sum();
            }
        }
        Transform(out)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Textures and target for the current (width, height, format)
struct RendererState {
    descriptor: FrameDescriptor,
    row: &'static FormatRow,
    planes: Vec<wgpu::Texture>,
    target: wgpu::Texture,
    needs_clear: bool,
}

pub struct Renderer {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    programs: HashMap<Program, wgpu::RenderPipeline>,
    uniform_buffer: wgpu::Buffer,
    /// Bound to unused texture slots
    placeholder: wgpu::Texture,
    state: Option<RendererState>,
    zero_copy: ZeroCopyGate,
    max_texture_dimension: u32,
    rebuilds: u64,
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

impl Renderer {
    /// Renderer using the importer compiled into this build
    pub fn new(ctx: &GpuContext) -> Self {
        Self::with_importer(ctx, zero_copy::default_importer())
    }

    /// Renderer with an explicit importer; `None` always uploads
    pub fn with_importer(ctx: &GpuContext, importer: Option<Box<dyn TextureImporter>>) -> Self {
        let device = Arc::clone(&ctx.device);
        let queue = Arc::clone(&ctx.queue);

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("camera-pipeline frame bind group layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("camera-pipeline frame pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("camera-pipeline frame uniform"),
            size: std::mem::size_of::<FrameUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let placeholder = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("camera-pipeline placeholder"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });

        let zero_copy = ZeroCopyGate::resolve(importer, &device);
        let max_texture_dimension = device.limits().max_texture_dimension_2d;

        Self {
            device,
            queue,
            bind_group_layout,
            pipeline_layout,
            programs: HashMap::new(),
            uniform_buffer,
            placeholder,
            state: None,
            zero_copy,
            max_texture_dimension,
            rebuilds: 0,
        }
    }

    /// Number of texture rebuilds so far
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Largest texture width or height the device accepts
    pub fn max_texture_dimension(&self) -> u32 {
        self.max_texture_dimension
    }

    /// Number of distinct programs compiled so far
    pub fn compiled_programs(&self) -> usize {
        self.programs.len()
    }

    /// Program used for the current geometry
    pub fn active_program(&self) -> Option<Program> {
        self.state.as_ref().map(|s| s.row.program)
    }

    /// Textures allocated for the current geometry
    pub fn plane_count(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.planes.len())
    }

    pub fn zero_copy_state(&self) -> ZeroCopyState {
        self.zero_copy.state()
    }

    /// RGBA output of the last draw
    pub fn output_texture(&self) -> Option<&wgpu::Texture> {
        self.state.as_ref().map(|s| &s.target)
    }

    fn program(&mut self, program: Program) -> &wgpu::RenderPipeline {
        let device = &self.device;
        let layout = &self.pipeline_layout;
        self.programs.entry(program).or_insert_with(|| {
            debug!(program = program.name(), "Compiling frame program");
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(program.name()),
                source: wgpu::ShaderSource::Wgsl(program.source().into()),
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(program.name()),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &module,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: OUTPUT_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        })
    }

    fn rebuild(&mut self, descriptor: FrameDescriptor, row: &'static FormatRow) {
        let FrameDescriptor { width, height, format } = descriptor;
        let planes = row
            .planes
            .iter()
            .enumerate()
            .map(|(i, plane)| {
                let (w, h) = plane.size(format, width, height);
                self.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(if i == 0 { "camera-pipeline plane 0" } else { "camera-pipeline plane 1" }),
                    size: wgpu::Extent3d {
                        width: w,
                        height: h,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: plane.texture_format,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                })
            })
            .collect();

        let target = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("camera-pipeline output"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OUTPUT_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        self.zero_copy.clear();
        self.program(row.program);
        self.rebuilds += 1;

        info!(
            width,
            height,
            format = %format,
            program = row.program.name(),
            planes = row.planes.len(),
            "Renderer textures rebuilt"
        );

        self.state = Some(RendererState {
            descriptor,
            row,
            planes,
            target,
            needs_clear: true,
        });
    }

    fn upload(&self, state: &RendererState, data: &[u8]) {
        let FrameDescriptor { width, height, format } = state.descriptor;
        let mut offset = 0;
        for (plane, texture) in state.row.planes.iter().zip(&state.planes) {
            let (w, h) = plane.size(format, width, height);
            let len = plane.byte_len(format, width, height);
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &data[offset..offset + len],
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(plane.row_bytes(format, width, height)),
                    rows_per_image: Some(h),
                },
                wgpu::Extent3d {
                    width: w,
                    height: h,
                    depth_or_array_layers: 1,
                },
            );
            offset += len;
        }
    }

    /// Draw one raw frame into the output texture
    pub fn draw(&mut self, frame: &RenderFrame<'_>, transform: Transform) -> Result<(), RenderError> {
        let descriptor = frame.descriptor;
        let row = shaders::lookup(descriptor.format)
            .ok_or_else(|| RenderError::UnsupportedFormat(descriptor.format.to_string()))?;
        let expected = descriptor
            .expected_size()
            .ok_or_else(|| RenderError::UnsupportedFormat(descriptor.format.to_string()))?;
        if frame.data.len() != expected {
            return Err(RenderError::FrameSizeMismatch {
                expected,
                actual: frame.data.len(),
            });
        }
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(RenderError::UnsupportedFormat(descriptor.to_string()));
        }
        descriptor
            .require_layout()
            .map_err(|e| RenderError::UnsupportedFormat(e.to_string()))?;

        let FrameDescriptor { width, height, format } = descriptor;
        let limit = self.max_texture_dimension;
        let sizes = row.planes.iter().map(|p| p.size(format, width, height));
        for (w, h) in sizes.chain([(width, height)]) {
            if w > limit || h > limit {
                return Err(RenderError::TextureTooLarge {
                    width: w,
                    height: h,
                    limit,
                });
            }
        }

        if self.state.as_ref().map(|s| s.descriptor) != Some(descriptor) {
            self.rebuild(descriptor, row);
        }

        // Zero-copy first; the gate turns itself off on failure
        let mut imported = None;
        if self.zero_copy.eligible(row) {
            if let (Some(fd), Some(slot)) = (frame.dmabuf_fd, frame.slot) {
                let plane = row.planes[0];
                let (w, h) = plane.size(descriptor.format, descriptor.width, descriptor.height);
                let request = ImportRequest {
                    fd,
                    width: w,
                    height: h,
                    texture_format: plane.texture_format,
                    stride: plane.row_bytes(descriptor.format, descriptor.width, descriptor.height),
                    size: expected as u64,
                };
                imported = self
                    .zero_copy
                    .texture(&self.device, slot, &request)
                    .map(|t| t.create_view(&wgpu::TextureViewDescriptor::default()));
            }
        }

        let Some(state) = self.state.as_ref() else {
            return Err(RenderError::UnsupportedFormat(descriptor.to_string()));
        };
        if imported.is_none() {
            self.upload(state, frame.data);
        }

        let uniform = FrameUniform::new(row, descriptor.width, descriptor.height, transform.0);
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniform));

        let view0 = match imported {
            Some(view) => view,
            None => state.planes[0].create_view(&wgpu::TextureViewDescriptor::default()),
        };
        let view1 = state
            .planes
            .get(1)
            .unwrap_or(&self.placeholder)
            .create_view(&wgpu::TextureViewDescriptor::default());
        let target_view = state.target.create_view(&wgpu::TextureViewDescriptor::default());
        let load = if state.needs_clear {
            wgpu::LoadOp::Clear(CLEAR_COLOR)
        } else {
            wgpu::LoadOp::Load
        };

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("camera-pipeline frame bind group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view0),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&view1),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
            ],
        });

        let Some(pipeline) = self.programs.get(&row.program) else {
            return Err(RenderError::UnsupportedFormat(descriptor.to_string()));
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("camera-pipeline frame"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("camera-pipeline frame pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.draw(0..6, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        if let Some(state) = self.state.as_mut() {
            state.needs_clear = false;
        }
        Ok(())
    }

    /// Copy the output texture back as tightly packed RGBA rows
    pub async fn read_rgba_async(&self) -> Result<Vec<u8>, RenderError> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| RenderError::Readback("nothing has been drawn".to_string()))?;
        let FrameDescriptor { width, height, .. } = state.descriptor;

        let unpadded = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("camera-pipeline readback"),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("camera-pipeline readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &state.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(wgpu::PollType::wait_indefinitely());

        receiver
            .await
            .map_err(|_| RenderError::Readback("Failed to receive buffer mapping".to_string()))?
            .map_err(|e| RenderError::Readback(format!("Failed to map buffer: {:?}", e)))?;

        let data = {
            let mapped = slice.get_mapped_range();
            let mut out = Vec::with_capacity((unpadded * height) as usize);
            for row in mapped.chunks_exact(padded as usize) {
                out.extend_from_slice(&row[..unpadded as usize]);
            }
            out
        };
        buffer.unmap();
        Ok(data)
    }

    /// Blocking variant of [`Renderer::read_rgba_async`]
    pub fn read_rgba(&self) -> Result<Vec<u8>, RenderError> {
        pollster::block_on(self.read_rgba_async())
    }
}
