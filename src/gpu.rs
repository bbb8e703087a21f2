//! Rendering subsystem core.
//!
//! [`RenderCore::init`] performs the asynchronous wgpu device acquisition
//! the bootstrap pipeline awaits before anything else. Headless environments
//! without a usable adapter degrade to the CPU slice path instead of failing
//! the pipeline. [`GpuSliceRenderer`] extracts one oriented, windowed
//! cross-section from the volume on the GPU, resampled to the surface
//! dimensions.

use std::borrow::Cow;

use thiserror::Error;
use tracing::{info, warn};
use wgpu::{PollType, util::DeviceExt};

use crate::enums::Orientation;
use crate::volume::{VoiWindow, Volume};

#[derive(Debug, Error)]
pub enum RenderCoreError {
    #[error("device request failed: {0}")]
    Device(String),

    #[error("GPU readback failed: {0}")]
    Readback(String),

    #[error("volume data is not contiguous")]
    NonContiguousVolume,
}

/// GPU device and queue shared by all slice renderers.
pub struct WGPU {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

/// Rendering subsystem handle produced by initialization.
pub struct RenderCore {
    gpu: Option<WGPU>,
}

impl RenderCore {
    /// Initialize the rendering subsystem.
    ///
    /// Returns a CPU-only core when no adapter is available, so that
    /// headless runs still complete; a present adapter that refuses a
    /// device is an initialization failure.
    pub async fn init() -> Result<Self, RenderCoreError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = match instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
        {
            Ok(adapter) => adapter,
            Err(error) => {
                warn!(%error, "no GPU adapter available, using CPU slice path");
                return Ok(Self::cpu());
            }
        };

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default())
            .await
            .map_err(|e| RenderCoreError::Device(e.to_string()))?;

        info!("rendering subsystem initialized with GPU adapter");
        Ok(Self {
            gpu: Some(WGPU { device, queue }),
        })
    }

    /// Core without a GPU device; slices are extracted on the CPU.
    pub fn cpu() -> Self {
        Self { gpu: None }
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu.is_some()
    }

    pub(crate) fn gpu(&self) -> Option<&WGPU> {
        self.gpu.as_ref()
    }
}

/// Compute pipeline extracting oriented cross-sections of one volume.
///
/// The 16-bit volume is packed into an `Rg8Unorm` 3D texture (low byte in
/// the red channel) and recombined in the shader, which also applies the
/// VOI window before writing 8-bit output.
pub struct GpuSliceRenderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    volume_view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    dimensions: (u32, u32, u32),
}

impl GpuSliceRenderer {
    pub fn new(wgpu: &WGPU, volume: &Volume) -> Result<Self, RenderCoreError> {
        let (slices, rows, columns) = volume.dim();
        let (depth, height, width) = (slices as u32, rows as u32, columns as u32);
        let device = wgpu.device.clone();
        let queue = wgpu.queue.clone();

        let texture_size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: depth,
        };

        let volume_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Volume 3D Texture"),
            size: texture_size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: wgpu::TextureFormat::Rg8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        let data = volume
            .data()
            .as_slice()
            .ok_or(RenderCoreError::NonContiguousVolume)?;
        queue.write_texture(
            wgpu::TexelCopyTextureInfoBase {
                texture: &volume_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(data),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(2 * width),
                rows_per_image: Some(height),
            },
            texture_size,
        );

        let volume_view = volume_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Slice Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Viewport Slice Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!(
                "shaders/viewport_slice.wgsl"
            ))),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Viewport Slice Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D3,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
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
            label: Some("Viewport Slice Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Viewport Slice Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            volume_view,
            sampler,
            dimensions: (depth, height, width),
        })
    }

    /// Extract the windowed cross-section at `slice_index` into an 8-bit
    /// buffer of `target_width` × `target_height` pixels.
    pub async fn extract_slice(
        &self,
        slice_index: usize,
        orientation: Orientation,
        window: VoiWindow,
        target_width: u32,
        target_height: u32,
    ) -> Result<Vec<u8>, RenderCoreError> {
        #[repr(C)]
        #[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
        struct Uniforms {
            slice_index: u32,
            orientation: u32,
            output_width: u32,
            output_height: u32,
            volume_columns: u32,
            volume_rows: u32,
            volume_depth: u32,
            _padding: u32,
            window_center: f32,
            window_width: f32,
            _padding2: [f32; 2],
        }
        let uniforms = Uniforms {
            slice_index: slice_index as u32,
            orientation: orientation as u32,
            output_width: target_width,
            output_height: target_height,
            volume_columns: self.dimensions.2,
            volume_rows: self.dimensions.1,
            volume_depth: self.dimensions.0,
            _padding: 0,
            window_center: window.center,
            window_width: window.width,
            _padding2: [0.0; 2],
        };
        let uniform_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Uniform Buffer"),
                contents: bytemuck::bytes_of(&uniforms),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let output_size = (target_width * target_height) as usize;
        let output_bytes = (output_size * std::mem::size_of::<u32>()) as u64;
        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Output Buffer"),
            size: output_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: output_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Viewport Slice Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&self.volume_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: output_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: uniform_buffer.as_entire_binding(),
                },
            ],
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Viewport Slice Encoder"),
            });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Viewport Slice Pass"),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&self.pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            let workgroup_size = 8;
            let dispatch_x = target_width.div_ceil(workgroup_size);
            let dispatch_y = target_height.div_ceil(workgroup_size);
            compute_pass.dispatch_workgroups(dispatch_x, dispatch_y, 1);
        }
        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, output_bytes);
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(PollType::Wait {
            submission_index: None,
            timeout: None,
        });
        receiver
            .await
            .map_err(|_| RenderCoreError::Readback("map callback dropped".into()))?
            .map_err(|e| RenderCoreError::Readback(e.to_string()))?;

        let data = buffer_slice.get_mapped_range();
        let words: &[u32] = bytemuck::cast_slice(&data);
        let result: Vec<u8> = words.iter().map(|&v| v as u8).collect();

        drop(data);
        staging_buffer.unmap();
        Ok(result)
    }
}
