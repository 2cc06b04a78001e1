//! wgpu device backend
//!
//! Builds one render pipeline per stage up front. Bind groups are cached per
//! (stage, frame slot) and rebuilt only when the binding set generation moves.
//! Barriers are left to wgpu, which tracks usage itself; they are only traced.

use super::{AcquiredTarget, Backend};
use crate::{
    binding_table::OutputTarget,
    config::{HEIGHT, WIDTH},
    error::{PipelineError, PipelineResult},
    recording::{Command, FrameRecording, StageDraw},
    resource_pool::{PixelFormat, ResourceDesc, ResourceKind, ResourcePool},
    shaders::ShaderLibrary,
    stage_graph::{AddressMode, HistoryKey, StageDecl, StageGraph, StageId, TextureRef},
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

pub struct WgpuImage {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub format: PixelFormat,
}

pub struct WgpuBuffer {
    pub buffer: wgpu::Buffer,
    pub size: u64,
}

/// Submission index plus a flag set from the queue's completion callback
pub struct WgpuFence {
    submission: wgpu::SubmissionIndex,
    done: Arc<AtomicBool>,
}

pub struct WgpuTarget {
    texture: wgpu::SurfaceTexture,
    view: wgpu::TextureView,
}

struct CachedBindGroup {
    generation: u64,
    bind_group: wgpu::BindGroup,
}

fn texture_format(format: PixelFormat) -> wgpu::TextureFormat {
    match format {
        PixelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        PixelFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
    }
}

/// Format a stage output is rendered in
fn output_format(target: TextureRef, present_format: wgpu::TextureFormat) -> wgpu::TextureFormat {
    match target {
        TextureRef::Fixed(key) => texture_format(key.format()),
        TextureRef::History(_, _) => texture_format(HistoryKey::FORMAT),
        TextureRef::PresentTarget => present_format,
    }
}

/// Backend driving a wgpu device and window surface
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    surface_configuration: wgpu::SurfaceConfiguration,
    pipelines: HashMap<StageId, wgpu::RenderPipeline>,
    samplers: HashMap<AddressMode, wgpu::Sampler>,
    bind_groups: HashMap<(StageId, usize), CachedBindGroup>,
    /// Stands in for the swap-chain image index, which wgpu does not expose
    acquisitions: u32,
    pre_present: Option<Box<dyn Fn() + Send>>,
}

impl WgpuBackend {
    /// Opens a device for `surface` and builds a render pipeline per stage of `graph`
    ///
    /// # Arguments
    /// * `instance` - The instance `surface` was created from
    /// * `surface` - Window surface, configured here at the native frame size
    /// * `graph` - Stages to build pipelines for
    /// * `shaders` - Vertex and fragment sources
    pub fn new(instance: &wgpu::Instance, surface: wgpu::Surface<'static>, graph: &StageGraph, shaders: &ShaderLibrary) -> PipelineResult<Self> {
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .map_err(|e| PipelineError::resource_creation("adapter", e))?;
        tracing::info!(adapter = ?adapter.get_info(), "selected adapter");

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("denoise device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: Default::default(),
        }))
        .map_err(|e| PipelineError::resource_creation("device", e))?;

        let surface_configuration = surface_configuration(&surface.get_capabilities(&adapter))?;
        let surface_texture_format = surface_configuration.format;
        surface.configure(&device, &surface_configuration);

        let samplers = [AddressMode::Repeat, AddressMode::ClampToEdge]
            .into_iter()
            .map(|mode| {
                let address_mode = match mode {
                    AddressMode::Repeat => wgpu::AddressMode::Repeat,
                    AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
                };
                let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
                    label: Some(&format!("{mode:?} sampler")),
                    address_mode_u: address_mode,
                    address_mode_v: address_mode,
                    address_mode_w: address_mode,
                    mag_filter: wgpu::FilterMode::Linear,
                    min_filter: wgpu::FilterMode::Linear,
                    mipmap_filter: wgpu::FilterMode::Nearest,
                    ..Default::default()
                });
                (mode, sampler)
            })
            .collect();

        let present_format = surface_texture_format.remove_srgb_suffix();
        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fullscreen vertex"),
            source: wgpu::ShaderSource::Wgsl(shaders.vertex()?.into()),
        });

        let mut pipelines = HashMap::new();
        for stage in graph.stages() {
            let pipeline = Self::create_stage_pipeline(&device, stage, &vertex_module, shaders.fragment(stage)?, present_format)?;
            pipelines.insert(stage.id, pipeline);
        }

        Ok(Self {
            device,
            queue,
            surface,
            surface_configuration,
            pipelines,
            samplers,
            bind_groups: HashMap::new(),
            acquisitions: 0,
            pre_present: None,
        })
    }

    /// Runs `hook` right before every present
    pub fn set_pre_present_hook(&mut self, hook: impl Fn() + Send + 'static) {
        self.pre_present = Some(Box::new(hook));
    }

    pub fn surface_format(&self) -> wgpu::TextureFormat {
        self.surface_configuration.format
    }

    /// Builds the render pipeline of one stage
    ///
    /// Input slot `k` binds its texture at `2k` and its sampler at `2k + 1`.
    /// Color targets are laid out by output location.
    fn create_stage_pipeline(
        device: &wgpu::Device,
        stage: &StageDecl,
        vertex_module: &wgpu::ShaderModule,
        fragment_source: &str,
        present_format: wgpu::TextureFormat,
    ) -> PipelineResult<wgpu::RenderPipeline> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let fragment_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(stage.fragment_shader),
            source: wgpu::ShaderSource::Wgsl(fragment_source.into()),
        });

        let mut bind_group_layout_entries = Vec::with_capacity(stage.inputs.len() * 2);
        for slot in stage.inputs {
            bind_group_layout_entries.push(wgpu::BindGroupLayoutEntry {
                binding: slot.binding * 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
            bind_group_layout_entries.push(wgpu::BindGroupLayoutEntry {
                binding: slot.binding * 2 + 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            });
        }
        bind_group_layout_entries.sort_by_key(|entry| entry.binding);

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(stage.name),
            entries: &bind_group_layout_entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(stage.name),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let mut targets: Vec<Option<wgpu::ColorTargetState>> = Vec::new();
        for slot in stage.outputs {
            let location = slot.location as usize;
            if targets.len() <= location {
                targets.resize(location + 1, None);
            }
            targets[location] = Some(wgpu::ColorTargetState {
                format: output_format(slot.target, present_format),
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            });
        }

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(stage.name),
            layout: Some(&pipeline_layout),
            cache: None,
            vertex: wgpu::VertexState {
                module: vertex_module,
                buffers: &[],
                compilation_options: Default::default(),
                entry_point: None,
            },
            fragment: Some(wgpu::FragmentState {
                module: &fragment_module,
                targets: &targets,
                compilation_options: Default::default(),
                entry_point: None,
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                cull_mode: None,
                front_face: wgpu::FrontFace::Ccw,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
                unclipped_depth: false,
            },
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            depth_stencil: None,
        });

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(PipelineError::resource_creation(stage.name, error));
        }
        tracing::debug!(stage = stage.name, shader = stage.fragment_shader, "created stage pipeline");
        Ok(pipeline)
    }

    /// Rebuilds the cached bind group of `draw` if its binding set moved on
    fn refresh_bind_group(&mut self, draw: &StageDraw, pool: &ResourcePool<Self>) -> PipelineResult<()> {
        let key = (draw.stage, draw.bindings.frame_slot);
        if self.bind_groups.get(&key).is_some_and(|cached| cached.generation == draw.bindings.generation) {
            return Ok(());
        }

        let pipeline = self.pipelines.get(&draw.stage).ok_or_else(|| PipelineError::submission(format!("no pipeline for {:?}", draw.stage)))?;

        let mut entries = Vec::with_capacity(draw.bindings.inputs.len() * 2);
        for input in &draw.bindings.inputs {
            let image = pool.view(input.resource)?;
            let sampler = self
                .samplers
                .get(&input.addressing)
                .ok_or_else(|| PipelineError::submission(format!("no sampler for {:?}", input.addressing)))?;
            entries.push(wgpu::BindGroupEntry {
                binding: input.binding * 2,
                resource: wgpu::BindingResource::TextureView(&image.view),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: input.binding * 2 + 1,
                resource: wgpu::BindingResource::Sampler(sampler),
            });
        }
        entries.sort_by_key(|entry| entry.binding);

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{:?} slot {}", draw.stage, draw.bindings.frame_slot)),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        tracing::trace!(stage = ?draw.stage, frame_slot = draw.bindings.frame_slot, generation = draw.bindings.generation, "rebuilt bind group");
        self.bind_groups.insert(
            key,
            CachedBindGroup {
                generation: draw.bindings.generation,
                bind_group,
            },
        );
        Ok(())
    }

    fn encode_draw(&self, encoder: &mut wgpu::CommandEncoder, draw: &StageDraw, pool: &ResourcePool<Self>, target: Option<&WgpuTarget>) -> PipelineResult<()> {
        let mut color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = Vec::new();
        for output in &draw.bindings.outputs {
            let view = match output.target {
                OutputTarget::Resource(id) => &pool.view(id)?.view,
                OutputTarget::Present => &target.ok_or_else(|| PipelineError::submission(format!("{:?} draws to a present target that was not acquired", draw.stage)))?.view,
            };
            let location = output.location as usize;
            if color_attachments.len() <= location {
                color_attachments.resize_with(location + 1, || None);
            }
            color_attachments[location] = Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            });
        }

        let pipeline = self.pipelines.get(&draw.stage).ok_or_else(|| PipelineError::submission(format!("no pipeline for {:?}", draw.stage)))?;
        let cached = self
            .bind_groups
            .get(&(draw.stage, draw.bindings.frame_slot))
            .ok_or_else(|| PipelineError::submission(format!("no bind group for {:?}", draw.stage)))?;

        let label = format!("{:?}", draw.stage);
        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(&label),
            color_attachments: &color_attachments,
            ..Default::default()
        });

        let (width, height) = draw.viewport;
        render_pass.set_pipeline(pipeline);
        render_pass.set_bind_group(0, &cached.bind_group, &[]);
        render_pass.set_viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
        render_pass.set_scissor_rect(0, 0, width, height);
        render_pass.draw(0..draw.vertex_count, 0..1);
        Ok(())
    }

    fn encode_upload(encoder: &mut wgpu::CommandEncoder, staging: &WgpuBuffer, image: &WgpuImage) -> PipelineResult<()> {
        let size = image.texture.size();
        let bytes_per_row = size.width * image.format.bytes_per_pixel();
        if bytes_per_row % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT != 0 {
            return Err(PipelineError::submission(format!("row pitch {bytes_per_row} is not aligned for buffer copies")));
        }
        if u64::from(bytes_per_row) * u64::from(size.height) > staging.size {
            return Err(PipelineError::submission("staging buffer is smaller than the image"));
        }

        encoder.copy_buffer_to_texture(
            wgpu::TexelCopyBufferInfo {
                buffer: &staging.buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(size.height),
                },
            },
            wgpu::TexelCopyTextureInfo {
                texture: &image.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            size,
        );
        Ok(())
    }
}

impl Backend for WgpuBackend {
    type Image = WgpuImage;
    type Buffer = WgpuBuffer;
    type Fence = WgpuFence;
    type Target = WgpuTarget;

    fn create_image(&mut self, desc: &ResourceDesc) -> PipelineResult<WgpuImage> {
        let ResourceKind::Image { width, height, format } = desc.kind else {
            return Err(PipelineError::resource_creation(&desc.label, "not an image"));
        };

        let mut usage = wgpu::TextureUsages::empty();
        if desc.usage.sampled {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if desc.usage.color_output {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        if desc.usage.transfer_target {
            usage |= wgpu::TextureUsages::COPY_DST;
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texture_format(format),
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(WgpuImage { texture, view, format })
    }

    fn create_buffer(&mut self, desc: &ResourceDesc) -> PipelineResult<WgpuBuffer> {
        let ResourceKind::StagingBuffer { size } = desc.kind else {
            return Err(PipelineError::resource_creation(&desc.label, "not a buffer"));
        };

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size,
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Ok(WgpuBuffer { buffer, size })
    }

    fn destroy_image(&mut self, image: WgpuImage) {
        image.texture.destroy();
    }

    fn destroy_buffer(&mut self, buffer: WgpuBuffer) {
        buffer.buffer.destroy();
    }

    fn write_buffer(&mut self, buffer: &WgpuBuffer, data: &[u8]) -> PipelineResult<()> {
        if data.len() as u64 > buffer.size {
            return Err(PipelineError::submission(format!("{} bytes do not fit a {} byte staging buffer", data.len(), buffer.size)));
        }
        // Staged by the queue and applied ahead of the next submission
        self.queue.write_buffer(&buffer.buffer, 0, data);
        Ok(())
    }

    fn acquire_next(&mut self) -> PipelineResult<AcquiredTarget<WgpuTarget>> {
        let texture = match self.surface.get_current_texture() {
            Ok(texture) => texture,
            Err(wgpu::SurfaceError::Timeout | wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => return Err(PipelineError::AcquireStale),
            Err(e) => return Err(PipelineError::Acquire(e.to_string())),
        };

        let view = texture.texture.create_view(&wgpu::TextureViewDescriptor {
            format: Some(texture.texture.format().remove_srgb_suffix()),
            ..Default::default()
        });

        let index = self.acquisitions;
        self.acquisitions = self.acquisitions.wrapping_add(1);
        Ok(AcquiredTarget {
            index,
            suboptimal: texture.suboptimal,
            target: WgpuTarget { texture, view },
        })
    }

    fn submit(&mut self, recording: &FrameRecording, pool: &ResourcePool<Self>, target: Option<&WgpuTarget>) -> PipelineResult<WgpuFence> {
        for draw in recording.draws() {
            self.refresh_bind_group(draw, pool)?;
        }

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&format!("frame slot {}", recording.frame_slot)),
        });

        for command in &recording.commands {
            match command {
                Command::Barrier(barrier) => {
                    tracing::trace!(resource = %barrier.resource, from = ?barrier.from, to = ?barrier.to, kind = ?barrier.kind, "barrier");
                }
                Command::Upload { staging, image } => Self::encode_upload(&mut encoder, pool.buffer(*staging)?, pool.view(*image)?)?,
                Command::Draw(draw) => self.encode_draw(&mut encoder, draw, pool, target)?,
            }
        }

        let submission = self.queue.submit(Some(encoder.finish()));
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        self.queue.on_submitted_work_done(move || flag.store(true, Ordering::Release));

        Ok(WgpuFence { submission, done })
    }

    fn wait(&mut self, fence: &WgpuFence) -> PipelineResult<()> {
        if fence.done.load(Ordering::Acquire) {
            return Ok(());
        }
        self.device.poll(wgpu::PollType::WaitForSubmissionIndex(fence.submission.clone())).map_err(PipelineError::submission)?;
        Ok(())
    }

    fn is_signaled(&self, fence: &WgpuFence) -> bool {
        if let Err(e) = self.device.poll(wgpu::PollType::Poll) {
            tracing::warn!("device poll failed: {e}");
        }
        fence.done.load(Ordering::Acquire)
    }

    fn present(&mut self, target: WgpuTarget) {
        if let Some(hook) = &self.pre_present {
            hook();
        }
        target.texture.present();
    }
}

/// Native-size configuration preferring an sRGB format
fn surface_configuration(capabilities: &wgpu::SurfaceCapabilities) -> PipelineResult<wgpu::SurfaceConfiguration> {
    let unsupported = |what: &str| PipelineError::resource_creation("surface", format!("adapter reports no {what} for the surface"));

    let first_format = capabilities.formats.first().copied().ok_or_else(|| unsupported("formats"))?;
    let format = capabilities.formats.iter().find(|f| f.is_srgb()).copied().unwrap_or(first_format);
    let alpha_mode = capabilities.alpha_modes.first().copied().ok_or_else(|| unsupported("alpha modes"))?;
    let present_mode = capabilities.present_modes.first().copied().ok_or_else(|| unsupported("present modes"))?;

    Ok(wgpu::SurfaceConfiguration {
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        width: WIDTH,
        height: HEIGHT,
        format,
        view_formats: vec![format, format.remove_srgb_suffix()],
        alpha_mode,
        present_mode,
        desired_maximum_frame_latency: 2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_without_present_modes_is_rejected() {
        let capabilities = wgpu::SurfaceCapabilities {
            formats: vec![wgpu::TextureFormat::Bgra8Unorm],
            ..Default::default()
        };

        let result = surface_configuration(&capabilities);
        assert!(matches!(result, Err(PipelineError::ResourceCreation { ref reason, .. }) if reason.contains("present modes")));
    }

    #[test]
    fn test_surface_without_alpha_modes_is_rejected() {
        let capabilities = wgpu::SurfaceCapabilities {
            formats: vec![wgpu::TextureFormat::Bgra8Unorm],
            present_modes: vec![wgpu::PresentMode::Fifo],
            alpha_modes: Vec::new(),
            ..Default::default()
        };

        assert!(matches!(surface_configuration(&capabilities), Err(PipelineError::ResourceCreation { .. })));
    }

    #[test]
    fn test_surface_prefers_srgb_format() {
        let capabilities = wgpu::SurfaceCapabilities {
            formats: vec![wgpu::TextureFormat::Bgra8Unorm, wgpu::TextureFormat::Bgra8UnormSrgb],
            present_modes: vec![wgpu::PresentMode::Fifo, wgpu::PresentMode::Mailbox],
            ..Default::default()
        };

        let configuration = surface_configuration(&capabilities).unwrap();
        assert_eq!(configuration.format, wgpu::TextureFormat::Bgra8UnormSrgb);
        assert_eq!(configuration.view_formats, [wgpu::TextureFormat::Bgra8UnormSrgb, wgpu::TextureFormat::Bgra8Unorm]);
        assert_eq!(configuration.present_mode, wgpu::PresentMode::Fifo);
        assert_eq!(configuration.alpha_mode, wgpu::CompositeAlphaMode::Opaque);
        assert_eq!((configuration.width, configuration.height), (WIDTH, HEIGHT));
    }
}
