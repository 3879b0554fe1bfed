use anyhow::{Context, Result};
use std::mem::size_of;

use super::render_targets::{RenderTargetHandle, RenderTargetManager, ViewportTargets};
use super::{
    fullscreen_draw, fullscreen_pipeline, texture_entry, uniform_entry, GpuContext, AO_FORMAT, LINEAR_DEPTH_FORMAT,
};
use crate::error::PipelineResult;
use crate::hbao::{
    default_jitter_tile, AoProjection, BlurUniform, HbaoParameters, HbaoUniform, LinearizeUniform, AO_RANDOMTEX_SIZE,
};

/// Which texture holds this frame's occlusion term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AoSource {
    Blurred,
    Raw,
    /// 1x1 white texture bound while AO is disabled.
    Fallback,
}

struct AoBindGroups {
    key: [RenderTargetHandle; 10],
    linearize: wgpu::BindGroup,
    hbao: wgpu::BindGroup,
    blur_horizontal: wgpu::BindGroup,
    blur_vertical: wgpu::BindGroup,
}

/// Depth linearization, the HBAO kernel and the separable depth-aware blur.
pub struct AmbientOcclusionStage {
    linearize_pipeline: wgpu::RenderPipeline,
    hbao_pipeline: wgpu::RenderPipeline,
    blur_pipeline: wgpu::RenderPipeline,
    linearize_layout: wgpu::BindGroupLayout,
    hbao_layout: wgpu::BindGroupLayout,
    blur_layout: wgpu::BindGroupLayout,
    linearize_buffer: wgpu::Buffer,
    hbao_buffer: wgpu::Buffer,
    blur_horizontal_buffer: wgpu::Buffer,
    blur_vertical_buffer: wgpu::Buffer,
    _jitter_texture: wgpu::Texture,
    jitter_view: wgpu::TextureView,
    fallback_texture: wgpu::Texture,
    fallback_view: wgpu::TextureView,
    bind_groups: Option<AoBindGroups>,
    parameters: HbaoParameters,
    enabled: bool,
}

impl AmbientOcclusionStage {
    pub fn new(ctx: &GpuContext, parameters: HbaoParameters, enabled: bool) -> Self {
        let device = &ctx.device;
        let unfilterable = wgpu::TextureSampleType::Float { filterable: false };

        let linearize_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("AO Linearize BGL"),
            entries: &[uniform_entry(0), texture_entry(1, wgpu::TextureSampleType::Depth)],
        });
        let hbao_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("HBAO BGL"),
            entries: &[
                uniform_entry(0),
                texture_entry(1, unfilterable),
                texture_entry(2, unfilterable),
                texture_entry(3, unfilterable),
            ],
        });
        let blur_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("AO Blur BGL"),
            entries: &[uniform_entry(0), texture_entry(1, unfilterable), texture_entry(2, unfilterable)],
        });

        let linearize_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("AO Linearize Shader"),
            source: wgpu::ShaderSource::Wgsl(
                concat!(
                    include_str!("../../assets/shaders/fullscreen.wgsl"),
                    include_str!("../../assets/shaders/linearize_depth.wgsl")
                )
                .into(),
            ),
        });
        let hbao_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("HBAO Shader"),
            source: wgpu::ShaderSource::Wgsl(
                concat!(
                    include_str!("../../assets/shaders/fullscreen.wgsl"),
                    include_str!("../../assets/shaders/hbao.wgsl")
                )
                .into(),
            ),
        });
        let blur_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("AO Blur Shader"),
            source: wgpu::ShaderSource::Wgsl(
                concat!(
                    include_str!("../../assets/shaders/fullscreen.wgsl"),
                    include_str!("../../assets/shaders/hbao_blur.wgsl")
                )
                .into(),
            ),
        });
        let linearize_pipeline = fullscreen_pipeline(
            device,
            "AO Linearize Pipeline",
            &linearize_shader,
            "fs_linearize",
            &[&linearize_layout],
            LINEAR_DEPTH_FORMAT,
        );
        let hbao_pipeline =
            fullscreen_pipeline(device, "HBAO Pipeline", &hbao_shader, "fs_hbao", &[&hbao_layout], AO_FORMAT);
        let blur_pipeline =
            fullscreen_pipeline(device, "AO Blur Pipeline", &blur_shader, "fs_blur", &[&blur_layout], AO_FORMAT);

        let uniform_buffer = |label: &str, size: usize| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: size as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let linearize_buffer = uniform_buffer("AO Linearize Uniform", size_of::<LinearizeUniform>());
        let hbao_buffer = uniform_buffer("HBAO Uniform", size_of::<HbaoUniform>());
        let blur_horizontal_buffer = uniform_buffer("AO Blur Horizontal Uniform", size_of::<BlurUniform>());
        let blur_vertical_buffer = uniform_buffer("AO Blur Vertical Uniform", size_of::<BlurUniform>());

        let (jitter_texture, jitter_view) = upload_jitter_tile(ctx);
        let (fallback_texture, fallback_view) = create_fallback(ctx);

        Self {
            linearize_pipeline,
            hbao_pipeline,
            blur_pipeline,
            linearize_layout,
            hbao_layout,
            blur_layout,
            linearize_buffer,
            hbao_buffer,
            blur_horizontal_buffer,
            blur_vertical_buffer,
            _jitter_texture: jitter_texture,
            jitter_view,
            fallback_texture,
            fallback_view,
            bind_groups: None,
            parameters: parameters.clamped(),
            enabled,
        }
    }

    pub fn set_parameters(&mut self, parameters: HbaoParameters) {
        self.parameters = parameters.clamped();
    }

    pub fn parameters(&self) -> HbaoParameters {
        self.parameters
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Records the AO chain and reports which texture the lighting pass should sample.
    pub fn render_ao(
        &mut self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        targets: &RenderTargetManager,
        viewport: &ViewportTargets,
        projection: &AoProjection,
        blur: bool,
    ) -> Result<AoSource> {
        if !self.enabled {
            return Ok(AoSource::Fallback);
        }
        let (width, height) = viewport.size();
        let queue = &ctx.queue;
        queue.write_buffer(
            &self.linearize_buffer,
            0,
            bytemuck::bytes_of(&LinearizeUniform::new(projection.near, projection.far, projection.is_perspective())),
        );
        queue.write_buffer(
            &self.hbao_buffer,
            0,
            bytemuck::bytes_of(&HbaoUniform::new(&self.parameters, projection, width, height)),
        );
        let sharpness = self.parameters.blur_sharpness;
        queue.write_buffer(
            &self.blur_horizontal_buffer,
            0,
            bytemuck::bytes_of(&BlurUniform::horizontal(width, sharpness)),
        );
        queue.write_buffer(&self.blur_vertical_buffer, 0, bytemuck::bytes_of(&BlurUniform::vertical(height, sharpness)));

        self.ensure_bind_groups(ctx, targets, viewport)?;
        let groups = self.bind_groups.as_ref().context("AO bind groups missing")?;

        fullscreen_draw(
            encoder,
            "AO Linearize Pass",
            targets.view(viewport.ao.linear_depth)?,
            &self.linearize_pipeline,
            &[&groups.linearize],
        );
        fullscreen_draw(
            encoder,
            "HBAO Pass",
            targets.view(viewport.ao.raw_ao)?,
            &self.hbao_pipeline,
            &[&groups.hbao],
        );
        if !blur {
            return Ok(AoSource::Raw);
        }
        fullscreen_draw(
            encoder,
            "AO Blur Horizontal Pass",
            targets.view(viewport.ao.temp)?,
            &self.blur_pipeline,
            &[&groups.blur_horizontal],
        );
        fullscreen_draw(
            encoder,
            "AO Blur Vertical Pass",
            targets.view(viewport.ao.blurred_ao)?,
            &self.blur_pipeline,
            &[&groups.blur_vertical],
        );
        Ok(AoSource::Blurred)
    }

    /// Resolves `source` to the view the lighting and composite passes bind.
    pub fn view<'a>(
        &'a self,
        source: AoSource,
        targets: &'a RenderTargetManager,
        viewport: &ViewportTargets,
    ) -> PipelineResult<&'a wgpu::TextureView> {
        match source {
            AoSource::Blurred => targets.view(viewport.ao.blurred_ao),
            AoSource::Raw => targets.view(viewport.ao.raw_ao),
            AoSource::Fallback => Ok(&self.fallback_view),
        }
    }

    pub fn fallback_texture(&self) -> &wgpu::Texture {
        &self.fallback_texture
    }

    fn ensure_bind_groups(
        &mut self,
        ctx: &GpuContext,
        targets: &RenderTargetManager,
        viewport: &ViewportTargets,
    ) -> Result<()> {
        let key = viewport.handles();
        if self.bind_groups.as_ref().is_some_and(|groups| groups.key == key) {
            return Ok(());
        }
        let device = &ctx.device;
        let ao_depth = targets.view(viewport.ao.linear_depth)?;
        let blur_group = |label: &str, buffer: &wgpu::Buffer, input: &wgpu::TextureView| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &self.blur_layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: buffer.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(input) },
                    wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::TextureView(ao_depth) },
                ],
            })
        };
        let linearize = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("AO Linearize BG"),
            layout: &self.linearize_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: self.linearize_buffer.as_entire_binding() },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(targets.sample_view(viewport.gbuffer.depth)?),
                },
            ],
        });
        let hbao = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("HBAO BG"),
            layout: &self.hbao_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: self.hbao_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(ao_depth) },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(targets.view(viewport.gbuffer.normal)?),
                },
                wgpu::BindGroupEntry { binding: 3, resource: wgpu::BindingResource::TextureView(&self.jitter_view) },
            ],
        });
        let blur_horizontal =
            blur_group("AO Blur Horizontal BG", &self.blur_horizontal_buffer, targets.view(viewport.ao.raw_ao)?);
        let blur_vertical =
            blur_group("AO Blur Vertical BG", &self.blur_vertical_buffer, targets.view(viewport.ao.temp)?);
        self.bind_groups = Some(AoBindGroups { key, linearize, hbao, blur_horizontal, blur_vertical });
        tracing::debug!(generation = viewport.targets_generation(), "AO bind groups rebuilt");
        Ok(())
    }
}

fn upload_jitter_tile(ctx: &GpuContext) -> (wgpu::Texture, wgpu::TextureView) {
    let size = wgpu::Extent3d {
        width: AO_RANDOMTEX_SIZE as u32,
        height: AO_RANDOMTEX_SIZE as u32,
        depth_or_array_layers: 1,
    };
    let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("HBAO Jitter Tile"),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba32Float,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let texels: Vec<[f32; 4]> = default_jitter_tile().iter().map(|v| v.to_array()).collect();
    ctx.queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        bytemuck::cast_slice(&texels),
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(AO_RANDOMTEX_SIZE as u32 * 16),
            rows_per_image: Some(AO_RANDOMTEX_SIZE as u32),
        },
        size,
    );
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

fn create_fallback(ctx: &GpuContext) -> (wgpu::Texture, wgpu::TextureView) {
    let size = wgpu::Extent3d { width: 1, height: 1, depth_or_array_layers: 1 };
    let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("AO Fallback"),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: AO_FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    ctx.queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        &[255],
        wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(1), rows_per_image: Some(1) },
        size,
    );
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}
