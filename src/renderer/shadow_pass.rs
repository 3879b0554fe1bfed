use anyhow::{anyhow, Context, Result};
use glam::Mat4;
use std::mem::size_of;

use super::render_targets::{RenderTargetDesc, RenderTargetHandle, RenderTargetManager};
use super::{DynamicUniforms, GpuContext, RasterScope, RasterState, SHADOW_DEPTH_FORMAT};
use crate::cascade::Cascade;
use crate::config::ShadowConfig;
use crate::error::PipelineResult;
use crate::mesh::{GpuMesh, MeshVertex};

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct ShadowDrawUniform {
    light_model_view_proj: [[f32; 4]; 4],
    /// x: 1.0 when the shader must clamp depth itself.
    params: [f32; 4],
}

/// Renders caster depth into one layer of the cascade shadow array per cascade.
pub struct ShadowPass {
    pipeline: wgpu::RenderPipeline,
    draw_layout: wgpu::BindGroupLayout,
    draws: DynamicUniforms,
    staging: Vec<ShadowDrawUniform>,
    map: Option<RenderTargetHandle>,
    resolution: u32,
    layers: u32,
    caster_count: usize,
    prepared_cascades: usize,
    raster: RasterState,
}

impl ShadowPass {
    pub fn new(ctx: &GpuContext, targets: &mut RenderTargetManager, config: &ShadowConfig) -> Result<Self> {
        let device = &ctx.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Shadow Depth Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../assets/shaders/shadow_depth.wgsl").into()),
        });
        let draw_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Shadow Draw BGL"),
            entries: &[DynamicUniforms::layout_entry(
                0,
                wgpu::ShaderStages::VERTEX,
                size_of::<ShadowDrawUniform>() as u64,
            )],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Shadow Pipeline Layout"),
            bind_group_layouts: &[&draw_layout],
            push_constant_ranges: &[],
        });
        let hardware_clamp = ctx.supports_depth_clamp;
        let raster = RasterState::shadow(hardware_clamp);
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Shadow Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[MeshVertex::layout()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: None,
            primitive: raster.primitive_state(),
            depth_stencil: Some(wgpu::DepthStencilState {
                format: SHADOW_DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState { constant: 2, slope_scale: 2.0, clamp: 0.0 },
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        if !hardware_clamp {
            tracing::info!("depth clip control unavailable; shadow shader clamps caster depth");
        }
        let draws = DynamicUniforms::new(device, &draw_layout, "Shadow Draw", size_of::<ShadowDrawUniform>() as u64);

        let mut pass = Self {
            pipeline,
            draw_layout,
            draws,
            staging: Vec::new(),
            map: None,
            resolution: 0,
            layers: 0,
            caster_count: 0,
            prepared_cascades: 0,
            raster,
        };
        pass.configure(targets, config)?;
        Ok(pass)
    }

    /// Recreates the shadow array when the resolution or cascade count changes.
    /// Disabled shadows keep a 1x1 placeholder so the lighting inputs stay bound.
    pub fn configure(&mut self, targets: &mut RenderTargetManager, config: &ShadowConfig) -> PipelineResult<()> {
        let (resolution, layers) =
            if config.enabled { (config.resolution.max(1), config.cascade_count.max(1)) } else { (1, 1) };
        if self.map.is_some_and(|handle| targets.is_live(handle))
            && resolution == self.resolution
            && layers == self.layers
        {
            return Ok(());
        }
        if let Some(handle) = self.map.take() {
            targets.destroy_render_target(handle)?;
        }
        let desc = RenderTargetDesc::new(
            "Shadow Cascade Array",
            resolution,
            resolution,
            SHADOW_DEPTH_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        )
        .with_layers(layers);
        self.map = Some(targets.create_render_target(desc)?);
        self.resolution = resolution;
        self.layers = layers;
        tracing::debug!(resolution, layers, "shadow cascade array allocated");
        Ok(())
    }

    pub fn map_handle(&self) -> Option<RenderTargetHandle> {
        self.map
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn layer_count(&self) -> u32 {
        self.layers
    }

    /// Writes one light-space matrix per (cascade, caster) pair before any pass is recorded.
    pub fn prepare(&mut self, ctx: &GpuContext, cascades: &[Cascade], caster_transforms: &[Mat4]) {
        let clamp_flag = if self.raster.depth_clamp { 0.0 } else { 1.0 };
        self.staging.clear();
        for cascade in cascades {
            let light_view_proj = cascade.view_projection();
            for model in caster_transforms {
                self.staging.push(ShadowDrawUniform {
                    light_model_view_proj: (light_view_proj * *model).to_cols_array_2d(),
                    params: [clamp_flag, 0.0, 0.0, 0.0],
                });
            }
        }
        self.caster_count = caster_transforms.len();
        self.prepared_cascades = cascades.len();
        self.draws.write(&ctx.device, &ctx.queue, &self.draw_layout, &self.staging);
    }

    /// Opens the depth pass for `cascade_index`. The returned guard restores the default
    /// raster state when it ends or is dropped.
    pub fn begin<'a>(
        &'a self,
        encoder: &'a mut wgpu::CommandEncoder,
        cascade_index: usize,
        raster: &'a mut RasterState,
        targets: &RenderTargetManager,
    ) -> Result<ShadowCascadePass<'a>> {
        if cascade_index >= self.prepared_cascades || cascade_index >= self.layers as usize {
            return Err(anyhow!(
                "Shadow cascade {cascade_index} not prepared ({} cascades, {} layers)",
                self.prepared_cascades,
                self.layers
            ));
        }
        let handle = self.map.context("Shadow cascade array missing")?;
        let target = targets.target(handle)?;
        let layer_view = target
            .layer_view(cascade_index)
            .with_context(|| format!("Shadow cascade layer {cascade_index} missing"))?;
        let raster = RasterScope::enter(raster, self.raster);
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Shadow Pass"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: layer_view,
                depth_ops: Some(wgpu::Operations { load: wgpu::LoadOp::Clear(1.0), store: wgpu::StoreOp::Store }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        let size = self.resolution as f32;
        pass.set_viewport(0.0, 0.0, size, size, 0.0, 1.0);
        pass.set_scissor_rect(0, 0, self.resolution, self.resolution);
        pass.set_pipeline(&self.pipeline);
        Ok(ShadowCascadePass {
            pass,
            _raster: raster,
            draws: &self.draws,
            base: cascade_index * self.caster_count,
            caster_count: self.caster_count,
            draw_count: 0,
        })
    }
}

/// Scoped shadow render pass for a single cascade. Ending or dropping it restores the
/// default raster state.
pub struct ShadowCascadePass<'a> {
    pass: wgpu::RenderPass<'a>,
    _raster: RasterScope<'a>,
    draws: &'a DynamicUniforms,
    base: usize,
    caster_count: usize,
    draw_count: usize,
}

impl ShadowCascadePass<'_> {
    /// Draws the `caster_index`-th caster handed to [`ShadowPass::prepare`].
    pub fn draw(&mut self, mesh: &GpuMesh, caster_index: usize) {
        if caster_index >= self.caster_count || mesh.index_count == 0 {
            return;
        }
        let offset = self.draws.offset(self.base + caster_index);
        self.pass.set_bind_group(0, self.draws.bind_group(), &[offset]);
        self.pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
        self.pass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
        self.pass.draw_indexed(0..mesh.index_count, 0, 0..1);
        self.draw_count += 1;
    }

    pub fn end(self) -> usize {
        self.draw_count
    }
}
