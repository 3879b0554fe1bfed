use anyhow::{Context, Result};
use std::mem::size_of;

use super::ao_pass::AoSource;
use super::render_targets::{RenderTargetHandle, RenderTargetManager, ViewportTargets};
use super::{
    fullscreen_draw, fullscreen_pipeline, sampler_entry, texture_entry, uniform_entry, view_entry, DebugOverlay,
    GpuContext,
};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CompositeUniform {
    pub exposure: f32,
    pub overlay: u32,
    /// Linear depth mapped to white by the depth overlay.
    pub depth_range: f32,
    pub encode_srgb: u32,
}

impl CompositeUniform {
    pub fn new(exposure: f32, overlay: DebugOverlay, depth_range: f32, output_format: wgpu::TextureFormat) -> Self {
        Self {
            exposure: exposure.max(0.0),
            overlay: overlay.shader_code(),
            depth_range: depth_range.max(f32::EPSILON),
            encode_srgb: u32::from(!output_format.is_srgb()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeBindKey {
    pub viewport: [RenderTargetHandle; 10],
    pub ao: AoSource,
}

/// Tone maps the lit HDR color into the output view, or shows a debug overlay instead.
pub struct CompositePass {
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    ao_sampler: wgpu::Sampler,
    output_format: wgpu::TextureFormat,
    bind_group: Option<(CompositeBindKey, wgpu::BindGroup)>,
}

impl CompositePass {
    pub fn new(ctx: &GpuContext, output_format: wgpu::TextureFormat) -> Self {
        let device = &ctx.device;
        let unfilterable = wgpu::TextureSampleType::Float { filterable: false };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Composite BGL"),
            entries: &[
                uniform_entry(0),
                texture_entry(1, unfilterable),
                texture_entry(2, unfilterable),
                texture_entry(3, wgpu::TextureSampleType::Float { filterable: true }),
                sampler_entry(4, wgpu::SamplerBindingType::Filtering),
            ],
        });
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Composite Shader"),
            source: wgpu::ShaderSource::Wgsl(
                concat!(
                    include_str!("../../assets/shaders/fullscreen.wgsl"),
                    include_str!("../../assets/shaders/composite.wgsl")
                )
                .into(),
            ),
        });
        let pipeline =
            fullscreen_pipeline(device, "Composite Pipeline", &shader, "fs_composite", &[&layout], output_format);
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Composite Uniform"),
            size: size_of::<CompositeUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let ao_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Composite AO Sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        Self { pipeline, layout, uniform_buffer, ao_sampler, output_format, bind_group: None }
    }

    pub fn output_format(&self) -> wgpu::TextureFormat {
        self.output_format
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw(
        &mut self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        targets: &RenderTargetManager,
        viewport: &ViewportTargets,
        ao_view: &wgpu::TextureView,
        key: CompositeBindKey,
        uniform: &CompositeUniform,
        output: &wgpu::TextureView,
    ) -> Result<()> {
        ctx.queue.write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(uniform));
        if self.bind_group.as_ref().is_none_or(|(cached, _)| *cached != key) {
            let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Composite BG"),
                layout: &self.layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: self.uniform_buffer.as_entire_binding() },
                    view_entry(1, targets.view(viewport.lit_color)?),
                    view_entry(2, targets.view(viewport.gbuffer.linear_depth)?),
                    view_entry(3, ao_view),
                    wgpu::BindGroupEntry { binding: 4, resource: wgpu::BindingResource::Sampler(&self.ao_sampler) },
                ],
            });
            self.bind_group = Some((key, bind_group));
        }
        let (_, bind_group) = self.bind_group.as_ref().context("Composite bind group missing")?;
        fullscreen_draw(encoder, "Composite Pass", output, &self.pipeline, &[bind_group]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_outputs_skip_manual_encoding() {
        let srgb = CompositeUniform::new(1.0, DebugOverlay::None, 100.0, wgpu::TextureFormat::Bgra8UnormSrgb);
        assert_eq!(srgb.encode_srgb, 0);
        let linear = CompositeUniform::new(1.0, DebugOverlay::Ao, 100.0, wgpu::TextureFormat::Rgba8Unorm);
        assert_eq!(linear.encode_srgb, 1);
        assert_eq!(linear.overlay, 2);
        assert_eq!(size_of::<CompositeUniform>(), 16);
    }
}
