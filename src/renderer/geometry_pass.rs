use anyhow::{Context, Result};
use glam::{Mat3, Mat4};
use std::mem::size_of;

use super::render_targets::{GBuffer, RenderTargetManager};
use super::{
    DynamicUniforms, GpuContext, RasterState, ALBEDO_FORMAT, AO_METAL_ROUGH_FORMAT, GBUFFER_DEPTH_FORMAT,
    LINEAR_DEPTH_FORMAT, NORMAL_FORMAT,
};
use crate::camera::Camera3D;
use crate::material::MaterialRegistry;
use crate::mesh::{GpuMesh, MeshVertex};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GeometryDrawUniform {
    pub model_view: [[f32; 4]; 4],
    pub normal_matrix: [[f32; 4]; 4],
    pub model_view_proj: [[f32; 4]; 4],
}

impl GeometryDrawUniform {
    pub fn new(view: Mat4, projection: Mat4, model: Mat4) -> Self {
        let model_view = view * model;
        Self {
            model_view: model_view.to_cols_array_2d(),
            normal_matrix: Mat4::from_mat3(normal_matrix(model_view)).to_cols_array_2d(),
            model_view_proj: (projection * model_view).to_cols_array_2d(),
        }
    }
}

/// Inverse-transpose of the upper 3x3, so normals stay perpendicular under non-uniform scale.
pub fn normal_matrix(model_view: Mat4) -> Mat3 {
    let upper = Mat3::from_mat4(model_view);
    if upper.determinant().abs() <= f32::EPSILON {
        return upper;
    }
    upper.inverse().transpose()
}

/// A resolved draw: every handle has already been checked against the registries.
pub struct GeometryDraw<'a> {
    pub mesh: &'a GpuMesh,
    pub material: &'a wgpu::BindGroup,
}

/// Rasterizes opaque geometry into the G-buffer.
pub struct GeometryPass {
    pipeline: wgpu::RenderPipeline,
    draw_layout: wgpu::BindGroupLayout,
    material_layout: wgpu::BindGroupLayout,
    draws: DynamicUniforms,
    staging: Vec<GeometryDrawUniform>,
}

impl GeometryPass {
    pub fn new(ctx: &GpuContext) -> Self {
        let device = &ctx.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("GBuffer Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../assets/shaders/gbuffer.wgsl").into()),
        });
        let draw_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("GBuffer Draw BGL"),
            entries: &[DynamicUniforms::layout_entry(
                0,
                wgpu::ShaderStages::VERTEX,
                size_of::<GeometryDrawUniform>() as u64,
            )],
        });
        let material_layout = MaterialRegistry::bind_group_layout(device);
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("GBuffer Pipeline Layout"),
            bind_group_layouts: &[&draw_layout, &material_layout],
            push_constant_ranges: &[],
        });
        let color_targets = [
            Some(wgpu::ColorTargetState {
                format: ALBEDO_FORMAT,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            }),
            Some(wgpu::ColorTargetState {
                format: NORMAL_FORMAT,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            }),
            Some(wgpu::ColorTargetState {
                format: AO_METAL_ROUGH_FORMAT,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            }),
            Some(wgpu::ColorTargetState {
                format: LINEAR_DEPTH_FORMAT,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            }),
        ];
        let raster = RasterState::default();
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("GBuffer Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[MeshVertex::layout()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &color_targets,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: raster.primitive_state(),
            depth_stencil: Some(wgpu::DepthStencilState {
                format: GBUFFER_DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        let draws =
            DynamicUniforms::new(device, &draw_layout, "GBuffer Draw", size_of::<GeometryDrawUniform>() as u64);
        Self { pipeline, draw_layout, material_layout, draws, staging: Vec::new() }
    }

    pub fn material_layout(&self) -> &wgpu::BindGroupLayout {
        &self.material_layout
    }

    /// Uploads per-draw transforms; `transforms[i]` belongs to the i-th draw passed to [`Self::render`].
    pub fn prepare(&mut self, ctx: &GpuContext, camera: &Camera3D, transforms: &[Mat4]) {
        let view = camera.view();
        let projection = camera.projection();
        self.staging.clear();
        self.staging.extend(transforms.iter().map(|model| GeometryDrawUniform::new(view, projection, *model)));
        self.draws.write(&ctx.device, &ctx.queue, &self.draw_layout, &self.staging);
    }

    pub fn render(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        targets: &RenderTargetManager,
        gbuffer: &GBuffer,
        draws: &[GeometryDraw<'_>],
    ) -> Result<usize> {
        let clear = |color: wgpu::Color| wgpu::Operations { load: wgpu::LoadOp::Clear(color), store: wgpu::StoreOp::Store };
        let albedo = targets.view(gbuffer.albedo).context("GBuffer albedo target")?;
        let normal = targets.view(gbuffer.normal).context("GBuffer normal target")?;
        let amr = targets.view(gbuffer.ao_metal_rough).context("GBuffer ao/metal/rough target")?;
        let linear_depth = targets.view(gbuffer.linear_depth).context("GBuffer linear depth target")?;
        let depth = targets.view(gbuffer.depth).context("GBuffer depth target")?;

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("GBuffer Pass"),
            color_attachments: &[
                Some(wgpu::RenderPassColorAttachment {
                    view: albedo,
                    depth_slice: None,
                    resolve_target: None,
                    ops: clear(wgpu::Color::TRANSPARENT),
                }),
                Some(wgpu::RenderPassColorAttachment {
                    view: normal,
                    depth_slice: None,
                    resolve_target: None,
                    ops: clear(wgpu::Color { r: 0.0, g: 0.0, b: 1.0, a: 0.0 }),
                }),
                Some(wgpu::RenderPassColorAttachment {
                    view: amr,
                    depth_slice: None,
                    resolve_target: None,
                    ops: clear(wgpu::Color { r: 1.0, g: 0.0, b: 1.0, a: 0.0 }),
                }),
                // Zero linear depth marks background pixels for the later passes.
                Some(wgpu::RenderPassColorAttachment {
                    view: linear_depth,
                    depth_slice: None,
                    resolve_target: None,
                    ops: clear(wgpu::Color::TRANSPARENT),
                }),
            ],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: depth,
                depth_ops: Some(wgpu::Operations { load: wgpu::LoadOp::Clear(1.0), store: wgpu::StoreOp::Store }),
                stencil_ops: Some(wgpu::Operations { load: wgpu::LoadOp::Clear(0), store: wgpu::StoreOp::Store }),
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&self.pipeline);
        let mut drawn = 0;
        for (index, draw) in draws.iter().enumerate().take(self.staging.len()) {
            if draw.mesh.index_count == 0 {
                continue;
            }
            pass.set_bind_group(0, self.draws.bind_group(), &[self.draws.offset(index)]);
            pass.set_bind_group(1, draw.material, &[]);
            pass.set_vertex_buffer(0, draw.mesh.vertex_buffer.slice(..));
            pass.set_index_buffer(draw.mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(0..draw.mesh.index_count, 0, 0..1);
            drawn += 1;
        }
        Ok(drawn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn normal_matrix_keeps_normals_perpendicular_under_non_uniform_scale() {
        let model_view = Mat4::from_scale(Vec3::new(4.0, 1.0, 1.0)) * Mat4::from_rotation_z(0.5);
        let tangent = Vec3::new(1.0, 1.0, 0.0).normalize();
        let normal = Vec3::new(-1.0, 1.0, 0.0).normalize();
        let tangent_out = model_view.transform_vector3(tangent);
        let normal_out = normal_matrix(model_view) * normal;
        assert!(tangent_out.dot(normal_out).abs() < 1e-5);

        let naive = Mat3::from_mat4(model_view) * normal;
        assert!(tangent_out.dot(naive).abs() > 0.1);
    }

    #[test]
    fn draw_uniform_composes_view_before_model() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let projection = Mat4::perspective_rh(1.0, 1.0, 0.1, 50.0);
        let model = Mat4::from_translation(Vec3::new(0.0, 0.0, -2.0));
        let uniform = GeometryDrawUniform::new(view, projection, model);
        let model_view = Mat4::from_cols_array_2d(&uniform.model_view);
        let origin = model_view.transform_point3(Vec3::ZERO);
        assert!((origin.z + 7.0).abs() < 1e-5);
        let rigid_normal = Mat4::from_cols_array_2d(&uniform.normal_matrix);
        assert!((rigid_normal.transform_vector3(Vec3::Y) - Vec3::Y).length() < 1e-5);
    }
}
