use anyhow::{Context, Result};
use glam::{Mat4, Vec3};
use std::mem::size_of;

use super::ao_pass::AoSource;
use super::render_targets::{RenderTargetHandle, RenderTargetManager, ViewportTargets};
use super::{
    fullscreen_draw, fullscreen_pipeline, sampler_entry, texture_entry, texture_entry_with_dimension,
    uniform_entry, view_entry, GpuContext, LIT_COLOR_FORMAT,
};
use crate::camera::Camera3D;
use crate::cascade::{Cascade, MAX_SHADOW_CASCADES};
use crate::config::ShadowConfig;
use crate::environment::EnvironmentGpu;
use crate::hbao::AoProjection;
use crate::scene::DirectionalLight;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LightingFlags: u32 {
        const IBL = 1;
        const SHADOWS = 1 << 1;
        const PCF_LERP = 1 << 2;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightingUniform {
    pub inv_view: [[f32; 4]; 4],
    pub cascade_view_proj: [[[f32; 4]; 4]; MAX_SHADOW_CASCADES],
    pub cascade_splits: [f32; 4],
    pub proj_info: [f32; 4],
    pub light_direction: [f32; 4],
    pub light_color: [f32; 4],
    pub ambient_color: [f32; 4],
    pub shadow_params: [f32; 4],
    pub flags: u32,
    pub cascade_count: u32,
    pub proj_ortho: u32,
    pub _padding: u32,
}

/// Per-frame state the lighting uniform is built from.
pub struct LightingInputs<'a> {
    pub camera: &'a Camera3D,
    pub light: &'a DirectionalLight,
    pub cascades: &'a [Cascade],
    pub shadow: &'a ShadowConfig,
    pub shadow_resolution: u32,
    pub ambient_color: Vec3,
    /// Mip count of the prefiltered specular cube, `None` without an environment.
    pub specular_mip_count: Option<u32>,
}

impl LightingUniform {
    pub fn new(inputs: &LightingInputs<'_>) -> Self {
        let view = inputs.camera.view();
        let light_dir = view.transform_vector3(inputs.light.direction).normalize_or_zero();
        let cascade_count = inputs.cascades.len().min(MAX_SHADOW_CASCADES);

        let mut cascade_view_proj = [Mat4::IDENTITY.to_cols_array_2d(); MAX_SHADOW_CASCADES];
        let mut cascade_splits = [0.0; 4];
        for (index, cascade) in inputs.cascades.iter().take(cascade_count).enumerate() {
            cascade_view_proj[index] = cascade.view_projection().to_cols_array_2d();
            cascade_splits[index] = cascade.far_split;
        }

        let mut flags = LightingFlags::empty();
        let strength = inputs.shadow.strength.clamp(0.0, 1.0);
        if inputs.shadow.enabled && cascade_count > 0 && strength > 0.0 {
            flags |= LightingFlags::SHADOWS;
        }
        let pcf = inputs.shadow.pcf.clamped();
        if pcf.use_lerp_filtering {
            flags |= LightingFlags::PCF_LERP;
        }
        if inputs.specular_mip_count.is_some() {
            flags |= LightingFlags::IBL;
        }

        let projection = AoProjection::from_camera(inputs.camera);
        let color = inputs.light.color;
        Self {
            inv_view: view.inverse().to_cols_array_2d(),
            cascade_view_proj,
            cascade_splits,
            proj_info: projection.proj_info().to_array(),
            light_direction: light_dir.extend(inputs.light.intensity.max(0.0)).to_array(),
            light_color: [color.x, color.y, color.z, strength],
            ambient_color: inputs.ambient_color.extend(inputs.specular_mip_count.unwrap_or(1) as f32).to_array(),
            shadow_params: [
                inputs.shadow.bias.max(0.0),
                1.0 / inputs.shadow_resolution.max(1) as f32,
                pcf.samples_x as f32,
                pcf.samples_y as f32,
            ],
            flags: flags.bits(),
            cascade_count: cascade_count as u32,
            proj_ortho: u32::from(!projection.is_perspective()),
            _padding: 0,
        }
    }

    pub fn flags(&self) -> LightingFlags {
        LightingFlags::from_bits_truncate(self.flags)
    }
}

/// Everything the cached input bind group depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightingBindKey {
    pub viewport: [RenderTargetHandle; 10],
    pub ao: AoSource,
    pub shadow_map: RenderTargetHandle,
}

/// 1x1 black cubes and LUT bound while no environment is loaded.
struct PlaceholderEnvironment {
    _textures: [wgpu::Texture; 2],
    bind_group: wgpu::BindGroup,
}

/// Full-screen Cook-Torrance shading of the G-buffer into the HDR lit color target.
pub struct LightingPass {
    pipeline: wgpu::RenderPipeline,
    input_layout: wgpu::BindGroupLayout,
    environment_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    ao_sampler: wgpu::Sampler,
    shadow_sampler: wgpu::Sampler,
    placeholder: PlaceholderEnvironment,
    environment_bind_group: Option<wgpu::BindGroup>,
    input_bind_group: Option<(LightingBindKey, wgpu::BindGroup)>,
}

impl LightingPass {
    pub fn new(ctx: &GpuContext) -> Self {
        let device = &ctx.device;
        let unfilterable = wgpu::TextureSampleType::Float { filterable: false };
        let input_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Lighting Input BGL"),
            entries: &[
                uniform_entry(0),
                texture_entry(1, unfilterable),
                texture_entry(2, unfilterable),
                texture_entry(3, unfilterable),
                texture_entry(4, unfilterable),
                texture_entry(5, wgpu::TextureSampleType::Float { filterable: true }),
                sampler_entry(6, wgpu::SamplerBindingType::Filtering),
                texture_entry_with_dimension(7, wgpu::TextureSampleType::Depth, wgpu::TextureViewDimension::D2Array),
                sampler_entry(8, wgpu::SamplerBindingType::Comparison),
            ],
        });
        let filterable = wgpu::TextureSampleType::Float { filterable: true };
        let environment_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Lighting Environment BGL"),
            entries: &[
                texture_entry_with_dimension(0, filterable, wgpu::TextureViewDimension::Cube),
                texture_entry_with_dimension(1, filterable, wgpu::TextureViewDimension::Cube),
                texture_entry(2, filterable),
                sampler_entry(3, wgpu::SamplerBindingType::Filtering),
            ],
        });
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Deferred Lighting Shader"),
            source: wgpu::ShaderSource::Wgsl(
                concat!(
                    include_str!("../../assets/shaders/fullscreen.wgsl"),
                    include_str!("../../assets/shaders/deferred_lighting.wgsl")
                )
                .into(),
            ),
        });
        let pipeline = fullscreen_pipeline(
            device,
            "Deferred Lighting Pipeline",
            &shader,
            "fs_lighting",
            &[&input_layout, &environment_layout],
            LIT_COLOR_FORMAT,
        );
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Lighting Uniform"),
            size: size_of::<LightingUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let ao_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Lighting AO Sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let shadow_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Shadow Comparison Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            compare: Some(wgpu::CompareFunction::LessEqual),
            ..Default::default()
        });
        let placeholder = create_placeholder_environment(device, &environment_layout);
        Self {
            pipeline,
            input_layout,
            environment_layout,
            uniform_buffer,
            ao_sampler,
            shadow_sampler,
            placeholder,
            environment_bind_group: None,
            input_bind_group: None,
        }
    }

    /// Binds `environment` for image-based lighting, or the black placeholder when `None`.
    pub fn set_environment(&mut self, device: &wgpu::Device, environment: Option<&EnvironmentGpu>) {
        self.environment_bind_group = environment.map(|env| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Lighting Environment BG"),
                layout: &self.environment_layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(env.diffuse_view()) },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(env.specular_view()),
                    },
                    wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::TextureView(env.brdf_view()) },
                    wgpu::BindGroupEntry { binding: 3, resource: wgpu::BindingResource::Sampler(env.sampler()) },
                ],
            })
        });
    }

    pub fn has_environment(&self) -> bool {
        self.environment_bind_group.is_some()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_lighting(
        &mut self,
        ctx: &GpuContext,
        encoder: &mut wgpu::CommandEncoder,
        targets: &RenderTargetManager,
        viewport: &ViewportTargets,
        ao_view: &wgpu::TextureView,
        key: LightingBindKey,
        uniform: &LightingUniform,
    ) -> Result<()> {
        ctx.queue.write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(uniform));
        if self.input_bind_group.as_ref().is_none_or(|(cached, _)| *cached != key) {
            let bind_group = self.build_input_bind_group(ctx, targets, viewport, ao_view, key.shadow_map)?;
            self.input_bind_group = Some((key, bind_group));
            tracing::debug!(ao = ?key.ao, "lighting bind group rebuilt");
        }
        let (_, input_group) = self.input_bind_group.as_ref().context("Lighting bind group missing")?;
        let environment_group = self.environment_bind_group.as_ref().unwrap_or(&self.placeholder.bind_group);
        fullscreen_draw(
            encoder,
            "Deferred Lighting Pass",
            targets.view(viewport.lit_color)?,
            &self.pipeline,
            &[input_group, environment_group],
        );
        Ok(())
    }

    fn build_input_bind_group(
        &self,
        ctx: &GpuContext,
        targets: &RenderTargetManager,
        viewport: &ViewportTargets,
        ao_view: &wgpu::TextureView,
        shadow_map: RenderTargetHandle,
    ) -> Result<wgpu::BindGroup> {
        let gbuffer = &viewport.gbuffer;
        let shadow = targets.target(shadow_map).context("Shadow cascade array unavailable")?;
        Ok(ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Lighting Input BG"),
            layout: &self.input_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: self.uniform_buffer.as_entire_binding() },
                view_entry(1, targets.view(gbuffer.albedo)?),
                view_entry(2, targets.view(gbuffer.normal)?),
                view_entry(3, targets.view(gbuffer.ao_metal_rough)?),
                view_entry(4, targets.view(gbuffer.linear_depth)?),
                view_entry(5, ao_view),
                wgpu::BindGroupEntry { binding: 6, resource: wgpu::BindingResource::Sampler(&self.ao_sampler) },
                view_entry(7, shadow.array_view()),
                wgpu::BindGroupEntry { binding: 8, resource: wgpu::BindingResource::Sampler(&self.shadow_sampler) },
            ],
        }))
    }
}

fn create_placeholder_environment(device: &wgpu::Device, layout: &wgpu::BindGroupLayout) -> PlaceholderEnvironment {
    let texture = |label: &str, layers: u32| {
        device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d { width: 1, height: 1, depth_or_array_layers: layers },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba16Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        })
    };
    let cube = texture("Placeholder Environment Cube", 6);
    let lut = texture("Placeholder BRDF LUT", 1);
    let cube_view = cube.create_view(&wgpu::TextureViewDescriptor {
        dimension: Some(wgpu::TextureViewDimension::Cube),
        ..Default::default()
    });
    let lut_view = lut.create_view(&wgpu::TextureViewDescriptor::default());
    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("Placeholder Environment Sampler"),
        ..Default::default()
    });
    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("Placeholder Environment BG"),
        layout,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&cube_view) },
            wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(&cube_view) },
            wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::TextureView(&lut_view) },
            wgpu::BindGroupEntry { binding: 3, resource: wgpu::BindingResource::Sampler(&sampler) },
        ],
    });
    PlaceholderEnvironment { _textures: [cube, lut], bind_group }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::build_cascades;

    fn camera() -> Camera3D {
        Camera3D::new(Vec3::new(0.0, 3.0, 10.0), Vec3::ZERO, 50f32.to_radians(), 0.1, 80.0).with_aspect(1.5)
    }

    #[test]
    fn uniform_matches_shader_layout() {
        assert_eq!(size_of::<LightingUniform>(), 432);
    }

    #[test]
    fn flags_follow_shadow_and_environment_state() {
        let camera = camera();
        let light = DirectionalLight::default();
        let shadow = ShadowConfig::default();
        let cascades = build_cascades(&camera, light.direction, 4, shadow.split_lambda, true, 2048, None).unwrap();
        let inputs = LightingInputs {
            camera: &camera,
            light: &light,
            cascades: &cascades,
            shadow: &shadow,
            shadow_resolution: 2048,
            ambient_color: Vec3::splat(0.03),
            specular_mip_count: None,
        };
        let uniform = LightingUniform::new(&inputs);
        assert!(uniform.flags().contains(LightingFlags::SHADOWS));
        assert!(!uniform.flags().contains(LightingFlags::IBL));
        assert_eq!(uniform.cascade_count, 4);
        assert_eq!(uniform.cascade_splits[3], cascades[3].far_split);
        assert!((uniform.shadow_params[1] - 1.0 / 2048.0).abs() < 1e-9);

        let disabled = ShadowConfig { enabled: false, ..ShadowConfig::default() };
        let uniform = LightingUniform::new(&LightingInputs {
            shadow: &disabled,
            cascades: &[],
            specular_mip_count: Some(6),
            ..inputs
        });
        assert!(!uniform.flags().contains(LightingFlags::SHADOWS));
        assert!(uniform.flags().contains(LightingFlags::IBL));
        assert_eq!(uniform.ambient_color[3], 6.0);
    }

    #[test]
    fn light_direction_is_expressed_in_view_space() {
        let camera = camera();
        let light = DirectionalLight { direction: Vec3::NEG_Y, ..DirectionalLight::default() };
        let shadow = ShadowConfig::default();
        let uniform = LightingUniform::new(&LightingInputs {
            camera: &camera,
            light: &light,
            cascades: &[],
            shadow: &shadow,
            shadow_resolution: 1024,
            ambient_color: Vec3::ZERO,
            specular_mip_count: None,
        });
        let expected = camera.view().transform_vector3(Vec3::NEG_Y).normalize();
        let actual = Vec3::new(uniform.light_direction[0], uniform.light_direction[1], uniform.light_direction[2]);
        assert!((expected - actual).length() < 1e-5);
        assert_eq!(uniform.light_direction[3], light.intensity);
        let inv_view = Mat4::from_cols_array_2d(&uniform.inv_view);
        assert!((inv_view.transform_point3(Vec3::ZERO) - camera.position()).length() < 1e-4);
    }
}
