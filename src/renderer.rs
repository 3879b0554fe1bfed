//! Deferred PBR frame: cascaded shadows, G-buffer, HBAO, lighting and composite.

pub mod render_targets;

mod ao_pass;
mod composite_pass;
mod geometry_pass;
mod lighting_pass;
mod shadow_pass;
mod window_surface;

use anyhow::{Context, Result};
use glam::{Mat4, Vec3};
use smallvec::SmallVec;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Instant;

use crate::camera::Camera3D;
use crate::cascade::{build_cascades, scene_depth_range, Cascade, MAX_SHADOW_CASCADES};
use crate::config::{PcfConfig, RendererConfig, ShadowConfig};
use crate::environment::EnvironmentGpu;
use crate::error::{PipelineError, PipelineResult};
use crate::hbao::{AoProjection, HbaoParameters};
use crate::material::{MaterialDesc, MaterialRegistry};
use crate::mesh::{Mesh, MeshRegistry};
use crate::scene::{DrawCommand, MaterialHandle, MeshHandle, SceneSource, TextureHandle};

pub use ao_pass::{AmbientOcclusionStage, AoSource};
pub use composite_pass::{CompositePass, CompositeUniform};
pub use geometry_pass::{normal_matrix, GeometryDraw, GeometryDrawUniform, GeometryPass};
pub use lighting_pass::{LightingFlags, LightingInputs, LightingPass, LightingUniform};
pub use render_targets::{
    GpuTarget, RenderTargetDesc, RenderTargetHandle, RenderTargetManager, TargetAllocator, ViewportTargets,
    WgpuAllocator,
};
pub use shadow_pass::{ShadowCascadePass, ShadowPass};
pub use window_surface::{SurfaceFrame, WindowSurface};

use composite_pass::CompositeBindKey;
use lighting_pass::LightingBindKey;

pub const SHADOW_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
pub const GBUFFER_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;
pub const ALBEDO_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
pub const NORMAL_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
pub const AO_METAL_ROUGH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
pub const LINEAR_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R32Float;
pub const AO_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::R8Unorm;
pub const LIT_COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

const DEFAULT_AMBIENT: Vec3 = Vec3::splat(0.03);

/// Every format the pipeline renders into, with the target that needs it.
pub const RENDERED_FORMATS: [(&str, wgpu::TextureFormat); 8] = [
    ("Shadow Cascade Array", SHADOW_DEPTH_FORMAT),
    ("GBuffer Depth", GBUFFER_DEPTH_FORMAT),
    ("GBuffer Albedo", ALBEDO_FORMAT),
    ("GBuffer Normal", NORMAL_FORMAT),
    ("GBuffer AO/Metal/Rough", AO_METAL_ROUGH_FORMAT),
    ("GBuffer Linear Depth", LINEAR_DEPTH_FORMAT),
    ("AO", AO_FORMAT),
    ("Lit Color", LIT_COLOR_FORMAT),
];

/// Adapter, device and queue shared by every pass. All handles are cheap clones.
#[derive(Clone, Debug)]
pub struct GpuContext {
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    /// `Features::DEPTH_CLIP_CONTROL` was enabled on the device.
    pub supports_depth_clamp: bool,
}

impl GpuContext {
    pub fn new(adapter: wgpu::Adapter, device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let supports_depth_clamp = device.features().contains(wgpu::Features::DEPTH_CLIP_CONTROL);
        Self { adapter, device, queue, supports_depth_clamp }
    }

    /// Fails on the first target whose format the adapter cannot use as a render attachment.
    pub fn require_renderable(&self, targets: &[(&str, wgpu::TextureFormat)]) -> PipelineResult<()> {
        require_renderable(targets, |format| self.adapter.get_texture_format_features(format).allowed_usages)
    }
}

pub(crate) fn require_renderable(
    targets: &[(&str, wgpu::TextureFormat)],
    allowed_usages: impl Fn(wgpu::TextureFormat) -> wgpu::TextureUsages,
) -> PipelineResult<()> {
    let unsupported = targets
        .iter()
        .find(|(_, format)| !allowed_usages(*format).contains(wgpu::TextureUsages::RENDER_ATTACHMENT));
    match unsupported {
        Some((target, format)) => {
            Err(PipelineError::UnsupportedFormat { target: (*target).to_string(), format: *format })
        }
        None => Ok(()),
    }
}

/// Rasterizer state a pass may change and must restore. Pipelines take their
/// `PrimitiveState` from it, and the renderer tracks which one is active while recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterState {
    pub depth_clamp: bool,
    pub cull_mode: Option<wgpu::Face>,
}

impl Default for RasterState {
    fn default() -> Self {
        Self { depth_clamp: false, cull_mode: Some(wgpu::Face::Back) }
    }
}

impl RasterState {
    /// Caster depth is clamped by the rasterizer only when the device can switch clipping off.
    pub fn shadow(hardware_clamp: bool) -> Self {
        Self { depth_clamp: hardware_clamp, cull_mode: Some(wgpu::Face::Back) }
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    pub fn primitive_state(&self) -> wgpu::PrimitiveState {
        wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: self.cull_mode,
            unclipped_depth: self.depth_clamp,
            ..Default::default()
        }
    }
}

/// Applies a raster state for as long as it lives, then puts back the default.
pub struct RasterScope<'a> {
    state: &'a mut RasterState,
}

impl<'a> RasterScope<'a> {
    pub fn enter(state: &'a mut RasterState, scoped: RasterState) -> Self {
        *state = scoped;
        Self { state }
    }

    pub fn current(&self) -> RasterState {
        *self.state
    }
}

impl Drop for RasterScope<'_> {
    fn drop(&mut self) {
        *self.state = RasterState::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Shadow(usize),
    Geometry,
    AmbientOcclusion,
    Lighting,
    Composite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugOverlay {
    #[default]
    None,
    Depth,
    Ao,
}

impl DebugOverlay {
    pub fn shader_code(self) -> u32 {
        match self {
            DebugOverlay::None => 0,
            DebugOverlay::Depth => 1,
            DebugOverlay::Ao => 2,
        }
    }
}

impl FromStr for DebugOverlay {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(DebugOverlay::None),
            "depth" => Ok(DebugOverlay::Depth),
            "ao" => Ok(DebugOverlay::Ao),
            other => Err(format!("unknown debug overlay '{other}' (expected none, depth or ao)")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    pub frame_index: u64,
    pub draw_count: usize,
    pub shadow_draw_count: usize,
    /// Far split distance of every cascade rendered this frame.
    pub cascade_splits: Vec<f32>,
    pub cpu_time_ms: f32,
    pub frame_time: f32,
    /// The viewport was zero-sized and nothing was recorded.
    pub skipped: bool,
}

/// Pass order for one frame with `cascade_count` shadow cascades.
pub fn frame_schedule_for(cascade_count: usize) -> SmallVec<[PassKind; 8]> {
    let mut schedule: SmallVec<[PassKind; 8]> =
        (0..cascade_count.min(MAX_SHADOW_CASCADES)).map(PassKind::Shadow).collect();
    schedule.extend([PassKind::Geometry, PassKind::AmbientOcclusion, PassKind::Lighting, PassKind::Composite]);
    schedule
}

/// Owns every pass and render target and records one frame per [`DeferredRenderer::render`].
pub struct DeferredRenderer {
    ctx: GpuContext,
    targets: RenderTargetManager,
    viewport: Option<ViewportTargets>,
    meshes: MeshRegistry,
    materials: MaterialRegistry,
    shadow_pass: ShadowPass,
    geometry_pass: GeometryPass,
    ao_stage: AmbientOcclusionStage,
    lighting_pass: LightingPass,
    composite_pass: CompositePass,
    raster_state: RasterState,
    shadow_config: ShadowConfig,
    ao_blur: bool,
    exposure: f32,
    ambient_color: Vec3,
    overlay: DebugOverlay,
    environment: Option<EnvironmentGpu>,
    frame_index: u64,
    warned_meshes: HashSet<MeshHandle>,
    warned_materials: HashSet<MaterialHandle>,
}

impl DeferredRenderer {
    pub fn new(ctx: GpuContext, config: &RendererConfig, output_format: wgpu::TextureFormat) -> Result<Self> {
        config.validate()?;
        ctx.require_renderable(&RENDERED_FORMATS)?;
        ctx.require_renderable(&[("Output", output_format)])?;
        let mut targets = RenderTargetManager::new(WgpuAllocator::new(ctx.device.clone(), config.memory_budget_bytes()));
        let shadow_pass = ShadowPass::new(&ctx, &mut targets, &config.shadow)?;
        let geometry_pass = GeometryPass::new(&ctx);
        let ao_stage = AmbientOcclusionStage::new(&ctx, config.ao.parameters(), config.ao.enabled);
        let lighting_pass = LightingPass::new(&ctx);
        let composite_pass = CompositePass::new(&ctx, output_format);
        tracing::info!(
            cascades = config.shadow.cascade_count,
            shadow_resolution = config.shadow.resolution,
            ao = config.ao.enabled,
            depth_clamp = ctx.supports_depth_clamp,
            ?output_format,
            "deferred renderer ready"
        );
        Ok(Self {
            ctx,
            targets,
            viewport: None,
            meshes: MeshRegistry::new(),
            materials: MaterialRegistry::new(),
            shadow_pass,
            geometry_pass,
            ao_stage,
            lighting_pass,
            composite_pass,
            raster_state: RasterState::default(),
            shadow_config: config.shadow.clone(),
            ao_blur: config.ao.blur,
            exposure: config.exposure,
            ambient_color: DEFAULT_AMBIENT,
            overlay: DebugOverlay::None,
            environment: None,
            frame_index: 0,
            warned_meshes: HashSet::new(),
            warned_materials: HashSet::new(),
        })
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    pub fn add_mesh(&mut self, mesh: &Mesh, label: &str) -> MeshHandle {
        self.meshes.add(&self.ctx.device, mesh, label)
    }

    pub fn add_material(&mut self, desc: MaterialDesc) -> MaterialHandle {
        self.materials.add_material(desc)
    }

    pub fn add_texture_rgba8(
        &mut self,
        label: &str,
        width: u32,
        height: u32,
        data: Vec<u8>,
        srgb: bool,
    ) -> Result<TextureHandle> {
        self.materials.add_texture_rgba8(label, width, height, data, srgb)
    }

    pub fn materials(&self) -> &MaterialRegistry {
        &self.materials
    }

    pub fn materials_mut(&mut self) -> &mut MaterialRegistry {
        &mut self.materials
    }

    pub fn meshes(&self) -> &MeshRegistry {
        &self.meshes
    }

    pub fn targets(&self) -> &RenderTargetManager {
        &self.targets
    }

    pub fn viewport_targets(&self) -> Option<&ViewportTargets> {
        self.viewport.as_ref()
    }

    pub fn shadow_pass(&self) -> &ShadowPass {
        &self.shadow_pass
    }

    pub fn ao_stage(&self) -> &AmbientOcclusionStage {
        &self.ao_stage
    }

    pub fn raster_state(&self) -> RasterState {
        self.raster_state
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn shadow_config(&self) -> &ShadowConfig {
        &self.shadow_config
    }

    pub fn frame_schedule(&self) -> SmallVec<[PassKind; 8]> {
        frame_schedule_for(self.active_cascade_count())
    }

    /// Recreates the viewport-sized targets. Zero sizes are ignored.
    pub fn on_resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            tracing::debug!(width, height, "ignoring zero-sized resize");
            return Ok(());
        }
        self.ensure_viewport(width, height)?;
        Ok(())
    }

    pub fn set_show_debug_overlay(&mut self, overlay: DebugOverlay) {
        self.overlay = overlay;
    }

    pub fn debug_overlay(&self) -> DebugOverlay {
        self.overlay
    }

    pub fn set_hbao_parameters(&mut self, parameters: HbaoParameters) {
        self.ao_stage.set_parameters(parameters);
    }

    pub fn set_ao_enabled(&mut self, enabled: bool) {
        self.ao_stage.set_enabled(enabled);
    }

    pub fn set_ao_blur(&mut self, blur: bool) {
        self.ao_blur = blur;
    }

    pub fn set_shadow_bias(&mut self, bias: f32) {
        self.shadow_config.bias = if bias.is_finite() { bias.max(0.0) } else { 0.0 };
    }

    pub fn set_pcf_kernel(&mut self, pcf: PcfConfig) {
        self.shadow_config.pcf = pcf.clamped();
    }

    /// Validates `config` and reallocates the cascade array if its size changed.
    pub fn set_shadow_config(&mut self, config: ShadowConfig) -> Result<()> {
        config.validate()?;
        self.shadow_pass.configure(&mut self.targets, &config)?;
        self.shadow_config = ShadowConfig { pcf: config.pcf.clamped(), ..config };
        Ok(())
    }

    pub fn set_environment(&mut self, environment: Option<EnvironmentGpu>) {
        self.lighting_pass.set_environment(&self.ctx.device, environment.as_ref());
        tracing::info!(ibl = environment.is_some(), "environment lighting updated");
        self.environment = environment;
    }

    pub fn has_environment(&self) -> bool {
        self.environment.is_some()
    }

    pub fn set_exposure(&mut self, exposure: f32) {
        if exposure.is_finite() && exposure > 0.0 {
            self.exposure = exposure;
        }
    }

    pub fn set_ambient_color(&mut self, color: Vec3) {
        self.ambient_color = color.max(Vec3::ZERO);
    }

    /// Records and submits one frame into `output`, which must match the output format
    /// the renderer was created with.
    pub fn render(
        &mut self,
        scene: &dyn SceneSource,
        camera: &Camera3D,
        frame_time: f32,
        width: u32,
        height: u32,
        output: &wgpu::TextureView,
    ) -> Result<FrameStats> {
        let started = Instant::now();
        if width == 0 || height == 0 {
            return Ok(FrameStats { frame_index: self.frame_index, frame_time, skipped: true, ..FrameStats::default() });
        }
        // Resize barrier: every target is final before any pass is recorded.
        self.ensure_viewport(width, height)?;

        let mut camera = camera.clone();
        camera.set_viewport(width, height);
        let light = scene.directional_light();
        let draws = self.resolve_draws(scene);
        self.materials.prepare_gpu(&self.ctx.device, &self.ctx.queue, self.geometry_pass.material_layout())?;

        let cascades = self.build_frame_cascades(&camera, light.direction, &draws)?;
        let casters: Vec<&DrawCommand> = draws.iter().filter(|draw| draw.casts_shadows).collect();
        let caster_transforms: Vec<Mat4> = casters.iter().map(|draw| draw.world_transform).collect();
        let transforms: Vec<Mat4> = draws.iter().map(|draw| draw.world_transform).collect();
        self.shadow_pass.prepare(&self.ctx, &cascades, &caster_transforms);
        self.geometry_pass.prepare(&self.ctx, &camera, &transforms);

        let mut encoder = self.ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Deferred Frame Encoder"),
        });

        let mut shadow_draw_count = 0;
        for cascade_index in 0..cascades.len() {
            let mut pass =
                self.shadow_pass.begin(&mut encoder, cascade_index, &mut self.raster_state, &self.targets)?;
            for (caster_index, draw) in casters.iter().enumerate() {
                if let Some(mesh) = self.meshes.get(draw.mesh) {
                    pass.draw(mesh, caster_index);
                }
            }
            shadow_draw_count += pass.end();
        }

        let viewport = self.viewport.as_ref().context("Viewport targets missing")?;
        let mut geometry_draws = Vec::with_capacity(draws.len());
        for draw in &draws {
            let mesh = self.meshes.get(draw.mesh).context("Resolved mesh missing")?;
            let material = self
                .materials
                .bind_group(draw.material)
                .with_context(|| format!("Material {:?} has no bind group", draw.material))?;
            geometry_draws.push(GeometryDraw { mesh, material });
        }
        let draw_count = self.geometry_pass.render(&mut encoder, &self.targets, &viewport.gbuffer, &geometry_draws)?;

        let projection = AoProjection::from_camera(&camera);
        let ao_source =
            self.ao_stage.render_ao(&self.ctx, &mut encoder, &self.targets, viewport, &projection, self.ao_blur)?;
        let ao_view = self.ao_stage.view(ao_source, &self.targets, viewport)?;

        let shadow_map = self.shadow_pass.map_handle().context("Shadow cascade array missing")?;
        let lighting = LightingUniform::new(&LightingInputs {
            camera: &camera,
            light: &light,
            cascades: &cascades,
            shadow: &self.shadow_config,
            shadow_resolution: self.shadow_pass.resolution(),
            ambient_color: self.ambient_color,
            specular_mip_count: self.environment.as_ref().map(EnvironmentGpu::specular_mip_count),
        });
        let lighting_key = LightingBindKey { viewport: viewport.handles(), ao: ao_source, shadow_map };
        self.lighting_pass.draw_lighting(
            &self.ctx,
            &mut encoder,
            &self.targets,
            viewport,
            ao_view,
            lighting_key,
            &lighting,
        )?;

        let composite = CompositeUniform::new(
            self.exposure,
            self.overlay,
            camera.far,
            self.composite_pass.output_format(),
        );
        let composite_key = CompositeBindKey { viewport: viewport.handles(), ao: ao_source };
        self.composite_pass.draw(
            &self.ctx,
            &mut encoder,
            &self.targets,
            viewport,
            ao_view,
            composite_key,
            &composite,
            output,
        )?;

        self.ctx.queue.submit(Some(encoder.finish()));
        let stats = FrameStats {
            frame_index: self.frame_index,
            draw_count,
            shadow_draw_count,
            cascade_splits: cascades.iter().map(|cascade| cascade.far_split).collect(),
            cpu_time_ms: started.elapsed().as_secs_f32() * 1000.0,
            frame_time,
            skipped: false,
        };
        self.frame_index += 1;
        Ok(stats)
    }

    fn active_cascade_count(&self) -> usize {
        if self.shadow_config.enabled {
            self.shadow_config.cascade_count as usize
        } else {
            0
        }
    }

    fn build_frame_cascades(
        &self,
        camera: &Camera3D,
        light_direction: Vec3,
        draws: &[DrawCommand],
    ) -> PipelineResult<Vec<Cascade>> {
        let count = self.active_cascade_count();
        if count == 0 {
            return Ok(Vec::new());
        }
        let scene_depth = if self.shadow_config.fit_to_scene_depth {
            scene_depth_range(camera, draws.iter().map(|draw| draw.bounds))
        } else {
            None
        };
        build_cascades(
            camera,
            light_direction,
            count,
            self.shadow_config.split_lambda,
            self.shadow_config.stabilize,
            self.shadow_pass.resolution(),
            scene_depth,
        )
    }

    fn ensure_viewport(&mut self, width: u32, height: u32) -> PipelineResult<()> {
        match self.viewport.as_mut() {
            Some(viewport) => {
                viewport.resize(&mut self.targets, width, height)?;
            }
            None => {
                self.viewport = Some(ViewportTargets::new(&mut self.targets, width, height)?);
                tracing::info!(width, height, "viewport targets allocated");
            }
        }
        Ok(())
    }

    /// Drops draws whose mesh or material is unknown, warning once per handle.
    fn resolve_draws(&mut self, scene: &dyn SceneSource) -> Vec<DrawCommand> {
        let meshes = &self.meshes;
        let materials = &self.materials;
        let warned_meshes = &mut self.warned_meshes;
        let warned_materials = &mut self.warned_materials;
        let mut draws = Vec::new();
        scene.for_each_draw_command(&mut |draw| {
            if meshes.get(draw.mesh).is_none() {
                if warned_meshes.insert(draw.mesh) {
                    tracing::warn!(mesh = draw.mesh.0, "skipping draw with unknown mesh handle");
                }
                return;
            }
            if materials.material(draw.material).is_none() {
                if warned_materials.insert(draw.material) {
                    tracing::warn!(material = draw.material.0, "skipping draw with unknown material handle");
                }
                return;
            }
            draws.push(*draw);
        });
        draws
    }
}

/// Uniform buffer holding one element per draw, bound with a dynamic offset.
pub(crate) struct DynamicUniforms {
    label: &'static str,
    element_size: u64,
    stride: u64,
    capacity: usize,
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    staging: Vec<u8>,
}

impl DynamicUniforms {
    const INITIAL_CAPACITY: usize = 64;

    pub fn layout_entry(binding: u32, visibility: wgpu::ShaderStages, element_size: u64) -> wgpu::BindGroupLayoutEntry {
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: true,
                min_binding_size: wgpu::BufferSize::new(element_size),
            },
            count: None,
        }
    }

    pub fn new(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        label: &'static str,
        element_size: u64,
    ) -> Self {
        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let stride = align_to(element_size, alignment);
        let capacity = Self::INITIAL_CAPACITY;
        let (buffer, bind_group) = Self::allocate(device, layout, label, element_size, stride, capacity);
        Self { label, element_size, stride, capacity, buffer, bind_group, staging: Vec::new() }
    }

    fn allocate(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        label: &str,
        element_size: u64,
        stride: u64,
        capacity: usize,
    ) -> (wgpu::Buffer, wgpu::BindGroup) {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label} Uniforms")),
            size: stride * capacity as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{label} BG")),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(element_size),
                }),
            }],
        });
        (buffer, bind_group)
    }

    /// Writes `items` at consecutive strides, growing the buffer first if needed.
    pub fn write<T: bytemuck::Pod>(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        layout: &wgpu::BindGroupLayout,
        items: &[T],
    ) {
        if items.len() > self.capacity {
            self.capacity = items.len().next_power_of_two();
            let (buffer, bind_group) =
                Self::allocate(device, layout, self.label, self.element_size, self.stride, self.capacity);
            self.buffer = buffer;
            self.bind_group = bind_group;
            tracing::debug!(label = self.label, capacity = self.capacity, "grew dynamic uniform buffer");
        }
        if items.is_empty() {
            return;
        }
        let stride = self.stride as usize;
        self.staging.clear();
        self.staging.resize(items.len() * stride, 0);
        for (index, item) in items.iter().enumerate() {
            let bytes = bytemuck::bytes_of(item);
            let start = index * stride;
            self.staging[start..start + bytes.len()].copy_from_slice(bytes);
        }
        queue.write_buffer(&self.buffer, 0, &self.staging);
    }

    pub fn offset(&self, index: usize) -> u32 {
        (index as u64 * self.stride) as u32
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }
}

pub(crate) fn align_to(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

pub(crate) fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn texture_entry(binding: u32, sample_type: wgpu::TextureSampleType) -> wgpu::BindGroupLayoutEntry {
    texture_entry_with_dimension(binding, sample_type, wgpu::TextureViewDimension::D2)
}

pub(crate) fn texture_entry_with_dimension(
    binding: u32,
    sample_type: wgpu::TextureSampleType,
    view_dimension: wgpu::TextureViewDimension,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture { sample_type, view_dimension, multisampled: false },
        count: None,
    }
}

pub(crate) fn sampler_entry(binding: u32, ty: wgpu::SamplerBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(ty),
        count: None,
    }
}

pub(crate) fn view_entry(binding: u32, view: &wgpu::TextureView) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry { binding, resource: wgpu::BindingResource::TextureView(view) }
}

/// Pipeline drawing the full-screen triangle from `fullscreen.wgsl` into one color target.
pub(crate) fn fullscreen_pipeline(
    device: &wgpu::Device,
    label: &str,
    module: &wgpu::ShaderModule,
    fragment_entry: &str,
    bind_group_layouts: &[&wgpu::BindGroupLayout],
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts,
        push_constant_ranges: &[],
    });
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(&layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: Some("vs_fullscreen"),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: Some(fragment_entry),
            targets: &[Some(wgpu::ColorTargetState { format, blend: None, write_mask: wgpu::ColorWrites::ALL })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: wgpu::PrimitiveState { cull_mode: None, ..Default::default() },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

pub(crate) fn fullscreen_draw(
    encoder: &mut wgpu::CommandEncoder,
    label: &str,
    target: &wgpu::TextureView,
    pipeline: &wgpu::RenderPipeline,
    bind_groups: &[&wgpu::BindGroup],
) {
    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(label),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: target,
            depth_slice: None,
            resolve_target: None,
            ops: wgpu::Operations { load: wgpu::LoadOp::Clear(wgpu::Color::BLACK), store: wgpu::StoreOp::Store },
        })],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
    });
    pass.set_pipeline(pipeline);
    for (index, bind_group) in bind_groups.iter().enumerate() {
        pass.set_bind_group(index as u32, *bind_group, &[]);
    }
    pass.draw(0..3, 0..1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_runs_shadows_before_geometry() {
        let schedule = frame_schedule_for(4);
        assert_eq!(
            schedule.as_slice(),
            &[
                PassKind::Shadow(0),
                PassKind::Shadow(1),
                PassKind::Shadow(2),
                PassKind::Shadow(3),
                PassKind::Geometry,
                PassKind::AmbientOcclusion,
                PassKind::Lighting,
                PassKind::Composite,
            ]
        );
        assert!(!schedule.spilled());
        assert_eq!(frame_schedule_for(0)[0], PassKind::Geometry);
    }

    #[test]
    fn raster_scope_restores_default_state() {
        let mut state = RasterState::default();
        {
            let scope = RasterScope::enter(&mut state, RasterState::shadow(true));
            assert!(scope.current().depth_clamp);
            assert!(scope.current().primitive_state().unclipped_depth);
        }
        assert!(state.is_default());
        assert!(!state.primitive_state().unclipped_depth);

        state.cull_mode = None;
        drop(RasterScope::enter(&mut state, RasterState::shadow(false)));
        assert_eq!(state, RasterState::default());
    }

    #[test]
    fn primitive_state_follows_raster_state() {
        let primitive = RasterState { depth_clamp: false, cull_mode: None }.primitive_state();
        assert_eq!(primitive.cull_mode, None);
        assert_eq!(primitive.topology, wgpu::PrimitiveTopology::TriangleList);
        assert_eq!(RasterState::default().primitive_state().cull_mode, Some(wgpu::Face::Back));
    }

    #[test]
    fn unrenderable_format_is_reported_with_its_target() {
        let no_float32_attachments = |format: wgpu::TextureFormat| {
            if format == wgpu::TextureFormat::R32Float {
                wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::STORAGE_BINDING
            } else {
                wgpu::TextureUsages::all()
            }
        };
        let err = require_renderable(&RENDERED_FORMATS, no_float32_attachments).unwrap_err();
        assert_eq!(
            err,
            PipelineError::UnsupportedFormat {
                target: "GBuffer Linear Depth".into(),
                format: wgpu::TextureFormat::R32Float,
            }
        );
        assert!(require_renderable(&RENDERED_FORMATS, |_| wgpu::TextureUsages::all()).is_ok());
    }

    #[test]
    fn uniform_strides_respect_alignment() {
        assert_eq!(align_to(80, 256), 256);
        assert_eq!(align_to(192, 64), 192);
        assert_eq!(align_to(257, 256), 512);
        assert_eq!(align_to(10, 0), 10);
    }

    #[test]
    fn debug_overlay_parses_cli_names() {
        assert_eq!("depth".parse::<DebugOverlay>(), Ok(DebugOverlay::Depth));
        assert_eq!("AO".parse::<DebugOverlay>(), Ok(DebugOverlay::Ao));
        assert_eq!("none".parse::<DebugOverlay>(), Ok(DebugOverlay::None));
        assert!("normals".parse::<DebugOverlay>().is_err());
    }
}
