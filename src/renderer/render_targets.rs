//! Ownership of every GPU render target.
//!
//! Stages never hold textures directly. They keep [`RenderTargetHandle`]s and resolve
//! them each frame; a handle whose target was destroyed resolves to
//! [`PipelineError::StaleHandle`].

use crate::error::{PipelineError, PipelineResult};

use super::{
    AO_FORMAT, AO_METAL_ROUGH_FORMAT, ALBEDO_FORMAT, GBUFFER_DEPTH_FORMAT, LINEAR_DEPTH_FORMAT, LIT_COLOR_FORMAT,
    NORMAL_FORMAT,
};

#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargetDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
    pub samples: u32,
    pub layers: u32,
    pub usage: wgpu::TextureUsages,
}

impl RenderTargetDesc {
    pub fn new(
        label: impl Into<String>,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> Self {
        Self { label: label.into(), width, height, format, samples: 1, layers: 1, usage }
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    /// Approximate device memory for this target.
    pub fn byte_size(&self) -> u64 {
        let texel = match self.format {
            wgpu::TextureFormat::Depth24PlusStencil8 | wgpu::TextureFormat::Depth24Plus => 4,
            wgpu::TextureFormat::Depth32FloatStencil8 => 5,
            format => format.block_copy_size(None).unwrap_or(4),
        } as u64;
        self.width as u64 * self.height as u64 * self.layers.max(1) as u64 * self.samples.max(1) as u64 * texel
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetHandle {
    index: u32,
    generation: u32,
}

impl RenderTargetHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Backend that creates and releases the storage behind render targets.
pub trait TargetAllocator {
    type Target;

    fn allocate(&mut self, desc: &RenderTargetDesc) -> PipelineResult<Self::Target>;

    fn release(&mut self, desc: &RenderTargetDesc, target: Self::Target);
}

/// A wgpu texture plus the views the passes bind.
pub struct GpuTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    sample_view: wgpu::TextureView,
    array_view: wgpu::TextureView,
    layer_views: Vec<wgpu::TextureView>,
}

impl GpuTarget {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    /// Attachment view covering every aspect.
    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    /// Depth-only view for combined depth-stencil formats, the attachment view otherwise.
    pub fn sample_view(&self) -> &wgpu::TextureView {
        &self.sample_view
    }

    pub fn array_view(&self) -> &wgpu::TextureView {
        &self.array_view
    }

    pub fn layer_view(&self, layer: usize) -> Option<&wgpu::TextureView> {
        self.layer_views.get(layer)
    }
}

pub struct WgpuAllocator {
    device: wgpu::Device,
    max_dimension: u32,
    max_layers: u32,
    budget_bytes: Option<u64>,
    allocated_bytes: u64,
}

impl WgpuAllocator {
    pub fn new(device: wgpu::Device, budget_bytes: Option<u64>) -> Self {
        let limits = device.limits();
        Self {
            max_dimension: limits.max_texture_dimension_2d,
            max_layers: limits.max_texture_array_layers,
            device,
            budget_bytes,
            allocated_bytes: 0,
        }
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }
}

impl TargetAllocator for WgpuAllocator {
    type Target = GpuTarget;

    fn allocate(&mut self, desc: &RenderTargetDesc) -> PipelineResult<GpuTarget> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(PipelineError::invalid_config(format!(
                "render target '{}' has zero extent {}x{}x{}",
                desc.label, desc.width, desc.height, desc.layers
            )));
        }
        let requested_bytes = desc.byte_size();
        if desc.width > self.max_dimension || desc.height > self.max_dimension {
            return Err(PipelineError::ResourceExhaustion {
                label: desc.label.clone(),
                requested_bytes,
                reason: format!("{}x{} exceeds device limit {}", desc.width, desc.height, self.max_dimension),
            });
        }
        if desc.layers > self.max_layers {
            return Err(PipelineError::ResourceExhaustion {
                label: desc.label.clone(),
                requested_bytes,
                reason: format!("{} layers exceeds device limit {}", desc.layers, self.max_layers),
            });
        }
        if let Some(budget) = self.budget_bytes {
            if self.allocated_bytes + requested_bytes > budget {
                return Err(PipelineError::ResourceExhaustion {
                    label: desc.label.clone(),
                    requested_bytes,
                    reason: format!("{} bytes already allocated of a {budget} byte budget", self.allocated_bytes),
                });
            }
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d { width: desc.width, height: desc.height, depth_or_array_layers: desc.layers },
            mip_level_count: 1,
            sample_count: desc.samples.max(1),
            dimension: wgpu::TextureDimension::D2,
            format: desc.format,
            usage: desc.usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(&desc.label),
            dimension: Some(if desc.layers > 1 {
                wgpu::TextureViewDimension::D2Array
            } else {
                wgpu::TextureViewDimension::D2
            }),
            ..Default::default()
        });
        let sample_aspect = if desc.format.has_depth_aspect() && desc.format.has_stencil_aspect() {
            wgpu::TextureAspect::DepthOnly
        } else {
            wgpu::TextureAspect::All
        };
        let sample_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(&format!("{} (sampled)", desc.label)),
            dimension: Some(if desc.layers > 1 {
                wgpu::TextureViewDimension::D2Array
            } else {
                wgpu::TextureViewDimension::D2
            }),
            aspect: sample_aspect,
            ..Default::default()
        });
        let array_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(&format!("{} (array)", desc.label)),
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            aspect: sample_aspect,
            array_layer_count: Some(desc.layers),
            ..Default::default()
        });
        let layer_views = (0..desc.layers)
            .map(|layer| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(&format!("{} (layer {layer})", desc.label)),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    base_array_layer: layer,
                    array_layer_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();

        self.allocated_bytes += requested_bytes;
        Ok(GpuTarget { texture, view, sample_view, array_view, layer_views })
    }

    fn release(&mut self, desc: &RenderTargetDesc, target: GpuTarget) {
        self.allocated_bytes = self.allocated_bytes.saturating_sub(desc.byte_size());
        target.texture.destroy();
    }
}

struct Slot<T> {
    generation: u32,
    live: Option<(RenderTargetDesc, T)>,
}

pub struct RenderTargetManager<A: TargetAllocator = WgpuAllocator> {
    allocator: A,
    slots: Vec<Slot<A::Target>>,
}

impl<A: TargetAllocator> RenderTargetManager<A> {
    pub fn new(allocator: A) -> Self {
        Self { allocator, slots: Vec::new() }
    }

    pub fn create_render_target(&mut self, desc: RenderTargetDesc) -> PipelineResult<RenderTargetHandle> {
        let target = self.allocator.allocate(&desc)?;
        tracing::debug!(label = %desc.label, width = desc.width, height = desc.height, "render target created");
        let index = match self.slots.iter().position(|slot| slot.live.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(Slot { generation: 0, live: None });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.live = Some((desc, target));
        Ok(RenderTargetHandle { index: index as u32, generation: slot.generation })
    }

    pub fn destroy_render_target(&mut self, handle: RenderTargetHandle) -> PipelineResult<()> {
        let slot = self.slot_mut(handle)?;
        let (desc, target) = slot.live.take().ok_or(PipelineError::StaleHandle {
            index: handle.index,
            generation: handle.generation,
        })?;
        slot.generation = slot.generation.wrapping_add(1);
        tracing::debug!(label = %desc.label, "render target destroyed");
        self.allocator.release(&desc, target);
        Ok(())
    }

    pub fn target(&self, handle: RenderTargetHandle) -> PipelineResult<&A::Target> {
        self.entry(handle).map(|(_, target)| target)
    }

    pub fn desc(&self, handle: RenderTargetHandle) -> PipelineResult<&RenderTargetDesc> {
        self.entry(handle).map(|(desc, _)| desc)
    }

    pub fn is_live(&self, handle: RenderTargetHandle) -> bool {
        self.entry(handle).is_ok()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.live.is_some()).count()
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    fn entry(&self, handle: RenderTargetHandle) -> PipelineResult<&(RenderTargetDesc, A::Target)> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.live.as_ref())
            .ok_or(PipelineError::StaleHandle { index: handle.index, generation: handle.generation })
    }

    fn slot_mut(&mut self, handle: RenderTargetHandle) -> PipelineResult<&mut Slot<A::Target>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(PipelineError::StaleHandle { index: handle.index, generation: handle.generation })
    }
}

impl RenderTargetManager<WgpuAllocator> {
    pub fn view(&self, handle: RenderTargetHandle) -> PipelineResult<&wgpu::TextureView> {
        self.target(handle).map(GpuTarget::view)
    }

    pub fn sample_view(&self, handle: RenderTargetHandle) -> PipelineResult<&wgpu::TextureView> {
        self.target(handle).map(GpuTarget::sample_view)
    }
}

impl<A: TargetAllocator> Drop for RenderTargetManager<A> {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Some((desc, target)) = slot.live.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.allocator.release(&desc, target);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GBuffer {
    pub albedo: RenderTargetHandle,
    pub normal: RenderTargetHandle,
    pub ao_metal_rough: RenderTargetHandle,
    pub linear_depth: RenderTargetHandle,
    pub depth: RenderTargetHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AoBuffers {
    pub linear_depth: RenderTargetHandle,
    pub raw_ao: RenderTargetHandle,
    pub blurred_ao: RenderTargetHandle,
    pub temp: RenderTargetHandle,
}

/// Every target whose size follows the viewport.
#[derive(Debug)]
pub struct ViewportTargets {
    pub gbuffer: GBuffer,
    pub ao: AoBuffers,
    pub lit_color: RenderTargetHandle,
    width: u32,
    height: u32,
    generation: u64,
}

impl ViewportTargets {
    pub fn new<A: TargetAllocator>(
        manager: &mut RenderTargetManager<A>,
        width: u32,
        height: u32,
    ) -> PipelineResult<Self> {
        let (gbuffer, ao, lit_color) = allocate_viewport(manager, width, height)?;
        Ok(Self { gbuffer, ao, lit_color, width, height, generation: 0 })
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Bumped on every successful resize. Cached bind groups compare against it.
    pub fn targets_generation(&self) -> u64 {
        self.generation
    }

    pub fn handles(&self) -> [RenderTargetHandle; 10] {
        [
            self.gbuffer.albedo,
            self.gbuffer.normal,
            self.gbuffer.ao_metal_rough,
            self.gbuffer.linear_depth,
            self.gbuffer.depth,
            self.ao.linear_depth,
            self.ao.raw_ao,
            self.ao.blurred_ao,
            self.ao.temp,
            self.lit_color,
        ]
    }

    /// Destroys every member, then allocates all of them at the new size.
    ///
    /// Returns `Ok(false)` when nothing changed. Zero sizes are ignored.
    pub fn resize<A: TargetAllocator>(
        &mut self,
        manager: &mut RenderTargetManager<A>,
        width: u32,
        height: u32,
    ) -> PipelineResult<bool> {
        if width == 0 || height == 0 || (width, height) == (self.width, self.height) {
            return Ok(false);
        }
        self.destroy(manager)?;
        // Stale handles stay behind on failure, so the next resize starts from scratch.
        self.width = 0;
        self.height = 0;
        let (gbuffer, ao, lit_color) = allocate_viewport(manager, width, height)?;
        self.gbuffer = gbuffer;
        self.ao = ao;
        self.lit_color = lit_color;
        self.width = width;
        self.height = height;
        self.generation += 1;
        tracing::info!(width, height, generation = self.generation, "viewport targets recreated");
        Ok(true)
    }

    pub fn destroy<A: TargetAllocator>(&mut self, manager: &mut RenderTargetManager<A>) -> PipelineResult<()> {
        for handle in self.handles() {
            if manager.is_live(handle) {
                manager.destroy_render_target(handle)?;
            }
        }
        Ok(())
    }
}

fn allocate_viewport<A: TargetAllocator>(
    manager: &mut RenderTargetManager<A>,
    width: u32,
    height: u32,
) -> PipelineResult<(GBuffer, AoBuffers, RenderTargetHandle)> {
    let sampled = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
    let descs = [
        RenderTargetDesc::new("GBuffer Albedo", width, height, ALBEDO_FORMAT, sampled),
        RenderTargetDesc::new("GBuffer Normal", width, height, NORMAL_FORMAT, sampled),
        RenderTargetDesc::new("GBuffer AO/Metal/Rough", width, height, AO_METAL_ROUGH_FORMAT, sampled),
        RenderTargetDesc::new("GBuffer Linear Depth", width, height, LINEAR_DEPTH_FORMAT, sampled),
        RenderTargetDesc::new("GBuffer Depth", width, height, GBUFFER_DEPTH_FORMAT, sampled),
        RenderTargetDesc::new("AO Linear Depth", width, height, LINEAR_DEPTH_FORMAT, sampled),
        RenderTargetDesc::new("AO Raw", width, height, AO_FORMAT, sampled),
        RenderTargetDesc::new("AO Blurred", width, height, AO_FORMAT, sampled | wgpu::TextureUsages::COPY_SRC),
        RenderTargetDesc::new("AO Blur Temp", width, height, AO_FORMAT, sampled),
        RenderTargetDesc::new("Lit Color", width, height, LIT_COLOR_FORMAT, sampled),
    ];
    let mut handles = Vec::with_capacity(descs.len());
    for desc in descs {
        match manager.create_render_target(desc) {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                for handle in handles {
                    manager.destroy_render_target(handle)?;
                }
                return Err(err);
            }
        }
    }
    let gbuffer = GBuffer {
        albedo: handles[0],
        normal: handles[1],
        ao_metal_rough: handles[2],
        linear_depth: handles[3],
        depth: handles[4],
    };
    let ao = AoBuffers { linear_depth: handles[5], raw_ao: handles[6], blurred_ao: handles[7], temp: handles[8] };
    Ok((gbuffer, ao, handles[9]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[derive(Default)]
    struct Ledger {
        alive: HashMap<u64, bool>,
        next: u64,
    }

    /// Allocates ids instead of textures and poisons them on release.
    struct CanaryAllocator {
        ledger: Rc<RefCell<Ledger>>,
        budget: Option<u64>,
        in_use: u64,
    }

    impl TargetAllocator for CanaryAllocator {
        type Target = u64;

        fn allocate(&mut self, desc: &RenderTargetDesc) -> PipelineResult<u64> {
            let bytes = desc.byte_size();
            if self.budget.is_some_and(|budget| self.in_use + bytes > budget) {
                return Err(PipelineError::ResourceExhaustion {
                    label: desc.label.clone(),
                    requested_bytes: bytes,
                    reason: "canary budget".into(),
                });
            }
            self.in_use += bytes;
            let mut ledger = self.ledger.borrow_mut();
            let id = ledger.next;
            ledger.next += 1;
            ledger.alive.insert(id, true);
            Ok(id)
        }

        fn release(&mut self, desc: &RenderTargetDesc, target: u64) {
            self.in_use -= desc.byte_size();
            let mut ledger = self.ledger.borrow_mut();
            let alive = ledger.alive.get_mut(&target).expect("released an unknown target");
            assert!(*alive, "target {target} released twice");
            *alive = false;
        }
    }

    fn manager(budget: Option<u64>) -> (RenderTargetManager<CanaryAllocator>, Rc<RefCell<Ledger>>) {
        let ledger = Rc::new(RefCell::new(Ledger::default()));
        (RenderTargetManager::new(CanaryAllocator { ledger: ledger.clone(), budget, in_use: 0 }), ledger)
    }

    fn color_desc(size: u32) -> RenderTargetDesc {
        RenderTargetDesc::new("test", size, size, wgpu::TextureFormat::Rgba8Unorm, wgpu::TextureUsages::RENDER_ATTACHMENT)
    }

    #[test]
    fn destroyed_handle_is_stale() {
        let (mut manager, _) = manager(None);
        let handle = manager.create_render_target(color_desc(4)).expect("create");
        assert!(manager.target(handle).is_ok());
        manager.destroy_render_target(handle).expect("destroy");
        assert_eq!(
            manager.target(handle).unwrap_err(),
            PipelineError::StaleHandle { index: handle.index(), generation: handle.generation() }
        );
        assert!(manager.destroy_render_target(handle).is_err(), "double destroy must fail");
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let (mut manager, _) = manager(None);
        let first = manager.create_render_target(color_desc(4)).expect("create");
        manager.destroy_render_target(first).expect("destroy");
        let second = manager.create_render_target(color_desc(8)).expect("create");
        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        assert!(manager.target(first).is_err());
        assert_eq!(manager.desc(second).expect("desc").width, 8);
    }

    #[test]
    fn drop_releases_every_live_target() {
        let (mut manager, ledger) = manager(None);
        for size in [1, 2, 3] {
            manager.create_render_target(color_desc(size)).expect("create");
        }
        drop(manager);
        assert!(ledger.borrow().alive.values().all(|alive| !alive));
    }

    #[test]
    fn viewport_resize_recreates_all_members() {
        let (mut manager, ledger) = manager(None);
        let mut targets = ViewportTargets::new(&mut manager, 64, 32).expect("targets");
        let old = targets.handles();
        let old_ids: Vec<u64> = old.iter().map(|h| *manager.target(*h).expect("live")).collect();

        assert!(targets.resize(&mut manager, 128, 64).expect("resize"));
        assert_eq!(targets.size(), (128, 64));
        assert_eq!(targets.targets_generation(), 1);
        assert_eq!(manager.live_count(), 10);
        for handle in old {
            assert!(manager.target(handle).is_err(), "old handle must be stale after resize");
        }
        let ledger = ledger.borrow();
        assert!(old_ids.iter().all(|id| !ledger.alive[id]), "old targets must be released");
        for handle in targets.handles() {
            assert_eq!(manager.desc(handle).expect("live").width, 128);
        }
    }

    #[test]
    fn zero_and_same_size_resizes_are_ignored() {
        let (mut manager, _) = manager(None);
        let mut targets = ViewportTargets::new(&mut manager, 16, 16).expect("targets");
        let before = targets.handles();
        assert!(!targets.resize(&mut manager, 0, 720).expect("resize"));
        assert!(!targets.resize(&mut manager, 16, 16).expect("resize"));
        assert_eq!(targets.handles(), before);
        assert_eq!(targets.targets_generation(), 0);
    }

    #[test]
    fn budget_exhaustion_rolls_back_partial_allocation() {
        let one_viewport: u64 = {
            let (mut manager, _) = manager(None);
            let targets = ViewportTargets::new(&mut manager, 8, 8).expect("targets");
            targets.handles().iter().map(|h| manager.desc(*h).expect("desc").byte_size()).sum()
        };
        let (mut manager, _) = manager(Some(one_viewport));
        let mut targets = ViewportTargets::new(&mut manager, 8, 8).expect("fits budget");
        let err = targets.resize(&mut manager, 64, 64).unwrap_err();
        assert!(matches!(err, PipelineError::ResourceExhaustion { .. }));
        assert_eq!(manager.live_count(), 0, "partial allocations must be released");
        assert!(targets.resize(&mut manager, 8, 8).expect("retry at old size"));
        assert_eq!(manager.live_count(), 10);
    }

    #[test]
    fn byte_size_covers_layers_and_depth_formats() {
        let desc = RenderTargetDesc::new(
            "shadow",
            1024,
            1024,
            wgpu::TextureFormat::Depth32Float,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        )
        .with_layers(4);
        assert_eq!(desc.byte_size(), 1024 * 1024 * 4 * 4);
        let packed = RenderTargetDesc::new(
            "depth",
            10,
            10,
            wgpu::TextureFormat::Depth24PlusStencil8,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
        );
        assert_eq!(packed.byte_size(), 400);
    }
}
