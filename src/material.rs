//! Opaque material and texture handles plus the GPU bind groups the geometry pass samples.
//!
//! Every material binds all five surface maps. Slots the material leaves empty are
//! filled with 1x1 fallback textures, so the shader never sees an unbound slot.

use anyhow::{anyhow, Context, Result};
use bytemuck::{Pod, Zeroable};
use std::collections::HashSet;
use wgpu::util::DeviceExt;

use crate::scene::{MaterialHandle, TextureHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialSlot {
    Albedo,
    Ao,
    Metallic,
    Normal,
    Roughness,
}

impl MaterialSlot {
    /// Binding order inside the material bind group.
    pub const ALL: [MaterialSlot; 5] =
        [MaterialSlot::Albedo, MaterialSlot::Ao, MaterialSlot::Metallic, MaterialSlot::Normal, MaterialSlot::Roughness];

    /// Texel sampled when the material leaves this slot empty.
    pub fn fallback_texel(self) -> [u8; 4] {
        match self {
            MaterialSlot::Albedo | MaterialSlot::Ao | MaterialSlot::Roughness => [255, 255, 255, 255],
            MaterialSlot::Metallic => [0, 0, 0, 255],
            MaterialSlot::Normal => [128, 128, 255, 255],
        }
    }

    fn srgb(self) -> bool {
        matches!(self, MaterialSlot::Albedo)
    }

    fn binding(self) -> u32 {
        match self {
            MaterialSlot::Albedo => 1,
            MaterialSlot::Ao => 2,
            MaterialSlot::Metallic => 3,
            MaterialSlot::Normal => 4,
            MaterialSlot::Roughness => 5,
        }
    }

    fn label(self) -> &'static str {
        match self {
            MaterialSlot::Albedo => "albedo",
            MaterialSlot::Ao => "ao",
            MaterialSlot::Metallic => "metallic",
            MaterialSlot::Normal => "normal",
            MaterialSlot::Roughness => "roughness",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaterialDesc {
    pub label: String,
    pub base_color: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    pub albedo_map: Option<TextureHandle>,
    pub ao_map: Option<TextureHandle>,
    pub metallic_map: Option<TextureHandle>,
    pub normal_map: Option<TextureHandle>,
    pub roughness_map: Option<TextureHandle>,
}

impl Default for MaterialDesc {
    fn default() -> Self {
        Self {
            label: "Default".to_string(),
            base_color: [1.0, 1.0, 1.0, 1.0],
            metallic: 1.0,
            roughness: 1.0,
            albedo_map: None,
            ao_map: None,
            metallic_map: None,
            normal_map: None,
            roughness_map: None,
        }
    }
}

impl MaterialDesc {
    pub fn solid(label: impl Into<String>, base_color: [f32; 4], metallic: f32, roughness: f32) -> Self {
        Self { label: label.into(), base_color, metallic, roughness, ..Default::default() }
    }

    pub fn slot(&self, slot: MaterialSlot) -> Option<TextureHandle> {
        match slot {
            MaterialSlot::Albedo => self.albedo_map,
            MaterialSlot::Ao => self.ao_map,
            MaterialSlot::Metallic => self.metallic_map,
            MaterialSlot::Normal => self.normal_map,
            MaterialSlot::Roughness => self.roughness_map,
        }
    }
}

/// Where a slot's texture comes from once handles are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSource {
    Texture(TextureHandle),
    Fallback,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct MaterialUniform {
    base_color: [f32; 4],
    params: [f32; 4], // metallic, roughness, unused, unused
}

struct TextureEntry {
    label: String,
    width: u32,
    height: u32,
    data: Vec<u8>,
    srgb: bool,
    gpu: Option<(wgpu::Texture, wgpu::TextureView)>,
}

struct MaterialEntry {
    desc: MaterialDesc,
    gpu: Option<MaterialGpu>,
}

struct MaterialGpu {
    bind_group: wgpu::BindGroup,
    _uniform_buffer: wgpu::Buffer,
}

struct FallbackTextures {
    views: Vec<(MaterialSlot, wgpu::TextureView)>,
    _textures: Vec<wgpu::Texture>,
}

impl FallbackTextures {
    fn view(&self, slot: MaterialSlot) -> Option<&wgpu::TextureView> {
        self.views.iter().find(|(s, _)| *s == slot).map(|(_, view)| view)
    }
}

#[derive(Default)]
pub struct MaterialRegistry {
    textures: Vec<TextureEntry>,
    materials: Vec<MaterialEntry>,
    fallbacks: Option<FallbackTextures>,
    sampler: Option<wgpu::Sampler>,
    missing_warnings: HashSet<TextureHandle>,
}

impl MaterialRegistry {
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.add_material(MaterialDesc::solid("Default", [0.8, 0.8, 0.8, 1.0], 0.0, 0.6));
        registry
    }

    pub fn default_material(&self) -> MaterialHandle {
        MaterialHandle(0)
    }

    /// Registers raw RGBA8 pixels. No file format is parsed here.
    pub fn add_texture_rgba8(
        &mut self,
        label: impl Into<String>,
        width: u32,
        height: u32,
        data: Vec<u8>,
        srgb: bool,
    ) -> Result<TextureHandle> {
        let label = label.into();
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || data.len() != expected {
            return Err(anyhow!(
                "Texture '{label}' has {} bytes, expected {expected} for {width}x{height} RGBA8",
                data.len()
            ));
        }
        let handle = TextureHandle(self.textures.len() as u32);
        self.textures.push(TextureEntry { label, width, height, data, srgb, gpu: None });
        Ok(handle)
    }

    pub fn add_material(&mut self, desc: MaterialDesc) -> MaterialHandle {
        let handle = MaterialHandle(self.materials.len() as u32);
        self.materials.push(MaterialEntry { desc, gpu: None });
        handle
    }

    pub fn update_material(&mut self, handle: MaterialHandle, desc: MaterialDesc) -> Result<()> {
        let entry = self
            .materials
            .get_mut(handle.0 as usize)
            .ok_or_else(|| anyhow!("Material {:?} not registered", handle))?;
        entry.desc = desc;
        entry.gpu = None;
        Ok(())
    }

    pub fn material(&self, handle: MaterialHandle) -> Option<&MaterialDesc> {
        self.materials.get(handle.0 as usize).map(|entry| &entry.desc)
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    /// Resolves a slot to a registered texture, or to its fallback when empty or unknown.
    pub fn resolve_slot(&self, handle: MaterialHandle, slot: MaterialSlot) -> SlotSource {
        match self.material(handle).and_then(|desc| desc.slot(slot)) {
            Some(texture) if (texture.0 as usize) < self.textures.len() => SlotSource::Texture(texture),
            _ => SlotSource::Fallback,
        }
    }

    pub fn bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        for slot in MaterialSlot::ALL {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: slot.binding(),
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
        }
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 6,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Material BGL"),
            entries: &entries,
        })
    }

    /// Builds GPU textures and bind groups for anything registered since the last call.
    pub fn prepare_gpu(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        layout: &wgpu::BindGroupLayout,
    ) -> Result<()> {
        self.ensure_fallbacks(device, queue);
        if self.sampler.is_none() {
            self.sampler = Some(device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("Material Sampler"),
                address_mode_u: wgpu::AddressMode::Repeat,
                address_mode_v: wgpu::AddressMode::Repeat,
                address_mode_w: wgpu::AddressMode::Repeat,
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                mipmap_filter: wgpu::FilterMode::Nearest,
                ..Default::default()
            }));
        }
        for entry in self.textures.iter_mut().filter(|entry| entry.gpu.is_none()) {
            let format =
                if entry.srgb { wgpu::TextureFormat::Rgba8UnormSrgb } else { wgpu::TextureFormat::Rgba8Unorm };
            entry.gpu = Some(upload_rgba8(device, queue, &entry.label, entry.width, entry.height, &entry.data, format));
        }

        for index in 0..self.materials.len() {
            if self.materials[index].gpu.is_some() {
                continue;
            }
            let handle = MaterialHandle(index as u32);
            let gpu = self.build_material_gpu(device, layout, handle)?;
            self.materials[index].gpu = Some(gpu);
        }
        Ok(())
    }

    pub fn bind_group(&self, handle: MaterialHandle) -> Option<&wgpu::BindGroup> {
        self.materials.get(handle.0 as usize)?.gpu.as_ref().map(|gpu| &gpu.bind_group)
    }

    fn build_material_gpu(
        &mut self,
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        handle: MaterialHandle,
    ) -> Result<MaterialGpu> {
        let desc = self.material(handle).context("Material missing while building bind group")?.clone();
        for slot in MaterialSlot::ALL {
            if let Some(texture) = desc.slot(slot) {
                if self.resolve_slot(handle, slot) == SlotSource::Fallback && self.missing_warnings.insert(texture) {
                    tracing::warn!(
                        material = %desc.label,
                        slot = slot.label(),
                        "Texture {:?} is not registered; binding the fallback",
                        texture
                    );
                }
            }
        }

        let uniform = MaterialUniform {
            base_color: desc.base_color,
            params: [desc.metallic.clamp(0.0, 1.0), desc.roughness.clamp(0.04, 1.0), 0.0, 0.0],
        };
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Material Uniform Buffer"),
            contents: bytemuck::bytes_of(&uniform),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let fallbacks = self.fallbacks.as_ref().context("Material fallback textures missing")?;
        let sampler = self.sampler.as_ref().context("Material sampler missing")?;
        let mut views = Vec::with_capacity(MaterialSlot::ALL.len());
        for slot in MaterialSlot::ALL {
            let view = match self.resolve_slot(handle, slot) {
                SlotSource::Texture(texture) => self.textures[texture.0 as usize]
                    .gpu
                    .as_ref()
                    .map(|(_, view)| view)
                    .context("Material texture not uploaded")?,
                SlotSource::Fallback => fallbacks.view(slot).context("Fallback texture missing")?,
            };
            views.push((slot, view));
        }

        let mut entries = vec![wgpu::BindGroupEntry { binding: 0, resource: uniform_buffer.as_entire_binding() }];
        for (slot, view) in &views {
            entries.push(wgpu::BindGroupEntry {
                binding: slot.binding(),
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        entries.push(wgpu::BindGroupEntry { binding: 6, resource: wgpu::BindingResource::Sampler(sampler) });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("Material BG ({})", desc.label)),
            layout,
            entries: &entries,
        });
        Ok(MaterialGpu { bind_group, _uniform_buffer: uniform_buffer })
    }

    fn ensure_fallbacks(&mut self, device: &wgpu::Device, queue: &wgpu::Queue) {
        if self.fallbacks.is_some() {
            return;
        }
        let mut views = Vec::new();
        let mut textures = Vec::new();
        for slot in MaterialSlot::ALL {
            let format =
                if slot.srgb() { wgpu::TextureFormat::Rgba8UnormSrgb } else { wgpu::TextureFormat::Rgba8Unorm };
            let label = format!("Material Fallback ({})", slot.label());
            let (texture, view) = upload_rgba8(device, queue, &label, 1, 1, &slot.fallback_texel(), format);
            views.push((slot, view));
            textures.push(texture);
        }
        self.fallbacks = Some(FallbackTextures { views, _textures: textures });
    }
}

pub(crate) fn upload_rgba8(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    label: &str,
    width: u32,
    height: u32,
    data: &[u8],
    format: wgpu::TextureFormat,
) -> (wgpu::Texture, wgpu::TextureView) {
    let size = wgpu::Extent3d { width, height, depth_or_array_layers: 1 };
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        data,
        wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(width * 4), rows_per_image: Some(height) },
        size,
    );
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_texels_follow_slot_semantics() {
        assert_eq!(MaterialSlot::Albedo.fallback_texel(), [255, 255, 255, 255]);
        assert_eq!(MaterialSlot::Ao.fallback_texel(), [255, 255, 255, 255]);
        assert_eq!(MaterialSlot::Metallic.fallback_texel(), [0, 0, 0, 255]);
        assert_eq!(MaterialSlot::Roughness.fallback_texel(), [255, 255, 255, 255]);
        assert_eq!(MaterialSlot::Normal.fallback_texel(), [128, 128, 255, 255]);
    }

    #[test]
    fn empty_and_unknown_slots_resolve_to_fallback() {
        let mut registry = MaterialRegistry::new();
        let albedo = registry.add_texture_rgba8("checker", 2, 1, vec![255; 8], true).expect("texture");
        let material = registry.add_material(MaterialDesc {
            albedo_map: Some(albedo),
            normal_map: Some(TextureHandle(99)),
            ..MaterialDesc::default()
        });
        assert_eq!(registry.resolve_slot(material, MaterialSlot::Albedo), SlotSource::Texture(albedo));
        assert_eq!(registry.resolve_slot(material, MaterialSlot::Normal), SlotSource::Fallback);
        assert_eq!(registry.resolve_slot(material, MaterialSlot::Roughness), SlotSource::Fallback);
        assert_eq!(registry.resolve_slot(MaterialHandle(42), MaterialSlot::Albedo), SlotSource::Fallback);
    }

    #[test]
    fn texture_size_is_validated() {
        let mut registry = MaterialRegistry::new();
        assert!(registry.add_texture_rgba8("short", 2, 2, vec![0; 15], false).is_err());
        assert!(registry.add_texture_rgba8("empty", 0, 2, Vec::new(), false).is_err());
    }

    #[test]
    fn default_material_is_registered() {
        let mut registry = MaterialRegistry::new();
        assert_eq!(registry.material_count(), 1);
        assert_eq!(registry.material(registry.default_material()).map(|m| m.label.as_str()), Some("Default"));
        let updated = MaterialDesc::solid("Red", [1.0, 0.0, 0.0, 1.0], 0.0, 0.5);
        registry.update_material(MaterialHandle(0), updated).expect("update");
        assert!(registry.update_material(MaterialHandle(7), MaterialDesc::default()).is_err());
    }
}
