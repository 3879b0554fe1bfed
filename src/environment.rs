use anyhow::{Context, Result};
use glam::{Vec2, Vec3};
use half::f16;
use image::{DynamicImage, ImageReader};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::f32::consts::{PI, TAU};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

pub const DIFFUSE_CACHE_FILE: &str = "diffuse.bin";
pub const SPECULAR_CACHE_FILE: &str = "specular.bin";
pub const BRDF_CACHE_FILE: &str = "brdf_lut.bin";

/// Resolution and sample counts for the image-based lighting precompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IblSettings {
    pub diffuse_resolution: u32,
    pub specular_base_resolution: u32,
    pub specular_mip_count: u32,
    pub brdf_lut_size: u32,
    pub diffuse_samples: u32,
    pub specular_samples: u32,
    pub brdf_samples: u32,
}

impl Default for IblSettings {
    fn default() -> Self {
        Self {
            diffuse_resolution: 32,
            specular_base_resolution: 128,
            specular_mip_count: 6,
            brdf_lut_size: 256,
            diffuse_samples: 64,
            specular_samples: 128,
            brdf_samples: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cubemap {
    pub size: u32,
    pub faces: [Vec<f32>; 6],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefilteredCubemap {
    pub base_size: u32,
    pub levels: Vec<Cubemap>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lut2D {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

/// CPU-side irradiance, prefiltered specular and BRDF integration maps.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentMaps {
    pub diffuse: Cubemap,
    pub specular: PrefilteredCubemap,
    pub brdf: Lut2D,
}

#[derive(Clone)]
struct HdrImage {
    width: u32,
    height: u32,
    pixels: Vec<Vec3>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Computed,
}

/// Disk cache for [`EnvironmentMaps`].
///
/// A cache directory counts as valid when all three files exist. Nothing is versioned,
/// so a cache written for a different source or different settings is reused as-is.
pub struct EnvironmentCache;

impl EnvironmentCache {
    pub fn is_cached(dir: &Path) -> bool {
        [DIFFUSE_CACHE_FILE, SPECULAR_CACHE_FILE, BRDF_CACHE_FILE].iter().all(|name| dir.join(name).is_file())
    }

    pub fn load_or_compute(
        dir: &Path,
        source: Option<&Path>,
        settings: &IblSettings,
    ) -> Result<(EnvironmentMaps, CacheOutcome)> {
        if Self::is_cached(dir) {
            match Self::load(dir) {
                Ok(maps) => {
                    tracing::info!(dir = %dir.display(), "IBL cache hit");
                    return Ok((maps, CacheOutcome::Hit));
                }
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), "IBL cache unreadable, recomputing: {err:#}");
                }
            }
        }
        tracing::info!(dir = %dir.display(), "IBL cache miss; precomputing environment maps");
        let image = match source {
            Some(path) => load_hdr_image(path)?,
            None => generate_default_hdr(),
        };
        let maps = EnvironmentMaps::from_hdr(&image, settings);
        Self::store(dir, &maps)?;
        Ok((maps, CacheOutcome::Computed))
    }

    pub fn load(dir: &Path) -> Result<EnvironmentMaps> {
        Ok(EnvironmentMaps {
            diffuse: read_bin(&dir.join(DIFFUSE_CACHE_FILE))?,
            specular: read_bin(&dir.join(SPECULAR_CACHE_FILE))?,
            brdf: read_bin(&dir.join(BRDF_CACHE_FILE))?,
        })
    }

    pub fn store(dir: &Path, maps: &EnvironmentMaps) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("creating IBL cache directory '{}'", dir.display()))?;
        write_bin(&dir.join(DIFFUSE_CACHE_FILE), &maps.diffuse)?;
        write_bin(&dir.join(SPECULAR_CACHE_FILE), &maps.specular)?;
        write_bin(&dir.join(BRDF_CACHE_FILE), &maps.brdf)?;
        Ok(())
    }
}

fn read_bin<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    bincode::deserialize_from(BufReader::new(file)).with_context(|| format!("decoding '{}'", path.display()))
}

fn write_bin<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating '{}'", path.display()))?;
    bincode::serialize_into(BufWriter::new(file), value).with_context(|| format!("writing '{}'", path.display()))
}

impl EnvironmentMaps {
    fn from_hdr(image: &HdrImage, settings: &IblSettings) -> Self {
        let diffuse = compute_diffuse_cubemap(image, settings.diffuse_resolution.max(1), settings.diffuse_samples);
        let specular = compute_specular_cubemap(
            image,
            settings.specular_base_resolution.max(1),
            settings.specular_mip_count,
            settings.specular_samples,
        );
        let brdf = compute_brdf_lut(settings.brdf_lut_size.max(1), settings.brdf_samples);
        Self { diffuse, specular, brdf }
    }

    /// Maps for the built-in gradient sky.
    pub fn generated_default(settings: &IblSettings) -> Self {
        Self::from_hdr(&generate_default_hdr(), settings)
    }

    pub fn from_path(path: &Path, settings: &IblSettings) -> Result<Self> {
        let image = load_hdr_image(path)?;
        Ok(Self::from_hdr(&image, settings))
    }
}

fn f32_to_f16_bits(data: &[f32]) -> Vec<u16> {
    data.iter().map(|value| f16::from_f32(*value).to_bits()).collect()
}

/// Uploaded IBL textures, bound by the lighting pass.
pub struct EnvironmentGpu {
    _diffuse_texture: wgpu::Texture,
    diffuse_view: wgpu::TextureView,
    _specular_texture: wgpu::Texture,
    specular_view: wgpu::TextureView,
    _brdf_texture: wgpu::Texture,
    brdf_view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    specular_mip_count: u32,
}

impl EnvironmentGpu {
    pub fn upload(device: &wgpu::Device, queue: &wgpu::Queue, maps: &EnvironmentMaps) -> Result<Self> {
        let diffuse_texture = create_cube_texture(device, "Environment Diffuse Cube", maps.diffuse.size, 1);
        write_cube_level(queue, &diffuse_texture, 0, &maps.diffuse);
        let diffuse_view = diffuse_texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Environment Diffuse View"),
            dimension: Some(wgpu::TextureViewDimension::Cube),
            ..Default::default()
        });

        let mip_count = maps.specular.levels.len().max(1) as u32;
        let specular_texture =
            create_cube_texture(device, "Environment Specular Cube", maps.specular.base_size, mip_count);
        for (level_idx, level) in maps.specular.levels.iter().enumerate() {
            write_cube_level(queue, &specular_texture, level_idx as u32, level);
        }
        let specular_view = specular_texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Environment Specular View"),
            dimension: Some(wgpu::TextureViewDimension::Cube),
            base_mip_level: 0,
            mip_level_count: Some(mip_count),
            ..Default::default()
        });

        let brdf_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Environment BRDF LUT"),
            size: wgpu::Extent3d { width: maps.brdf.width, height: maps.brdf.height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba16Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let brdf_half = f32_to_f16_bits(&maps.brdf.data);
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &brdf_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&brdf_half),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(maps.brdf.width * 8),
                rows_per_image: Some(maps.brdf.height),
            },
            wgpu::Extent3d { width: maps.brdf.width, height: maps.brdf.height, depth_or_array_layers: 1 },
        );
        let brdf_view = brdf_texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Environment BRDF View"),
            dimension: Some(wgpu::TextureViewDimension::D2),
            ..Default::default()
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Environment Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Ok(Self {
            _diffuse_texture: diffuse_texture,
            diffuse_view,
            _specular_texture: specular_texture,
            specular_view,
            _brdf_texture: brdf_texture,
            brdf_view,
            sampler,
            specular_mip_count: mip_count,
        })
    }

    pub fn diffuse_view(&self) -> &wgpu::TextureView {
        &self.diffuse_view
    }

    pub fn specular_view(&self) -> &wgpu::TextureView {
        &self.specular_view
    }

    pub fn brdf_view(&self) -> &wgpu::TextureView {
        &self.brdf_view
    }

    pub fn sampler(&self) -> &wgpu::Sampler {
        &self.sampler
    }

    pub fn specular_mip_count(&self) -> u32 {
        self.specular_mip_count
    }
}

fn create_cube_texture(device: &wgpu::Device, label: &str, size: u32, mip_count: u32) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d { width: size, height: size, depth_or_array_layers: 6 },
        mip_level_count: mip_count,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba16Float,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}

fn write_cube_level(queue: &wgpu::Queue, texture: &wgpu::Texture, mip_level: u32, level: &Cubemap) {
    for (face, data) in level.faces.iter().enumerate() {
        let face_half = f32_to_f16_bits(data);
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level,
                origin: wgpu::Origin3d { x: 0, y: 0, z: face as u32 },
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&face_half),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(level.size * 8),
                rows_per_image: Some(level.size),
            },
            wgpu::Extent3d { width: level.size, height: level.size, depth_or_array_layers: 1 },
        );
    }
}

fn load_hdr_image(path: &Path) -> Result<HdrImage> {
    let reader = ImageReader::open(path)
        .with_context(|| format!("opening environment '{}'", path.display()))?
        .with_guessed_format()?;
    let dyn_img = reader.decode().with_context(|| format!("decoding environment '{}'", path.display()))?;
    Ok(convert_to_hdr(&dyn_img))
}

fn convert_to_hdr(image: &DynamicImage) -> HdrImage {
    let rgb = image.to_rgb32f();
    let (width, height) = (rgb.width(), rgb.height());
    let pixels = rgb.pixels().map(|pixel| Vec3::from_array(pixel.0)).collect();
    HdrImage { width, height, pixels }
}

fn generate_default_hdr() -> HdrImage {
    let width = 256u32;
    let height = 128u32;
    let mut pixels = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        let v = y as f32 / (height - 1) as f32;
        for x in 0..width {
            let u = x as f32 / (width - 1) as f32;
            let horizon = (1.0 - (2.0 * (v - 0.5)).abs()).clamp(0.0, 1.0);
            let sky = Vec3::new(0.25, 0.35, 0.6) * (1.0 - v) + Vec3::new(0.65, 0.7, 0.9) * v;
            let sun_dir = Vec2::new(u - 0.2, v - 0.35);
            let sun = ((1.0 - sun_dir.length() * 6.0).max(0.0)).powf(12.0);
            let ground = Vec3::new(0.08, 0.07, 0.05) * (1.0 - horizon) + Vec3::new(0.2, 0.18, 0.16) * horizon;
            let mut color = sky * (0.6 + 0.4 * horizon) + ground * (1.0 - horizon);
            color += Vec3::new(1.0, 0.9, 0.75) * sun * 8.0;
            pixels.push(color);
        }
    }
    HdrImage { width, height, pixels }
}

fn empty_faces(size: u32) -> [Vec<f32>; 6] {
    std::array::from_fn(|_| vec![0.0; (size * size * 4) as usize])
}

fn compute_diffuse_cubemap(image: &HdrImage, size: u32, sample_count: u32) -> Cubemap {
    let sample_count = sample_count.max(1);
    let mut faces = empty_faces(size);
    for (face, data) in faces.iter_mut().enumerate() {
        for y in 0..size {
            for x in 0..size {
                let dir = cubemap_direction(face, x, y, size);
                let mut result = Vec3::ZERO;
                let mut weight_sum = 0.0f32;
                for sample in 0..sample_count {
                    let xi = hammersley(sample, sample_count);
                    let sample_dir = cosine_sample_hemisphere(dir, xi);
                    let n_dot_l = dir.dot(sample_dir).max(0.0);
                    if n_dot_l > 0.0 {
                        result += sample_equirect(image, sample_dir) * n_dot_l;
                        weight_sum += n_dot_l;
                    }
                }
                if weight_sum > 0.0 {
                    result /= weight_sum;
                }
                let idx = ((y * size + x) * 4) as usize;
                data[idx..idx + 4].copy_from_slice(&[result.x, result.y, result.z, 1.0]);
            }
        }
    }
    Cubemap { size, faces }
}

fn compute_specular_cubemap(image: &HdrImage, base_size: u32, mip_count: u32, sample_count: u32) -> PrefilteredCubemap {
    let sample_count = sample_count.max(1);
    let max_level = mip_count.max(1);
    let mut levels = Vec::with_capacity(max_level as usize);
    for mip in 0..max_level {
        let size = (base_size >> mip).max(1);
        let roughness = mip as f32 / (max_level as f32 - 1.0).max(1.0);
        let mut faces = empty_faces(size);
        for (face, data) in faces.iter_mut().enumerate() {
            for y in 0..size {
                for x in 0..size {
                    let r = cubemap_direction(face, x, y, size);
                    let mut color = Vec3::ZERO;
                    let mut weight_sum = 0.0f32;
                    for sample in 0..sample_count {
                        let xi = hammersley(sample, sample_count);
                        let h = importance_sample_ggx(r, xi, roughness);
                        let l = reflect(-r, h).normalize();
                        let n_dot_l = r.dot(l).max(0.0);
                        if n_dot_l > 0.0 {
                            color += sample_equirect(image, l) * n_dot_l;
                            weight_sum += n_dot_l;
                        }
                    }
                    if weight_sum > 0.0 {
                        color /= weight_sum;
                    }
                    let idx = ((y * size + x) * 4) as usize;
                    data[idx..idx + 4].copy_from_slice(&[color.x, color.y, color.z, 1.0]);
                }
            }
        }
        levels.push(Cubemap { size, faces });
    }
    PrefilteredCubemap { base_size, levels }
}

fn compute_brdf_lut(size: u32, sample_count: u32) -> Lut2D {
    let mut data = vec![0.0f32; (size * size * 4) as usize];
    for y in 0..size {
        let roughness = (y as f32 + 0.5) / size as f32;
        for x in 0..size {
            let n_dot_v = (x as f32 + 0.5) / size as f32;
            let (a, b) = integrate_brdf(n_dot_v, roughness, sample_count.max(1));
            let idx = ((y * size + x) * 4) as usize;
            data[idx..idx + 4].copy_from_slice(&[a, b, 0.0, 1.0]);
        }
    }
    Lut2D { width: size, height: size, data }
}

fn sample_equirect(image: &HdrImage, dir: Vec3) -> Vec3 {
    let d = dir.normalize();
    let theta = d.y.clamp(-1.0, 1.0).acos();
    let phi = d.z.atan2(d.x);
    let u = (phi + PI) / TAU;
    let v = theta / PI;
    let x = u * (image.width as f32 - 1.0);
    let y = v * (image.height as f32 - 1.0);
    let (x0, y0) = (x.floor(), y.floor());
    let (tx, ty) = (x - x0, y - y0);

    let ix0 = x0.rem_euclid(image.width as f32) as u32;
    let ix1 = (x0 + 1.0).rem_euclid(image.width as f32) as u32;
    let iy0 = y0.clamp(0.0, (image.height - 1) as f32) as u32;
    let iy1 = (y0 + 1.0).clamp(0.0, (image.height - 1) as f32) as u32;

    let c0 = image.pixel(ix0, iy0) * (1.0 - tx) + image.pixel(ix1, iy0) * tx;
    let c1 = image.pixel(ix0, iy1) * (1.0 - tx) + image.pixel(ix1, iy1) * tx;
    c0 * (1.0 - ty) + c1 * ty
}

fn cubemap_direction(face: usize, x: u32, y: u32, size: u32) -> Vec3 {
    let a = (2.0 * (x as f32 + 0.5) / size as f32) - 1.0;
    let b = (2.0 * (y as f32 + 0.5) / size as f32) - 1.0;
    match face {
        0 => Vec3::new(1.0, -b, -a),
        1 => Vec3::new(-1.0, -b, a),
        2 => Vec3::new(a, 1.0, b),
        3 => Vec3::new(a, -1.0, -b),
        4 => Vec3::new(a, -b, 1.0),
        _ => Vec3::new(-a, -b, -1.0),
    }
    .normalize()
}

fn cosine_sample_hemisphere(normal: Vec3, xi: Vec2) -> Vec3 {
    let r = xi.x.sqrt();
    let theta = TAU * xi.y;
    let z = (1.0 - xi.x).sqrt();
    tangent_to_world(normal, Vec3::new(r * theta.cos(), r * theta.sin(), z))
}

fn importance_sample_ggx(normal: Vec3, xi: Vec2, roughness: f32) -> Vec3 {
    let a = roughness.max(0.001);
    let phi = TAU * xi.x;
    let cos_theta = ((1.0 - xi.y) / (1.0 + (a * a - 1.0) * xi.y)).sqrt();
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let h = Vec3::new(phi.cos() * sin_theta, phi.sin() * sin_theta, cos_theta);
    tangent_to_world(normal, h)
}

fn tangent_to_world(normal: Vec3, vec: Vec3) -> Vec3 {
    let up = if normal.z.abs() < 0.999 { Vec3::Z } else { Vec3::X };
    let tangent = normal.cross(up).normalize();
    let bitangent = normal.cross(tangent);
    tangent * vec.x + bitangent * vec.y + normal * vec.z
}

fn reflect(v: Vec3, n: Vec3) -> Vec3 {
    v - 2.0 * v.dot(n) * n
}

fn hammersley(i: u32, n: u32) -> Vec2 {
    Vec2::new(i as f32 / n as f32, radical_inverse_vdc(i))
}

fn radical_inverse_vdc(bits: u32) -> f32 {
    bits.reverse_bits() as f32 * 2.328_306_4e-10
}

fn integrate_brdf(n_dot_v: f32, roughness: f32, sample_count: u32) -> (f32, f32) {
    let normal = Vec3::Z;
    let v = Vec3::new((1.0 - n_dot_v * n_dot_v).sqrt(), 0.0, n_dot_v);
    let mut a = 0.0f32;
    let mut b = 0.0f32;
    for i in 0..sample_count {
        let xi = hammersley(i, sample_count);
        let h = importance_sample_ggx(normal, xi, roughness);
        let l = reflect(-v, h);
        let n_dot_l = l.z.max(0.0);
        let n_dot_h = h.z.max(0.0);
        let v_dot_h = v.dot(h).max(0.0);
        if n_dot_l > 0.0 {
            let g = geometry_smith(normal, v, l, roughness);
            let g_vis = (g * v_dot_h) / (n_dot_h * n_dot_v).max(1e-4);
            let fc = (1.0 - v_dot_h).powi(5);
            a += (1.0 - fc) * g_vis;
            b += fc * g_vis;
        }
    }
    let scale = 1.0 / sample_count as f32;
    (a * scale, b * scale)
}

fn geometry_smith(normal: Vec3, v: Vec3, l: Vec3, roughness: f32) -> f32 {
    let n_dot_v = normal.dot(v).max(0.0);
    let n_dot_l = normal.dot(l).max(0.0);
    geometry_schlick_ggx(n_dot_v, roughness) * geometry_schlick_ggx(n_dot_l, roughness)
}

fn geometry_schlick_ggx(n_dot_v: f32, roughness: f32) -> f32 {
    let r = roughness + 1.0;
    let k = (r * r) * 0.125;
    n_dot_v / (n_dot_v * (1.0 - k) + k)
}

impl HdrImage {
    fn pixel(&self, x: u32, y: u32) -> Vec3 {
        self.pixels[(y * self.width + x) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn tiny_settings() -> IblSettings {
        IblSettings {
            diffuse_resolution: 2,
            specular_base_resolution: 4,
            specular_mip_count: 2,
            brdf_lut_size: 4,
            diffuse_samples: 8,
            specular_samples: 8,
            brdf_samples: 16,
        }
    }

    #[test]
    fn radical_inverse_matches_reference_values() {
        assert_eq!(radical_inverse_vdc(0), 0.0);
        assert!((radical_inverse_vdc(1) - 0.5).abs() < 1e-6);
        assert!((radical_inverse_vdc(2) - 0.25).abs() < 1e-6);
        assert!((radical_inverse_vdc(3) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn generated_maps_have_expected_shapes() {
        let maps = EnvironmentMaps::generated_default(&tiny_settings());
        assert_eq!(maps.diffuse.size, 2);
        assert!(maps.diffuse.faces.iter().all(|face| face.len() == 2 * 2 * 4));
        assert_eq!(maps.specular.levels.len(), 2);
        assert_eq!(maps.specular.levels[1].size, 2);
        assert_eq!(maps.brdf.data.len(), 4 * 4 * 4);
        for texel in maps.brdf.data.chunks(4) {
            assert!(texel[0] >= 0.0 && texel[0] <= 1.05, "scale {}", texel[0]);
            assert!(texel[1] >= 0.0 && texel[1] <= 1.05, "bias {}", texel[1]);
        }
    }

    #[test]
    fn cache_round_trip_then_hit() {
        let dir = tempdir().expect("temp dir");
        let cache = dir.path().join("ibl");
        assert!(!EnvironmentCache::is_cached(&cache));

        let (computed, outcome) =
            EnvironmentCache::load_or_compute(&cache, None, &tiny_settings()).expect("compute");
        assert_eq!(outcome, CacheOutcome::Computed);
        for name in [DIFFUSE_CACHE_FILE, SPECULAR_CACHE_FILE, BRDF_CACHE_FILE] {
            assert!(cache.join(name).is_file(), "{name} missing");
        }

        let (loaded, outcome) = EnvironmentCache::load_or_compute(&cache, None, &tiny_settings()).expect("load");
        assert_eq!(outcome, CacheOutcome::Hit);
        assert_eq!(loaded, computed);
    }

    #[test]
    fn missing_file_forces_recompute() {
        let dir = tempdir().expect("temp dir");
        EnvironmentCache::load_or_compute(dir.path(), None, &tiny_settings()).expect("compute");
        fs::remove_file(dir.path().join(SPECULAR_CACHE_FILE)).expect("remove");
        let (_, outcome) = EnvironmentCache::load_or_compute(dir.path(), None, &tiny_settings()).expect("again");
        assert_eq!(outcome, CacheOutcome::Computed);
    }

    #[test]
    fn existing_cache_is_reused_even_for_new_settings() {
        let dir = tempdir().expect("temp dir");
        EnvironmentCache::load_or_compute(dir.path(), None, &tiny_settings()).expect("compute");
        let other = IblSettings { diffuse_resolution: 3, ..tiny_settings() };
        let (maps, outcome) = EnvironmentCache::load_or_compute(dir.path(), None, &other).expect("load");
        assert_eq!(outcome, CacheOutcome::Hit);
        assert_eq!(maps.diffuse.size, 2);
    }

    #[test]
    fn png_source_is_decoded() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("studio.png");
        let mut img = RgbImage::new(4, 2);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([255, 255, 255]);
        }
        img.save(&path).expect("save png");

        let maps = EnvironmentMaps::from_path(&path, &tiny_settings()).expect("maps");
        for value in maps.diffuse.faces[0].chunks(4) {
            assert!((value[0] - 1.0).abs() < 1e-3, "uniform white sky should integrate to white");
        }
    }
}
