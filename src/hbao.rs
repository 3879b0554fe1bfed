//! Horizon-based ambient occlusion: parameter clamping, GPU uniform packing, the 4x4
//! jitter tile and a CPU evaluation of the same kernel the WGSL shaders run.

use glam::{Mat4, Vec2, Vec3, Vec4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::camera::Camera3D;

pub const HBAO_NUM_DIRECTIONS: usize = 8;
pub const HBAO_NUM_STEPS: usize = 4;
pub const AO_RANDOMTEX_SIZE: usize = 4;
pub const BLUR_KERNEL_RADIUS: i32 = 3;

const JITTER_SEED: u64 = 0x6862_616f;

/// User-facing HBAO settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HbaoParameters {
    /// Sampling radius in meters.
    pub radius: f32,
    /// Power exponent applied to the final occlusion.
    pub intensity: f32,
    /// Angle bias in [0, 1). Suppresses self-occlusion on low-tessellated surfaces.
    pub bias: f32,
    pub blur_sharpness: f32,
    pub meters_to_viewspace: f32,
}

impl Default for HbaoParameters {
    fn default() -> Self {
        Self { radius: 2.0, intensity: 1.5, bias: 0.1, blur_sharpness: 40.0, meters_to_viewspace: 1.0 }
    }
}

impl HbaoParameters {
    pub const MIN_RADIUS: f32 = 0.01;
    pub const MAX_BIAS: f32 = 0.99;

    /// Copy with every field inside its documented range.
    pub fn clamped(self) -> Self {
        Self {
            radius: finite_or(self.radius, 2.0).max(Self::MIN_RADIUS),
            intensity: finite_or(self.intensity, 1.5).max(0.0),
            bias: finite_or(self.bias, 0.1).clamp(0.0, Self::MAX_BIAS),
            blur_sharpness: finite_or(self.blur_sharpness, 40.0).max(0.0),
            meters_to_viewspace: if self.meters_to_viewspace.is_finite() && self.meters_to_viewspace > 0.0 {
                self.meters_to_viewspace
            } else {
                1.0
            },
        }
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Projection inputs the AO stage needs, taken from the camera each frame.
#[derive(Debug, Clone, Copy)]
pub struct AoProjection {
    pub matrix: Mat4,
    pub near: f32,
    pub far: f32,
    /// `Some(fov_y)` for perspective cameras.
    pub fov_y_radians: Option<f32>,
}

impl AoProjection {
    pub fn from_camera(camera: &Camera3D) -> Self {
        Self { matrix: camera.projection(), near: camera.near, far: camera.far, fov_y_radians: camera.fov() }
    }

    pub fn is_perspective(&self) -> bool {
        self.fov_y_radians.is_some()
    }

    /// Converts a view-space UV with a bottom-left origin into the projInfo reconstruction terms.
    pub fn proj_info(&self) -> Vec4 {
        let p = self.matrix;
        let (p00, p11) = (p.x_axis.x, p.y_axis.y);
        if self.is_perspective() {
            Vec4::new(2.0 / p00, 2.0 / p11, -(1.0 - p.z_axis.x) / p00, -(1.0 + p.z_axis.y) / p11)
        } else {
            Vec4::new(2.0 / p00, 2.0 / p11, -(1.0 + p.w_axis.x) / p00, -(1.0 - p.w_axis.y) / p11)
        }
    }

    /// Pixels per view-space unit at distance 1 (perspective) or everywhere (orthographic).
    pub fn proj_scale(&self, height: u32) -> f32 {
        let height = height as f32;
        match self.fov_y_radians {
            Some(fov) => height / ((fov * 0.5).tan() * 2.0),
            None => height / self.proj_info().y,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct HbaoUniform {
    pub radius_to_screen: f32,
    pub r2: f32,
    pub neg_inv_r2: f32,
    pub n_dot_v_bias: f32,
    pub inv_full_resolution: [f32; 2],
    pub inv_quarter_resolution: [f32; 2],
    pub ao_multiplier: f32,
    pub pow_exponent: f32,
    pub proj_ortho: u32,
    pub _padding: u32,
    pub proj_info: [f32; 4],
}

impl HbaoUniform {
    pub fn new(params: &HbaoParameters, projection: &AoProjection, width: u32, height: u32) -> Self {
        let params = params.clamped();
        let width = width.max(1);
        let height = height.max(1);
        let proj_info = projection.proj_info();
        let proj_scale = projection.proj_scale(height);

        let r = params.radius * params.meters_to_viewspace;
        let r2 = r * r;
        let n_dot_v_bias = params.bias.clamp(0.0, 1.0);
        let quarter_w = width.div_ceil(4) as f32;
        let quarter_h = height.div_ceil(4) as f32;

        Self {
            radius_to_screen: r * 0.5 * proj_scale,
            r2,
            neg_inv_r2: -1.0 / r2,
            n_dot_v_bias,
            inv_full_resolution: [1.0 / width as f32, 1.0 / height as f32],
            inv_quarter_resolution: [1.0 / quarter_w, 1.0 / quarter_h],
            ao_multiplier: 1.0 / (1.0 - n_dot_v_bias),
            pow_exponent: params.intensity.max(0.0),
            proj_ortho: u32::from(!projection.is_perspective()),
            _padding: 0,
            proj_info: proj_info.to_array(),
        }
    }
}

/// `(near * far, near - far, far, perspective)`, consumed by the depth linearization shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LinearizeUniform {
    pub clip_info: [f32; 4],
}

impl LinearizeUniform {
    pub fn new(near: f32, far: f32, perspective: bool) -> Self {
        Self { clip_info: [near * far, near - far, far, if perspective { 1.0 } else { 0.0 }] }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BlurUniform {
    pub inv_resolution_direction: [f32; 2],
    pub sharpness: f32,
    pub _padding: f32,
}

impl BlurUniform {
    pub fn horizontal(width: u32, sharpness: f32) -> Self {
        Self { inv_resolution_direction: [1.0 / width.max(1) as f32, 0.0], sharpness, _padding: 0.0 }
    }

    pub fn vertical(height: u32, sharpness: f32) -> Self {
        Self { inv_resolution_direction: [0.0, 1.0 / height.max(1) as f32], sharpness, _padding: 0.0 }
    }
}

/// Linear view distance from a 0..1 hardware depth value.
pub fn linearize_depth(depth: f32, near: f32, far: f32, perspective: bool) -> f32 {
    if perspective {
        near * far / (far - depth * (far - near))
    } else {
        near + depth * (far - near)
    }
}

/// 4x4 tile of `(cos a, sin a, jitter, 0)` with `a` a random rotation within one direction sector.
pub fn jitter_tile(seed: u64) -> [Vec4; AO_RANDOMTEX_SIZE * AO_RANDOMTEX_SIZE] {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tile = [Vec4::ZERO; AO_RANDOMTEX_SIZE * AO_RANDOMTEX_SIZE];
    for texel in tile.iter_mut() {
        let rand1: f32 = rng.gen();
        let rand2: f32 = rng.gen();
        let angle = std::f32::consts::TAU * rand1 / HBAO_NUM_DIRECTIONS as f32;
        *texel = Vec4::new(angle.cos(), angle.sin(), rand2, 0.0);
    }
    tile
}

pub fn default_jitter_tile() -> [Vec4; AO_RANDOMTEX_SIZE * AO_RANDOMTEX_SIZE] {
    jitter_tile(JITTER_SEED)
}

/// Single-channel image used by the CPU kernel.
#[derive(Debug, Clone)]
pub struct AoImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl AoImage {
    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self { width, height, data: vec![value; (width * height) as usize] }
    }

    fn texel_clamped(&self, x: i32, y: i32) -> f32 {
        let cx = x.clamp(0, self.width as i32 - 1) as u32;
        let cy = y.clamp(0, self.height as i32 - 1) as u32;
        self.data[(cy * self.width + cx) as usize]
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }
}

/// View position in the AO convention: x right, y up, z positive distance in front.
/// `uv` has a top-left origin, matching wgpu texture coordinates.
fn uv_to_view(uv: Vec2, eye_z: f32, uniform: &HbaoUniform) -> Vec3 {
    let info = Vec4::from_array(uniform.proj_info);
    let gl_uv = Vec2::new(uv.x, 1.0 - uv.y);
    let xy = gl_uv * Vec2::new(info.x, info.y) + Vec2::new(info.z, info.w);
    let scale = if uniform.proj_ortho != 0 { 1.0 } else { eye_z };
    (xy * scale).extend(eye_z)
}

fn falloff(distance_sq: f32, uniform: &HbaoUniform) -> f32 {
    distance_sq * uniform.neg_inv_r2 + 1.0
}

fn compute_ao(p: Vec3, n: Vec3, s: Vec3, uniform: &HbaoUniform) -> f32 {
    let v = s - p;
    let v_dot_v = v.dot(v);
    if v_dot_v <= f32::EPSILON {
        return 0.0;
    }
    let n_dot_v = n.dot(v) / v_dot_v.sqrt();
    (n_dot_v - uniform.n_dot_v_bias).clamp(0.0, 1.0) * falloff(v_dot_v, uniform).clamp(0.0, 1.0)
}

fn rotate_direction(dir: Vec2, cos_sin: Vec2) -> Vec2 {
    Vec2::new(dir.x * cos_sin.x - dir.y * cos_sin.y, dir.x * cos_sin.y + dir.y * cos_sin.x)
}

/// Evaluates the HBAO kernel for every pixel of `linear_depth`.
///
/// `view_normals` are view-space normals in the usual right-handed convention (+z toward
/// the viewer). Output is 1.0 where nothing occludes the pixel.
pub fn evaluate_hbao_cpu(
    linear_depth: &AoImage,
    view_normals: &[Vec3],
    uniform: &HbaoUniform,
    jitter: &[Vec4; AO_RANDOMTEX_SIZE * AO_RANDOMTEX_SIZE],
) -> AoImage {
    let (width, height) = (linear_depth.width, linear_depth.height);
    let inv_res = Vec2::from_array(uniform.inv_full_resolution);
    let fetch_view_pos = |px: i32, py: i32| {
        let cx = px.clamp(0, width as i32 - 1);
        let cy = py.clamp(0, height as i32 - 1);
        let uv = (Vec2::new(cx as f32, cy as f32) + 0.5) * inv_res;
        uv_to_view(uv, linear_depth.texel_clamped(cx, cy), uniform)
    };

    let mut out = AoImage::filled(width, height, 1.0);
    let alpha = std::f32::consts::TAU / HBAO_NUM_DIRECTIONS as f32;
    for y in 0..height {
        for x in 0..width {
            let idx = (y * width + x) as usize;
            let p = fetch_view_pos(x as i32, y as i32);
            let rh = view_normals[idx];
            let n = Vec3::new(rh.x, rh.y, -rh.z);
            let radius_pixels =
                if uniform.proj_ortho != 0 { uniform.radius_to_screen } else { uniform.radius_to_screen / p.z };
            let rand = jitter[(y as usize % AO_RANDOMTEX_SIZE) * AO_RANDOMTEX_SIZE + x as usize % AO_RANDOMTEX_SIZE];
            let step_size = radius_pixels / (HBAO_NUM_STEPS as f32 + 1.0);

            let mut ao = 0.0;
            for d in 0..HBAO_NUM_DIRECTIONS {
                let angle = alpha * d as f32;
                let direction = rotate_direction(Vec2::new(angle.cos(), angle.sin()), Vec2::new(rand.x, rand.y));
                let mut ray_pixels = rand.z * step_size + 1.0;
                for _ in 0..HBAO_NUM_STEPS {
                    // Screen y grows downward while view y grows upward.
                    let offset = (direction * ray_pixels).round();
                    let s = fetch_view_pos(x as i32 + offset.x as i32, y as i32 - offset.y as i32);
                    ray_pixels += step_size;
                    ao += compute_ao(p, n, s, uniform);
                }
            }
            ao *= uniform.ao_multiplier / (HBAO_NUM_DIRECTIONS * HBAO_NUM_STEPS) as f32;
            let ao = (1.0 - ao * 2.0).clamp(0.0, 1.0);
            out.data[idx] = ao.powf(uniform.pow_exponent);
        }
    }
    out
}

/// One separable bilateral blur pass guided by linear depth.
pub fn bilateral_blur_cpu(ao: &AoImage, linear_depth: &AoImage, sharpness: f32, horizontal: bool) -> AoImage {
    let sigma = BLUR_KERNEL_RADIUS as f32 * 0.5;
    let falloff = 1.0 / (2.0 * sigma * sigma);
    let (dx, dy) = if horizontal { (1, 0) } else { (0, 1) };
    let mut out = AoImage::filled(ao.width, ao.height, 0.0);
    for y in 0..ao.height as i32 {
        for x in 0..ao.width as i32 {
            let center_c = ao.texel_clamped(x, y);
            let center_d = linear_depth.texel_clamped(x, y);
            let mut total = center_c;
            let mut weight_total = 1.0;
            for r in 1..=BLUR_KERNEL_RADIUS {
                for sign in [-1, 1] {
                    let sx = x + dx * r * sign;
                    let sy = y + dy * r * sign;
                    let c = ao.texel_clamped(sx, sy);
                    let d = linear_depth.texel_clamped(sx, sy);
                    let ddiff = (d - center_d) * sharpness;
                    let rf = r as f32;
                    let w = (-rf * rf * falloff - ddiff * ddiff).exp2();
                    total += c * w;
                    weight_total += w;
                }
            }
            out.data[(y as u32 * ao.width + x as u32) as usize] = total / weight_total;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDTH: u32 = 64;
    const HEIGHT: u32 = 48;

    fn perspective() -> AoProjection {
        let fov = 45f32.to_radians();
        AoProjection {
            matrix: Mat4::perspective_rh(fov, WIDTH as f32 / HEIGHT as f32, 0.1, 100.0),
            near: 0.1,
            far: 100.0,
            fov_y_radians: Some(fov),
        }
    }

    fn scenario_params() -> HbaoParameters {
        HbaoParameters { radius: 2.0, bias: 0.1, intensity: 1.5, ..HbaoParameters::default() }
    }

    /// Linear depth and view normals of the plane `dot(n, p) = d` seen through `projection`.
    fn plane_buffers(projection: &AoProjection, normal: Vec3, d: f32) -> (AoImage, Vec<Vec3>) {
        let inv_proj = projection.matrix.inverse();
        let mut depth = AoImage::filled(WIDTH, HEIGHT, 0.0);
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let ndc_x = (x as f32 + 0.5) / WIDTH as f32 * 2.0 - 1.0;
                let ndc_y = 1.0 - (y as f32 + 0.5) / HEIGHT as f32 * 2.0;
                let far_point = inv_proj.project_point3(Vec3::new(ndc_x, ndc_y, 1.0));
                let ray = far_point.normalize();
                let t = d / normal.dot(ray);
                depth.data[(y * WIDTH + x) as usize] = -(ray * t).z;
            }
        }
        (depth, vec![normal; (WIDTH * HEIGHT) as usize])
    }

    #[test]
    fn defaults_match_documented_values() {
        let params = HbaoParameters::default();
        assert_eq!(params.radius, 2.0);
        assert_eq!(params.intensity, 1.5);
        assert_eq!(params.bias, 0.1);
        assert_eq!(params.blur_sharpness, 40.0);
        assert_eq!(params.meters_to_viewspace, 1.0);
    }

    #[test]
    fn clamping_enforces_ranges() {
        let params = HbaoParameters {
            radius: -3.0,
            intensity: -1.0,
            bias: 1.5,
            blur_sharpness: -2.0,
            meters_to_viewspace: 0.0,
        }
        .clamped();
        assert_eq!(params.radius, HbaoParameters::MIN_RADIUS);
        assert_eq!(params.intensity, 0.0);
        assert_eq!(params.bias, HbaoParameters::MAX_BIAS);
        assert_eq!(params.blur_sharpness, 0.0);
        assert_eq!(params.meters_to_viewspace, 1.0);
        let nan = HbaoParameters { radius: f32::NAN, ..HbaoParameters::default() }.clamped();
        assert_eq!(nan.radius, 2.0);
    }

    #[test]
    fn uniform_matches_reference_math() {
        let projection = perspective();
        let uniform = HbaoUniform::new(&scenario_params(), &projection, WIDTH, HEIGHT);
        let proj_scale = HEIGHT as f32 / ((45f32.to_radians() * 0.5).tan() * 2.0);
        assert!((uniform.radius_to_screen - 2.0 * 0.5 * proj_scale).abs() < 1e-4);
        assert_eq!(uniform.r2, 4.0);
        assert_eq!(uniform.neg_inv_r2, -0.25);
        assert!((uniform.n_dot_v_bias - 0.1).abs() < 1e-6);
        assert!((uniform.ao_multiplier - 1.0 / 0.9).abs() < 1e-6);
        assert_eq!(uniform.pow_exponent, 1.5);
        assert_eq!(uniform.inv_full_resolution, [1.0 / 64.0, 1.0 / 48.0]);
        assert_eq!(uniform.inv_quarter_resolution, [1.0 / 16.0, 1.0 / 12.0]);
        assert_eq!(uniform.proj_ortho, 0);

        let p = projection.matrix;
        assert!((uniform.proj_info[0] - 2.0 / p.x_axis.x).abs() < 1e-6);
        assert!((uniform.proj_info[1] - 2.0 / p.y_axis.y).abs() < 1e-6);
        assert!((uniform.proj_info[2] + 1.0 / p.x_axis.x).abs() < 1e-6);
        assert!((uniform.proj_info[3] + 1.0 / p.y_axis.y).abs() < 1e-6);
    }

    #[test]
    fn orthographic_uniform_uses_view_height() {
        let projection = AoProjection {
            matrix: Mat4::orthographic_rh(-8.0, 8.0, -6.0, 6.0, 0.1, 50.0),
            near: 0.1,
            far: 50.0,
            fov_y_radians: None,
        };
        let uniform = HbaoUniform::new(&HbaoParameters::default(), &projection, 160, 120);
        assert_eq!(uniform.proj_ortho, 1);
        assert!((uniform.proj_info[1] - 12.0).abs() < 1e-4);
        assert!((uniform.radius_to_screen - 2.0 * 0.5 * 10.0).abs() < 1e-3);
    }

    #[test]
    fn quarter_resolution_rounds_up() {
        let uniform = HbaoUniform::new(&HbaoParameters::default(), &perspective(), 1281, 721);
        assert_eq!(uniform.inv_quarter_resolution, [1.0 / 321.0, 1.0 / 181.0]);
    }

    #[test]
    fn linearize_hits_clip_planes() {
        assert!((linearize_depth(0.0, 0.1, 100.0, true) - 0.1).abs() < 1e-6);
        assert!((linearize_depth(1.0, 0.1, 100.0, true) - 100.0).abs() < 1e-3);
        assert!((linearize_depth(0.5, 1.0, 11.0, false) - 6.0).abs() < 1e-6);

        let proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0);
        let clip = proj * Vec4::new(0.0, 0.0, -25.0, 1.0);
        assert!((linearize_depth(clip.z / clip.w, 0.1, 100.0, true) - 25.0).abs() < 1e-2);
    }

    #[test]
    fn linearize_uniform_packs_clip_info() {
        let uniform = LinearizeUniform::new(0.5, 200.0, true);
        assert_eq!(uniform.clip_info, [100.0, -199.5, 200.0, 1.0]);
        assert_eq!(LinearizeUniform::new(0.5, 200.0, false).clip_info[3], 0.0);
    }

    #[test]
    fn jitter_tile_is_deterministic_and_in_sector() {
        let tile = default_jitter_tile();
        assert_eq!(tile, default_jitter_tile());
        let sector = std::f32::consts::TAU / HBAO_NUM_DIRECTIONS as f32;
        for texel in tile {
            assert!((Vec2::new(texel.x, texel.y).length() - 1.0).abs() < 1e-5);
            let angle = texel.y.atan2(texel.x);
            assert!((0.0..=sector + 1e-5).contains(&angle));
            assert!((0.0..1.0).contains(&texel.z));
            assert_eq!(texel.w, 0.0);
        }
    }

    #[test]
    fn flat_plane_facing_camera_is_unoccluded() {
        let projection = perspective();
        let uniform = HbaoUniform::new(&scenario_params(), &projection, WIDTH, HEIGHT);
        let depth = AoImage::filled(WIDTH, HEIGHT, 10.0);
        let normals = vec![Vec3::Z; (WIDTH * HEIGHT) as usize];
        let ao = evaluate_hbao_cpu(&depth, &normals, &uniform, &default_jitter_tile());
        assert!(ao.data.iter().all(|value| (value - 1.0).abs() < 1e-4));
    }

    #[test]
    fn tilted_ground_plane_is_unoccluded() {
        let projection = perspective();
        let uniform = HbaoUniform::new(&scenario_params(), &projection, WIDTH, HEIGHT);
        // Ground plane seen from 3 units above, tilted toward the camera.
        let normal = Vec3::new(0.0, 0.8, 0.6).normalize();
        let (depth, normals) = plane_buffers(&projection, normal, -3.0);
        let ao = evaluate_hbao_cpu(&depth, &normals, &uniform, &default_jitter_tile());
        let min = ao.data.iter().copied().fold(1.0f32, f32::min);
        assert!(min > 0.99, "flat ground should not self-occlude, min ao {min}");
    }

    #[test]
    fn step_edge_occludes_the_far_side() {
        let projection = perspective();
        let uniform = HbaoUniform::new(&scenario_params(), &projection, WIDTH, HEIGHT);
        let mut depth = AoImage::filled(WIDTH, HEIGHT, 10.0);
        for y in 0..HEIGHT {
            for x in WIDTH / 2..WIDTH {
                depth.data[(y * WIDTH + x) as usize] = 9.0;
            }
        }
        let normals = vec![Vec3::Z; (WIDTH * HEIGHT) as usize];
        let ao = evaluate_hbao_cpu(&depth, &normals, &uniform, &default_jitter_tile());
        let row = HEIGHT / 2;
        assert!(ao.get(WIDTH / 2 - 1, row) < 0.95, "edge ao {}", ao.get(WIDTH / 2 - 1, row));
        assert!((ao.get(2, row) - 1.0).abs() < 1e-4);
        assert!((ao.get(WIDTH / 2 + 1, row) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn blur_preserves_constant_and_respects_depth_edges() {
        let depth = AoImage::filled(16, 8, 5.0);
        let lit = AoImage::filled(16, 8, 1.0);
        let blurred = bilateral_blur_cpu(&lit, &depth, 40.0, true);
        assert!(blurred.data.iter().all(|v| (v - 1.0).abs() < 1e-6));

        let mut ao = AoImage::filled(16, 8, 1.0);
        let mut split_depth = AoImage::filled(16, 8, 5.0);
        for y in 0..8 {
            for x in 8..16 {
                ao.data[y * 16 + x] = 0.0;
                split_depth.data[y * 16 + x] = 6.0;
            }
        }
        let horizontal = bilateral_blur_cpu(&ao, &split_depth, 40.0, true);
        assert!((horizontal.get(7, 3) - 1.0).abs() < 1e-4);
        assert!(horizontal.get(8, 3) < 1e-4);

        let soft = bilateral_blur_cpu(&ao, &split_depth, 0.0, true);
        assert!(soft.get(7, 3) < 0.95);
        let vertical = bilateral_blur_cpu(&ao, &split_depth, 0.0, false);
        assert!((vertical.get(7, 3) - 1.0).abs() < 1e-6);
    }
}
