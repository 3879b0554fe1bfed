//! Cascade split computation and stable light-space fitting for directional shadows.

use glam::{Mat4, Vec3, Vec4};

use crate::camera::Camera3D;
use crate::error::{PipelineError, PipelineResult};
use crate::scene::Aabb;

pub const MAX_SHADOW_CASCADES: usize = 4;

/// Bounding sphere radii are rounded up to this step so the light projection keeps
/// the same scale while the camera moves.
pub const RADIUS_QUANTUM: f32 = 1.0 / 16.0;

/// Step used by [`quantize_splits`] when split stabilization is enabled.
pub const SPLIT_QUANTUM: f32 = 1.0 / 32.0;

const POLE_THRESHOLD: f32 = 0.99;

/// Scene depth intervals thinner than this fall back to the camera clip range.
pub const MIN_SCENE_DEPTH_SPAN: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cascade {
    pub near_split: f32,
    pub far_split: f32,
    pub light_view: Mat4,
    pub light_proj: Mat4,
    pub sphere_center: Vec3,
    pub sphere_radius: f32,
}

impl Cascade {
    pub fn view_projection(&self) -> Mat4 {
        self.light_proj * self.light_view
    }
}

/// Far split distances for `cascade_count` cascades between `near` and `far`.
///
/// `lambda` blends the logarithmic scheme (1.0) with the uniform scheme (0.0).
/// The final split always equals `far`.
pub fn compute_splits(near: f32, far: f32, cascade_count: usize, lambda: f32) -> PipelineResult<Vec<f32>> {
    if !near.is_finite() || !far.is_finite() || !lambda.is_finite() {
        return Err(PipelineError::invalid_config("cascade clip planes must be finite"));
    }
    if near <= 0.0 {
        return Err(PipelineError::invalid_config(format!("near clip {near} must be positive")));
    }
    if near >= far {
        return Err(PipelineError::invalid_config(format!("near clip {near} must be less than far clip {far}")));
    }
    if cascade_count == 0 || cascade_count > MAX_SHADOW_CASCADES {
        return Err(PipelineError::invalid_config(format!(
            "cascade count {cascade_count} outside 1..={MAX_SHADOW_CASCADES}"
        )));
    }
    if cascade_count == 1 {
        return Ok(vec![far]);
    }

    let lambda = lambda.clamp(0.0, 1.0);
    let ratio = far / near;
    let range = far - near;
    let mut splits = Vec::with_capacity(cascade_count);
    for i in 1..=cascade_count {
        if i == cascade_count {
            splits.push(far);
            break;
        }
        let p = i as f32 / cascade_count as f32;
        let log_split = near * ratio.powf(p);
        let uniform_split = near + range * p;
        splits.push(lambda * log_split + (1.0 - lambda) * uniform_split);
    }
    Ok(splits)
}

/// Rounds every split but the last up to a multiple of `step`.
///
/// Falls back to the unquantized splits when rounding would merge two cascades or
/// push a split past the far plane.
pub fn quantize_splits(splits: &[f32], step: f32) -> Vec<f32> {
    if splits.len() < 2 || step <= 0.0 {
        return splits.to_vec();
    }
    let last = splits.len() - 1;
    let mut quantized: Vec<f32> = splits
        .iter()
        .enumerate()
        .map(|(idx, split)| if idx == last { *split } else { (split / step).ceil() * step })
        .collect();
    let strictly_increasing = quantized.windows(2).all(|pair| pair[0] < pair[1]);
    if !strictly_increasing {
        quantized.copy_from_slice(splits);
    }
    quantized
}

/// Contiguous `(near, far)` ranges: cascade i's far equals cascade i+1's near.
pub fn cascade_ranges(near: f32, splits: &[f32]) -> Vec<(f32, f32)> {
    let mut ranges = Vec::with_capacity(splits.len());
    let mut previous = near;
    for &split in splits {
        ranges.push((previous, split));
        previous = split;
    }
    ranges
}

/// Index of the first cascade whose far split lies beyond `view_depth`.
///
/// Depths past the last split return `None`: those pixels receive no shadow.
pub fn select_cascade(view_depth: f32, splits: &[f32]) -> Option<usize> {
    splits.iter().position(|split| view_depth < *split)
}

/// Up vector for the light view; switches away from +Y when the light is nearly vertical.
pub fn light_up_vector(light_dir: Vec3) -> Vec3 {
    if light_dir.dot(Vec3::Y).abs() > POLE_THRESHOLD {
        Vec3::Z
    } else {
        Vec3::Y
    }
}

/// Fits a stable orthographic light projection around the camera sub-frustum
/// `[near_split, far_split]`.
pub fn fit_cascade(
    camera: &Camera3D,
    light_dir: Vec3,
    near_split: f32,
    far_split: f32,
    shadow_resolution: u32,
) -> Cascade {
    let corners = camera.frustum_corners_world(near_split, far_split);
    let centroid = corners.iter().copied().sum::<Vec3>() / corners.len() as f32;

    let max_distance = corners.iter().map(|corner| corner.distance(centroid)).fold(0.0f32, f32::max);
    let radius = (max_distance / RADIUS_QUANTUM).ceil() * RADIUS_QUANTUM;

    let dir = light_dir.normalize();
    let eye = centroid - dir * radius;
    let light_view = Mat4::look_at_rh(eye, centroid, light_up_vector(dir));
    let unsnapped = Mat4::orthographic_rh(-radius, radius, -radius, radius, 0.0, 2.0 * radius);
    let light_proj = snap_to_texel_grid(unsnapped, light_view, shadow_resolution);

    Cascade {
        near_split,
        far_split,
        light_view,
        light_proj,
        sphere_center: centroid,
        sphere_radius: radius,
    }
}

/// Translates `proj` so the world origin lands exactly on a shadow-map texel.
///
/// Only the x/y translation changes. A snapped matrix maps the origin onto the grid,
/// so snapping it again adds a zero offset.
pub fn snap_to_texel_grid(proj: Mat4, view: Mat4, shadow_resolution: u32) -> Mat4 {
    let half_res = shadow_resolution.max(1) as f32 * 0.5;
    let origin = (proj * view) * Vec4::W;
    let texel = Vec4::new(origin.x * half_res, origin.y * half_res, 0.0, 0.0);
    let rounded = Vec4::new(texel.x.round(), texel.y.round(), 0.0, 0.0);
    let offset = (rounded - texel) / half_res;

    let mut snapped = proj;
    snapped.w_axis.x += offset.x;
    snapped.w_axis.y += offset.y;
    snapped
}

/// View-depth interval covered by `bounds`, clamped to the camera clip range.
///
/// Returns `None` when nothing lies in front of the camera or the interval is thinner
/// than [`MIN_SCENE_DEPTH_SPAN`].
pub fn scene_depth_range(camera: &Camera3D, bounds: impl IntoIterator<Item = Aabb>) -> Option<(f32, f32)> {
    let view = camera.view();
    let mut min_depth = f32::INFINITY;
    let mut max_depth = f32::NEG_INFINITY;
    for aabb in bounds {
        for corner in aabb.corners() {
            let depth = -view.transform_point3(corner).z;
            min_depth = min_depth.min(depth);
            max_depth = max_depth.max(depth);
        }
    }
    let near = min_depth.max(camera.near);
    let far = max_depth.min(camera.far);
    (far - near >= MIN_SCENE_DEPTH_SPAN).then_some((near, far))
}

/// Splits and fitted cascades for one frame.
///
/// With `scene_depth` set, the splits cover that interval (clamped to the clip range)
/// instead of the whole camera range.
pub fn build_cascades(
    camera: &Camera3D,
    light_dir: Vec3,
    cascade_count: usize,
    lambda: f32,
    stabilize: bool,
    shadow_resolution: u32,
    scene_depth: Option<(f32, f32)>,
) -> PipelineResult<Vec<Cascade>> {
    let (near, far) = scene_depth
        .map(|(near, far)| (near.max(camera.near), far.min(camera.far)))
        .filter(|(near, far)| near < far)
        .unwrap_or((camera.near, camera.far));
    let mut splits = compute_splits(near, far, cascade_count, lambda)?;
    if stabilize {
        splits = quantize_splits(&splits, SPLIT_QUANTUM);
    }
    Ok(cascade_ranges(near, &splits)
        .into_iter()
        .map(|(near, far)| fit_cascade(camera, light_dir, near, far, shadow_resolution))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> Camera3D {
        Camera3D::new(Vec3::new(3.0, 4.0, 12.0), Vec3::new(0.0, 0.5, 0.0), 45f32.to_radians(), 0.1, 100.0)
            .with_aspect(16.0 / 9.0)
    }

    #[test]
    fn pure_log_splits_follow_formula() {
        let splits = compute_splits(0.1, 100.0, 4, 1.0).expect("valid config");
        let expected = [0.1 * 1000f32.powf(0.25), 0.1 * 1000f32.powf(0.5), 0.1 * 1000f32.powf(0.75), 100.0];
        for (split, want) in splits.iter().zip(expected) {
            assert!((split - want).abs() < 1e-3, "{split} vs {want}");
        }
    }

    #[test]
    fn blended_splits_are_monotonic_and_end_at_far() {
        for lambda in [0.0, 0.25, 0.5, 0.75, 1.0] {
            for count in 1..=MAX_SHADOW_CASCADES {
                let splits = compute_splits(0.5, 250.0, count, lambda).expect("valid config");
                assert_eq!(splits.len(), count);
                assert_eq!(*splits.last().unwrap(), 250.0);
                assert!(splits.windows(2).all(|pair| pair[0] < pair[1]), "{splits:?}");
                assert!(splits[0] > 0.5);
            }
        }
    }

    #[test]
    fn uniform_splits_are_evenly_spaced() {
        let splits = compute_splits(1.0, 9.0, 4, 0.0).expect("valid config");
        assert_eq!(splits, vec![3.0, 5.0, 7.0, 9.0]);
    }

    #[test]
    fn single_cascade_covers_whole_range() {
        assert_eq!(compute_splits(0.1, 42.0, 1, 0.6).unwrap(), vec![42.0]);
    }

    #[test]
    fn invalid_configs_fail_fast() {
        assert!(matches!(compute_splits(10.0, 10.0, 4, 0.5), Err(PipelineError::InvalidConfig(_))));
        assert!(matches!(compute_splits(20.0, 10.0, 4, 0.5), Err(PipelineError::InvalidConfig(_))));
        assert!(matches!(compute_splits(0.1, 10.0, 0, 0.5), Err(PipelineError::InvalidConfig(_))));
        assert!(matches!(compute_splits(0.0, 10.0, 2, 0.5), Err(PipelineError::InvalidConfig(_))));
        assert!(matches!(
            compute_splits(0.1, 10.0, MAX_SHADOW_CASCADES + 1, 0.5),
            Err(PipelineError::InvalidConfig(_))
        ));
        assert!(compute_splits(0.1, f32::NAN, 2, 0.5).is_err());
    }

    #[test]
    fn ranges_are_contiguous() {
        let splits = compute_splits(0.1, 100.0, 4, 0.6).unwrap();
        let ranges = cascade_ranges(0.1, &splits);
        assert_eq!(ranges[0].0, 0.1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
            assert!(pair[0].1 < pair[1].1);
        }
    }

    #[test]
    fn quantized_splits_round_up_and_keep_far() {
        let splits = compute_splits(0.1, 100.0, 4, 0.6).unwrap();
        let quantized = quantize_splits(&splits, SPLIT_QUANTUM);
        assert_eq!(quantized[3], 100.0);
        for (raw, q) in splits.iter().zip(&quantized).take(3) {
            assert!(q >= raw);
            assert!(q - raw < SPLIT_QUANTUM);
            let steps = q / SPLIT_QUANTUM;
            assert!((steps - steps.round()).abs() < 1e-3);
        }
    }

    #[test]
    fn quantization_falls_back_when_cascades_would_merge() {
        let splits = vec![0.101, 0.102, 0.2];
        assert_eq!(quantize_splits(&splits, SPLIT_QUANTUM), splits);
    }

    #[test]
    fn selection_uses_first_far_split_and_leaves_tail_unshadowed() {
        let splits = [2.0, 8.0, 30.0, 100.0];
        assert_eq!(select_cascade(0.5, &splits), Some(0));
        assert_eq!(select_cascade(2.0, &splits), Some(1));
        assert_eq!(select_cascade(29.9, &splits), Some(2));
        assert_eq!(select_cascade(99.0, &splits), Some(3));
        assert_eq!(select_cascade(100.0, &splits), None);
        assert_eq!(select_cascade(500.0, &splits), None);
    }

    #[test]
    fn bounding_sphere_contains_all_corners() {
        let camera = camera();
        let light = Vec3::new(-0.4, -1.0, -0.3);
        let splits = compute_splits(camera.near, camera.far, 4, 0.7).unwrap();
        for (near, far) in cascade_ranges(camera.near, &splits) {
            let cascade = fit_cascade(&camera, light, near, far, 2048);
            for corner in camera.frustum_corners_world(near, far) {
                let dist = corner.distance(cascade.sphere_center);
                assert!(dist <= cascade.sphere_radius + 1e-4, "{dist} > {}", cascade.sphere_radius);
            }
            let steps = cascade.sphere_radius / RADIUS_QUANTUM;
            assert!((steps - steps.round()).abs() < 1e-3);
        }
    }

    #[test]
    fn corners_land_inside_light_clip_volume() {
        let camera = camera();
        let cascade = fit_cascade(&camera, Vec3::new(0.3, -1.0, 0.2), 0.1, 10.0, 1024);
        let vp = cascade.view_projection();
        for corner in camera.frustum_corners_world(0.1, 10.0) {
            let clip = vp * corner.extend(1.0);
            assert!(clip.x.abs() <= 1.0 + 1e-2 && clip.y.abs() <= 1.0 + 1e-2, "{clip:?}");
            assert!(clip.z >= -1e-3 && clip.z <= 1.0 + 1e-3, "{clip:?}");
        }
    }

    #[test]
    fn texel_snap_is_idempotent() {
        let camera = camera();
        let cascade = fit_cascade(&camera, Vec3::new(-0.2, -1.0, 0.6), 2.0, 20.0, 2048);
        let raw = Mat4::orthographic_rh(
            -cascade.sphere_radius,
            cascade.sphere_radius,
            -cascade.sphere_radius,
            cascade.sphere_radius,
            0.0,
            2.0 * cascade.sphere_radius,
        );
        let once = snap_to_texel_grid(raw, cascade.light_view, 2048);
        let twice = snap_to_texel_grid(once, cascade.light_view, 2048);
        for (a, b) in once.to_cols_array().iter().zip(twice.to_cols_array()) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(once.z_axis, raw.z_axis);
        assert_eq!(once.w_axis.z, raw.w_axis.z);
        assert_eq!(once.w_axis.w, raw.w_axis.w);
    }

    #[test]
    fn snapped_origin_sits_on_texel_grid() {
        let view = Mat4::look_at_rh(Vec3::new(3.3, 10.0, 1.7), Vec3::new(3.0, 0.0, 2.0), Vec3::Y);
        let proj = Mat4::orthographic_rh(-7.3, 7.3, -7.3, 7.3, 0.0, 14.6);
        let snapped = snap_to_texel_grid(proj, view, 1024);
        let origin = (snapped * view) * Vec4::W;
        let texel_x = origin.x * 512.0;
        let texel_y = origin.y * 512.0;
        assert!((texel_x - texel_x.round()).abs() < 1e-2);
        assert!((texel_y - texel_y.round()).abs() < 1e-2);
    }

    #[test]
    fn small_camera_motion_keeps_radius_stable() {
        let mut camera = camera();
        let light = Vec3::new(0.5, -1.0, 0.1);
        let first = fit_cascade(&camera, light, 0.1, 6.0, 2048);
        camera.position += Vec3::new(0.01, 0.0, 0.0);
        camera.target += Vec3::new(0.01, 0.0, 0.0);
        let second = fit_cascade(&camera, light, 0.1, 6.0, 2048);
        assert_eq!(first.sphere_radius, second.sphere_radius);
    }

    #[test]
    fn vertical_light_uses_fallback_up() {
        assert_eq!(light_up_vector(Vec3::NEG_Y), Vec3::Z);
        assert_eq!(light_up_vector(Vec3::new(0.3, -1.0, 0.0).normalize()), Vec3::Y);
        let cascade = fit_cascade(&camera(), Vec3::NEG_Y, 0.1, 5.0, 512);
        assert!(!cascade.light_view.to_cols_array().iter().any(|v| v.is_nan()));
    }

    #[test]
    fn nan_camera_propagates_instead_of_failing() {
        let mut camera = camera();
        camera.position = Vec3::splat(f32::NAN);
        let cascade = fit_cascade(&camera, Vec3::NEG_Y, 0.1, 5.0, 512);
        assert!(cascade.sphere_center.is_nan());
    }

    #[test]
    fn build_cascades_reports_invalid_camera() {
        let mut camera = camera();
        camera.far = camera.near;
        assert!(build_cascades(&camera, Vec3::NEG_Y, 4, 0.5, true, 1024, None).is_err());
        assert!(build_cascades(&camera, Vec3::NEG_Y, 4, 0.5, true, 1024, Some((1.0, 5.0))).is_err());
        camera.far = 50.0;
        let cascades = build_cascades(&camera, Vec3::NEG_Y, 3, 0.5, true, 1024, None).unwrap();
        assert_eq!(cascades.len(), 3);
        assert_eq!(cascades[2].far_split, 50.0);
    }

    #[test]
    fn scene_depth_range_spans_box_corners() {
        let camera = Camera3D::new(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, 45f32.to_radians(), 0.1, 100.0);
        let unit_box = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let (near, far) = scene_depth_range(&camera, [unit_box]).expect("box in front of camera");
        assert!((near - 9.0).abs() < 1e-4 && (far - 11.0).abs() < 1e-4, "{near}..{far}");

        let straddling = Aabb::new(Vec3::new(-1.0, -1.0, -500.0), Vec3::new(1.0, 1.0, 20.0));
        assert_eq!(scene_depth_range(&camera, [straddling]), Some((0.1, 100.0)));
    }

    #[test]
    fn scene_depth_range_ignores_empty_and_hidden_scenes() {
        let camera = Camera3D::new(Vec3::new(0.0, 0.0, 10.0), Vec3::ZERO, 45f32.to_radians(), 0.1, 100.0);
        assert_eq!(scene_depth_range(&camera, []), None);
        let behind = Aabb::new(Vec3::new(-1.0, -1.0, 12.0), Vec3::new(1.0, 1.0, 14.0));
        assert_eq!(scene_depth_range(&camera, [behind]), None);
        let facing_sheet = Aabb::new(Vec3::new(-5.0, -5.0, 0.0), Vec3::new(5.0, 5.0, 0.0));
        assert_eq!(scene_depth_range(&camera, [facing_sheet]), None);
    }

    #[test]
    fn scene_depth_tightens_splits() {
        let camera = camera();
        let full = build_cascades(&camera, Vec3::NEG_Y, 4, 0.6, false, 2048, None).unwrap();
        let tight = build_cascades(&camera, Vec3::NEG_Y, 4, 0.6, false, 2048, Some((2.0, 20.0))).unwrap();
        assert_eq!(tight[0].near_split, 2.0);
        assert_eq!(tight[3].far_split, 20.0);
        assert_eq!(full[3].far_split, 100.0);
        for (tight, full) in tight.iter().zip(&full) {
            assert!(tight.far_split <= full.far_split, "{} > {}", tight.far_split, full.far_split);
        }
        assert!(tight[3].sphere_radius < full[3].sphere_radius);

        let clamped = build_cascades(&camera, Vec3::NEG_Y, 4, 0.6, false, 2048, Some((-5.0, 400.0))).unwrap();
        assert_eq!(clamped, full);
    }
}
