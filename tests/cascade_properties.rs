use glam::{Vec3, Vec4};
use kestrel_pbr::camera::Camera3D;
use kestrel_pbr::cascade::{
    build_cascades, compute_splits, scene_depth_range, select_cascade, MAX_SHADOW_CASCADES,
};
use kestrel_pbr::scene::Aabb;

const RESOLUTION: u32 = 2048;

fn camera_at(position: Vec3) -> Camera3D {
    Camera3D::new(position, position + Vec3::new(0.3, -0.4, -1.0), 60f32.to_radians(), 0.5, 150.0)
        .with_aspect(16.0 / 9.0)
}

fn light_dirs() -> [Vec3; 4] {
    [
        Vec3::new(-0.4, -1.0, -0.3),
        Vec3::new(0.0, -1.0, 0.0),
        Vec3::new(1.0, -0.2, 0.0),
        Vec3::new(0.2, 1.0, 0.1),
    ]
}

#[test]
fn every_cascade_encloses_its_sub_frustum() {
    let camera = camera_at(Vec3::new(2.0, 6.0, 20.0));
    for light in light_dirs() {
        for count in 1..=MAX_SHADOW_CASCADES {
            let cascades = build_cascades(&camera, light, count, 0.6, true, RESOLUTION, None).expect("cascades");
            assert_eq!(cascades.len(), count);
            for cascade in &cascades {
                let view_proj = cascade.view_projection();
                for corner in camera.frustum_corners_world(cascade.near_split, cascade.far_split) {
                    let clip = view_proj * corner.extend(1.0);
                    let ndc = clip / clip.w;
                    // One texel of slack for the grid snap.
                    let slack = 2.0 / RESOLUTION as f32 + 1e-4;
                    assert!(ndc.x.abs() <= 1.0 + slack && ndc.y.abs() <= 1.0 + slack, "corner outside: {ndc:?}");
                    assert!((-1e-4..=1.0 + 1e-4).contains(&ndc.z), "corner clipped in depth: {ndc:?}");
                }
            }
        }
    }
}

#[test]
fn cascades_tile_the_view_range_without_gaps() {
    let camera = camera_at(Vec3::ZERO);
    let cascades = build_cascades(&camera, light_dirs()[0], 4, 0.6, true, RESOLUTION, None).expect("cascades");
    assert_eq!(cascades[0].near_split, camera.near);
    for pair in cascades.windows(2) {
        assert_eq!(pair[0].far_split, pair[1].near_split);
        assert!(pair[0].far_split < pair[1].far_split);
    }
    assert_eq!(cascades[3].far_split, camera.far);
}

#[test]
fn translating_camera_shifts_shadow_projection_by_whole_texels() {
    let light = light_dirs()[0];
    let before = build_cascades(&camera_at(Vec3::new(0.0, 5.0, 10.0)), light, 3, 0.6, true, RESOLUTION, None)
        .expect("cascades");
    let after = build_cascades(&camera_at(Vec3::new(0.013, 5.0, 10.0)), light, 3, 0.6, true, RESOLUTION, None)
        .expect("cascades");
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.sphere_radius, b.sphere_radius, "radius must not shimmer");
        let half_res = RESOLUTION as f32 * 0.5;
        for m in [a.view_projection(), b.view_projection()] {
            let origin = m * Vec4::W;
            let texel_x = origin.x * half_res;
            let texel_y = origin.y * half_res;
            assert!((texel_x - texel_x.round()).abs() < 1e-2);
            assert!((texel_y - texel_y.round()).abs() < 1e-2);
        }
    }
}

#[test]
fn selection_agrees_with_split_table() {
    let splits = compute_splits(0.5, 150.0, 4, 0.6).expect("splits");
    let mut last = 0;
    for step in 1..300 {
        let depth = step as f32 * 0.5;
        match select_cascade(depth, &splits) {
            Some(index) => {
                assert!(index >= last, "cascade index must not decrease with depth");
                assert!(depth <= splits[index]);
                last = index;
            }
            None => assert!(depth >= splits[3]),
        }
    }
    assert_eq!(last, 3);
}

#[test]
fn small_scene_concentrates_cascades_on_its_depth_range() {
    let camera = camera_at(Vec3::new(0.0, 2.0, 8.0));
    let scene = [Aabb::new(Vec3::new(-3.0, -1.0, -6.0), Vec3::new(3.0, 1.0, 2.0))];
    let range = scene_depth_range(&camera, scene).expect("scene in front of camera");
    assert!(range.0 > camera.near && range.1 < camera.far, "{range:?}");

    let light = light_dirs()[0];
    let bounded = build_cascades(&camera, light, 4, 0.6, true, RESOLUTION, Some(range)).expect("cascades");
    let unbounded = build_cascades(&camera, light, 4, 0.6, true, RESOLUTION, None).expect("cascades");
    assert_eq!(bounded[0].near_split, range.0);
    assert_eq!(bounded[3].far_split, range.1);
    for (tight, full) in bounded.iter().zip(&unbounded) {
        assert!(tight.far_split <= full.far_split, "{} > {}", tight.far_split, full.far_split);
    }
    assert!(bounded[3].sphere_radius < unbounded[3].sphere_radius);
}
