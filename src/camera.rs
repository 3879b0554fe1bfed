use glam::{Mat4, Quat, Vec2, Vec3, Vec4};

const DEFAULT_UP: Vec3 = Vec3::Y;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective { fov_y_radians: f32 },
    /// Vertical extent of the view volume in world units.
    Orthographic { height: f32 },
}

/// Camera read by the rendering core. The application mutates it once per frame.
#[derive(Debug, Clone)]
pub struct Camera3D {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub projection: Projection,
    pub near: f32,
    pub far: f32,
    pub aspect: f32,
}

impl Camera3D {
    pub fn new(position: Vec3, target: Vec3, fov_y_radians: f32, near: f32, far: f32) -> Self {
        Self {
            position,
            target,
            up: DEFAULT_UP,
            projection: Projection::Perspective { fov_y_radians },
            near,
            far,
            aspect: 16.0 / 9.0,
        }
    }

    pub fn orthographic(position: Vec3, target: Vec3, height: f32, near: f32, far: f32) -> Self {
        Self { projection: Projection::Orthographic { height }, ..Self::new(position, target, 1.0, near, far) }
    }

    pub fn with_aspect(mut self, aspect: f32) -> Self {
        self.set_aspect(aspect);
        self
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect.max(0.0001);
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if height > 0 {
            self.set_aspect(width as f32 / height as f32);
        }
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Vertical field of view, `None` for orthographic cameras.
    pub fn fov(&self) -> Option<f32> {
        match self.projection {
            Projection::Perspective { fov_y_radians } => Some(fov_y_radians),
            Projection::Orthographic { .. } => None,
        }
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.aspect
    }

    pub fn is_perspective(&self) -> bool {
        matches!(self.projection, Projection::Perspective { .. })
    }

    pub fn forward(&self) -> Vec3 {
        (self.target - self.position).normalize_or_zero()
    }

    pub fn right(&self) -> Vec3 {
        self.forward().cross(self.up).normalize_or_zero()
    }

    pub fn up_vector(&self) -> Vec3 {
        self.right().cross(self.forward())
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Projection with wgpu's 0..1 depth range.
    pub fn projection(&self) -> Mat4 {
        match self.projection {
            Projection::Perspective { fov_y_radians } => {
                Mat4::perspective_rh(fov_y_radians, self.aspect, self.near, self.far)
            }
            Projection::Orthographic { height } => {
                let half_h = height * 0.5;
                let half_w = half_h * self.aspect;
                Mat4::orthographic_rh(-half_w, half_w, -half_h, half_h, self.near, self.far)
            }
        }
    }

    /// Perspective or orthographic, whichever the camera was built with.
    pub fn perspective_projection(&self) -> Mat4 {
        self.projection()
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection() * self.view()
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(self.view_projection())
    }

    /// Half extents of the view volume cross-section at view distance `distance`.
    fn half_extents_at(&self, distance: f32) -> Vec2 {
        let half_h = match self.projection {
            Projection::Perspective { fov_y_radians } => (fov_y_radians * 0.5).tan() * distance,
            Projection::Orthographic { height } => height * 0.5,
        };
        Vec2::new(half_h * self.aspect, half_h)
    }

    /// Corners of the sub-frustum `[near, far]` in view space (camera looks down -Z).
    /// The first four corners lie on the near plane, the last four on the far plane.
    pub fn frustum_corners_view(&self, near: f32, far: f32) -> [Vec3; 8] {
        let mut corners = [Vec3::ZERO; 8];
        for (slice, distance) in [near, far].into_iter().enumerate() {
            let half = self.half_extents_at(distance);
            let quad = [
                Vec3::new(-half.x, -half.y, -distance),
                Vec3::new(half.x, -half.y, -distance),
                Vec3::new(half.x, half.y, -distance),
                Vec3::new(-half.x, half.y, -distance),
            ];
            corners[slice * 4..slice * 4 + 4].copy_from_slice(&quad);
        }
        corners
    }

    pub fn frustum_corners_world(&self, near: f32, far: f32) -> [Vec3; 8] {
        let inv_view = self.view().inverse();
        self.frustum_corners_view(near, far).map(|corner| inv_view.transform_point3(corner))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    fn from_row(row: Vec4) -> Self {
        let normal = row.truncate();
        let len = normal.length();
        if len <= f32::EPSILON {
            return Self { normal, d: row.w };
        }
        Self { normal: normal / len, d: row.w / len }
    }

    pub fn signed_distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }
}

/// Six inward-facing planes: left, right, bottom, top, near, far.
#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Gribb/Hartmann extraction for a 0..1 clip depth range.
    pub fn from_view_projection(m: Mat4) -> Self {
        let r0 = m.row(0);
        let r1 = m.row(1);
        let r2 = m.row(2);
        let r3 = m.row(3);
        Self {
            planes: [
                Plane::from_row(r3 + r0),
                Plane::from_row(r3 - r0),
                Plane::from_row(r3 + r1),
                Plane::from_row(r3 - r1),
                Plane::from_row(r2),
                Plane::from_row(r3 - r2),
            ],
        }
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|plane| plane.signed_distance(point) >= 0.0)
    }

    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes.iter().all(|plane| plane.signed_distance(center) >= -radius)
    }

    /// Conservative test: an AABB is rejected only if it lies fully outside one plane.
    pub fn intersects_aabb(&self, min: Vec3, max: Vec3) -> bool {
        self.planes.iter().all(|plane| {
            let positive = Vec3::new(
                if plane.normal.x >= 0.0 { max.x } else { min.x },
                if plane.normal.y >= 0.0 { max.y } else { min.y },
                if plane.normal.z >= 0.0 { max.z } else { min.z },
            );
            plane.signed_distance(positive) >= 0.0
        })
    }
}

/// Orbit-style controller storing yaw/pitch around a target.
#[derive(Debug, Clone)]
pub struct OrbitCamera {
    pub target: Vec3,
    pub radius: f32,
    pub yaw_radians: f32,
    pub pitch_radians: f32,
}

impl OrbitCamera {
    pub fn new(target: Vec3, radius: f32) -> Self {
        Self { target, radius: radius.max(0.01), yaw_radians: 0.0, pitch_radians: 0.0 }
    }

    pub fn to_camera(&self, fov_y_radians: f32, near: f32, far: f32) -> Camera3D {
        let rotation = Quat::from_euler(glam::EulerRot::YXZ, self.yaw_radians, self.pitch_radians, 0.0);
        let offset = rotation * Vec3::new(0.0, 0.0, self.radius);
        Camera3D::new(self.target + offset, self.target, fov_y_radians, near, far)
    }

    pub fn orbit(&mut self, delta: Vec2) {
        self.yaw_radians += delta.x;
        self.pitch_radians = (self.pitch_radians + delta.y)
            .clamp(-std::f32::consts::FRAC_PI_2 + 0.01, std::f32::consts::FRAC_PI_2 - 0.01);
    }

    pub fn zoom(&mut self, factor: f32) {
        self.radius = (self.radius * factor).clamp(0.1, 10_000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_camera() -> Camera3D {
        Camera3D::new(Vec3::new(0.0, 2.0, 10.0), Vec3::ZERO, 45f32.to_radians(), 0.1, 100.0)
            .with_aspect(16.0 / 9.0)
    }

    #[test]
    fn view_projection_is_finite() {
        let vp = test_camera().view_projection();
        assert!(!vp.to_cols_array().iter().any(|v| v.is_nan() || v.is_infinite()));
    }

    #[test]
    fn view_space_corners_project_to_clip_bounds() {
        let camera = test_camera();
        let proj = camera.projection();
        for (i, corner) in camera.frustum_corners_view(camera.near, camera.far).iter().enumerate() {
            let clip = proj * corner.extend(1.0);
            let ndc = clip.truncate() / clip.w;
            assert!((ndc.x.abs() - 1.0).abs() < 1e-3, "corner {i} x = {}", ndc.x);
            assert!((ndc.y.abs() - 1.0).abs() < 1e-3, "corner {i} y = {}", ndc.y);
            let expected_z = if i < 4 { 0.0 } else { 1.0 };
            assert!((ndc.z - expected_z).abs() < 1e-3, "corner {i} z = {}", ndc.z);
        }
    }

    #[test]
    fn frustum_contains_target_and_rejects_behind() {
        let camera = test_camera();
        let frustum = camera.frustum();
        assert!(frustum.contains_point(Vec3::ZERO));
        assert!(!frustum.contains_point(Vec3::new(0.0, 2.0, 20.0)));
        assert!(frustum.intersects_sphere(Vec3::new(0.0, 2.0, 10.5), 1.0));
        assert!(!frustum.intersects_aabb(Vec3::new(-1.0, 1.0, 30.0), Vec3::new(1.0, 3.0, 32.0)));
        assert!(frustum.intersects_aabb(Vec3::splat(-1.0), Vec3::splat(1.0)));
    }

    #[test]
    fn orthographic_corners_have_constant_extent() {
        let camera = Camera3D::orthographic(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, 4.0, 0.1, 50.0)
            .with_aspect(2.0);
        let corners = camera.frustum_corners_view(1.0, 10.0);
        assert_eq!(corners[1].x, corners[5].x);
        assert_eq!(corners[2].y, 2.0);
        assert_eq!(corners[2].x, 4.0);
        assert!(camera.fov().is_none());
    }

    #[test]
    fn basis_vectors_are_orthonormal() {
        let camera = test_camera();
        let (f, r, u) = (camera.forward(), camera.right(), camera.up_vector());
        assert!(f.dot(r).abs() < 1e-5);
        assert!(f.dot(u).abs() < 1e-5);
        assert!((u.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn orbit_camera_orbits_target() {
        let mut orbit = OrbitCamera::new(Vec3::ZERO, 5.0);
        orbit.orbit(Vec2::new(0.5, 0.25));
        let camera = orbit.to_camera(45.0f32.to_radians(), 0.1, 500.0);
        assert!(camera.position.distance(Vec3::ZERO) > 1.0);
        assert!(camera.position.distance(Vec3::ZERO) < 10.0);
    }
}
