//! Draw-command interface between the application's scene representation and the
//! rendering core. The core never walks a scene graph: it consumes a flat list.

use glam::{Mat4, Vec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// Axis-aligned bounds of this box after `transform`.
    pub fn transformed(&self, transform: &Mat4) -> Self {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for corner in self.corners() {
            let p = transform.transform_point3(corner);
            min = min.min(p);
            max = max.max(p);
        }
        Self { min, max }
    }
}

/// One mesh instance to draw this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawCommand {
    pub mesh: MeshHandle,
    pub material: MaterialHandle,
    pub world_transform: Mat4,
    pub prev_world_transform: Mat4,
    /// World-space bounds.
    pub bounds: Aabb,
    pub casts_shadows: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    /// Direction the light travels, from the light toward the scene.
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self { direction: Vec3::new(-0.4, -1.0, -0.3).normalize(), color: Vec3::ONE, intensity: 3.0 }
    }
}

/// Anything that can enumerate draw commands for the renderer.
pub trait SceneSource {
    fn for_each_draw_command(&self, f: &mut dyn FnMut(&DrawCommand));

    fn directional_light(&self) -> DirectionalLight;
}

/// Flat arena of draw commands produced by a single traversal.
#[derive(Debug, Clone, Default)]
pub struct DrawList {
    commands: Vec<DrawCommand>,
    light: DirectionalLight,
}

impl DrawList {
    pub fn new(light: DirectionalLight) -> Self {
        Self { commands: Vec::new(), light }
    }

    pub fn push(&mut self, mesh: MeshHandle, material: MaterialHandle, transform: Mat4, local_bounds: Aabb) {
        self.push_moving(mesh, material, transform, transform, local_bounds);
    }

    pub fn push_moving(
        &mut self,
        mesh: MeshHandle,
        material: MaterialHandle,
        transform: Mat4,
        prev: Mat4,
        local_bounds: Aabb,
    ) {
        self.commands.push(DrawCommand {
            mesh,
            material,
            world_transform: transform,
            prev_world_transform: prev,
            bounds: local_bounds.transformed(&transform),
            casts_shadows: true,
        });
    }

    pub fn push_command(&mut self, command: DrawCommand) {
        self.commands.push(command);
    }

    /// Empties the list for the next traversal and hands back the previous commands.
    pub fn begin_frame(&mut self) -> Vec<DrawCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn set_light(&mut self, light: DirectionalLight) {
        self.light = light;
    }

    pub fn light(&self) -> &DirectionalLight {
        &self.light
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DrawCommand> {
        self.commands.iter()
    }

    pub fn last_mut(&mut self) -> Option<&mut DrawCommand> {
        self.commands.last_mut()
    }
}

impl SceneSource for DrawList {
    fn for_each_draw_command(&self, f: &mut dyn FnMut(&DrawCommand)) {
        for command in &self.commands {
            f(command);
        }
    }

    fn directional_light(&self) -> DirectionalLight {
        self.light
    }
}

/// Collects every draw command of `scene` into a contiguous vector.
pub fn collect_draws(scene: &dyn SceneSource) -> Vec<DrawCommand> {
    let mut draws = Vec::new();
    scene.for_each_draw_command(&mut |cmd| draws.push(*cmd));
    draws
}
