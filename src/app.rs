use crate::camera::OrbitCamera;
use crate::config::AppConfig;
use crate::environment::{CacheOutcome, EnvironmentCache, EnvironmentGpu, IblSettings};
use crate::material::MaterialDesc;
use crate::mesh::Mesh;
use crate::renderer::{DebugOverlay, DeferredRenderer, WindowSurface};
use crate::scene::{Aabb, DirectionalLight, DrawList, MaterialHandle, MeshHandle};
use crate::time::FrameClock;

use anyhow::{Context, Result};
use glam::{Mat4, Quat, Vec2, Vec3};
use winit::application::ApplicationHandler;
use winit::event::{ElementState, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{Key, NamedKey};

const ORBIT_SENSITIVITY: f32 = 0.005;
const STATS_INTERVAL_SECONDS: f32 = 2.0;
const CHECKER_SIZE: u32 = 64;

pub fn run(config: AppConfig, overlay: DebugOverlay) -> Result<()> {
    let event_loop = EventLoop::new().context("Failed to create winit event loop")?;
    let mut app = App::new(config, overlay);
    event_loop.run_app(&mut app).context("Event loop execution failed")?;
    Ok(())
}

/// One renderable object of the demo scene.
#[derive(Debug, Clone, Copy)]
struct SceneObject {
    mesh: MeshHandle,
    material: MaterialHandle,
    local_bounds: Aabb,
    translation: Vec3,
    spin: f32,
}

/// Ground plane with a spinning cube and a sphere.
#[derive(Debug, Clone, Default)]
pub struct DemoScene {
    objects: Vec<SceneObject>,
    angle: f32,
    light: DirectionalLight,
}

impl DemoScene {
    pub fn build(renderer: &mut DeferredRenderer) -> Result<Self> {
        let checker = renderer.add_texture_rgba8(
            "Ground Checker",
            CHECKER_SIZE,
            CHECKER_SIZE,
            checker_texels(CHECKER_SIZE, 8),
            true,
        )?;
        let ground_material = renderer.add_material(MaterialDesc {
            albedo_map: Some(checker),
            ..MaterialDesc::solid("Ground", [0.8, 0.8, 0.8, 1.0], 0.0, 0.9)
        });
        let metal = renderer.add_material(MaterialDesc::solid("Brushed Gold", [1.0, 0.78, 0.34, 1.0], 1.0, 0.35));
        let plastic = renderer.add_material(MaterialDesc::solid("Red Plastic", [0.7, 0.08, 0.06, 1.0], 0.0, 0.4));

        let mut scene = DemoScene::default();
        let plane = Mesh::plane(20.0, 8);
        scene.add(renderer.add_mesh(&plane, "Ground"), ground_material, plane.local_bounds(), Vec3::ZERO, 0.0);
        let cube = Mesh::cube(1.5);
        scene.add(renderer.add_mesh(&cube, "Cube"), metal, cube.local_bounds(), Vec3::new(-1.6, 0.75, 0.0), 0.6);
        let sphere = Mesh::uv_sphere(1.0, 48, 24);
        scene.add(renderer.add_mesh(&sphere, "Sphere"), plastic, sphere.local_bounds(), Vec3::new(1.8, 1.0, 0.5), 0.0);
        tracing::info!(objects = scene.objects.len(), "demo scene ready");
        Ok(scene)
    }

    fn add(&mut self, mesh: MeshHandle, material: MaterialHandle, local_bounds: Aabb, translation: Vec3, spin: f32) {
        self.objects.push(SceneObject { mesh, material, local_bounds, translation, spin });
    }

    pub fn advance(&mut self, dt: f32) {
        self.angle = (self.angle + dt) % std::f32::consts::TAU;
    }

    fn transform_at(object: &SceneObject, angle: f32) -> Mat4 {
        Mat4::from_rotation_translation(Quat::from_rotation_y(angle * object.spin), object.translation)
    }

    /// Builds this frame's draw list. Spinning objects carry last frame's transform as well.
    pub fn draw_list(&self, previous_angle: f32) -> DrawList {
        let mut draws = DrawList::new(self.light);
        for object in &self.objects {
            draws.push_moving(
                object.mesh,
                object.material,
                Self::transform_at(object, self.angle),
                Self::transform_at(object, previous_angle),
                object.local_bounds,
            );
        }
        draws
    }

    pub fn angle(&self) -> f32 {
        self.angle
    }
}

fn checker_texels(size: u32, cells: u32) -> Vec<u8> {
    let cell = (size / cells.max(1)).max(1);
    let mut data = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let value = if ((x / cell) + (y / cell)) % 2 == 0 { 230 } else { 90 };
            data.extend_from_slice(&[value, value, value, 255]);
        }
    }
    data
}

pub struct App {
    config: AppConfig,
    surface: WindowSurface,
    renderer: Option<DeferredRenderer>,
    scene: DemoScene,
    orbit: OrbitCamera,
    clock: FrameClock,
    overlay: DebugOverlay,
    should_close: bool,
    orbiting: bool,
    last_cursor: Option<Vec2>,
}

impl App {
    pub fn new(config: AppConfig, overlay: DebugOverlay) -> Self {
        let surface = WindowSurface::new(&config.window);
        let mut orbit = OrbitCamera::new(Vec3::new(0.0, 0.8, 0.0), 8.0);
        orbit.orbit(Vec2::new(0.6, -0.35));
        Self {
            config,
            surface,
            renderer: None,
            scene: DemoScene::default(),
            orbit,
            clock: FrameClock::new(STATS_INTERVAL_SECONDS),
            overlay,
            should_close: false,
            orbiting: false,
            last_cursor: None,
        }
    }

    fn init_renderer(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        self.surface.ensure_window(event_loop)?;
        if self.renderer.is_some() {
            return Ok(());
        }
        let ctx = self.surface.gpu_context()?;
        let format = self.surface.surface_format()?;
        let mut renderer = DeferredRenderer::new(ctx, &self.config.renderer, format)?;
        renderer.set_show_debug_overlay(self.overlay);
        self.scene = DemoScene::build(&mut renderer)?;
        if self.config.ibl.enabled {
            match self.load_environment(&renderer) {
                Ok(environment) => renderer.set_environment(Some(environment)),
                Err(err) => tracing::warn!("Image-based lighting unavailable: {err:#}"),
            }
        }
        let size = self.surface.size();
        renderer.on_resize(size.width, size.height)?;
        self.renderer = Some(renderer);
        Ok(())
    }

    fn load_environment(&self, renderer: &DeferredRenderer) -> Result<EnvironmentGpu> {
        let ibl = &self.config.ibl;
        let (maps, outcome) =
            EnvironmentCache::load_or_compute(&ibl.cache_dir, ibl.source.as_deref(), &IblSettings::default())?;
        if matches!(outcome, CacheOutcome::Computed) {
            tracing::info!(dir = %ibl.cache_dir.display(), "IBL maps written to cache");
        }
        let ctx = renderer.context();
        EnvironmentGpu::upload(&ctx.device, &ctx.queue, &maps)
    }

    fn render_frame(&mut self) {
        let dt = self.clock.tick();
        let previous_angle = self.scene.angle();
        self.scene.advance(dt);

        let size = self.surface.size();
        if size.width == 0 || size.height == 0 {
            return;
        }
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        let frame = match self.surface.acquire_surface_frame() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!("Surface frame unavailable: {err:#}");
                return;
            }
        };
        let cam = &self.config.camera;
        let camera = self.orbit.to_camera(cam.fov_y_degrees.to_radians(), cam.near, cam.far);
        let draws = self.scene.draw_list(previous_angle);
        let result = renderer.render(&draws, &camera, dt, size.width, size.height, frame.view());
        frame.present();
        match result {
            Ok(stats) => {
                if let Some(summary) = self.clock.record(&stats) {
                    tracing::debug!(
                        frame = summary.last_frame_index,
                        frames = summary.frames,
                        skipped = summary.skipped,
                        avg_frame_ms = summary.avg_frame_ms,
                        max_frame_ms = summary.max_frame_ms,
                        avg_cpu_ms = summary.avg_cpu_ms,
                        draws = stats.draw_count,
                        shadow_draws = stats.shadow_draw_count,
                        splits = ?summary.cascade_splits,
                        "frame stats"
                    );
                }
            }
            Err(err) => tracing::error!("Frame failed: {err:#}"),
        }
    }

    fn handle_key(&mut self, key: &Key) {
        let Some(renderer) = self.renderer.as_mut() else {
            if matches!(key, Key::Named(NamedKey::Escape)) {
                self.should_close = true;
            }
            return;
        };
        match key {
            Key::Named(NamedKey::Escape) => self.should_close = true,
            Key::Named(NamedKey::F1) => {
                self.overlay = next_overlay(self.overlay);
                renderer.set_show_debug_overlay(self.overlay);
                tracing::info!(overlay = ?self.overlay, "debug overlay");
            }
            Key::Character(c) if c.as_str().eq_ignore_ascii_case("o") => {
                let enabled = !renderer.ao_stage().is_enabled();
                renderer.set_ao_enabled(enabled);
                tracing::info!(enabled, "ambient occlusion");
            }
            Key::Character(c) if c.as_str().eq_ignore_ascii_case("v") => {
                let vsync = !self.surface.vsync_enabled();
                if let Err(err) = self.surface.set_vsync(vsync) {
                    tracing::warn!("Failed to toggle vsync: {err:#}");
                }
            }
            _ => {}
        }
    }
}

fn next_overlay(overlay: DebugOverlay) -> DebugOverlay {
    match overlay {
        DebugOverlay::None => DebugOverlay::Depth,
        DebugOverlay::Depth => DebugOverlay::Ao,
        DebugOverlay::Ao => DebugOverlay::None,
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if let Err(err) = self.init_renderer(event_loop) {
            tracing::error!("Renderer initialization error: {err:#}");
            self.should_close = true;
        }
    }

    fn window_event(&mut self, _el: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => self.should_close = true,
            WindowEvent::Resized(size) => {
                self.surface.resize(size);
                if let Some(renderer) = self.renderer.as_mut() {
                    if let Err(err) = renderer.on_resize(size.width, size.height) {
                        tracing::error!("Resize to {}x{} failed: {err:#}", size.width, size.height);
                    }
                }
            }
            WindowEvent::RedrawRequested => self.render_frame(),
            WindowEvent::KeyboardInput { event: KeyEvent { logical_key, state: ElementState::Pressed, .. }, .. } => {
                self.handle_key(&logical_key);
            }
            WindowEvent::MouseInput { state, button: MouseButton::Left, .. } => {
                self.orbiting = state == ElementState::Pressed;
            }
            WindowEvent::CursorMoved { position, .. } => {
                let cursor = Vec2::new(position.x as f32, position.y as f32);
                if let (true, Some(last)) = (self.orbiting, self.last_cursor) {
                    self.orbit.orbit((last - cursor) * ORBIT_SENSITIVITY);
                }
                self.last_cursor = Some(cursor);
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let lines = match delta {
                    MouseScrollDelta::LineDelta(_, y) => y,
                    MouseScrollDelta::PixelDelta(pos) => pos.y as f32 / 40.0,
                };
                self.orbit.zoom(0.9f32.powf(lines));
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.should_close {
            event_loop.exit();
            return;
        }
        self.surface.request_redraw();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_scene() -> DemoScene {
        let bounds = Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5));
        let mut scene = DemoScene::default();
        scene.add(MeshHandle(0), MaterialHandle(0), bounds, Vec3::ZERO, 0.0);
        scene.add(MeshHandle(1), MaterialHandle(1), bounds, Vec3::new(2.0, 0.5, 0.0), 1.0);
        scene
    }

    #[test]
    fn draw_list_tracks_previous_transform_for_spinning_objects() {
        let mut scene = sample_scene();
        let previous = scene.angle();
        scene.advance(0.5);
        let draws = scene.draw_list(previous);
        let commands: Vec<_> = draws.iter().collect();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].world_transform, commands[0].prev_world_transform);
        assert_ne!(commands[1].world_transform, commands[1].prev_world_transform);
        assert!(commands[1].bounds.center().abs_diff_eq(Vec3::new(2.0, 0.5, 0.0), 1e-4));
    }

    #[test]
    fn overlay_cycle_visits_every_mode() {
        let mut overlay = DebugOverlay::None;
        let mut seen = Vec::new();
        for _ in 0..3 {
            overlay = next_overlay(overlay);
            seen.push(overlay);
        }
        assert_eq!(seen, vec![DebugOverlay::Depth, DebugOverlay::Ao, DebugOverlay::None]);
    }

    #[test]
    fn checker_texels_alternate() {
        let texels = checker_texels(4, 2);
        assert_eq!(texels.len(), 64);
        assert_eq!(texels[0], 230);
        assert_eq!(texels[2 * 4], 90);
        assert!(texels.chunks(4).all(|px| px[3] == 255));
    }
}
