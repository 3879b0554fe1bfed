use crate::config::WindowConfig;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Fullscreen, Window};

use super::GpuContext;

const DEFAULT_PRESENT_MODES: [wgpu::PresentMode; 1] = [wgpu::PresentMode::Fifo];
const HEADLESS_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[derive(Debug)]
pub struct SurfaceFrame {
    view: wgpu::TextureView,
    surface: Option<wgpu::SurfaceTexture>,
}

impl SurfaceFrame {
    fn new(surface: wgpu::SurfaceTexture) -> Self {
        let view = surface.texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { view, surface: Some(surface) }
    }

    fn headless(view: wgpu::TextureView) -> Self {
        Self { view, surface: None }
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn present(mut self) {
        if let Some(surface) = self.surface.take() {
            surface.present();
        }
    }
}

struct HeadlessTarget {
    texture: wgpu::Texture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SurfaceErrorAction {
    Reconfigure,
    Retry,
    OutOfMemory,
    Unknown,
}

/// Window, surface and device. The renderer receives the device through [`GpuContext`].
pub struct WindowSurface {
    surface: Option<wgpu::Surface<'static>>,
    adapter: Option<wgpu::Adapter>,
    device: Option<wgpu::Device>,
    queue: Option<wgpu::Queue>,
    config: Option<wgpu::SurfaceConfiguration>,
    size: PhysicalSize<u32>,
    window: Option<Arc<Window>>,
    title: String,
    vsync: bool,
    fullscreen: bool,
    present_modes: Vec<wgpu::PresentMode>,
    headless_target: Option<HeadlessTarget>,
    depth_clamp_supported: bool,
    #[cfg(test)]
    resize_invocations: usize,
    #[cfg(test)]
    surface_error_injector: Option<wgpu::SurfaceError>,
}

impl WindowSurface {
    pub fn new(window_cfg: &WindowConfig) -> Self {
        Self {
            surface: None,
            adapter: None,
            device: None,
            queue: None,
            config: None,
            size: PhysicalSize::new(window_cfg.width, window_cfg.height),
            window: None,
            title: window_cfg.title.clone(),
            vsync: window_cfg.vsync,
            fullscreen: window_cfg.fullscreen,
            present_modes: Vec::new(),
            headless_target: None,
            depth_clamp_supported: false,
            #[cfg(test)]
            resize_invocations: 0,
            #[cfg(test)]
            surface_error_injector: None,
        }
    }

    pub fn ensure_window(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        if self.window.is_some() {
            return Ok(());
        }
        let mut attrs = Window::default_attributes().with_title(self.title.clone()).with_inner_size(self.size);
        if self.fullscreen {
            attrs = attrs.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }
        let window = Arc::new(event_loop.create_window(attrs).context("Failed to create window")?);
        pollster::block_on(self.init_wgpu(&window))?;
        let actual_size = window.inner_size();
        if actual_size.width > 0 && actual_size.height > 0 && actual_size != self.size {
            self.resize(actual_size);
        }
        self.window = Some(window);
        Ok(())
    }

    pub fn device(&self) -> Result<&wgpu::Device> {
        self.device.as_ref().context("GPU device not initialized")
    }

    pub fn queue(&self) -> Result<&wgpu::Queue> {
        self.queue.as_ref().context("GPU queue not initialized")
    }

    /// Shared handles for the renderer once a device exists.
    pub fn gpu_context(&self) -> Result<GpuContext> {
        let adapter = self.adapter.as_ref().context("GPU adapter not initialized")?;
        Ok(GpuContext::new(adapter.clone(), self.device()?.clone(), self.queue()?.clone()))
    }

    pub fn supports_depth_clamp(&self) -> bool {
        self.depth_clamp_supported
    }

    pub fn surface_format(&self) -> Result<wgpu::TextureFormat> {
        Ok(self.config.as_ref().context("Surface configuration missing")?.format)
    }

    pub fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    pub fn window(&self) -> Option<&Window> {
        self.window.as_deref()
    }

    pub fn request_redraw(&self) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    pub fn vsync_enabled(&self) -> bool {
        self.vsync
    }

    pub fn set_vsync(&mut self, enabled: bool) -> Result<()> {
        if self.vsync == enabled {
            return Ok(());
        }
        self.vsync = enabled;
        self.reconfigure_present_mode()
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.size.height == 0 {
            1.0
        } else {
            self.size.width as f32 / self.size.height as f32
        }
    }

    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        self.size = new_size;
        #[cfg(test)]
        {
            self.resize_invocations = self.resize_invocations.saturating_add(1);
        }
        self.headless_target = None;
        if new_size.width > 0 && new_size.height > 0 {
            if let Some(config) = self.config.as_mut() {
                config.width = new_size.width;
                config.height = new_size.height;
                if let Err(err) = self.configure_surface() {
                    tracing::warn!("Surface resize failed: {err:?}");
                }
            }
        }
    }

    pub fn acquire_surface_frame(&mut self) -> Result<SurfaceFrame> {
        #[cfg(test)]
        if let Some(err) = self.surface_error_injector.take() {
            return Err(self.handle_surface_error(&err));
        }
        if let Some(surface) = self.surface.as_ref() {
            match surface.get_current_texture() {
                Ok(frame) => Ok(SurfaceFrame::new(frame)),
                Err(err) => Err(self.handle_surface_error(&err)),
            }
        } else if let Some(target) = self.headless_target.as_ref() {
            let view = target.texture.create_view(&wgpu::TextureViewDescriptor::default());
            Ok(SurfaceFrame::headless(view))
        } else {
            Err(anyhow!("Surface not initialized"))
        }
    }

    /// Offscreen color target standing in for the swapchain; readable through `COPY_SRC`.
    pub fn prepare_headless_render_target(&mut self) -> Result<()> {
        let device = self.device()?;
        if self.size.width == 0 || self.size.height == 0 {
            return Err(anyhow!("Headless render target requires non-zero dimensions"));
        }
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Headless Render Target"),
            size: wgpu::Extent3d { width: self.size.width, height: self.size.height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: HEADLESS_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        self.headless_target = Some(HeadlessTarget { texture });
        Ok(())
    }

    pub fn headless_texture(&self) -> Option<&wgpu::Texture> {
        self.headless_target.as_ref().map(|target| &target.texture)
    }

    #[cfg(test)]
    pub fn resize_invocations_for_test(&self) -> usize {
        self.resize_invocations
    }

    #[cfg(test)]
    pub fn inject_surface_error_for_test(&mut self, error: wgpu::SurfaceError) {
        self.surface_error_injector = Some(error);
    }

    /// Creates a device without a window. Fails when no adapter is available.
    pub async fn init_headless_for_test(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("Failed to request headless adapter")?;
        let (device, queue) = self.request_device(&adapter, "Headless Device").await?;
        self.adapter = Some(adapter);
        self.device = Some(device);
        self.queue = Some(queue);
        if self.config.is_none() {
            self.config = Some(wgpu::SurfaceConfiguration {
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                format: HEADLESS_FORMAT,
                width: self.size.width.max(1),
                height: self.size.height.max(1),
                present_mode: wgpu::PresentMode::Fifo,
                alpha_mode: wgpu::CompositeAlphaMode::Opaque,
                view_formats: vec![],
                desired_maximum_frame_latency: 2,
            });
        }
        Ok(())
    }

    pub fn handle_surface_error(&mut self, error: &wgpu::SurfaceError) -> anyhow::Error {
        match Self::surface_error_action(error) {
            SurfaceErrorAction::Reconfigure => {
                self.resize(self.size);
                anyhow!("Surface lost or outdated; reconfigured surface")
            }
            SurfaceErrorAction::Retry => anyhow!("Surface acquisition timed out"),
            SurfaceErrorAction::OutOfMemory => anyhow!("Surface out of memory"),
            SurfaceErrorAction::Unknown => anyhow!("Surface reported an unknown error"),
        }
    }

    fn configure_surface(&mut self) -> Result<()> {
        let surface = self.surface.as_ref().context("Surface not initialized")?;
        let device = self.device.as_ref().context("GPU device not initialized")?;
        let config = self.config.as_mut().context("Surface configuration missing")?;
        surface.configure(device, config);
        Ok(())
    }

    fn select_present_mode(&self, modes: &[wgpu::PresentMode]) -> wgpu::PresentMode {
        if self.vsync {
            wgpu::PresentMode::Fifo
        } else {
            modes.iter().copied().find(|mode| *mode != wgpu::PresentMode::Fifo).unwrap_or(wgpu::PresentMode::Fifo)
        }
    }

    fn choose_surface_format(formats: &[wgpu::TextureFormat]) -> Result<wgpu::TextureFormat> {
        formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| formats.first().copied())
            .context("Surface reports no supported formats")
    }

    pub fn reconfigure_present_mode(&mut self) -> Result<()> {
        if self.surface.is_none() {
            return Ok(());
        }
        let modes: &[wgpu::PresentMode] =
            if self.present_modes.is_empty() { &DEFAULT_PRESENT_MODES } else { self.present_modes.as_slice() };
        let present_mode = self.select_present_mode(modes);
        {
            let config = self.config.as_mut().context("Surface configuration missing")?;
            config.present_mode = present_mode;
        }
        self.configure_surface()
    }

    /// Requests a device, enabling depth clip control when the adapter has it.
    async fn request_device(&mut self, adapter: &wgpu::Adapter, label: &str) -> Result<(wgpu::Device, wgpu::Queue)> {
        let info = adapter.get_info();
        self.depth_clamp_supported = adapter.features().contains(wgpu::Features::DEPTH_CLIP_CONTROL);
        let mut required_features = wgpu::Features::empty();
        if self.depth_clamp_supported {
            required_features |= wgpu::Features::DEPTH_CLIP_CONTROL;
        }
        let device_desc = wgpu::DeviceDescriptor {
            label: Some(label),
            required_features,
            required_limits: adapter.limits(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        };
        let (device, queue) = adapter.request_device(&device_desc).await.context("Failed to request WGPU device")?;
        tracing::info!(
            adapter = %info.name,
            backend = ?info.backend,
            depth_clamp = self.depth_clamp_supported,
            "GPU device ready"
        );
        Ok((device, queue))
    }

    async fn init_wgpu(&mut self, window: &Arc<Window>) -> Result<()> {
        let instance = wgpu::Instance::default();
        let surface = instance.create_surface(window.clone()).context("Failed to create WGPU surface")?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .context("Failed to request WGPU adapter")?;
        let (device, queue) = self.request_device(&adapter, "Device").await?;

        let caps = surface.get_capabilities(&adapter);
        let format = Self::choose_surface_format(&caps.formats)?;
        let alpha_mode = caps.alpha_modes.first().copied().unwrap_or(wgpu::CompositeAlphaMode::Auto);
        let size = window.inner_size();
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: self.select_present_mode(&caps.present_modes),
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        self.surface = Some(surface);
        self.adapter = Some(adapter);
        self.device = Some(device);
        self.queue = Some(queue);
        self.config = Some(config);
        self.present_modes = caps.present_modes.clone();
        Ok(())
    }

    fn surface_error_action(error: &wgpu::SurfaceError) -> SurfaceErrorAction {
        match error {
            wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated => SurfaceErrorAction::Reconfigure,
            wgpu::SurfaceError::Timeout => SurfaceErrorAction::Retry,
            wgpu::SurfaceError::OutOfMemory => SurfaceErrorAction::OutOfMemory,
            wgpu::SurfaceError::Other => SurfaceErrorAction::Unknown,
        }
    }
}
