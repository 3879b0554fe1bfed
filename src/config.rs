use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cascade::MAX_SHADOW_CASCADES;
use crate::error::{PipelineError, PipelineResult};
use crate::hbao::HbaoParameters;

#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub fullscreen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PcfConfig {
    #[serde(default = "PcfConfig::default_samples")]
    pub samples_x: u32,
    #[serde(default = "PcfConfig::default_samples")]
    pub samples_y: u32,
    #[serde(default = "PcfConfig::default_use_lerp_filtering")]
    pub use_lerp_filtering: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShadowConfig {
    #[serde(default = "ShadowConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "ShadowConfig::default_cascade_count")]
    pub cascade_count: u32,
    #[serde(default = "ShadowConfig::default_resolution")]
    pub resolution: u32,
    #[serde(default = "ShadowConfig::default_split_lambda")]
    pub split_lambda: f32,
    #[serde(default = "ShadowConfig::default_bias")]
    pub bias: f32,
    #[serde(default = "ShadowConfig::default_strength")]
    pub strength: f32,
    #[serde(default = "ShadowConfig::default_stabilize")]
    pub stabilize: bool,
    /// Split the view-depth range actually occupied by the scene instead of near..far.
    #[serde(default = "ShadowConfig::default_fit_to_scene_depth")]
    pub fit_to_scene_depth: bool,
    #[serde(default)]
    pub pcf: PcfConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AoConfig {
    #[serde(default = "AoConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "AoConfig::default_blur")]
    pub blur: bool,
    #[serde(default = "AoConfig::default_radius")]
    pub radius: f32,
    #[serde(default = "AoConfig::default_intensity")]
    pub intensity: f32,
    #[serde(default = "AoConfig::default_bias")]
    pub bias: f32,
    #[serde(default = "AoConfig::default_blur_sharpness")]
    pub blur_sharpness: f32,
    #[serde(default = "AoConfig::default_meters_to_viewspace")]
    pub meters_to_viewspace: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "CameraConfig::default_fov_y_degrees")]
    pub fov_y_degrees: f32,
    #[serde(default = "CameraConfig::default_near")]
    pub near: f32,
    #[serde(default = "CameraConfig::default_far")]
    pub far: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IblConfig {
    #[serde(default = "IblConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "IblConfig::default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Equirectangular HDR/PNG source; the built-in gradient sky is used when unset.
    #[serde(default)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RendererConfig {
    #[serde(default = "RendererConfig::default_exposure")]
    pub exposure: f32,
    /// Upper bound for render-target memory. Unlimited when unset.
    #[serde(default)]
    pub gpu_memory_budget_mb: Option<u64>,
    #[serde(default)]
    pub shadow: ShadowConfig,
    #[serde(default)]
    pub ao: AoConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    pub window: WindowConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub ibl: IblConfig,
}

#[derive(Debug, Clone, Default)]
pub struct AppConfigOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub vsync: Option<bool>,
    pub ao_enabled: Option<bool>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { title: "Kestrel PBR".to_string(), width: 1280, height: 720, vsync: true, fullscreen: false }
    }
}

impl PcfConfig {
    const fn default_samples() -> u32 {
        3
    }

    const fn default_use_lerp_filtering() -> bool {
        true
    }

    pub const MAX_SAMPLES: u32 = 7;

    pub fn clamped(self) -> Self {
        Self {
            samples_x: self.samples_x.clamp(1, Self::MAX_SAMPLES),
            samples_y: self.samples_y.clamp(1, Self::MAX_SAMPLES),
            use_lerp_filtering: self.use_lerp_filtering,
        }
    }
}

impl Default for PcfConfig {
    fn default() -> Self {
        Self {
            samples_x: Self::default_samples(),
            samples_y: Self::default_samples(),
            use_lerp_filtering: Self::default_use_lerp_filtering(),
        }
    }
}

impl ShadowConfig {
    const fn default_enabled() -> bool {
        true
    }

    const fn default_cascade_count() -> u32 {
        4
    }

    const fn default_resolution() -> u32 {
        2048
    }

    const fn default_split_lambda() -> f32 {
        0.6
    }

    const fn default_bias() -> f32 {
        0.005
    }

    const fn default_strength() -> f32 {
        1.0
    }

    const fn default_stabilize() -> bool {
        true
    }

    const fn default_fit_to_scene_depth() -> bool {
        true
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.cascade_count == 0 || self.cascade_count as usize > MAX_SHADOW_CASCADES {
            return Err(PipelineError::invalid_config(format!(
                "shadow.cascade_count {} outside 1..={MAX_SHADOW_CASCADES}",
                self.cascade_count
            )));
        }
        if !(256..=8192).contains(&self.resolution) {
            return Err(PipelineError::invalid_config(format!(
                "shadow.resolution {} outside 256..=8192",
                self.resolution
            )));
        }
        if !(0.0..=1.0).contains(&self.split_lambda) {
            return Err(PipelineError::invalid_config(format!(
                "shadow.split_lambda {} outside [0, 1]",
                self.split_lambda
            )));
        }
        Ok(())
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            cascade_count: Self::default_cascade_count(),
            resolution: Self::default_resolution(),
            split_lambda: Self::default_split_lambda(),
            bias: Self::default_bias(),
            strength: Self::default_strength(),
            stabilize: Self::default_stabilize(),
            fit_to_scene_depth: Self::default_fit_to_scene_depth(),
            pcf: PcfConfig::default(),
        }
    }
}

impl AoConfig {
    const fn default_enabled() -> bool {
        true
    }

    const fn default_blur() -> bool {
        true
    }

    const fn default_radius() -> f32 {
        2.0
    }

    const fn default_intensity() -> f32 {
        1.5
    }

    const fn default_bias() -> f32 {
        0.1
    }

    const fn default_blur_sharpness() -> f32 {
        40.0
    }

    const fn default_meters_to_viewspace() -> f32 {
        1.0
    }

    pub fn parameters(&self) -> HbaoParameters {
        HbaoParameters {
            radius: self.radius,
            intensity: self.intensity,
            bias: self.bias,
            blur_sharpness: self.blur_sharpness,
            meters_to_viewspace: self.meters_to_viewspace,
        }
        .clamped()
    }
}

impl Default for AoConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            blur: Self::default_blur(),
            radius: Self::default_radius(),
            intensity: Self::default_intensity(),
            bias: Self::default_bias(),
            blur_sharpness: Self::default_blur_sharpness(),
            meters_to_viewspace: Self::default_meters_to_viewspace(),
        }
    }
}

impl CameraConfig {
    const fn default_fov_y_degrees() -> f32 {
        45.0
    }

    const fn default_near() -> f32 {
        0.1
    }

    const fn default_far() -> f32 {
        100.0
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self { fov_y_degrees: Self::default_fov_y_degrees(), near: Self::default_near(), far: Self::default_far() }
    }
}

impl IblConfig {
    const fn default_enabled() -> bool {
        true
    }

    fn default_cache_dir() -> PathBuf {
        PathBuf::from("cache/ibl")
    }
}

impl Default for IblConfig {
    fn default() -> Self {
        Self { enabled: Self::default_enabled(), cache_dir: Self::default_cache_dir(), source: None }
    }
}

impl RendererConfig {
    const fn default_exposure() -> f32 {
        1.0
    }

    pub fn memory_budget_bytes(&self) -> Option<u64> {
        self.gpu_memory_budget_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }

    pub fn validate(&self) -> PipelineResult<()> {
        self.shadow.validate()?;
        if !(self.exposure.is_finite() && self.exposure > 0.0) {
            return Err(PipelineError::invalid_config("renderer.exposure must be positive"));
        }
        if self.gpu_memory_budget_mb == Some(0) {
            return Err(PipelineError::invalid_config("renderer.gpu_memory_budget_mb must be non-zero"));
        }
        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            exposure: Self::default_exposure(),
            gpu_memory_budget_mb: None,
            shadow: ShadowConfig::default(),
            ao: AoConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &AppConfigOverrides) {
        if let Some(width) = overrides.width {
            self.window.width = width;
        }
        if let Some(height) = overrides.height {
            self.window.height = height;
        }
        if let Some(vsync) = overrides.vsync {
            self.window.vsync = vsync;
        }
        if let Some(enabled) = overrides.ao_enabled {
            self.renderer.ao.enabled = enabled;
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let camera = &self.camera;
        if !(camera.near > 0.0 && camera.near < camera.far) {
            return Err(PipelineError::invalid_config(format!(
                "camera clip planes near={} far={} must satisfy 0 < near < far",
                camera.near, camera.far
            )));
        }
        if !(camera.fov_y_degrees > 0.0 && camera.fov_y_degrees < 180.0) {
            return Err(PipelineError::invalid_config(format!(
                "camera.fov_y_degrees {} outside (0, 180)",
                camera.fov_y_degrees
            )));
        }
        self.renderer.validate()
    }
}

impl AppConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.width.is_none() && self.height.is_none() && self.vsync.is_none() && self.ao_enabled.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.width.is_some() {
            fields.push("width");
        }
        if self.height.is_some() {
            fields.push("height");
        }
        if self.vsync.is_some() {
            fields.push("vsync");
        }
        if self.ao_enabled.is_some() {
            fields.push("ao");
        }
        fields
    }
}
