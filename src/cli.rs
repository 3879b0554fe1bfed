use crate::config::AppConfigOverrides;
use crate::renderer::DebugOverlay;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/app.json";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    width: Option<u32>,
    height: Option<u32>,
    vsync: Option<bool>,
    ao_enabled: Option<bool>,
    config_path: Option<PathBuf>,
    debug_overlay: Option<DebugOverlay>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Use --width/--height/--vsync with values.");
            };
            if key == "no-ao" {
                overrides.ao_enabled = Some(false);
                continue;
            }
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "width" => {
                    overrides.width =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid width '{value}'"))?);
                }
                "height" => {
                    overrides.height =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid height '{value}'"))?);
                }
                "vsync" => {
                    overrides.vsync = Some(parse_bool_flag("vsync", &value)?);
                }
                "ao" => {
                    overrides.ao_enabled = Some(parse_bool_flag("ao", &value)?);
                }
                "config" => {
                    overrides.config_path = Some(PathBuf::from(value));
                }
                "debug-overlay" => {
                    overrides.debug_overlay = Some(value.parse::<DebugOverlay>().map_err(|err| anyhow!(err))?);
                }
                _ => bail!(
                    "Unknown flag '{flag}'. Supported flags: --width, --height, --vsync, --ao, --no-ao, --config, --debug-overlay."
                ),
            }
        }
        Ok(overrides)
    }

    pub fn config_path(&self) -> &Path {
        self.config_path.as_deref().unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH))
    }

    pub fn debug_overlay(&self) -> Option<DebugOverlay> {
        self.debug_overlay
    }

    pub fn config_overrides(&self) -> AppConfigOverrides {
        AppConfigOverrides { width: self.width, height: self.height, vsync: self.vsync, ao_enabled: self.ao_enabled }
    }

    pub fn into_config_overrides(self) -> AppConfigOverrides {
        self.config_overrides()
    }

    #[cfg(test)]
    pub fn as_tuple(&self) -> (Option<u32>, Option<u32>, Option<bool>) {
        (self.width, self.height, self.vsync)
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}
