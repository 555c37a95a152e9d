// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use kestrel_platform::WindowSpec;
use kestrel_render_vk::{DevicePolicy, ValidationMode, VkSettings};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        let spec = WindowSpec::default();
        Self {
            title: spec.title,
            width: spec.width,
            height: spec.height,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCfg {
    Off,
    #[default]
    Auto,
    Optional,
    Required,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DevicePolicyCfg {
    #[default]
    FirstSuitable,
    PreferDiscrete,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RenderCfg {
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
    pub validation: ValidationCfg,
    pub device_policy: DevicePolicyCfg,
    pub shader_dir: Option<PathBuf>,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            frames_in_flight: 2,
            validation: ValidationCfg::Auto,
            device_policy: DevicePolicyCfg::FirstSuitable,
            shader_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SceneCfg {
    pub clear_color: [f32; 4],
    /// Radians per second.
    pub spin_speed: f32,
}

impl Default for SceneCfg {
    fn default() -> Self {
        Self {
            clear_color: [0.10, 0.11, 0.14, 1.0],
            spin_speed: 1.0,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AppCfg {
    pub window: WindowCfg,
    pub render: RenderCfg,
    pub scene: SceneCfg,
}

impl AppCfg {
    pub fn window_spec(&self) -> WindowSpec {
        WindowSpec {
            title: self.window.title.clone(),
            width: self.window.width.max(1),
            height: self.window.height.max(1),
        }
    }

    pub fn vk_settings(&self) -> VkSettings {
        let validation = match self.render.validation {
            ValidationCfg::Off => ValidationMode::Off,
            ValidationCfg::Auto => ValidationMode::for_build(),
            ValidationCfg::Optional => ValidationMode::Optional,
            ValidationCfg::Required => ValidationMode::Required,
        };
        let device_policy = match self.render.device_policy {
            DevicePolicyCfg::FirstSuitable => DevicePolicy::FirstSuitable,
            DevicePolicyCfg::PreferDiscrete => DevicePolicy::PreferDiscrete,
        };
        VkSettings {
            validation,
            device_policy,
            frames_in_flight: self.render.frames_in_flight,
            clear_color: self.render.clear_color,
            shader_dir: self.render.shader_dir.clone(),
        }
    }
}

fn default_clear() -> [f32; 4] {
    [0.02, 0.02, 0.04, 1.0]
}

/// Missing file means defaults; a file that fails to parse is reported and
/// also falls back to defaults.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("{}: {e}; using defaults", path.display());
            AppCfg::default()
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!("{} not found, using defaults", path.display());
            AppCfg::default()
        }
        Err(e) => {
            warn!("read {}: {e}; using defaults", path.display());
            AppCfg::default()
        }
    }
}

pub fn parse_cfg(s: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str(s)
}
