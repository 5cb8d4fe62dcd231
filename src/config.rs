// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::shader::{ShaderSource, ShaderStage};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Rocket Engine".to_string(),
            width: 1920,
            height: 1080,
            resizable: true,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Which external tool turns shader sources into SPIR-V
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompilerTool {
    Glslc,
    Dxc,
}

/// The fixed vertex + fragment pair the pipeline is built from
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub compiler: CompilerTool,
    pub vertex: PathBuf,
    pub fragment: PathBuf,
    pub vertex_entry: String,
    pub fragment_entry: String,
    pub vertex_profile: String,
    pub fragment_profile: String,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            compiler: CompilerTool::Glslc,
            vertex: PathBuf::from("shaders/triangle.vert"),
            fragment: PathBuf::from("shaders/triangle.frag"),
            vertex_entry: "main".to_string(),
            fragment_entry: "main".to_string(),
            vertex_profile: "vulkan1.0".to_string(),
            fragment_profile: "vulkan1.0".to_string(),
        }
    }
}

impl ShaderConfig {
    pub fn vertex_source(&self) -> ShaderSource {
        ShaderSource {
            stage: ShaderStage::Vertex,
            path: self.vertex.clone(),
            entry_point: self.vertex_entry.clone(),
            profile: self.vertex_profile.clone(),
        }
    }

    pub fn fragment_source(&self) -> ShaderSource {
        ShaderSource {
            stage: ShaderStage::Fragment,
            path: self.fragment.clone(),
            entry_point: self.fragment_entry.clone(),
            profile: self.fragment_profile.clone(),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    pub hot_reload_shaders: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "renderer.log".to_string(),
            show_fps: true,
            hot_reload_shaders: false,
        }
    }
}

impl Config {
    /// Load `config.toml` from the working directory.
    ///
    /// Runs before the logger exists, so a broken file is handed back with
    /// the defaults for the caller to report.
    pub fn load() -> (Self, Option<anyhow::Error>) {
        Self::load_or_default("config.toml")
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validation layers are a debug-build feature only
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }
}
