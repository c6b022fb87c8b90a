use log::{LevelFilter, debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};
use std::time::Duration;

use crate::pdf::LayoutPolicy;
use crate::sandbox::GrowthPolicy;
use crate::sandbox::SandboxConfig;
use crate::sandbox::memory::{DEFAULT_GROWTH_FACTOR, DEFAULT_MEMORY_CEILING};
use crate::sandbox::pdfium::DEFAULT_LARGE_DOCUMENT_THRESHOLD;

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "pdfgate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Location of the wasm build of PDFium
    #[serde(default = "default_wasm_path")]
    pub wasm_path: PathBuf,

    #[serde(default = "default_memory_ceiling")]
    pub memory_ceiling: u64,

    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,

    #[serde(default = "default_large_document_threshold")]
    pub large_document_threshold: u64,

    /// Bound on each bridged read; unset waits forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,

    #[serde(default)]
    pub layout: LayoutPolicy,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_wasm_path() -> PathBuf {
    PathBuf::from("pdfium.wasm")
}

fn default_memory_ceiling() -> u64 {
    DEFAULT_MEMORY_CEILING
}

fn default_growth_factor() -> f64 {
    DEFAULT_GROWTH_FACTOR
}

fn default_large_document_threshold() -> u64 {
    DEFAULT_LARGE_DOCUMENT_THRESHOLD
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            wasm_path: default_wasm_path(),
            memory_ceiling: default_memory_ceiling(),
            growth_factor: default_growth_factor(),
            large_document_threshold: default_large_document_threshold(),
            read_timeout_ms: None,
            layout: LayoutPolicy::default(),
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    #[must_use]
    pub fn growth_policy(&self) -> GrowthPolicy {
        GrowthPolicy::new(self.memory_ceiling, self.growth_factor)
    }

    #[must_use]
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            growth: self.growth_policy(),
            large_document_threshold: self.large_document_threshold,
            read_timeout: self.read_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Unknown level names fall back to `Info`.
    #[must_use]
    pub fn log_level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Info)
    }
}

static SETTINGS: LazyLock<RwLock<Settings>> = LazyLock::new(|| RwLock::new(Settings::default()));

pub fn preferred_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

/// Load the user config, writing a commented default file on first run.
pub fn load_settings() {
    let Some(path) = preferred_config_path() else {
        warn!("Could not determine config directory, using default settings");
        return;
    };
    if path.exists() {
        load_settings_from_path(&path);
    } else {
        info!("Settings file not found, creating with defaults at {path:?}");
        if let Ok(settings) = SETTINGS.read() {
            save_settings_to_file(&settings, &path);
        }
    }
}

/// Replace the global settings with the contents of `path`; keeps the
/// current values when the file cannot be read or parsed.
pub fn load_settings_from_path(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str::<Settings>(&content) {
            Ok(mut settings) => {
                debug!("Loaded settings from {path:?}");
                if settings.version < CURRENT_VERSION {
                    info!(
                        "Migrating settings from v{} to v{}",
                        settings.version, CURRENT_VERSION
                    );
                    settings.version = CURRENT_VERSION;
                }
                if let Ok(mut global) = SETTINGS.write() {
                    *global = settings;
                }
                true
            }
            Err(e) => {
                error!("Failed to parse settings file {path:?}: {e}");
                false
            }
        },
        Err(e) => {
            error!("Failed to read settings file {path:?}: {e}");
            false
        }
    }
}

pub fn save_settings_to_file(settings: &Settings, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create config directory {parent:?}: {e}");
                return;
            }
        }
    }

    match fs::write(path, generate_settings_yaml(settings)) {
        Ok(()) => debug!("Saved settings to {path:?}"),
        Err(e) => error!("Failed to save settings to {path:?}: {e}"),
    }
}

fn generate_settings_yaml(settings: &Settings) -> String {
    let mut content = String::new();

    content.push_str(&format!("version: {}\n", settings.version));
    content.push_str(&format!(
        "wasm_path: \"{}\"\n",
        settings.wasm_path.display()
    ));
    content.push_str("\n# Sandbox heap limits (bytes); growth multiplies the current size\n");
    content.push_str(&format!("memory_ceiling: {}\n", settings.memory_ceiling));
    content.push_str(&format!("growth_factor: {:?}\n", settings.growth_factor));
    content.push_str("\n# Larger in-memory documents are opened through a virtual file\n");
    content.push_str(&format!(
        "large_document_threshold: {}\n",
        settings.large_document_threshold
    ));
    match settings.read_timeout_ms {
        Some(ms) => content.push_str(&format!("read_timeout_ms: {ms}\n")),
        None => content.push_str("# read_timeout_ms: 30000\n"),
    }
    content.push_str("\n# Line reconstruction for extracted text\n");
    content.push_str("layout:\n");
    content.push_str(&format!("  column_gap: {:?}\n", settings.layout.column_gap));
    content.push_str(&format!(
        "  break_on_horizontal_regression: {}\n",
        settings.layout.break_on_horizontal_regression
    ));
    content.push_str(&format!("\nlog_level: {}\n", settings.log_level));

    content
}

// Public API for reading settings

pub fn get_settings() -> Settings {
    SETTINGS.read().map(|s| s.clone()).unwrap_or_default()
}

pub fn get_wasm_path() -> PathBuf {
    SETTINGS
        .read()
        .map(|s| s.wasm_path.clone())
        .unwrap_or_else(|_| default_wasm_path())
}

pub fn get_sandbox_config() -> SandboxConfig {
    SETTINGS
        .read()
        .map(|s| s.sandbox_config())
        .unwrap_or_default()
}

pub fn get_layout_policy() -> LayoutPolicy {
    SETTINGS.read().map(|s| s.layout).unwrap_or_default()
}

pub fn get_log_level() -> LevelFilter {
    SETTINGS
        .read()
        .map(|s| s.log_level_filter())
        .unwrap_or(LevelFilter::Info)
}
