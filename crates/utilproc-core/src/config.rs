//! Configuration resolution for utilproc.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/utilproc/settings.json)
//! 3. Project config (.utilproc/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Bytes a reader buffers before it reports that it is no longer ready.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Bytes the process host reads from a worker pipe per chunk.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Complete utilproc configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Launch defaults applied by the option normalizer and the process host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Exec arguments used when the launch options carry none.
    pub default_exec_args: Vec<String>,
    /// Program that runs the entry script. Without one the entry is executed directly.
    pub interpreter: Option<PathBuf>,
    /// Reader buffer size (bytes) above which a push reports not-ready.
    pub high_water_mark: usize,
    /// Maximum bytes read from a worker pipe per chunk.
    pub read_chunk_size: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            default_exec_args: Vec::new(),
            interpreter: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// One settings file as written on disk. Absent fields leave the lower
/// layer untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsFile {
    pub launcher: LauncherSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LauncherSettings {
    pub default_exec_args: Option<Vec<String>>,
    pub interpreter: Option<PathBuf>,
    pub high_water_mark: Option<usize>,
    pub read_chunk_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub json: Option<bool>,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, &global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".utilproc").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, &project);
        }
    }

    apply_env_overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".utilproc").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/utilproc/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("utilproc").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Read a single settings file.
pub fn load_config_file(path: &Path) -> Result<SettingsFile> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: &SettingsFile) {
    let launcher = &overlay.launcher;
    if let Some(args) = &launcher.default_exec_args {
        base.launcher.default_exec_args.clone_from(args);
    }
    if let Some(interpreter) = &launcher.interpreter {
        base.launcher.interpreter = Some(interpreter.clone());
    }
    if let Some(n) = launcher.high_water_mark {
        base.launcher.high_water_mark = n;
    }
    if let Some(n) = launcher.read_chunk_size {
        base.launcher.read_chunk_size = n;
    }

    if let Some(level) = &overlay.logging.level {
        base.logging.level.clone_from(level);
    }
    if let Some(json) = overlay.logging.json {
        base.logging.json = json;
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("UTILPROC_INTERPRETER")
        && !val.is_empty()
    {
        config.launcher.interpreter = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("UTILPROC_HIGH_WATER_MARK")
        && let Ok(n) = val.parse()
    {
        config.launcher.high_water_mark = n;
    }
    if let Ok(val) = std::env::var("UTILPROC_READ_CHUNK_SIZE")
        && let Ok(n) = val.parse()
    {
        config.launcher.read_chunk_size = n;
    }
    if let Ok(val) = std::env::var("UTILPROC_LOG_LEVEL") {
        config.logging.level = val;
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.launcher.high_water_mark == 0 {
        return Err(Error::Config(
            "launcher.high_water_mark must be greater than zero".to_string(),
        ));
    }
    if config.launcher.read_chunk_size == 0 {
        return Err(Error::Config(
            "launcher.read_chunk_size must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
