use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::batch::DEFAULT_PARALLELISM;
use crate::pipeline::DEFAULT_CACHE_SIZE;

/// Top-level configuration for darkroom.
///
/// Says where the external tools live, where workspaces go, and how hard
/// batches may push the machine.
///
/// # Loading
///
/// ```rust,no_run
/// use darkroom::config::Config;
///
/// // From a JSON file
/// let config = Config::load(Some("config.json".as_ref())).unwrap();
///
/// // Or use defaults and customize
/// let mut config = Config::default();
/// config.tools.exiftool = "/usr/local/bin/exiftool".into();
/// config.batch.parallelism = 4;
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// External programs.
    pub tools: ToolsConfig,
    /// Per-photo scratch directories.
    pub workspace: WorkspaceConfig,
    pub preview: PreviewConfig,
    pub batch: BatchConfig,
}

/// Paths of the external programs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Adobe DNG Converter executable.
    pub dng_converter: PathBuf,
    /// exiftool executable.
    pub exiftool: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    /// Workspace directories kept around; least recently used go first.
    pub max_workspaces: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Long edge of the edit cache, in pixels.
    pub cache_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Photos exported at the same time.
    pub parallelism: usize,
}

#[cfg(target_os = "macos")]
const DNG_CONVERTER: &str = "/Applications/Adobe DNG Converter.app/Contents/MacOS/Adobe DNG Converter";
#[cfg(windows)]
const DNG_CONVERTER: &str = r"C:\Program Files\Adobe\Adobe DNG Converter\Adobe DNG Converter.exe";
#[cfg(not(any(target_os = "macos", windows)))]
const DNG_CONVERTER: &str = "Adobe DNG Converter";

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            dng_converter: PathBuf::from(DNG_CONVERTER),
            exiftool: PathBuf::from("exiftool"),
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("darkroom"),
            max_workspaces: 16,
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

impl Config {
    /// Resolve the config file path: `config.json` next to the executable.
    pub fn config_path() -> Result<PathBuf> {
        let exe_path = std::env::current_exe().context("Failed to get executable path")?;
        let exe_dir = exe_path
            .parent()
            .context("Failed to get executable directory")?;
        Ok(exe_dir.join("config.json"))
    }

    /// Load config from the given path, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            log::warn!(
                "Config file not found at {}. Using defaults.",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config to the given path, or to the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        crate::fsutil::write_file(&config_path, contents.as_bytes())
            .context("Failed to write config file")?;
        log::info!("Config saved to {}", config_path.display());
        Ok(())
    }
}
