//! Configuration for the pipeline engines, with layered loading.

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefineryConfig {
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub apply: ApplyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

/// Preview engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Sample size when the caller does not ask for one (default: 100).
    #[serde(default = "default_preview_rows")]
    pub default_rows: usize,
    /// Upper bound on the sample size (default: 1000).
    #[serde(default = "default_max_preview_rows")]
    pub max_rows: usize,
    /// Time budget for one preview in milliseconds (default: 2000).
    #[serde(default = "default_preview_timeout")]
    pub timeout_ms: u64,
    /// Number of cached preview results; 0 disables the cache (default: 64).
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Lifetime of a cached preview in seconds (default: 300).
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_preview_rows() -> usize {
    100
}
fn default_max_preview_rows() -> usize {
    1000
}
fn default_preview_timeout() -> u64 {
    2000
}
fn default_cache_capacity() -> usize {
    64
}
fn default_cache_ttl() -> u64 {
    300
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            default_rows: default_preview_rows(),
            max_rows: default_max_preview_rows(),
            timeout_ms: default_preview_timeout(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

/// Apply engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Rows per chunk when streaming the source (default: 10000).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_chunk_size() -> usize {
    10_000
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// Where datasets and recipes live on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory; the platform data directory when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// The effective data directory.
    pub fn resolve_data_dir(&self, workspace: &Path) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return if dir.is_absolute() {
                dir.clone()
            } else {
                workspace.join(dir)
            };
        }
        directories::ProjectDirs::from("dev", "refinery", "refinery")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| workspace.join(".refinery").join("data"))
    }
}

/// Edit history configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum number of undo steps kept (default: 100).
    #[serde(default = "default_history_depth")]
    pub max_depth: usize,
}

fn default_history_depth() -> usize {
    100
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_depth: default_history_depth(),
        }
    }
}

/// Load configuration from defaults, the user config file, the workspace
/// config file, `REFINERY_` environment variables, and explicit overrides,
/// later layers winning.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&RefineryConfig>,
) -> Result<RefineryConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(RefineryConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "refinery", "refinery") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".refinery").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // REFINERY_PREVIEW__MAX_ROWS, REFINERY_APPLY__CHUNK_SIZE, ...
    figment = figment.merge(Env::prefixed("REFINERY_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = RefineryConfig::default();
        assert_eq!(config.preview.default_rows, 100);
        assert_eq!(config.preview.max_rows, 1000);
        assert_eq!(config.apply.chunk_size, 10_000);
        assert_eq!(config.history.max_depth, 100);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: RefineryConfig = toml::from_str("[preview]\nmax_rows = 50\n").unwrap();
        assert_eq!(config.preview.max_rows, 50);
        assert_eq!(config.preview.default_rows, 100);
        assert_eq!(config.apply, ApplyConfig::default());
    }

    #[test]
    fn test_workspace_file_and_overrides() {
        let dir = TempDir::new().unwrap();
        let cfg_dir = dir.path().join(".refinery");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "[apply]\nchunk_size = 500\n[preview]\ndefault_rows = 20\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.apply.chunk_size, 500);
        assert_eq!(config.preview.default_rows, 20);

        let mut overrides = config.clone();
        overrides.apply.chunk_size = 7;
        let config = load_config(Some(dir.path()), Some(&overrides)).unwrap();
        assert_eq!(config.apply.chunk_size, 7);
    }

    #[test]
    fn test_relative_data_dir_resolves_against_workspace() {
        let storage = StorageConfig {
            data_dir: Some(PathBuf::from("data")),
        };
        assert_eq!(
            storage.resolve_data_dir(Path::new("/ws")),
            PathBuf::from("/ws/data")
        );
    }
}
