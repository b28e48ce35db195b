//! リゾルバ設定 (`~/.kura/config.toml`)。

pub mod logging;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cache::{ArtifactCache, CacheError, PurgePolicy, UpdatePolicy};
use crate::download::DownloadSettings;
use crate::registry::{ChecksumPolicy, DEFAULT_CHECKSUM_BACKOFF};
use crate::repository::RepositoryManager;
use crate::repository::config::RepositoryConfig;

pub use logging::{LogLevel, LoggingConfig, LoggingConfigError};

const CONFIG_DIR: &str = ".kura";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ホームディレクトリを特定できません")]
    HomeDirectoryUnavailable,
    #[error("{path:?} を読み込めません: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("設定ファイルの解析に失敗しました: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResolverConfig {
    /// 省略時は `~/.kura/cache`。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_override_dir: Option<PathBuf>,
    #[serde(default = "default_verify_checksums")]
    pub verify_checksums: bool,
    #[serde(default = "default_checksum_retry_backoff_ms")]
    pub checksum_retry_backoff_ms: u64,
    #[serde(default)]
    pub update_policy: UpdatePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purge: Option<PurgePolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<RepositoryConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_verify_checksums() -> bool {
    true
}

fn default_checksum_retry_backoff_ms() -> u64 {
    DEFAULT_CHECKSUM_BACKOFF.as_millis() as u64
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_root: None,
            project_override_dir: None,
            verify_checksums: default_verify_checksums(),
            checksum_retry_backoff_ms: default_checksum_retry_backoff_ms(),
            update_policy: UpdatePolicy::default(),
            purge: None,
            repositories: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ResolverConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        debug!(path = %path.display(), repositories = config.repositories.len(), "設定を読み込みました");
        Ok(config)
    }

    /// `~/.kura/config.toml` を読む。ファイルがなければ既定値を返す。
    pub fn load_default() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeDirectoryUnavailable)?;
        Self::load_in_home(&home)
    }

    pub fn load_in_home(home: &Path) -> Result<Self, ConfigError> {
        let path = home.join(CONFIG_DIR).join(CONFIG_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "設定ファイルがないため既定値を使用します");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// 設定されたリポジトリ。未設定なら Maven Central のみ。
    pub fn effective_repositories(&self) -> Vec<RepositoryConfig> {
        if self.repositories.is_empty() {
            vec![RepositoryConfig::maven_central()]
        } else {
            self.repositories.clone()
        }
    }

    pub fn repository_manager(&self) -> RepositoryManager {
        RepositoryManager::new(self.effective_repositories())
    }

    pub fn checksum_policy(&self) -> ChecksumPolicy {
        ChecksumPolicy {
            enforce: self.verify_checksums,
            retry_backoff: Duration::from_millis(self.checksum_retry_backoff_ms),
        }
    }

    pub fn download_settings(&self) -> DownloadSettings {
        DownloadSettings {
            checksums: self.checksum_policy(),
            update_policy: self.update_policy,
            purge: self.purge,
        }
    }

    pub fn open_cache(&self) -> Result<ArtifactCache, CacheError> {
        match &self.cache_root {
            Some(root) => ArtifactCache::with_dir(root.clone()),
            None => ArtifactCache::global(),
        }
    }
}
