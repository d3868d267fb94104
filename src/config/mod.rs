//! Configuration management for the extension runtime

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub runtime: RuntimeSection,
    pub secrets: SecretsConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Where installed extensions live (defaults to the platform data dir)
    pub extensions_dir: Option<PathBuf>,
    /// Where extension storage and the secrets database live
    pub data_dir: Option<PathBuf>,
    /// How long a unit may take to report `ready`
    pub ready_timeout_secs: u64,
    /// Wait after `deactivate` before a unit is force-terminated
    pub deactivate_grace_ms: u64,
    pub tool_timeout_secs: u64,
    pub action_timeout_secs: u64,
    pub models_timeout_secs: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            extensions_dir: None,
            data_dir: None,
            ready_timeout_secs: 10,
            deactivate_grace_ms: 2000,
            tool_timeout_secs: 60,
            action_timeout_secs: 30,
            models_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Environment variable holding the master secret
    pub master_secret_env: String,
    /// Database file, relative to the data dir unless absolute
    pub db_file: PathBuf,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            master_secret_env: "EXTENSION_RUNTIME_MASTER_SECRET".to_string(),
            db_file: PathBuf::from("secrets.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Responses larger than this are refused
    pub max_response_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("extension-runtime/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            max_response_bytes: 10 * 1024 * 1024,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from default location or fall back to defaults
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load from an explicit path; a missing file means defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: RuntimeConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            Ok(RuntimeConfig::default())
        }
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "extension-runtime") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Ok(PathBuf::from("config.toml"))
        }
    }

    pub fn extensions_dir(&self) -> Result<PathBuf> {
        match &self.runtime.extensions_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::extensions::extensions_dir(),
        }
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.runtime.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::extensions::data_dir(),
        }
    }

    /// Root of per-extension storage files
    pub fn storage_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("storage"))
    }

    pub fn secrets_db_path(&self) -> Result<PathBuf> {
        if self.secrets.db_file.is_absolute() {
            Ok(self.secrets.db_file.clone())
        } else {
            Ok(self.data_dir()?.join(&self.secrets.db_file))
        }
    }

    /// Master secret from the configured environment variable
    pub fn master_secret(&self) -> Option<String> {
        std::env::var(&self.secrets.master_secret_env)
            .ok()
            .filter(|s| !s.is_empty())
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.ready_timeout_secs)
    }

    pub fn deactivate_grace(&self) -> Duration {
        Duration::from_millis(self.runtime.deactivate_grace_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.tool_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.action_timeout_secs)
    }

    pub fn models_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.models_timeout_secs)
    }

    /// Save configuration to default location
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.tool_timeout(), Duration::from_secs(60));
        assert_eq!(config.action_timeout(), Duration::from_secs(30));
        assert_eq!(config.models_timeout(), Duration::from_secs(30));
        assert_eq!(config.secrets.master_secret_env, "EXTENSION_RUNTIME_MASTER_SECRET");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [runtime]
            data_dir = "/tmp/ext-data"
            tool_timeout_secs = 5

            [network]
            timeout_secs = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.runtime.tool_timeout_secs, 5);
        assert_eq!(config.runtime.action_timeout_secs, 30);
        assert_eq!(config.network.timeout_secs, 3);
        assert_eq!(
            config.secrets_db_path().unwrap(),
            PathBuf::from("/tmp/ext-data/secrets.db")
        );
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.runtime.ready_timeout_secs, 10);
    }
}
