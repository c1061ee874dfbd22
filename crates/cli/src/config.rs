use std::path::{Path, PathBuf};

use anyhow::Context;
use orchestrator::{ExecConfig, OrchestratorConfig};
use serde::{Deserialize, Serialize};
use streaming::{HandleServiceConfig, PrivacyGuardConfig};
use tokio::fs;
use tracing::debug;

pub const RUNTIME_DIR: &str = ".execstream";
pub const CONFIG_FILE: &str = "config.toml";

/// Runtime configuration stored in .execstream/config.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Used when RUST_LOG is not set
    pub log_level: String,
    pub orchestrator: OrchestratorConfig,
    pub exec: ExecConfig,
    pub handles: HandleServiceConfig,
    pub privacy: PrivacyGuardConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            orchestrator: OrchestratorConfig::default(),
            exec: ExecConfig::default(),
            handles: HandleServiceConfig::default(),
            privacy: PrivacyGuardConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn path(project_path: &Path) -> PathBuf {
        project_path.join(RUNTIME_DIR).join(CONFIG_FILE)
    }

    /// Load config from the project directory. `Ok(None)` when no file exists.
    pub async fn load(project_path: &Path) -> anyhow::Result<Option<Self>> {
        let config_path = Self::path(project_path);
        if !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        Ok(Some(config))
    }

    pub async fn write(&self, project_path: &Path) -> std::io::Result<()> {
        let config_dir = project_path.join(RUNTIME_DIR);
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).await?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let config_path = config_dir.join(CONFIG_FILE);
        fs::write(&config_path, content).await?;
        debug!(path = %config_path.display(), "Config saved successfully");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_core::ApprovalPolicy;
    use streaming::GuardMode;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_read_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        assert!(RuntimeConfig::load(temp_dir.path()).await.unwrap().is_none());

        let config = RuntimeConfig::default();
        assert_eq!(config.orchestrator.max_attempts, 3);
        assert_eq!(config.handles.max_stored_frames, 500);
        assert_eq!(config.privacy.mode, GuardMode::Shadow);
    }

    #[tokio::test]
    async fn test_config_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = RuntimeConfig::default();
        config.orchestrator.approval_policy = ApprovalPolicy::Never;
        config.orchestrator.max_attempts = 5;
        config.privacy.mode = GuardMode::Enforce;
        config.handles.default_queue_size = 8;

        config.write(temp_dir.path()).await.unwrap();
        assert!(RuntimeConfig::path(temp_dir.path()).exists());

        let loaded = RuntimeConfig::load(temp_dir.path()).await.unwrap();
        assert_eq!(loaded, Some(config));
    }

    #[tokio::test]
    async fn test_partial_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join(RUNTIME_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(CONFIG_FILE),
            "log_level = \"debug\"\n\n[privacy]\nmode = \"enforce\"\n",
        )
        .unwrap();

        let loaded = RuntimeConfig::load(temp_dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.log_level, "debug");
        assert_eq!(loaded.privacy.mode, GuardMode::Enforce);
        assert_eq!(loaded.exec.max_buffer_bytes, 64 * 1024);
    }

    #[tokio::test]
    async fn test_invalid_config_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join(RUNTIME_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), "orchestrator = 12").unwrap();

        let error = RuntimeConfig::load(temp_dir.path()).await.unwrap_err();
        assert!(error.to_string().starts_with("Failed to parse"));
        assert!(error.to_string().contains(CONFIG_FILE));
    }
}
