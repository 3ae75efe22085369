//! Runtime configuration (spec.md §6 "Environment", SPEC_FULL.md §4.11).
//!
//! Loaded once at process start: compiled-in defaults, overridden by
//! environment variables (`dotenvy` loads a `.env` file first, if
//! present, matching the teacher's layered-load convention).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const MAIN_GROUP_FOLDER: &str = "main";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub assistant_name: String,
    pub scheduler_poll_interval_ms: u64,
    pub max_concurrent_containers: u32,
    pub container_image: String,
    pub container_timeout_ms: u64,
    pub container_max_output_size: usize,
    pub idle_timeout_ms: u64,
    pub ipc_poll_interval_ms: u64,
    pub port: u16,
    pub timezone: String,

    pub project_root: PathBuf,
    pub home_dir: PathBuf,
    pub mount_allowlist_path: PathBuf,
    pub store_dir: PathBuf,
    pub groups_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl RuntimeConfig {
    /// Loads from environment, falling back to the same defaults the
    /// original daemon shipped with.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let project_root = std::env::current_dir()
            .context("failed to resolve current directory")?
            .canonicalize()
            .context("failed to canonicalize project root")?;
        let home_dir = dirs::home_dir().context("could not resolve home directory")?;

        let config = Self {
            assistant_name: env_or("ASSISTANT_NAME", "CodeClaw"),
            scheduler_poll_interval_ms: 60_000,
            max_concurrent_containers: env_or("MAX_CONCURRENT_CONTAINERS", "5").parse().unwrap_or(5).max(1),
            container_image: env_or("CONTAINER_IMAGE", "codeclaw-agent:latest"),
            container_timeout_ms: env_or("CONTAINER_TIMEOUT", "1800000").parse().unwrap_or(1_800_000),
            container_max_output_size: env_or("CONTAINER_MAX_OUTPUT_SIZE", "10485760").parse().unwrap_or(10_485_760),
            idle_timeout_ms: env_or("IDLE_TIMEOUT", "1800000").parse().unwrap_or(1_800_000),
            ipc_poll_interval_ms: 1_000,
            port: env_or("PORT", "3000").parse().unwrap_or(3000),
            timezone: env_or("TZ", "UTC"),

            mount_allowlist_path: home_dir.join(".config/codeclaw/mount-allowlist.json"),
            store_dir: project_root.join("store"),
            groups_dir: project_root.join("data/groups"),
            data_dir: project_root.join("data"),
            project_root,
            home_dir,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_containers < 1 {
            bail!("MAX_CONCURRENT_CONTAINERS must be at least 1");
        }
        for (name, path) in [
            ("mount_allowlist_path", &self.mount_allowlist_path),
            ("store_dir", &self.store_dir),
            ("data_dir", &self.data_dir),
        ] {
            if !path.is_absolute() {
                bail!("{name} must be an absolute path, got {}", path.display());
            }
        }
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.store_dir).context("failed to create store directory")?;
        std::fs::create_dir_all(&self.groups_dir).context("failed to create groups directory")?;
        std::fs::create_dir_all(self.data_dir.join("ipc")).context("failed to create ipc directory")?;
        if let Some(parent) = self.mount_allowlist_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create mount allowlist directory")?;
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_dir.join("codeclaw.sqlite3")
    }

    pub fn group_folder_path(&self, folder: &str) -> PathBuf {
        if folder == MAIN_GROUP_FOLDER {
            self.groups_dir.join(MAIN_GROUP_FOLDER)
        } else {
            self.groups_dir.join(folder)
        }
    }

    /// Resolves and validates that `folder` does not escape `groups_dir`
    /// via symlink or `..` tricks once the directory exists.
    pub fn resolve_group_folder_path(&self, folder: &str) -> Result<PathBuf> {
        let path = self.group_folder_path(folder);
        std::fs::create_dir_all(&path).context("failed to create group folder")?;
        let real = path.canonicalize().context("failed to canonicalize group folder")?;
        if !real.starts_with(&self.groups_dir.canonicalize().unwrap_or_else(|_| self.groups_dir.clone())) {
            bail!("group folder '{folder}' escapes the groups directory");
        }
        Ok(real)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Grounded on `src/config.rs`'s `find_spec_file`: `.forge/spec.md`
/// first here is a `codeclaw.toml` carrying deployment-local overrides
/// (registered app id, installation map); absent is not an error, since
/// every field above already has an environment-backed default.
pub fn load_app_credentials(project_root: &Path) -> Result<Option<AppCredentials>> {
    let candidate = project_root.join("codeclaw.app.json");
    if !candidate.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&candidate).context("failed to read codeclaw.app.json")?;
    let creds: AppCredentials = serde_json::from_str(&raw).context("failed to parse codeclaw.app.json")?;
    Ok(Some(creds))
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AppCredentials {
    pub app_id: String,
    pub private_key_path: PathBuf,
    pub webhook_secret: String,
    /// `"owner/repo" -> installation id`, populated once per repo the
    /// app is installed against (GitHub's installation webhook, or
    /// manual entry from the app's settings page).
    #[serde(default)]
    pub installation_ids: std::collections::HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = sample_config();
        config.max_concurrent_containers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_store_dir() {
        let mut config = sample_config();
        config.store_dir = PathBuf::from("relative/store");
        assert!(config.validate().is_err());
    }

    #[test]
    fn group_folder_path_uses_main_constant_for_main() {
        let config = sample_config();
        assert_eq!(config.group_folder_path(MAIN_GROUP_FOLDER), config.groups_dir.join("main"));
    }

    #[test]
    fn load_app_credentials_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_app_credentials(dir.path()).unwrap().is_none());
    }

    fn sample_config() -> RuntimeConfig {
        RuntimeConfig {
            assistant_name: "CodeClaw".into(),
            scheduler_poll_interval_ms: 60_000,
            max_concurrent_containers: 5,
            container_image: "codeclaw-agent:latest".into(),
            container_timeout_ms: 1_800_000,
            container_max_output_size: 10_485_760,
            idle_timeout_ms: 1_800_000,
            ipc_poll_interval_ms: 1_000,
            port: 3000,
            timezone: "UTC".into(),
            project_root: PathBuf::from("/tmp/codeclaw-test"),
            home_dir: PathBuf::from("/tmp/codeclaw-test-home"),
            mount_allowlist_path: PathBuf::from("/tmp/codeclaw-test-home/.config/codeclaw/mount-allowlist.json"),
            store_dir: PathBuf::from("/tmp/codeclaw-test/store"),
            groups_dir: PathBuf::from("/tmp/codeclaw-test/data/groups"),
            data_dir: PathBuf::from("/tmp/codeclaw-test/data"),
        }
    }
}
