//! Configuration loading and paths

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::auth::{AuthEndpoints, ExpirationPolicy, SessionSettings};
use crate::models::DEFAULT_ALLOWED_ROLES;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend base URL; resource paths are joined onto it
    pub base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub logout_path: String,
    /// Roles permitted to hold a session
    pub allowed_roles: Vec<String>,
    /// Paths sent without bearer or refresh handling
    pub excluded_paths: Vec<String>,
    /// Seconds before expiry at which a token counts as due for refresh
    pub refresh_buffer_secs: i64,
    pub refresh_timeout_secs: u64,
    pub logout_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Overrides the session file location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            logout_path: "/auth/logout".to_string(),
            allowed_roles: DEFAULT_ALLOWED_ROLES.iter().map(|r| r.to_string()).collect(),
            excluded_paths: vec!["/auth/login".to_string(), "/auth/refresh".to_string()],
            refresh_buffer_secs: crate::auth::expiry::DEFAULT_REFRESH_BUFFER_SECS,
            refresh_timeout_secs: 10,
            logout_timeout_secs: 5,
            request_timeout_secs: 30,
            session_file: None,
        }
    }
}

impl Config {
    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "session-keeper", "session-keeper")
            .context("Could not determine config directory")
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Load configuration from `path`; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Where the session record lives
    pub fn session_path(&self) -> Result<PathBuf> {
        match &self.session_file {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::project_dirs()?.data_dir().join("session.toml")),
        }
    }

    /// Absolute URL for a path below `base_url`
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&joined).with_context(|| format!("Invalid endpoint URL '{}'", joined))
    }

    pub fn auth_endpoints(&self) -> Result<AuthEndpoints> {
        Ok(AuthEndpoints {
            login: self.endpoint(&self.login_path)?,
            refresh: self.endpoint(&self.refresh_path)?,
            logout: self.endpoint(&self.logout_path)?,
        })
    }

    pub fn policy(&self) -> ExpirationPolicy {
        ExpirationPolicy::new(self.refresh_buffer_secs)
    }

    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            allowed_roles: self.allowed_roles.clone(),
            policy: self.policy(),
            logout_timeout: Duration::from_secs(self.logout_timeout_secs),
        }
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
