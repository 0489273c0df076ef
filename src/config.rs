use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::auth::{Identity, TokenTable};
use crate::coalescer::{CoalesceConfig, DEFAULT_FLUSH_DELAY, DEFAULT_FLUSH_THRESHOLD};
use crate::pty::{default_env, resolve_shell};
use crate::reaper::{DEFAULT_IDLE_TIMEOUT, DEFAULT_REAP_INTERVAL};
use crate::registry::RegistrySettings;
use crate::scrollback::DEFAULT_SCROLLBACK_BYTES;

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Top-level server config, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the session metadata mirror.
    pub state_dir: Option<PathBuf>,
    pub server: ServerConfig,
    pub sessions: SessionsConfig,
    pub shell: ShellConfig,
    /// Bearer tokens and the identities they resolve to.
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Session limits and timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub max_sessions: usize,
    pub scrollback_bytes: usize,
    pub coalesce_threshold_bytes: usize,
    pub coalesce_delay_ms: u64,
    pub idle_timeout_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: RegistrySettings::DEFAULT_MAX_SESSIONS,
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            coalesce_threshold_bytes: DEFAULT_FLUSH_THRESHOLD,
            coalesce_delay_ms: DEFAULT_FLUSH_DELAY.as_millis() as u64,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            reap_interval_secs: DEFAULT_REAP_INTERVAL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Overrides `$SHELL`.
    pub program: Option<String>,
    /// Working directory for sessions without a project.
    pub home_dir: Option<PathBuf>,
    /// Parent of the per-project working directories.
    pub projects_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: String,
    pub token: String,
    #[serde(default)]
    pub admin: bool,
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Reject limits that would make the server unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sessions;
        let zero = [
            ("sessions.max_sessions", s.max_sessions as u64),
            ("sessions.scrollback_bytes", s.scrollback_bytes as u64),
            ("sessions.coalesce_threshold_bytes", s.coalesce_threshold_bytes as u64),
            ("sessions.idle_timeout_secs", s.idle_timeout_secs),
            ("sessions.reap_interval_secs", s.reap_interval_secs),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);
        if let Some((key, _)) = zero {
            return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
        }

        let mut seen = std::collections::HashSet::new();
        for user in &self.users {
            if user.id.trim().is_empty() {
                return Err(ConfigError::Invalid("user id must not be empty".into()));
            }
            if user.token.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "user {} has an empty token",
                    user.id
                )));
            }
            if !seen.insert(user.token.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "user {} reuses another user's token",
                    user.id
                )));
            }
        }
        Ok(())
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            max_sessions: self.sessions.max_sessions,
            scrollback_bytes: self.sessions.scrollback_bytes,
            coalesce: CoalesceConfig {
                threshold: self.sessions.coalesce_threshold_bytes,
                delay: Duration::from_millis(self.sessions.coalesce_delay_ms),
            },
            shell: resolve_shell(self.shell.program.as_deref()),
            home_dir: self
                .shell
                .home_dir
                .clone()
                .or_else(dirs::home_dir)
                .unwrap_or_else(std::env::temp_dir),
            projects_root: self.shell.projects_root.clone(),
            env: default_env(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.sessions.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.reap_interval_secs)
    }

    /// Configured state directory, else the platform data dir.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("termhub")
        })
    }

    pub fn token_table(&self) -> TokenTable {
        TokenTable::new(self.users.iter().map(|u| {
            (
                u.token.clone(),
                Identity {
                    id: u.id.clone(),
                    admin: u.admin,
                },
            )
        }))
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn if the config file is world-readable, since it holds tokens.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It contains tokens -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, DEFAULT_BIND);
        assert_eq!(config.sessions.max_sessions, 10);
        assert_eq!(config.sessions.scrollback_bytes, 50 * 1024);
        assert_eq!(config.sessions.coalesce_threshold_bytes, 32 * 1024);
        assert_eq!(config.sessions.coalesce_delay_ms, 8);
        assert_eq!(config.idle_timeout(), Duration::from_secs(86_400));
        assert_eq!(config.reap_interval(), Duration::from_secs(3_600));
        assert!(config.users.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            state_dir = "/var/lib/termhub"

            [server]
            bind = "0.0.0.0:9000"

            [sessions]
            max_sessions = 4
            scrollback_bytes = 1024
            idle_timeout_secs = 60

            [shell]
            program = "/bin/sh"
            projects_root = "/srv/projects"

            [[users]]
            id = "alice"
            token = "a-token"

            [[users]]
            id = "root"
            token = "r-token"
            admin = true
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.state_dir(), PathBuf::from("/var/lib/termhub"));

        let settings = config.registry_settings();
        assert_eq!(settings.max_sessions, 4);
        assert_eq!(settings.scrollback_bytes, 1024);
        assert_eq!(settings.shell, "/bin/sh");
        assert_eq!(settings.projects_root, Some(PathBuf::from("/srv/projects")));
        assert_eq!(settings.coalesce.delay, Duration::from_millis(8));

        let tokens = config.token_table();
        assert_eq!(tokens.len(), 2);
        let root = tokens.resolve("r-token").unwrap();
        assert_eq!(root.id, "root");
        assert!(root.admin);
        assert!(!tokens.resolve("a-token").unwrap().admin);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config: Config = toml::from_str("[sessions]\nmax_sessions = 0").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sessions.max_sessions"));

        let config: Config = toml::from_str("[sessions]\nreap_interval_secs = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_tokens_are_rejected() {
        let toml = r#"
            [[users]]
            id = "a"
            token = "same"
            [[users]]
            id = "b"
            token = "same"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&dir.path().join("absent.toml")).unwrap().is_none());
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termhub.toml");
        std::fs::write(&path, "[server\nbind = 1").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::ParseFailed(..))
        ));
    }

    #[test]
    fn load_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termhub.toml");
        std::fs::write(&path, "[sessions]\nscrollback_bytes = 0\n").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));
    }

    #[cfg(unix)]
    #[test]
    fn is_world_readable_detects_644() {
        assert!(is_world_readable(0o644));
    }

    #[cfg(unix)]
    #[test]
    fn is_world_readable_rejects_600() {
        assert!(!is_world_readable(0o600));
    }

    #[cfg(unix)]
    #[test]
    fn check_permissions_restricted_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termhub.toml");
        std::fs::write(&path, "").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        check_config_permissions(&path);
        assert!(Config::load(&path).unwrap().is_some());
    }
}
