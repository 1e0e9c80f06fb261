//! Configuration loading.
//!
//! Configuration is layered: a TOML file (created with defaults on first
//! run), then environment variable overrides, then CLI flags applied by the
//! binary. Server entries are fixed at startup and never mutated at
//! runtime.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::AppError;
use crate::models::ServerKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub intervalizer: IntervalizerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub images: ImagesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub base_url: String,
}

/// One configured upstream media server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub kind: ServerKind,
    pub display_name: String,
    pub base_url: String,
    /// API key (Emby/Jellyfin) or token (Plex).
    pub credential: String,
    pub external_url: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Active-sessions poll cadence. Floor of 1 second is enforced.
    pub poll_seconds: u64,
    /// Session cache TTL. Defaults to 3x the poll interval.
    pub cache_ttl_seconds: Option<u64>,
    /// Push-stream keepalive ping cadence.
    pub keepalive_seconds: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_seconds: 5,
            cache_ttl_seconds: None,
            keepalive_seconds: 30,
        }
    }
}

impl PollConfig {
    pub fn effective_poll_seconds(&self) -> u64 {
        self.poll_seconds.max(1)
    }

    pub fn effective_cache_ttl_seconds(&self) -> u64 {
        self.cache_ttl_seconds
            .unwrap_or_else(|| self.effective_poll_seconds() * 3)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalizerConfig {
    /// Position jumps at or above this magnitude are treated as seeks.
    pub seek_threshold_seconds: u64,
    /// Sessions with no event for this long are treated as silently stopped.
    pub no_progress_timeout_seconds: u64,
    /// Cadence of the no-progress sweeper.
    pub sweep_interval_seconds: u64,
}

impl Default for IntervalizerConfig {
    fn default() -> Self {
        Self {
            seek_threshold_seconds: 5,
            no_progress_timeout_seconds: 90,
            sweep_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub sync_interval_seconds: u64,
    pub user_sync_interval_seconds: u64,
    pub history_days: u32,
    pub refresh_chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_seconds: 300,
            user_sync_interval_seconds: 43_200,
            history_days: 2,
            refresh_chunk_size: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Whether the user-facing lifetime total includes Trakt-synced items.
    pub include_trakt: bool,
    /// Whether a container-only change with codec copy counts as a
    /// transcode in the now-playing summary.
    pub count_remux_as_transcode: bool,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            include_trakt: true,
            count_remux_as_transcode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Auto-generated and persisted beside the database when absent.
    pub admin_token: Option<String>,
    /// Defaults to the admin token when absent.
    pub webhook_secret: Option<String>,
    pub auth_cookie_name: String,
    pub session_ttl_minutes: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_token: None,
            webhook_secret: None,
            auth_cookie_name: "playtally_session".to_string(),
            session_ttl_minutes: 43_200,
        }
    }
}

/// Poster proxy parameters, consumed by the image-serving collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesConfig {
    pub quality: u32,
    pub max_width: u32,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            quality: 90,
            max_width: 640,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://./playtally.db".to_string(),
                max_connections: Some(5),
            },
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 8899,
                base_url: "http://localhost:8899".to_string(),
            },
            servers: Vec::new(),
            poll: PollConfig::default(),
            intervalizer: IntervalizerConfig::default(),
            sync: SyncConfig::default(),
            stats: StatsConfig::default(),
            auth: AuthConfig::default(),
            images: ImagesConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        let mut config = if Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            toml::from_str(&contents)?
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_file, contents)?;
            default_config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Overlay environment variables on top of the file configuration.
    /// A `<TYPE>_BASE_URL` + credential pair adds (or replaces) one server
    /// entry per server type.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(v) = std::env::var("POLL_SECONDS") {
            if let Ok(secs) = v.parse() {
                self.poll.poll_seconds = secs;
            }
        }
        if let Ok(v) = std::env::var("KEEPALIVE_SECONDS") {
            if let Ok(secs) = v.parse() {
                self.poll.keepalive_seconds = secs;
            }
        }
        if let Ok(v) = std::env::var("SYNC_INTERVAL_SECONDS") {
            if let Ok(secs) = v.parse() {
                self.sync.sync_interval_seconds = secs;
            }
        }
        if let Ok(v) = std::env::var("USER_SYNC_INTERVAL_SECONDS") {
            if let Ok(secs) = v.parse() {
                self.sync.user_sync_interval_seconds = secs;
            }
        }
        if let Ok(v) = std::env::var("HISTORY_DAYS") {
            if let Ok(days) = v.parse() {
                self.sync.history_days = days;
            }
        }
        if let Ok(v) = std::env::var("REFRESH_CHUNK_SIZE") {
            if let Ok(size) = v.parse() {
                self.sync.refresh_chunk_size = size;
            }
        }
        if let Ok(v) = std::env::var("IMAGE_QUALITY") {
            if let Ok(q) = v.parse() {
                self.images.quality = q;
            }
        }
        if let Ok(v) = std::env::var("IMAGE_MAX_WIDTH") {
            if let Ok(w) = v.parse() {
                self.images.max_width = w;
            }
        }
        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            self.auth.admin_token = Some(token);
        }
        if let Ok(secret) = std::env::var("WEBHOOK_SECRET") {
            self.auth.webhook_secret = Some(secret);
        }
        if let Ok(name) = std::env::var("AUTH_COOKIE_NAME") {
            self.auth.auth_cookie_name = name;
        }
        if let Ok(v) = std::env::var("SESSION_TTL_MINUTES") {
            if let Ok(minutes) = v.parse() {
                self.auth.session_ttl_minutes = minutes;
            }
        }

        for (kind, url_var, cred_var) in [
            (ServerKind::Emby, "EMBY_BASE_URL", "EMBY_API_KEY"),
            (ServerKind::Plex, "PLEX_BASE_URL", "PLEX_TOKEN"),
            (ServerKind::Jellyfin, "JELLYFIN_BASE_URL", "JELLYFIN_API_KEY"),
        ] {
            let base_url = std::env::var(url_var).ok();
            let credential = std::env::var(cred_var).ok();
            if let Some(base_url) = base_url {
                let entry = ServerConfig {
                    id: kind.as_str().to_string(),
                    kind,
                    display_name: kind.as_str().to_string(),
                    base_url,
                    credential: credential.unwrap_or_default(),
                    external_url: std::env::var(format!("{}_EXTERNAL_URL", kind.as_str().to_ascii_uppercase())).ok(),
                    enabled: true,
                    accept_invalid_certs: false,
                };
                match self.servers.iter_mut().find(|s| s.id == entry.id) {
                    Some(existing) => *existing = entry,
                    None => self.servers.push(entry),
                }
            }
        }
    }

    /// Startup validation. An enabled server with a missing base URL or
    /// credential is a fatal misconfiguration.
    pub fn validate(&self) -> Result<(), AppError> {
        for server in self.enabled_servers() {
            if server.base_url.trim().is_empty() {
                return Err(AppError::configuration(format!(
                    "server '{}' is enabled but has no base_url",
                    server.id
                )));
            }
            if server.credential.trim().is_empty() {
                return Err(AppError::configuration(format!(
                    "server '{}' is enabled but has no credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter().filter(|s| s.enabled)
    }

    /// Directory the database file lives in; sidecar files (admin token)
    /// are persisted next to it.
    pub fn data_dir(&self) -> PathBuf {
        let path = self
            .database
            .url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");
        Path::new(path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Resolve the admin token: configured value, else previously persisted
    /// sidecar file, else a freshly generated token written to disk. The
    /// webhook secret falls back to the admin token.
    pub fn ensure_admin_token(&mut self) -> Result<String> {
        if let Some(token) = self.auth.admin_token.clone() {
            if self.auth.webhook_secret.is_none() {
                self.auth.webhook_secret = Some(token.clone());
            }
            return Ok(token);
        }

        let token_path = self.data_dir().join("admin_token");
        let token = if token_path.exists() {
            std::fs::read_to_string(&token_path)?.trim().to_string()
        } else {
            let token = uuid::Uuid::new_v4().simple().to_string();
            if let Some(parent) = token_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&token_path, &token)?;
            token
        };

        self.auth.admin_token = Some(token.clone());
        if self.auth.webhook_secret.is_none() {
            self.auth.webhook_secret = Some(token.clone());
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_has_a_floor_of_one_second() {
        let poll = PollConfig {
            poll_seconds: 0,
            ..Default::default()
        };
        assert_eq!(poll.effective_poll_seconds(), 1);
        assert_eq!(poll.effective_cache_ttl_seconds(), 3);
    }

    #[test]
    fn cache_ttl_defaults_to_three_poll_intervals() {
        let poll = PollConfig::default();
        assert_eq!(poll.effective_cache_ttl_seconds(), 15);
    }

    #[test]
    fn enabled_server_without_credential_fails_validation() {
        let mut config = Config::default();
        config.servers.push(ServerConfig {
            id: "emby".into(),
            kind: ServerKind::Emby,
            display_name: "emby".into(),
            base_url: "http://emby.local:8096".into(),
            credential: "".into(),
            external_url: None,
            enabled: true,
            accept_invalid_certs: false,
        });
        assert!(config.validate().is_err());

        config.servers[0].credential = "key".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn disabled_servers_are_ignored_by_validation() {
        let mut config = Config::default();
        config.servers.push(ServerConfig {
            id: "plex".into(),
            kind: ServerKind::Plex,
            display_name: "plex".into(),
            base_url: "".into(),
            credential: "".into(),
            external_url: None,
            enabled: false,
            accept_invalid_certs: false,
        });
        assert!(config.validate().is_ok());
        assert_eq!(config.enabled_servers().count(), 0);
    }
}
