use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 2;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LastFmConfig {
    pub enabled: bool,
    pub api_key: String,
    pub api_secret: String,
}

impl Default for LastFmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            api_secret: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub enabled: bool,
    pub client_id: String,
    pub client_secret: String,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            client_id: String::new(),
            client_secret: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MusicBrainzConfig {
    pub enabled: bool,
    pub user_agent: String,
}

impl Default for MusicBrainzConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_agent: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

/// A local user with an external scrobbling identity to sync favorites
/// against. `user_id` is the opaque local user identifier.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSyncConfig {
    pub user_id: String,
    pub lastfm_user: String,
    pub lastfm_session_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: u32,
    pub music_roots: Vec<String>,
    pub index_path: String,
    pub data_path: String,
    pub port: u16,
    pub artist_separators: String,
    pub scan_on_start: bool,
    pub enrich_on_scan: bool,
    pub external_timeout_secs: u64,
    pub external_cache_ttl_secs: u64,
    pub retry: RetryConfig,
    pub lastfm: LastFmConfig,
    pub spotify: SpotifyConfig,
    pub musicbrainz: MusicBrainzConfig,
    pub users: Vec<UserSyncConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            music_roots: Vec::new(),
            index_path: "cadenza.redb".to_string(),
            data_path: "data".to_string(),
            port: 4533,
            artist_separators: ";/".to_string(),
            scan_on_start: true,
            enrich_on_scan: true,
            external_timeout_secs: 8,
            external_cache_ttl_secs: 60 * 60 * 24,
            retry: RetryConfig::default(),
            lastfm: LastFmConfig::default(),
            spotify: SpotifyConfig::default(),
            musicbrainz: MusicBrainzConfig::default(),
            users: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn separator_chars(&self) -> Vec<char> {
        let chars: Vec<char> = self.artist_separators.chars().collect();
        if chars.is_empty() {
            vec![';', '/']
        } else {
            chars
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("CADENZA_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(ServerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.index_path.trim().is_empty() {
            config.index_path = "cadenza.redb".to_string();
        }
        if config.data_path.trim().is_empty() {
            config.data_path = "data".to_string();
        }
        if config.port == 0 {
            config.port = 4533;
        }
        if config.external_cache_ttl_secs == 0 {
            config.external_cache_ttl_secs = 60 * 60 * 24;
        }
        if config.retry.max_attempts == 0 {
            config.retry = RetryConfig::default();
        }
        return Ok((config, false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

pub fn resolve_music_roots(config_path: &Path, config: &ServerConfig) -> Vec<PathBuf> {
    config
        .music_roots
        .iter()
        .map(|root| root.trim())
        .filter(|root| !root.is_empty())
        .map(|root| resolve_path(config_path, root))
        .collect()
}
