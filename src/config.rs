//! TOML configuration for the hub. Every field has a default, so an empty
//! file (or no file at all) is a valid configuration. CLI flags are layered
//! on top by `main`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::clock::{
    DEFAULT_PUSH_INTERVAL_MS, DEFAULT_TICK_MS, PLAYBACK_TOLERANCE_MS, TIMER_TOLERANCE_MS,
};
use crate::error::Result;
use crate::media::DEFAULT_MAX_BYTES;
use crate::providers::Provider;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a patient study coach. Explain concepts step by step, \
ask a short check-for-understanding question when useful, and keep answers under 200 words.";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub sync: SyncSection,
    pub coach: CoachConfig,
    pub media: MediaSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Write-through SQLite archive; off means purely in-memory rooms.
    pub persist: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8888,
            data_dir: PathBuf::from("studyroom-data"),
            persist: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub tick_ms: u64,
    pub push_interval_ms: u64,
    pub playback_tolerance_ms: u64,
    pub timer_tolerance_ms: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            push_interval_ms: DEFAULT_PUSH_INTERVAL_MS,
            playback_tolerance_ms: PLAYBACK_TOLERANCE_MS,
            timer_tolerance_ms: TIMER_TOLERANCE_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoachConfig {
    pub provider: Provider,
    /// Falls back to the provider's default model.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: String,
    /// Falls back to the provider's public endpoint.
    pub api_base: Option<String>,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Openai,
            model: None,
            max_tokens: 512,
            temperature: 0.7,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            api_base: None,
        }
    }
}

impl CoachConfig {
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }

    pub fn api_base(&self) -> &str {
        self.api_base
            .as_deref()
            .unwrap_or_else(|| self.provider.default_api_base())
            .trim_end_matches('/')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSection {
    pub max_bytes: usize,
}

impl Default for MediaSection {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.server.data_dir.join("rooms.db")
    }

    pub fn media_root(&self) -> PathBuf {
        self.server.data_dir.join("media")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        let cfg = ServerConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, ServerConfig::default());
        assert_eq!(cfg.sync.tick_ms, 1_000);
        assert_eq!(cfg.sync.push_interval_ms, 5_000);
        assert_eq!(cfg.sync.playback_tolerance_ms, 3_000);
        assert_eq!(cfg.sync.timer_tolerance_ms, 0);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let cfg = ServerConfig::from_toml_str(
            r#"
            [server]
            port = 9000

            [coach]
            provider = "anthropic"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.coach.provider, Provider::Anthropic);
        assert_eq!(cfg.coach.model(), "claude-sonnet-4-20250514");
        assert_eq!(cfg.coach.api_base(), "https://api.anthropic.com");
    }

    #[test]
    fn test_api_base_trailing_slash_trimmed() {
        let cfg = ServerConfig::from_toml_str(
            "[coach]\napi_base = \"http://127.0.0.1:9999/\"\n",
        )
        .unwrap();
        assert_eq!(cfg.coach.api_base(), "http://127.0.0.1:9999");
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = ServerConfig::from_toml_str("[server\nport = ").unwrap_err();
        assert!(err.to_string().starts_with("config error"));
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("studyroom.toml");
        std::fs::write(&path, "[media]\nmax_bytes = 1024\n[server]\ndata_dir = \"/var/rooms\"\n").unwrap();
        let cfg = ServerConfig::load(&path).unwrap();
        assert_eq!(cfg.media.max_bytes, 1024);
        assert_eq!(cfg.archive_path(), PathBuf::from("/var/rooms/rooms.db"));
        assert_eq!(cfg.media_root(), PathBuf::from("/var/rooms/media"));
    }
}
