//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between section and key)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (APP_SERVER__PORT, APP_ROOMS__MAX_STUDENTS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each concern of the relay (rooms, liveness, persistence, AI services) gets its own
/// section so the TOML file reads the same way the code is laid out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub rooms: RoomsConfig,
    pub heartbeat: HeartbeatConfig,
    pub rejected_codes: RejectedCodesConfig,
    pub store: StoreConfig,
    pub services: ServicesConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Room bookkeeping limits and retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    /// Students allowed in a single room before joins are refused
    pub max_students: usize,
    /// Transcript entries kept per room (oldest dropped first)
    pub transcript_limit: usize,
    /// Seconds a connection without a room may stay unjoined
    pub join_timeout_secs: u64,
    /// Keep the room registered after its host disconnects
    pub keep_room_on_host_leave: bool,
    /// Drop rooms from the registry once nobody is connected
    pub close_empty_rooms: bool,
    /// Random draws before falling back to a linear scan of the code space
    pub code_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedCodesConfig {
    /// Size at which the cache is cleared wholesale
    pub max_entries: usize,
    pub sweep_interval_secs: u64,
}

/// Which durable store backs room snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
    None,
}

/// Durable room store settings.
///
/// ## Fields:
/// - `backend`: `redis`, `memory` (in-process, development only) or `none`
/// - `redis_url`: connection URL, only read for the `redis` backend
/// - `key_prefix`: namespace prepended to every room code
/// - `ttl_secs`: expiry applied on every snapshot write (12 hours by default)
/// - `retry_after_secs`: how long an unreachable store is skipped before being retried
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    pub key_prefix: String,
    pub ttl_secs: u64,
    pub retry_after_secs: u64,
}

/// External transcription / translation service settings.
///
/// Any OpenAI-compatible endpoint works; `api_key` is usually supplied through
/// `APP_SERVICES__API_KEY` rather than the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub base_url: String,
    pub api_key: String,
    pub transcription_model: String,
    pub translation_model: String,
    /// MIME type of the audio the frontend records (sent with each upload)
    pub audio_mime: String,
    /// Language every text submission is translated into, requested or not
    pub baseline_language: String,
    /// Bytes buffered by a streaming session before a chunk is transcribed
    pub stream_chunk_bytes: usize,
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            rooms: RoomsConfig {
                max_students: 200,
                transcript_limit: 50,
                join_timeout_secs: 60,
                keep_room_on_host_leave: true,
                close_empty_rooms: false,
                code_attempts: 5,
            },
            heartbeat: HeartbeatConfig { interval_secs: 30 },
            rejected_codes: RejectedCodesConfig {
                max_entries: 1000,
                sweep_interval_secs: 300,
            },
            store: StoreConfig {
                backend: StoreBackend::None,
                redis_url: "redis://127.0.0.1:6379".to_string(),
                key_prefix: "room:".to_string(),
                ttl_secs: 12 * 60 * 60,
                retry_after_secs: 30,
            },
            services: ServicesConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: String::new(),
                transcription_model: "whisper-1".to_string(),
                translation_model: "gpt-4o-mini".to_string(),
                audio_mime: "audio/webm".to_string(),
                baseline_language: "English".to_string(),
                stream_chunk_bytes: 256 * 1024,
                request_timeout_secs: 30,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_STORE__BACKEND=redis`: Persist room snapshots to Redis
    /// - `APP_ROOMS__MAX_STUDENTS=50`: Smaller classrooms
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Room limits allow at least one student and one transcript entry
    /// - Timers have a non-zero period (a zero interval would spin)
    /// - A Redis URL is present when the Redis backend is selected
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.rooms.max_students == 0 {
            return Err(anyhow::anyhow!("Max students must be greater than 0"));
        }

        if self.rooms.transcript_limit == 0 {
            return Err(anyhow::anyhow!("Transcript limit must be greater than 0"));
        }

        if self.heartbeat.interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.rejected_codes.sweep_interval_secs == 0 || self.rejected_codes.max_entries == 0 {
            return Err(anyhow::anyhow!("Rejected-code cache limits must be greater than 0"));
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.trim().is_empty() {
            return Err(anyhow::anyhow!("Redis backend selected but store.redis_url is empty"));
        }

        if self.services.stream_chunk_bytes == 0 {
            return Err(anyhow::anyhow!("Stream chunk size must be greater than 0"));
        }

        Ok(())
    }
}

impl RoomsConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl StoreConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.rooms.max_students, 200);
        assert_eq!(config.rooms.transcript_limit, 50);
        assert_eq!(config.store.ttl(), Duration::from_secs(43_200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.heartbeat.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.store.backend = StoreBackend::Redis;
        config.store.redis_url = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_backend_names() {
        let backend: StoreBackend = serde_json::from_str("\"redis\"").unwrap();
        assert_eq!(backend, StoreBackend::Redis);
        let backend: StoreBackend = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(backend, StoreBackend::None);
    }
}
