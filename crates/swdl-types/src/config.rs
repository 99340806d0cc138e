//! Global configuration types for SWDL.
//!
//! `GlobalConfig` represents the top-level `config.toml` that controls
//! dispatch parallelism, event buffering and the HTTP listener.

use serde::{Deserialize, Serialize};

/// Top-level configuration.
///
/// Loaded from `~/.swdl/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Maximum stages dispatched concurrently within one batch.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Capacity of the live event broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Page size used when listing executions without an explicit limit.
    #[serde(default = "default_list_limit")]
    pub default_list_limit: u32,

    #[serde(default)]
    pub server: ServerConfig,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_event_buffer() -> usize {
    1024
}

fn default_list_limit() -> u32 {
    20
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            event_buffer: default_event_buffer(),
            default_list_limit: default_list_limit(),
            server: ServerConfig::default(),
        }
    }
}

/// HTTP listener settings for `swdl serve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}
