//! Locating the data directory and reading `config.toml` from it.
//!
//! Configuration problems never stop the CLI: a missing file is normal, and a
//! broken one is logged and replaced by defaults.

use std::path::{Path, PathBuf};

use swdl_types::config::GlobalConfig;

/// Overrides the data directory (database and `config.toml`).
pub const DATA_DIR_ENV: &str = "SWDL_DATA_DIR";

const CONFIG_FILE: &str = "config.toml";

/// `$SWDL_DATA_DIR`, falling back to `~/.swdl` (or `./.swdl` without a home).
pub fn data_dir() -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".swdl"),
    }
}

/// Parse config text, clamping values that would stall the engine.
pub fn parse_config(text: &str) -> Result<GlobalConfig, toml::de::Error> {
    let mut config: GlobalConfig = toml::from_str(text)?;
    config.max_concurrency = config.max_concurrency.max(1);
    config.event_buffer = config.event_buffer.max(1);
    config.default_list_limit = config.default_list_limit.max(1);
    Ok(config)
}

/// Read `{data_dir}/config.toml`, or defaults when it is absent or invalid.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let path = data_dir.join(CONFIG_FILE);

    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file");
            return GlobalConfig::default();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable config file ignored");
            return GlobalConfig::default();
        }
    };

    parse_config(&text).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "invalid config file ignored");
        GlobalConfig::default()
    })
}
