//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.stepwise/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use stepwise_types::config::EngineConfig;

pub const CONFIG_FILE: &str = "config.toml";

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => sanitize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// A fan-out with zero workers would never make progress.
fn sanitize(mut config: EngineConfig) -> EngineConfig {
    if config.max_fan_out_workers == 0 {
        tracing::warn!("max_fan_out_workers = 0 is not usable, using 1");
        config.max_fan_out_workers = 1;
    }
    config
}
