use std::path::Path;

use anyhow::{Context, Result};
use track_engine::EngineConfig;

use crate::cli::EngineFlags;

/// Engine config from the optional TOML file, with flag overrides applied.
pub fn load_engine_config(flags: &EngineFlags) -> Result<EngineConfig> {
    let mut config = match &flags.config {
        Some(path) => read_config_file(path)?,
        None => EngineConfig::default(),
    };
    apply_flags(&mut config, flags);
    tracing::debug!(?config, "engine config");
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<EngineConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    parse_config(&text).with_context(|| format!("parse config {}", path.display()))
}

fn parse_config(text: &str) -> Result<EngineConfig> {
    Ok(toml::from_str(text)?)
}

fn apply_flags(config: &mut EngineConfig, flags: &EngineFlags) {
    if let Some(ms) = flags.buffer_ms {
        config.buffer_ms = ms;
    }
    if let Some(ms) = flags.frame_ms {
        config.frame_ms = ms;
    }
    if flags.no_ghosting {
        config.seek_ghosting = false;
    }
    if let Some(ms) = flags.stuck_ms {
        config.stuck_threshold_ms = ms;
    }
}
