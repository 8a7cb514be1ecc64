// Configuration loader
// Loads ~/.crucible/config.toml with environment variable overrides

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::settings::{Config, EvolveConfig, ServerConfig, ToolConfig};

/// TOML shape of the config file. Every section is optional; anything left
/// out takes the built-in default.
#[derive(serde::Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    server: Option<ServerConfig>,
    #[serde(default)]
    tool: Option<ToolConfig>,
    #[serde(default)]
    evolve: Option<EvolveConfig>,
}

/// Load configuration from the given path, or `~/.crucible/config.toml` when
/// none is given. A missing file yields the defaults; environment overrides
/// (`CRUCIBLE_TOOL_BIN`, `CRUCIBLE_API_KEY`) apply on top either way.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let resolved = match path {
        Some(explicit) => Some(explicit.to_path_buf()),
        None => default_config_path(),
    };

    let mut config = match resolved {
        Some(ref file) if file.exists() => parse_file(file)?,
        Some(ref file) if path.is_some() => {
            anyhow::bail!("config file {} does not exist", file.display())
        }
        _ => Config::default(),
    };

    apply_env_overrides(&mut config);

    config.validate().context("configuration validation failed")?;
    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".crucible").join("config.toml"))
}

fn parse_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("could not read config file {}", path.display()))?;

    let toml_config: TomlConfig = toml::from_str(&contents)
        .with_context(|| format!("could not parse config file {}", path.display()))?;

    Ok(Config {
        server: toml_config.server.unwrap_or_default(),
        tool: toml_config.tool.unwrap_or_default(),
        evolve: toml_config.evolve.unwrap_or_default(),
    })
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(binary) = std::env::var("CRUCIBLE_TOOL_BIN") {
        if !binary.is_empty() {
            config.tool.binary = binary;
        }
    }
    if let Ok(key) = std::env::var("CRUCIBLE_API_KEY") {
        if !key.is_empty() {
            config.server.auth_enabled = true;
            if !config.server.api_keys.contains(&key) {
                config.server.api_keys.push(key);
            }
        }
    }
}
