//! Configuration management
//!
//! Layered: built-in defaults, then an optional `config.*` file from the
//! platform config directory, then `MRC_`-prefixed environment variables.
//! The loaded value is passed explicitly into the adapter constructors;
//! nothing reads configuration ambiently.

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP port for the browser-facing surface
    #[serde(default = "default_port")]
    pub port: u16,

    /// One entry per player zone, in display order
    #[serde(default)]
    pub players: Vec<PlayerConfig>,

    #[serde(default)]
    pub snapcast: SnapcastConfig,
}

fn default_port() -> u16 {
    8080
}

/// Static connection info for one player zone.
///
/// Created once at startup and never mutated; the zone client copies the
/// id at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
}

/// Connection info for the routing/volume daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapcastConfig {
    pub host: String,
    #[serde(default = "default_snapcast_port")]
    pub port: u16,
}

impl Default for SnapcastConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: default_snapcast_port(),
        }
    }
}

fn default_snapcast_port() -> u16 {
    1780
}

pub fn load_config() -> Result<Config> {
    let config_dir = directories::ProjectDirs::from("com", "open-horizon-labs", "multiroom-control")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    let config = ::config::Config::builder()
        .set_default("port", 8080)?
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // Override with environment variables (MRC_PORT, MRC_SNAPCAST__HOST, etc.)
        .add_source(
            ::config::Environment::with_prefix("MRC")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(config.try_deserialize()?)
}
