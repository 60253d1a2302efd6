//! Client settings.
//!
//! Every component config has a `Default` carrying the production constants,
//! so an empty file (or no file) is a valid configuration. Sources, later
//! ones overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. optional TOML file
//! 3. `TILESPACE_*` environment variables, `__` between sections
//!    (e.g. `TILESPACE_TRANSPORT__ENDPOINT`, `TILESPACE_AUDIO__MAX_HEAR_RADIUS`)
//!
//! ```toml
//! [transport]
//! endpoint = "https://spaces.example.com"
//!
//! [transport.reconnect]
//! max_attempts = 8
//!
//! [proximity]
//! connect_distance = 4.0
//! disconnect_distance = 6.0
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::audio::AudioConfig;
use crate::movement::MovementConfig;
use crate::proximity::ProximityConfig;
use crate::transport::TransportConfig;
use crate::zone::RouterConfig;

pub const ENV_PREFIX: &str = "TILESPACE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub transport: TransportConfig,
    pub movement: MovementConfig,
    pub proximity: ProximityConfig,
    pub audio: AudioConfig,
    pub router: RouterConfig,
}

impl ClientSettings {
    /// Defaults, then `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let settings: Self = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        log::debug!("[config] loaded settings (file: {:?})", path);
        Ok(settings)
    }

    /// Defaults overlaid with a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = ::config::Config::builder()
            .add_source(::config::File::from_str(text, ::config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.proximity;
        if !(p.connect_distance < p.disconnect_distance) {
            return Err(ConfigError::Invalid {
                key: "proximity.connect_distance",
                reason: format!(
                    "must be below disconnect_distance ({} >= {})",
                    p.connect_distance, p.disconnect_distance
                ),
            });
        }
        if !(self.audio.max_hear_radius > 0.0) {
            return Err(ConfigError::Invalid {
                key: "audio.max_hear_radius",
                reason: "must be positive".into(),
            });
        }
        if self.router.zone_chat_limit == 0 {
            return Err(ConfigError::Invalid {
                key: "router.zone_chat_limit",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
