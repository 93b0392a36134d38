use std::{io::ErrorKind, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::engine::MediaConstraints;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub rtc: RtcConfig,
    pub store: StoreConfig,
    pub session: SessionConfig,
}

impl Config {
    /// A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let toml = match fs::read_to_string(path).await {
            Ok(toml) => toml,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("{} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Self::from_toml_str(&toml).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Ok(toml::from_str(toml)?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RtcConfig {
    pub ice_servers: Vec<String>,
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_owned()],
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
        }
    }
}

impl RtcConfig {
    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            offer_to_receive_audio: self.offer_to_receive_audio,
            offer_to_receive_video: self.offer_to_receive_video,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("store.json"),
            poll_interval_ms: 500,
        }
    }
}

impl StoreConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub stats_interval_sec: u64,
    /// Capacity of the engine event channel.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stats_interval_sec: 10,
            event_buffer: 64,
        }
    }
}

impl SessionConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_sec)
    }
}
