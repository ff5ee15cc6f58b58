use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LivemuxConfig {
    #[serde(default)]
    pub transcoder: TranscoderSection,
    #[serde(default)]
    pub destination: DestinationSection,
    #[serde(default)]
    pub probe: ProbeSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub logs: LogsSection,
    #[serde(default)]
    pub media: MediaSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscoderSection {
    pub binary: PathBuf,
    pub log_level: String,
    pub stats_period: String,
    pub preset: String,
}

impl Default for TranscoderSection {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            log_level: "info".into(),
            stats_period: String::new(),
            preset: "veryfast".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DestinationSection {
    pub endpoint: String,
    pub path: String,
}

impl Default for DestinationSection {
    fn default() -> Self {
        Self {
            endpoint: "live-api-s.facebook.com:443".into(),
            path: "rtmp".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub timeout_seconds: u64,
    pub user_agent: String,
}

impl ProbeSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            timeout_seconds: 5,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub grace_period_ms: u64,
    pub drain_timeout_ms: u64,
}

impl SupervisorSection {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            grace_period_ms: 1_000,
            drain_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogsSection {
    pub capacity: usize,
    pub excerpt_chars: usize,
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            capacity: 500,
            excerpt_chars: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaSection {
    pub directory: PathBuf,
}

impl Default for MediaSection {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
        }
    }
}

pub fn load_livemux_config<P: AsRef<Path>>(path: P) -> Result<LivemuxConfig> {
    let path = path.as_ref();
    let config: LivemuxConfig = load_toml(path)?;
    if let Some(reason) = config.problem() {
        return Err(ConfigError::Invalid {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        });
    }
    Ok(config)
}

impl LivemuxConfig {
    fn problem(&self) -> Option<&'static str> {
        if self.transcoder.binary.as_os_str().is_empty() {
            Some("transcoder.binary must not be empty")
        } else if self.destination.endpoint.trim().is_empty() {
            Some("destination.endpoint must not be empty")
        } else if self.logs.capacity == 0 {
            Some("logs.capacity must be positive")
        } else if self.supervisor.grace_period_ms == 0 {
            Some("supervisor.grace_period_ms must be positive")
        } else {
            None
        }
    }
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
