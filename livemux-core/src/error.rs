use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to turn a `livemux.toml` into a usable [`crate::LivemuxConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read livemux config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed livemux config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    /// Parsed, but a value would make every session fail.
    #[error("invalid livemux config {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
