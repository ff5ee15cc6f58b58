mod registry;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::{QualityPreset, StreamConfig};
use crate::logs::LogEntry;
use crate::source::{SourceDescriptor, SourceKind};
use crate::supervisor::ExitOutcome;

pub use registry::{RegistryError, RegistrySummary, SessionRegistry};

const SESSION_ID_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    fn generate() -> Self {
        Self(
            Uuid::new_v4()
                .simple()
                .to_string()
                .chars()
                .take(SESSION_ID_LEN)
                .collect(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Running,
    Stopped,
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Errored)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything the operator supplies to launch a session.
#[derive(Clone)]
pub struct SessionRequest {
    pub title: String,
    pub kind: SourceKind,
    pub source: String,
    pub config: StreamConfig,
    pub quality: Option<QualityPreset>,
    pub destination_key: String,
}

impl fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRequest")
            .field("title", &self.title)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("config", &self.config)
            .field("quality", &self.quality)
            .finish_non_exhaustive()
    }
}

/// Point-in-time copy of a session. The destination key is never included.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub source: SourceDescriptor,
    pub config: StreamConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityPreset>,
    pub state: SessionState,
    pub logs: Vec<LogEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitOutcome>,
}

impl Session {
    pub fn last_logs(&self, count: usize) -> &[LogEntry] {
        let start = self.logs.len().saturating_sub(count);
        &self.logs[start..]
    }
}
