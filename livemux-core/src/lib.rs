pub mod command;
pub mod config;
pub mod error;
pub mod logs;
pub mod session;
pub mod source;
pub mod supervisor;

pub use command::{CommandBuilder, Destination, InvocationSpec, QualityPreset, StreamConfig};
pub use config::{load_livemux_config, LivemuxConfig};
pub use error::{ConfigError, Result};
pub use logs::{classify, LogCategory, LogEntry, LogEvent, LogSink, SessionLog};
pub use session::{
    RegistryError, RegistrySummary, Session, SessionId, SessionRegistry, SessionRequest,
    SessionState,
};
pub use source::{
    check_url_shape, list_local_videos, HttpClient, PlaylistInspector, PlaylistSummary,
    ReqwestClient, SourceDescriptor, SourceKind, SourceValidator, ValidationError,
};
pub use supervisor::{ExitOutcome, ProcessHandle, ProcessSupervisor, SpawnError};
