use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::{CommandBuilder, Destination, QualityPreset, StreamConfig};
use crate::config::LivemuxConfig;
use crate::logs::{LogCategory, LogSink, SessionLog};
use crate::source::{
    HttpClient, PlaylistInspector, SourceDescriptor, SourceKind, SourceValidator,
    ValidationError,
};
use crate::supervisor::{ExitOutcome, ProcessHandle, ProcessSupervisor};

use super::{Session, SessionId, SessionRequest, SessionState};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("session {0} is still running")]
    StillRunning(SessionId),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySummary {
    pub running: usize,
    pub total: usize,
    pub by_kind: BTreeMap<SourceKind, usize>,
}

enum Lifecycle {
    Created,
    Running(ProcessHandle),
    Stopped,
    Errored,
}

impl Lifecycle {
    fn state(&self) -> SessionState {
        match self {
            Lifecycle::Created => SessionState::Created,
            Lifecycle::Running(_) => SessionState::Running,
            Lifecycle::Stopped => SessionState::Stopped,
            Lifecycle::Errored => SessionState::Errored,
        }
    }
}

struct SessionRecord {
    id: SessionId,
    title: String,
    source: SourceDescriptor,
    config: StreamConfig,
    quality: Option<QualityPreset>,
    destination: Destination,
    lifecycle: Lifecycle,
    log: SessionLog,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
    pid: Option<u32>,
    exit: Option<ExitOutcome>,
}

impl SessionRecord {
    fn snapshot(&self) -> Session {
        Session {
            id: self.id.clone(),
            title: self.title.clone(),
            source: self.source.clone(),
            config: self.config,
            quality: self.quality,
            state: self.lifecycle.state(),
            logs: self.log.entries(),
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            pid: self.pid,
            exit: self.exit.clone(),
        }
    }

    fn finish(&mut self, lifecycle: Lifecycle) {
        self.lifecycle = lifecycle;
        self.stopped_at = Some(Utc::now());
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionRecord>,
    issued: HashSet<SessionId>,
}

impl RegistryState {
    fn allocate_id(&mut self) -> SessionId {
        loop {
            let id = SessionId::generate();
            if self.issued.insert(id.clone()) {
                return id;
            }
        }
    }
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    validator: SourceValidator,
    inspector: PlaylistInspector,
    builder: CommandBuilder,
    supervisor: ProcessSupervisor,
    log_capacity: usize,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append_log(&self, id: &SessionId, category: LogCategory, text: String) {
        let mut state = self.lock();
        if let Some(record) = state.sessions.get_mut(id) {
            record.log.push(category, text);
        }
    }

    /// Natural-exit transition. A session that already left `Running` keeps its outcome.
    fn complete(&self, id: &SessionId, outcome: ExitOutcome) {
        let mut state = self.lock();
        let Some(record) = state.sessions.get_mut(id) else {
            return;
        };
        if !matches!(record.lifecycle, Lifecycle::Running(_)) {
            debug!(session_id = %id, %outcome, "exit reported after stop, ignoring");
            return;
        }
        if outcome.is_success() {
            record.log.push(LogCategory::Info, "source ended, transcoder exited cleanly");
            record.finish(Lifecycle::Stopped);
            info!(session_id = %id, "session completed");
        } else {
            record
                .log
                .push(LogCategory::Error, format!("runtime error: transcoder {outcome}"));
            record.finish(Lifecycle::Errored);
            warn!(session_id = %id, %outcome, "session failed");
        }
        record.exit = Some(outcome);
        record.log.push(LogCategory::Info, "streaming stopped");
    }
}

struct SessionLogSink {
    registry: Weak<RegistryInner>,
    id: SessionId,
}

impl LogSink for SessionLogSink {
    fn append(&self, category: LogCategory, text: String) {
        if let Some(inner) = self.registry.upgrade() {
            inner.append_log(&self.id, category, text);
        }
    }
}

/// Owner of every session and its transcoder handle.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("SessionRegistry")
            .field("sessions", &state.sessions.len())
            .field("validator", &self.inner.validator)
            .field("builder", &self.inner.builder)
            .field("supervisor", &self.inner.supervisor)
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(config: &LivemuxConfig, client: Arc<dyn HttpClient>) -> Self {
        let validator = SourceValidator::from_config(config, Arc::clone(&client));
        let inspector = PlaylistInspector::new(client, config.probe.timeout());
        Self::from_parts(
            validator,
            inspector,
            CommandBuilder::from_config(config),
            ProcessSupervisor::from_config(config),
            config.logs.capacity,
        )
    }

    pub fn from_parts(
        validator: SourceValidator,
        inspector: PlaylistInspector,
        builder: CommandBuilder,
        supervisor: ProcessSupervisor,
        log_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                validator,
                inspector,
                builder,
                supervisor,
                log_capacity,
            }),
        }
    }

    /// Validates the request, then spawns its transcoder. Validation failures
    /// leave no trace; a spawn failure yields a session in `Errored`.
    pub async fn create_and_start(
        &self,
        request: SessionRequest,
    ) -> Result<SessionId, RegistryError> {
        if request.destination_key.trim().is_empty() {
            return Err(ValidationError::MissingKey.into());
        }
        request.config.validate()?;
        let source = self
            .inner
            .validator
            .validate(&request.source, request.kind)
            .await?;
        let playlist = if source.kind == SourceKind::HlsPlaylist {
            self.inner.inspector.inspect(&source.location).await
        } else {
            None
        };
        let spec = self
            .inner
            .builder
            .build(&source, &request.config, &request.destination_key);

        let mut state = self.inner.lock();
        let id = state.allocate_id();
        let mut record = SessionRecord {
            id: id.clone(),
            title: request.title,
            source,
            config: request.config,
            quality: request.quality,
            destination: spec.destination.clone(),
            lifecycle: Lifecycle::Created,
            log: SessionLog::new(self.inner.log_capacity),
            started_at: Utc::now(),
            stopped_at: None,
            pid: None,
            exit: None,
        };
        record
            .log
            .push(LogCategory::Info, source_announcement(&record.source));
        if let Some(summary) = playlist {
            record
                .log
                .push(LogCategory::Info, format!("HLS playlist: {summary}"));
        }
        let orientation = if record.config.is_vertical {
            "vertical"
        } else {
            "horizontal"
        };
        record
            .log
            .push(LogCategory::Info, format!("mode: {orientation}"));

        let sink = Arc::new(SessionLogSink {
            registry: Arc::downgrade(&self.inner),
            id: id.clone(),
        });
        match self.inner.supervisor.start(&spec, sink) {
            Ok(handle) => {
                record.pid = handle.pid();
                record.lifecycle = Lifecycle::Running(handle.clone());
                record.log.push(
                    LogCategory::Info,
                    format!("streaming to {}", record.destination),
                );
                state.sessions.insert(id.clone(), record);
                drop(state);
                info!(session_id = %id, pid = ?handle.pid(), "session running");

                let registry = Arc::clone(&self.inner);
                let session_id = id.clone();
                tokio::spawn(async move {
                    let outcome = registry.supervisor.wait(&handle).await;
                    registry.complete(&session_id, outcome);
                });
            }
            Err(error) => {
                warn!(session_id = %id, %error, "transcoder failed to start");
                record
                    .log
                    .push(LogCategory::Error, format!("spawn failed: {error}"));
                record.finish(Lifecycle::Errored);
                record.log.push(LogCategory::Info, "streaming stopped");
                state.sessions.insert(id.clone(), record);
            }
        }
        Ok(id)
    }

    /// Stops a running session. Returns `false` for unknown or non-running sessions.
    pub async fn stop(&self, id: &SessionId) -> bool {
        let handle = {
            let mut state = self.inner.lock();
            let Some(record) = state.sessions.get_mut(id) else {
                return false;
            };
            if !matches!(record.lifecycle, Lifecycle::Running(_)) {
                return false;
            }
            let Lifecycle::Running(handle) = mem::replace(&mut record.lifecycle, Lifecycle::Stopped)
            else {
                return false;
            };
            record.stopped_at = Some(Utc::now());
            record.log.push(LogCategory::Info, "stop requested");
            handle
        };

        info!(session_id = %id, pid = ?handle.pid(), "stopping session");
        self.inner.supervisor.request_stop(&handle).await;

        let mut state = self.inner.lock();
        if let Some(record) = state.sessions.get_mut(id) {
            record.exit = handle.exit_outcome();
            record.log.push(LogCategory::Info, "streaming stopped");
        }
        true
    }

    /// Stops every running session concurrently and returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let running: Vec<SessionId> = {
            let state = self.inner.lock();
            state
                .sessions
                .values()
                .filter(|record| matches!(record.lifecycle, Lifecycle::Running(_)))
                .map(|record| record.id.clone())
                .collect()
        };
        let results = join_all(running.iter().map(|id| self.stop(id))).await;
        let stopped = results.into_iter().filter(|stopped| *stopped).count();
        info!(stopped, "stop-all completed");
        stopped
    }

    pub fn delete(&self, id: &SessionId) -> Result<(), RegistryError> {
        let mut state = self.inner.lock();
        match state.sessions.get(id) {
            None => Err(RegistryError::NotFound(id.clone())),
            Some(record) if matches!(record.lifecycle, Lifecycle::Running(_)) => {
                Err(RegistryError::StillRunning(id.clone()))
            }
            Some(_) => {
                state.sessions.remove(id);
                debug!(session_id = %id, "session deleted");
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.inner.lock().sessions.get(id).map(SessionRecord::snapshot)
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<Session> {
        let state = self.inner.lock();
        let mut sessions: Vec<Session> =
            state.sessions.values().map(SessionRecord::snapshot).collect();
        sessions.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
    }

    /// Plain-text log export, one entry per line in append order.
    pub fn export_log(&self, id: &SessionId) -> Option<String> {
        self.inner
            .lock()
            .sessions
            .get(id)
            .map(|record| record.log.export())
    }

    pub fn summary(&self) -> RegistrySummary {
        let state = self.inner.lock();
        let mut summary = RegistrySummary {
            total: state.sessions.len(),
            ..RegistrySummary::default()
        };
        for record in state.sessions.values() {
            if matches!(record.lifecycle, Lifecycle::Running(_)) {
                summary.running += 1;
            }
            *summary.by_kind.entry(record.source.kind).or_insert(0) += 1;
        }
        summary
    }

    pub fn active_ingestions(&self) -> usize {
        self.inner.supervisor.active_ingestions()
    }
}

fn source_announcement(source: &SourceDescriptor) -> String {
    match source.kind {
        SourceKind::File => format!("using local file: {}", source.display_label),
        SourceKind::DirectUrl => format!("using video URL: {}", source.display_label),
        SourceKind::HlsPlaylist => format!("using HLS stream: {}", source.display_label),
    }
}
