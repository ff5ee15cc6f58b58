use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use livemux_core::{
    QualityPreset, RegistrySummary, Session, SessionRegistry, SessionRequest, SessionState,
    SourceKind,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{render, AppContext, AppError, DisplayFallback, OutputFormat, QualityArgs, Result};

const DEFAULT_KEY_ENV: &str = "LIVEMUX_STREAM_KEY";

#[derive(Args, Debug)]
pub struct RunArgs {
    /// TOML file with one `[[session]]` table per stream
    #[arg(long, conflicts_with_all = ["kind", "source"])]
    pub manifest: Option<PathBuf>,
    #[arg(long, required_unless_present = "manifest")]
    pub kind: Option<SourceKind>,
    #[arg(long, required_unless_present = "manifest")]
    pub source: Option<String>,
    #[arg(long, default_value = "Live")]
    pub title: String,
    /// Environment variable holding the destination key
    #[arg(long, default_value = DEFAULT_KEY_ENV)]
    pub key_env: String,
    #[command(flatten)]
    pub quality: QualityArgs,
    /// Seconds between status reports
    #[arg(long, default_value_t = 5)]
    pub status_interval: u64,
    /// Writes live_log_<id>.txt for every session on exit
    #[arg(long)]
    pub export_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionManifest {
    #[serde(default, rename = "session")]
    pub sessions: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub title: String,
    pub kind: SourceKind,
    pub source: String,
    #[serde(default)]
    pub quality: Option<QualityPreset>,
    #[serde(default)]
    pub vertical: bool,
    #[serde(default)]
    pub key_env: Option<String>,
}

impl SessionManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|source| AppError::Manifest {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl RunArgs {
    fn requests(&self) -> Result<Vec<SessionRequest>> {
        if let Some(path) = &self.manifest {
            let manifest = SessionManifest::load(path)?;
            return manifest
                .sessions
                .into_iter()
                .map(|entry| {
                    let key_env = entry.key_env.as_deref().unwrap_or(&self.key_env);
                    let quality = QualityArgs {
                        quality: entry.quality,
                        vertical: entry.vertical,
                        ..QualityArgs::default()
                    };
                    Ok(SessionRequest {
                        title: entry.title,
                        kind: entry.kind,
                        config: quality.stream_config(),
                        quality: entry.quality,
                        destination_key: read_key(key_env)?,
                        source: entry.source,
                    })
                })
                .collect();
        }

        let (Some(kind), Some(source)) = (self.kind, self.source.clone()) else {
            return Ok(Vec::new());
        };
        Ok(vec![SessionRequest {
            title: self.title.clone(),
            kind,
            source,
            config: self.quality.stream_config(),
            quality: self.quality.quality,
            destination_key: read_key(&self.key_env)?,
        }])
    }
}

fn read_key(var: &str) -> Result<String> {
    env::var(var)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| AppError::MissingKey(var.to_string()))
}

pub(crate) async fn execute(context: &AppContext, args: &RunArgs, format: OutputFormat) -> Result<()> {
    let requests = args.requests()?;
    let registry = SessionRegistry::new(context.config(), context.client());

    let mut rejected = 0usize;
    for request in requests {
        let title = request.title.clone();
        match registry.create_and_start(request).await {
            Ok(id) => info!(session_id = %id, %title, "session started"),
            Err(error) => {
                rejected += 1;
                warn!(%title, %error, "session rejected");
            }
        }
    }
    if registry.summary().total == 0 {
        return Err(AppError::NothingStarted);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupt received, stopping sessions");
                break;
            }
            _ = ticker.tick() => {
                let report = StatusReport::collect(&registry);
                render(&report, format)?;
                if report.summary.running == 0 {
                    break;
                }
            }
        }
    }

    registry.stop_all().await;
    let report = StatusReport::collect(&registry);
    render(&report, format)?;

    if let Some(dir) = &args.export_dir {
        let written = export_logs(&registry, dir)?;
        info!(files = written.len(), dir = %dir.display(), "session logs exported");
    }

    let failed = report
        .sessions
        .iter()
        .filter(|session| session.state == SessionState::Errored)
        .count()
        + rejected;
    if failed > 0 {
        return Err(AppError::SessionsFailed(failed));
    }
    Ok(())
}

/// Writes one `live_log_<id>.txt` per session and returns the written paths.
pub(crate) fn export_logs(registry: &SessionRegistry, dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for session in registry.list() {
        let Some(contents) = registry.export_log(&session.id) else {
            continue;
        };
        let path = dir.join(format!("live_log_{}.txt", session.id));
        fs::write(&path, contents)?;
        written.push(path);
    }
    Ok(written)
}

#[derive(Debug, Serialize)]
pub(crate) struct StatusReport {
    summary: RegistrySummary,
    sessions: Vec<SessionStatus>,
}

#[derive(Debug, Serialize)]
struct SessionStatus {
    id: String,
    title: String,
    kind: SourceKind,
    source: String,
    state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    log_entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_log: Option<String>,
}

impl From<&Session> for SessionStatus {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.to_string(),
            title: session.title.clone(),
            kind: session.source.kind,
            source: session.source.display_label.clone(),
            state: session.state,
            pid: session.pid,
            log_entries: session.logs.len(),
            last_log: session.last_logs(1).first().map(ToString::to_string),
        }
    }
}

impl StatusReport {
    pub(crate) fn collect(registry: &SessionRegistry) -> Self {
        Self {
            summary: registry.summary(),
            sessions: registry.list().iter().map(SessionStatus::from).collect(),
        }
    }
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Sessions: {} running / {} total",
            self.summary.running, self.summary.total
        )];
        for (kind, count) in &self.summary.by_kind {
            lines.push(format!("  - {kind}: {count}"));
        }
        for session in &self.sessions {
            lines.push(format!(
                "[{}] {} | {} | {} {}",
                session.id, session.title, session.state, session.kind, session.source
            ));
            if let Some(last) = &session.last_log {
                lines.push(format!("    {last}"));
            }
        }
        lines.join("\n")
    }
}
