#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use livemux_core::source::{FetchError, ProbeMethod, ProbeResponse};
use livemux_core::{
    ExitOutcome, HttpClient, LivemuxConfig, LogCategory, RegistryError, SessionId,
    SessionRegistry, SessionRequest, SessionState, SourceKind, StreamConfig, ValidationError,
};
use tempfile::TempDir;

const COOPERATIVE: &str = "#!/bin/sh\necho \"frame=  120 fps=30\"\nexec sleep 30\n";
const STUBBORN: &str = "#!/bin/sh\ntrap '' TERM\necho \"frame=1\"\nwhile :; do sleep 0.1; done\n";
const CLEAN_EXIT: &str = "#!/bin/sh\necho \"frame=   10 fps=25 bitrate= 2500.0kbits/s\"\nexit 0\n";
const OVERSIZED_LINE: &str = "#!/bin/sh\nhead -c 70000 /dev/zero | tr '\\0' x >&2\necho >&2\ni=0\nwhile [ $i -lt 4000 ]; do echo \"frame=$i\" >&2; i=$((i+1)); done\nexit 0\n";
const FAILING: &str = "#!/bin/sh\necho \"Connection to server failed: broken pipe\" >&2\nexit 1\n";

struct StaticClient {
    content_type: &'static str,
    calls: AtomicUsize,
}

impl StaticClient {
    fn video() -> Arc<Self> {
        Arc::new(Self {
            content_type: "video/mp4",
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl HttpClient for StaticClient {
    async fn probe(
        &self,
        _url: &str,
        _method: ProbeMethod,
        _timeout: Duration,
    ) -> Result<ProbeResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProbeResponse {
            status: 200,
            content_type: Some(self.content_type.to_string()),
        })
    }

    async fn fetch_text(&self, _url: &str, _timeout: Duration) -> Result<String, FetchError> {
        Ok("#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n".to_string())
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config_for(dir: &Path, binary: PathBuf) -> LivemuxConfig {
    let mut config = LivemuxConfig::default();
    config.transcoder.binary = binary;
    config.media.directory = dir.to_path_buf();
    config.supervisor.grace_period_ms = 300;
    config.supervisor.drain_timeout_ms = 1_000;
    fs::write(dir.join("clip.mp4"), b"not really a video").unwrap();
    config
}

fn registry_with_script(dir: &Path, body: &str) -> (SessionRegistry, Arc<StaticClient>) {
    let binary = write_script(dir, "fake-ffmpeg.sh", body);
    let client = StaticClient::video();
    let registry = SessionRegistry::new(&config_for(dir, binary), client.clone());
    (registry, client)
}

fn file_request(source: &str) -> SessionRequest {
    SessionRequest {
        title: "Morning show".into(),
        kind: SourceKind::File,
        source: source.into(),
        config: StreamConfig::default(),
        quality: None,
        destination_key: "FB-secret-key".into(),
    }
}

async fn wait_for_terminal(registry: &SessionRegistry, id: &SessionId) -> SessionState {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let state = registry.get(id).expect("session exists").state;
        if state.is_terminal() || Instant::now() > deadline {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_for_log(registry: &SessionRegistry, id: &SessionId, category: LogCategory) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let session = registry.get(id).expect("session exists");
        if session.logs.iter().any(|entry| entry.category == category) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn rejects_unsupported_scheme_without_network() {
    let dir = TempDir::new().unwrap();
    let (registry, client) = registry_with_script(dir.path(), COOPERATIVE);
    let request = SessionRequest {
        kind: SourceKind::DirectUrl,
        source: "ftp://x/y.mp4".into(),
        ..file_request("")
    };

    let err = registry.create_and_start(request).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Validation(ValidationError::Scheme)
    ));
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    assert!(registry.list().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_file_spawns_nothing() {
    let dir = TempDir::new().unwrap();
    let (registry, _) = registry_with_script(dir.path(), COOPERATIVE);

    let err = registry
        .create_and_start(file_request("missing.mp4"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Validation(ValidationError::FileNotFound(_))
    ));
    assert!(registry.list().is_empty());
    assert_eq!(registry.active_ingestions(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (registry, _) = registry_with_script(dir.path(), COOPERATIVE);
    let request = SessionRequest {
        destination_key: "  ".into(),
        ..file_request("clip.mp4")
    };

    let err = registry.create_and_start(request).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Validation(ValidationError::MissingKey)
    ));
    assert!(registry.list().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn start_then_stop_all_leaves_nothing_running() {
    let dir = TempDir::new().unwrap();
    let (registry, _) = registry_with_script(dir.path(), COOPERATIVE);

    let first = registry
        .create_and_start(file_request("clip.mp4"))
        .await
        .unwrap();
    let second = registry
        .create_and_start(SessionRequest {
            kind: SourceKind::DirectUrl,
            source: "https://cdn.example.com/live/show.mp4".into(),
            ..file_request("")
        })
        .await
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(registry.summary().running, 2);
    assert!(wait_for_log(&registry, &first, LogCategory::Frame).await);

    assert_eq!(registry.stop_all().await, 2);
    for id in [&first, &second] {
        let session = registry.get(id).unwrap();
        assert_eq!(session.state, SessionState::Stopped);
        assert!(session.stopped_at.is_some());
        assert!(session
            .logs
            .iter()
            .any(|entry| entry.text == "streaming stopped"));
    }
    assert_eq!(registry.summary().running, 0);
    assert_eq!(registry.active_ingestions(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_false_for_unknown_or_finished_sessions() {
    let dir = TempDir::new().unwrap();
    let (registry, _) = registry_with_script(dir.path(), COOPERATIVE);

    assert!(!registry.stop(&SessionId::from("deadbeef")).await);

    let id = registry
        .create_and_start(file_request("clip.mp4"))
        .await
        .unwrap();
    assert!(wait_for_log(&registry, &id, LogCategory::Frame).await);
    assert!(registry.stop(&id).await);
    assert!(!registry.stop(&id).await);

    let session = registry.get(&id).unwrap();
    assert_eq!(session.state, SessionState::Stopped);
    assert_eq!(session.exit, Some(ExitOutcome::Terminated));
}

#[tokio::test(flavor = "multi_thread")]
async fn stubborn_transcoder_is_killed_after_grace_period() {
    let dir = TempDir::new().unwrap();
    let (registry, _) = registry_with_script(dir.path(), STUBBORN);

    let id = registry
        .create_and_start(file_request("clip.mp4"))
        .await
        .unwrap();
    assert!(wait_for_log(&registry, &id, LogCategory::Frame).await);

    let started = Instant::now();
    assert!(registry.stop(&id).await);
    assert!(started.elapsed() < Duration::from_millis(2 * 300 + 400));

    let session = registry.get(&id).unwrap();
    assert_eq!(session.state, SessionState::Stopped);
    assert_eq!(session.exit, Some(ExitOutcome::Killed));
    assert_eq!(registry.active_ingestions(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_exit_marks_session_stopped() {
    let dir = TempDir::new().unwrap();
    let (registry, _) = registry_with_script(dir.path(), CLEAN_EXIT);

    let id = registry
        .create_and_start(file_request("clip.mp4"))
        .await
        .unwrap();
    assert_eq!(wait_for_terminal(&registry, &id).await, SessionState::Stopped);

    let session = registry.get(&id).unwrap();
    assert_eq!(session.exit, Some(ExitOutcome::Exited(0)));
    assert!(session
        .logs
        .iter()
        .any(|entry| entry.category == LogCategory::Frame && entry.text == "Frame: 10"));
    assert!(!registry.stop(&id).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_transcoder_marks_session_errored() {
    let dir = TempDir::new().unwrap();
    let (registry, _) = registry_with_script(dir.path(), FAILING);

    let id = registry
        .create_and_start(file_request("clip.mp4"))
        .await
        .unwrap();
    assert_eq!(wait_for_terminal(&registry, &id).await, SessionState::Errored);

    let session = registry.get(&id).unwrap();
    assert_eq!(session.exit, Some(ExitOutcome::Exited(1)));
    assert!(session
        .logs
        .iter()
        .any(|entry| entry.category == LogCategory::Error && entry.text.contains("failed")));
}

#[tokio::test(flavor = "multi_thread")]
async fn spawn_failure_produces_errored_session() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path(), dir.path().join("no-such-ffmpeg"));
    let registry = SessionRegistry::new(&config, StaticClient::video());

    let id = registry
        .create_and_start(file_request("clip.mp4"))
        .await
        .unwrap();
    let session = registry.get(&id).unwrap();
    assert_eq!(session.state, SessionState::Errored);
    assert!(session.pid.is_none());
    assert!(session
        .logs
        .iter()
        .any(|entry| entry.category == LogCategory::Error));
    assert_eq!(registry.active_ingestions(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn running_sessions_cannot_be_deleted() {
    let dir = TempDir::new().unwrap();
    let (registry, _) = registry_with_script(dir.path(), COOPERATIVE);

    let id = registry
        .create_and_start(file_request("clip.mp4"))
        .await
        .unwrap();
    assert!(matches!(
        registry.delete(&id),
        Err(RegistryError::StillRunning(_))
    ));

    registry.stop(&id).await;
    registry.delete(&id).unwrap();
    assert!(registry.get(&id).is_none());
    assert!(matches!(
        registry.delete(&id),
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn log_buffer_is_capped_and_exportable() {
    let dir = TempDir::new().unwrap();
    let script = "#!/bin/sh\ni=0\nwhile [ $i -lt 40 ]; do echo \"frame=$i\"; i=$((i+1)); done\nexit 0\n";
    let binary = write_script(dir.path(), "chatty.sh", script);
    let mut config = config_for(dir.path(), binary);
    config.logs.capacity = 8;
    let registry = SessionRegistry::new(&config, StaticClient::video());

    let id = registry
        .create_and_start(file_request("clip.mp4"))
        .await
        .unwrap();
    assert_eq!(wait_for_terminal(&registry, &id).await, SessionState::Stopped);

    let session = registry.get(&id).unwrap();
    assert_eq!(session.logs.len(), 8);
    assert_eq!(session.logs.last().unwrap().text, "streaming stopped");
    assert!(session
        .logs
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));

    let export = registry.export_log(&id).unwrap();
    assert_eq!(export.lines().count(), 8);
    assert!(export.contains("[frame] Frame: 39"));
    assert!(registry.export_log(&SessionId::from("unknown")).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn hls_sessions_record_playlist_summary() {
    let dir = TempDir::new().unwrap();
    let (registry, _) = registry_with_script(dir.path(), COOPERATIVE);

    let id = registry
        .create_and_start(SessionRequest {
            kind: SourceKind::HlsPlaylist,
            source: "https://cdn.example.com/live/index.m3u8".into(),
            ..file_request("")
        })
        .await
        .unwrap();
    let session = registry.get(&id).unwrap();
    assert!(session
        .logs
        .iter()
        .any(|entry| entry.text.starts_with("HLS playlist: 2 segments")));
    assert_eq!(registry.summary().by_kind.get(&SourceKind::HlsPlaylist), Some(&1));
    registry.stop_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_output_line_does_not_break_clean_exit() {
    let dir = TempDir::new().unwrap();
    let (registry, _) = registry_with_script(dir.path(), OVERSIZED_LINE);

    let id = registry
        .create_and_start(file_request("clip.mp4"))
        .await
        .unwrap();
    assert_eq!(wait_for_terminal(&registry, &id).await, SessionState::Stopped);

    let session = registry.get(&id).unwrap();
    assert_eq!(session.exit, Some(ExitOutcome::Exited(0)));
    let frames = session
        .logs
        .iter()
        .filter(|entry| entry.category == LogCategory::Frame)
        .count();
    assert!(frames > 0);
    assert!(registry
        .export_log(&id)
        .unwrap()
        .contains("[frame] Frame: 3999"));
    assert_eq!(registry.active_ingestions(), 0);
}
