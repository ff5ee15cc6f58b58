pub mod playlist;
pub mod probe;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::LivemuxConfig;

pub use playlist::{PlaylistInspector, PlaylistSummary};
pub use probe::{FetchError, HttpClient, ProbeMethod, ProbeResponse, ReqwestClient};

pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".flv", ".mkv", ".avi", ".mov", ".webm", ".m3u8", ".m3u",
];
pub const LOCAL_VIDEO_EXTENSIONS: &[&str] = &["mp4", "flv", "mkv", "avi", "mov", "webm"];

const DISPLAY_LABEL_CHARS: usize = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("source is empty")]
    Empty,
    #[error("URL must start with http:// or https://")]
    Scheme,
    #[error("malformed URL: {0}")]
    MalformedUrl(String),
    #[error("timed out while reaching {url}")]
    Timeout { url: String },
    #[error("could not reach {url}: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("{url} is not recognized as video")]
    NotVideo { url: String },
    #[error("video file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("{0} is outside the media directory")]
    OutsideMediaDir(PathBuf),
    #[error("unknown source kind: {0}")]
    UnknownKind(String),
    #[error("invalid stream config: {0}")]
    Config(String),
    #[error("destination key is required")]
    MissingKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "file")]
    File,
    #[serde(rename = "url")]
    DirectUrl,
    #[serde(rename = "hls")]
    HlsPlaylist,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::File => "file",
            SourceKind::DirectUrl => "url",
            SourceKind::HlsPlaylist => "hls",
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, SourceKind::File)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "url" => Ok(Self::DirectUrl),
            "hls" => Ok(Self::HlsPlaylist),
            other => Err(ValidationError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    pub location: String,
    pub display_label: String,
}

impl SourceDescriptor {
    fn file(path: &Path) -> Self {
        let display_label = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            kind: SourceKind::File,
            location: path.to_string_lossy().to_string(),
            display_label,
        }
    }

    fn remote(kind: SourceKind, url: &str) -> Self {
        let display_label = if url.chars().count() > DISPLAY_LABEL_CHARS {
            let head: String = url.chars().take(DISPLAY_LABEL_CHARS).collect();
            format!("{head}...")
        } else {
            url.to_string()
        };
        Self {
            kind,
            location: url.to_string(),
            display_label,
        }
    }
}

#[derive(Clone)]
pub struct SourceValidator {
    client: Arc<dyn HttpClient>,
    media_dir: PathBuf,
    timeout: Duration,
}

impl fmt::Debug for SourceValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceValidator")
            .field("media_dir", &self.media_dir)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SourceValidator {
    pub fn new(client: Arc<dyn HttpClient>, media_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            media_dir: media_dir.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &LivemuxConfig, client: Arc<dyn HttpClient>) -> Self {
        Self::new(client, config.media.directory.clone()).with_timeout(config.probe.timeout())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn validate(
        &self,
        raw: &str,
        kind: SourceKind,
    ) -> Result<SourceDescriptor, ValidationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ValidationError::Empty);
        }
        if !kind.is_remote() {
            return self.validate_file(raw);
        }
        let url = check_url_shape(raw)?;
        self.probe_liveness(&url).await?;
        info!(%kind, %url, "remote source accepted");
        Ok(SourceDescriptor::remote(kind, raw))
    }

    /// Files must resolve, symlinks included, to a regular file inside the media directory.
    fn validate_file(&self, raw: &str) -> Result<SourceDescriptor, ValidationError> {
        let candidate = self.media_dir.join(raw);
        let root = fs::canonicalize(&self.media_dir)
            .map_err(|_| ValidationError::FileNotFound(candidate.clone()))?;
        let path = fs::canonicalize(&candidate)
            .map_err(|_| ValidationError::FileNotFound(candidate.clone()))?;
        if !path.starts_with(&root) {
            warn!(path = %path.display(), media_dir = %root.display(), "file source outside media directory");
            return Err(ValidationError::OutsideMediaDir(candidate));
        }
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(SourceDescriptor::file(&path)),
            Ok(_) => Err(ValidationError::NotAFile(path)),
            Err(_) => Err(ValidationError::FileNotFound(path)),
        }
    }

    async fn probe_liveness(&self, url: &Url) -> Result<(), ValidationError> {
        let target = url.as_str();
        let head = self
            .client
            .probe(target, ProbeMethod::Head, self.timeout)
            .await
            .map_err(|err| fetch_rejection(target, err))?;
        if head.content_type_contains("video")
            || head.content_type_contains("application")
            || head.content_type_contains("octet-stream")
        {
            return Ok(());
        }

        debug!(
            url = %target,
            status = head.status,
            content_type = ?head.content_type,
            "HEAD inconclusive, retrying with GET"
        );
        let get = self
            .client
            .probe(target, ProbeMethod::Get, self.timeout)
            .await
            .map_err(|err| fetch_rejection(target, err))?;
        if get.content_type_contains("video") || get.content_type_contains("application") {
            return Ok(());
        }

        if has_video_extension(url) {
            return Ok(());
        }
        Err(ValidationError::NotVideo {
            url: target.to_string(),
        })
    }
}

/// Scheme, host and whitespace checks only; no network access.
pub fn check_url_shape(raw: &str) -> Result<Url, ValidationError> {
    if !(raw.starts_with("http://") || raw.starts_with("https://")) {
        return Err(ValidationError::Scheme);
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(ValidationError::MalformedUrl(
            "URL contains whitespace".into(),
        ));
    }
    let url = Url::parse(raw).map_err(|err| ValidationError::MalformedUrl(err.to_string()))?;
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(ValidationError::MalformedUrl("URL has no host".into())),
    }
}

fn has_video_extension(url: &Url) -> bool {
    let path = url.path().to_lowercase();
    VIDEO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

fn fetch_rejection(url: &str, error: FetchError) -> ValidationError {
    match error {
        FetchError::Timeout => ValidationError::Timeout {
            url: url.to_string(),
        },
        other => ValidationError::Unreachable {
            url: url.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Video files directly inside `dir`, sorted by name.
pub fn list_local_videos(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() {
                continue;
            }
            let matches = path
                .extension()
                .map(|ext| {
                    let ext = ext.to_string_lossy().to_lowercase();
                    LOCAL_VIDEO_EXTENSIONS.contains(&ext.as_str())
                })
                .unwrap_or(false);
            if matches {
                entries.push(path);
            }
        }
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Responder = fn(ProbeMethod) -> Result<ProbeResponse, FetchError>;

    struct ScriptedClient {
        respond: Responder,
        calls: Mutex<Vec<ProbeMethod>>,
    }

    impl ScriptedClient {
        fn validator(respond: Responder) -> (Arc<Self>, SourceValidator) {
            let client = Arc::new(Self {
                respond,
                calls: Mutex::new(Vec::new()),
            });
            let validator = SourceValidator::new(client.clone(), ".");
            (client, validator)
        }

        fn calls(&self) -> Vec<ProbeMethod> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn probe(
            &self,
            _url: &str,
            method: ProbeMethod,
            _timeout: Duration,
        ) -> Result<ProbeResponse, FetchError> {
            self.calls.lock().unwrap().push(method);
            (self.respond)(method)
        }

        async fn fetch_text(&self, _url: &str, _timeout: Duration) -> Result<String, FetchError> {
            Err(FetchError::Status(404))
        }
    }

    fn typed(content_type: &str) -> Result<ProbeResponse, FetchError> {
        Ok(ProbeResponse {
            status: 200,
            content_type: Some(content_type.to_string()),
        })
    }

    fn html_everywhere(_: ProbeMethod) -> Result<ProbeResponse, FetchError> {
        typed("text/html; charset=utf-8")
    }

    #[tokio::test]
    async fn get_fallback_accepts_application_content() {
        let (client, validator) = ScriptedClient::validator(|method| match method {
            ProbeMethod::Head => Ok(ProbeResponse {
                status: 405,
                content_type: None,
            }),
            ProbeMethod::Get => typed("application/vnd.apple.mpegurl"),
        });
        let source = validator
            .validate("https://cdn.example.com/live/stream", SourceKind::HlsPlaylist)
            .await
            .unwrap();
        assert_eq!(source.kind, SourceKind::HlsPlaylist);
        assert_eq!(client.calls(), vec![ProbeMethod::Head, ProbeMethod::Get]);
    }

    #[tokio::test]
    async fn known_extension_rescues_inconclusive_probes() {
        let (client, validator) = ScriptedClient::validator(html_everywhere);
        validator
            .validate("https://cdn.example.com/live/index.m3u8?token=abc", SourceKind::HlsPlaylist)
            .await
            .unwrap();
        assert_eq!(client.calls().len(), 2);
    }

    #[tokio::test]
    async fn inconclusive_probes_without_extension_are_not_video() {
        let (_, validator) = ScriptedClient::validator(html_everywhere);
        let err = validator
            .validate("https://cdn.example.com/watch?v=42", SourceKind::DirectUrl)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::NotVideo {
                url: "https://cdn.example.com/watch?v=42".into()
            }
        );
    }

    #[tokio::test]
    async fn head_timeout_rejects_without_get() {
        let (client, validator) = ScriptedClient::validator(|_| Err(FetchError::Timeout));
        let err = validator
            .validate("https://cdn.example.com/v.mp4", SourceKind::DirectUrl)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::Timeout { .. }));
        assert_eq!(client.calls(), vec![ProbeMethod::Head]);
    }

    #[tokio::test]
    async fn connect_failure_is_unreachable() {
        let (_, validator) =
            ScriptedClient::validator(|_| Err(FetchError::Connect("connection refused".into())));
        let err = validator
            .validate("https://cdn.example.com/v.mp4", SourceKind::DirectUrl)
            .await
            .unwrap_err();
        let ValidationError::Unreachable { reason, .. } = err else {
            panic!("expected unreachable, got {err:?}");
        };
        assert!(reason.contains("connection refused"));
    }

    #[tokio::test]
    async fn octet_stream_only_counts_on_head() {
        let (client, validator) = ScriptedClient::validator(|_| typed("binary/octet-stream"));
        validator
            .validate("https://cdn.example.com/blob", SourceKind::DirectUrl)
            .await
            .unwrap();
        assert_eq!(client.calls(), vec![ProbeMethod::Head]);

        let (_, validator) = ScriptedClient::validator(|method| match method {
            ProbeMethod::Head => typed("text/plain"),
            ProbeMethod::Get => typed("binary/octet-stream"),
        });
        let err = validator
            .validate("https://cdn.example.com/blob", SourceKind::DirectUrl)
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::NotVideo { .. }));
    }

    fn media_and_outside() -> (tempfile::TempDir, tempfile::TempDir, SourceValidator) {
        let media = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::create_dir(media.path().join("shows")).unwrap();
        std::fs::write(media.path().join("shows/intro.mp4"), b"x").unwrap();
        std::fs::write(outside.path().join("secret.mp4"), b"x").unwrap();
        let (_, validator) = ScriptedClient::validator(html_everywhere);
        let validator = SourceValidator {
            media_dir: media.path().to_path_buf(),
            ..validator
        };
        (media, outside, validator)
    }

    #[tokio::test]
    async fn files_resolve_inside_media_directory() {
        let (media, _outside, validator) = media_and_outside();
        let source = validator.validate("shows/intro.mp4", SourceKind::File).await.unwrap();
        assert_eq!(source.display_label, "intro.mp4");

        let absolute = media.path().join("shows/intro.mp4");
        validator
            .validate(&absolute.to_string_lossy(), SourceKind::File)
            .await
            .unwrap();

        assert!(matches!(
            validator.validate("shows/missing.mp4", SourceKind::File).await,
            Err(ValidationError::FileNotFound(_))
        ));
        assert!(matches!(
            validator.validate("shows", SourceKind::File).await,
            Err(ValidationError::NotAFile(_))
        ));
    }

    #[tokio::test]
    async fn files_outside_media_directory_are_rejected() {
        let (_media, outside, validator) = media_and_outside();
        let absolute = outside.path().join("secret.mp4");
        assert!(matches!(
            validator.validate(&absolute.to_string_lossy(), SourceKind::File).await,
            Err(ValidationError::OutsideMediaDir(_))
        ));

        let outside_name = outside.path().file_name().unwrap().to_string_lossy();
        let traversal = format!("../{outside_name}/secret.mp4");
        assert!(matches!(
            validator.validate(&traversal, SourceKind::File).await,
            Err(ValidationError::OutsideMediaDir(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_escaping_media_directory_are_rejected() {
        let (media, outside, validator) = media_and_outside();
        std::os::unix::fs::symlink(outside.path().join("secret.mp4"), media.path().join("link.mp4"))
            .unwrap();
        assert!(matches!(
            validator.validate("link.mp4", SourceKind::File).await,
            Err(ValidationError::OutsideMediaDir(_))
        ));
    }

    #[test]
    fn rejects_non_http_scheme() {
        let err = check_url_shape("ftp://x/a.mp4").unwrap_err();
        assert_eq!(err, ValidationError::Scheme);
        assert!(err.to_string().contains("http://"));
    }

    #[test]
    fn rejects_whitespace_and_missing_host() {
        assert!(matches!(
            check_url_shape("https://cdn.example.com/my video.mp4"),
            Err(ValidationError::MalformedUrl(_))
        ));
        assert!(matches!(
            check_url_shape("https://"),
            Err(ValidationError::MalformedUrl(_))
        ));
    }

    #[test]
    fn long_urls_are_truncated_for_display() {
        let url = format!("https://cdn.example.com/{}.mp4", "a".repeat(60));
        let descriptor = SourceDescriptor::remote(SourceKind::DirectUrl, &url);
        assert_eq!(descriptor.display_label.chars().count(), 53);
        assert!(descriptor.display_label.ends_with("..."));
        assert_eq!(descriptor.location, url);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [SourceKind::File, SourceKind::DirectUrl, SourceKind::HlsPlaylist] {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
        assert!("rtmp".parse::<SourceKind>().is_err());
    }

    #[test]
    fn lists_only_video_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("a.MKV"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("clip.mov")).unwrap();

        let videos = list_local_videos(dir.path()).unwrap();
        let names: Vec<_> = videos
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.MKV", "b.mp4"]);
    }
}
