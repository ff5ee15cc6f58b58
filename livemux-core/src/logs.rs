use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::LazyLock;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_stream::{Stream, StreamExt};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};
use tracing::debug;

static FRAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)frame=\s*(\d+)").expect("frame pattern is valid"));
static BITRATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)bitrate=\s*([\d.]+\s*\w+/s)").expect("bitrate pattern is valid")
});

const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Info,
    Frame,
    Bitrate,
    Error,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Info => "info",
            LogCategory::Frame => "frame",
            LogCategory::Bitrate => "bitrate",
            LogCategory::Error => "error",
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub category: LogCategory,
    pub text: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.category,
            self.text
        )
    }
}

/// A transcoder output line that is worth keeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Frame(u64),
    Bitrate(String),
    Error(String),
}

impl LogEvent {
    pub fn category(&self) -> LogCategory {
        match self {
            LogEvent::Frame(_) => LogCategory::Frame,
            LogEvent::Bitrate(_) => LogCategory::Bitrate,
            LogEvent::Error(_) => LogCategory::Error,
        }
    }

    pub fn text(&self) -> String {
        match self {
            LogEvent::Frame(count) => format!("Frame: {count}"),
            LogEvent::Bitrate(value) => format!("Bitrate: {value}"),
            LogEvent::Error(excerpt) => excerpt.clone(),
        }
    }
}

/// Classifies one output line. Frame counters win over bitrate, bitrate over errors;
/// anything else is dropped.
pub fn classify(line: &str, excerpt_chars: usize) -> Option<LogEvent> {
    if let Some(count) = FRAME_PATTERN
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
    {
        return Some(LogEvent::Frame(count));
    }
    if let Some(value) = BITRATE_PATTERN.captures(line).and_then(|caps| caps.get(1)) {
        return Some(LogEvent::Bitrate(value.as_str().to_string()));
    }
    let lower = line.to_lowercase();
    if lower.contains("error") || lower.contains("failed") {
        return Some(LogEvent::Error(excerpt(line.trim(), excerpt_chars)));
    }
    None
}

fn excerpt(line: &str, max_chars: usize) -> String {
    line.chars().take(max_chars).collect()
}

/// Receiver for accepted log entries; implementations stamp and store them.
pub trait LogSink: Send + Sync + 'static {
    fn append(&self, category: LogCategory, text: String);
}

/// Bounded, append-only log with non-decreasing timestamps.
#[derive(Debug, Clone)]
pub struct SessionLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl SessionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn push(&mut self, category: LogCategory, text: impl Into<String>) {
        let now = Utc::now();
        let timestamp = match self.entries.back() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            timestamp,
            category,
            text: text.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn export(&self) -> String {
        self.entries
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Splits both output streams on `\n` or `\r` and interleaves lines as they arrive.
pub fn merge_output<O, E>(stdout: O, stderr: E) -> impl Stream<Item = io::Result<String>> + Send + Unpin
where
    O: AsyncRead + Send + Unpin + 'static,
    E: AsyncRead + Send + Unpin + 'static,
{
    line_stream(stdout).merge(line_stream(stderr))
}

fn line_stream<R>(reader: R) -> impl Stream<Item = io::Result<String>> + Send + Unpin
where
    R: AsyncRead + Send + Unpin + 'static,
{
    FramedRead::new(reader, OutputLineCodec::new()).filter_map(|chunk| match chunk {
        Ok(bytes) => {
            let line = String::from_utf8_lossy(&bytes).into_owned();
            (!line.trim().is_empty()).then_some(Ok(line))
        }
        Err(err) => Some(Err(err)),
    })
}

/// Line splitter that drops oversized lines and keeps decoding, so a single
/// runaway line never ends the stream.
#[derive(Debug)]
struct OutputLineCodec {
    inner: AnyDelimiterCodec,
    skipped: usize,
}

impl OutputLineCodec {
    fn new() -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                b"\r\n".to_vec(),
                b"\n".to_vec(),
                MAX_LINE_BYTES,
            ),
            skipped: 0,
        }
    }

    fn decode_with<F>(&mut self, src: &mut BytesMut, mut decode: F) -> io::Result<Option<Bytes>>
    where
        F: FnMut(
            &mut AnyDelimiterCodec,
            &mut BytesMut,
        ) -> Result<Option<Bytes>, AnyDelimiterCodecError>,
    {
        loop {
            match decode(&mut self.inner, src) {
                Ok(frame) => return Ok(frame),
                // The inner codec is now discarding up to the next delimiter.
                Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                    self.skipped += 1;
                    debug!(skipped = self.skipped, "oversized output line dropped");
                }
                Err(AnyDelimiterCodecError::Io(err)) => return Err(err),
            }
        }
    }
}

impl Decoder for OutputLineCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        self.decode_with(src, |inner, src| inner.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        self.decode_with(src, |inner, src| inner.decode_eof(src))
    }
}

/// Drains `lines` into `sink` until end-of-stream or the first read error.
/// Returns how many entries were appended.
pub async fn ingest<S>(mut lines: S, sink: &dyn LogSink, excerpt_chars: usize) -> usize
where
    S: Stream<Item = io::Result<String>> + Unpin,
{
    let mut appended = 0;
    while let Some(Ok(line)) = lines.next().await {
        if let Some(event) = classify(&line, excerpt_chars) {
            sink.append(event.category(), event.text());
            appended += 1;
        }
    }
    appended
}
