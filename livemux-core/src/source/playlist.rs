use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::probe::HttpClient;

const STREAM_VARIANT_TAG: &str = "#EXT-X-STREAM-INF";
const END_LIST_TAG: &str = "#EXT-X-ENDLIST";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaylistSummary {
    pub segment_count: usize,
    pub is_variant: bool,
    pub has_endlist: bool,
}

impl PlaylistSummary {
    pub fn parse(contents: &str) -> Self {
        let segment_count = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .count();
        Self {
            segment_count,
            is_variant: contents.contains(STREAM_VARIANT_TAG),
            has_endlist: contents.contains(END_LIST_TAG),
        }
    }

    /// A playlist without an end-of-list tag is still being appended to.
    pub fn is_live(&self) -> bool {
        !self.has_endlist
    }
}

impl fmt::Display for PlaylistSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} segments, variant: {}, {}",
            self.segment_count,
            if self.is_variant { "yes" } else { "no" },
            if self.is_live() { "live" } else { "vod" }
        )
    }
}

#[derive(Clone)]
pub struct PlaylistInspector {
    client: Arc<dyn HttpClient>,
    timeout: Duration,
}

impl fmt::Debug for PlaylistInspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaylistInspector")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PlaylistInspector {
    pub fn new(client: Arc<dyn HttpClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Advisory only: any fetch failure yields `None`.
    pub async fn inspect(&self, url: &str) -> Option<PlaylistSummary> {
        match self.client.fetch_text(url, self.timeout).await {
            Ok(contents) => Some(PlaylistSummary::parse(&contents)),
            Err(error) => {
                debug!(%url, %error, "playlist inspection skipped");
                None
            }
        }
    }
}
