use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{DestinationSection, LivemuxConfig, TranscoderSection};
use crate::source::{SourceDescriptor, SourceKind, ValidationError};

pub const DEFAULT_GOP_SIZE: u32 = 60;
pub const VERTICAL_SCALE: &str = "scale=720:1280";
pub const LOOP_FOREVER: [&str; 2] = ["-stream_loop", "-1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub is_vertical: bool,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub buffer_kb: u32,
    #[serde(default = "default_gop_size")]
    pub gop_size: u32,
}

fn default_gop_size() -> u32 {
    DEFAULT_GOP_SIZE
}

impl Default for StreamConfig {
    fn default() -> Self {
        QualityPreset::default().stream_config(false)
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.video_bitrate_kbps == 0 {
            return Err(ValidationError::Config(
                "video bitrate must be positive".into(),
            ));
        }
        if self.audio_bitrate_kbps == 0 {
            return Err(ValidationError::Config(
                "audio bitrate must be positive".into(),
            ));
        }
        if self.buffer_kb == 0 {
            return Err(ValidationError::Config("buffer size must be positive".into()));
        }
        if self.gop_size == 0 {
            return Err(ValidationError::Config("gop size must be positive".into()));
        }
        if self.buffer_kb < self.video_bitrate_kbps {
            warn!(
                buffer_kb = self.buffer_kb,
                video_bitrate_kbps = self.video_bitrate_kbps,
                "buffer smaller than one second of video"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    #[default]
    Medium,
    High,
    Ultra,
}

impl QualityPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityPreset::Low => "low",
            QualityPreset::Medium => "medium",
            QualityPreset::High => "high",
            QualityPreset::Ultra => "ultra",
        }
    }

    pub fn stream_config(&self, is_vertical: bool) -> StreamConfig {
        let (video_bitrate_kbps, audio_bitrate_kbps, buffer_kb) = match self {
            QualityPreset::Low => (1_500, 96, 3_000),
            QualityPreset::Medium => (2_500, 128, 5_000),
            QualityPreset::High => (4_000, 192, 8_000),
            QualityPreset::Ultra => (6_000, 256, 12_000),
        };
        StreamConfig {
            is_vertical,
            video_bitrate_kbps,
            audio_bitrate_kbps,
            buffer_kb,
            gop_size: DEFAULT_GOP_SIZE,
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QualityPreset {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "ultra" => Ok(Self::Ultra),
            other => Err(ValidationError::Config(format!(
                "unknown quality preset: {other}"
            ))),
        }
    }
}

/// RTMPS ingest URL. The stream key never appears in `Debug` or `Display` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Destination {
    base: String,
    key: String,
}

impl Destination {
    pub fn new(section: &DestinationSection, key: &str) -> Self {
        let endpoint = section.endpoint.trim_end_matches('/');
        let path = section.path.trim_matches('/');
        let base = if path.is_empty() {
            format!("rtmps://{endpoint}")
        } else {
            format!("rtmps://{endpoint}/{path}")
        };
        Self {
            base,
            key: key.trim().to_string(),
        }
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.base, self.key)
    }

    pub fn redacted(&self) -> String {
        format!("{}/****", self.base)
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Destination").field(&self.redacted()).finish()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

#[derive(Clone)]
pub struct InvocationSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub destination: Destination,
}

impl InvocationSpec {
    /// Argument list with the destination key masked, safe for logs.
    pub fn redacted_args(&self) -> Vec<String> {
        let secret = self.destination.url();
        self.args
            .iter()
            .map(|arg| {
                if *arg == secret {
                    self.destination.redacted()
                } else {
                    arg.clone()
                }
            })
            .collect()
    }

    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|arg| arg == needle)
    }

    pub fn loops_input(&self) -> bool {
        self.args
            .windows(2)
            .any(|pair| pair[0] == LOOP_FOREVER[0] && pair[1] == LOOP_FOREVER[1])
    }
}

impl fmt::Debug for InvocationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationSpec")
            .field("program", &self.program)
            .field("args", &self.redacted_args())
            .field("destination", &self.destination)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CommandBuilder {
    transcoder: TranscoderSection,
    destination: DestinationSection,
}

impl CommandBuilder {
    pub fn new(transcoder: TranscoderSection, destination: DestinationSection) -> Self {
        Self {
            transcoder,
            destination,
        }
    }

    pub fn from_config(config: &LivemuxConfig) -> Self {
        Self::new(config.transcoder.clone(), config.destination.clone())
    }

    pub fn build(
        &self,
        source: &SourceDescriptor,
        config: &StreamConfig,
        destination_key: &str,
    ) -> InvocationSpec {
        let destination = Destination::new(&self.destination, destination_key);
        let mut args = self.base_args();
        args.push("-re".to_string());
        if source.kind == SourceKind::File {
            args.extend(LOOP_FOREVER.iter().map(|arg| arg.to_string()));
        }
        args.push("-i".to_string());
        args.push(source.location.clone());

        let video_rate = format!("{}k", config.video_bitrate_kbps);
        args.extend([
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.transcoder.preset.clone(),
            "-b:v".to_string(),
            video_rate.clone(),
            "-maxrate".to_string(),
            video_rate,
            "-bufsize".to_string(),
            format!("{}k", config.buffer_kb),
            "-g".to_string(),
            config.gop_size.to_string(),
            "-keyint_min".to_string(),
            config.gop_size.to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            format!("{}k", config.audio_bitrate_kbps),
        ]);
        if config.is_vertical {
            args.push("-vf".to_string());
            args.push(VERTICAL_SCALE.to_string());
        }
        args.push("-f".to_string());
        args.push("flv".to_string());
        args.push(destination.url());

        InvocationSpec {
            program: self.transcoder.binary.clone(),
            args,
            destination,
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            self.transcoder.log_level.clone(),
        ];
        if !self.transcoder.stats_period.is_empty() {
            args.push("-stats_period".to_string());
            args.push(self.transcoder.stats_period.clone());
        }
        args
    }
}
