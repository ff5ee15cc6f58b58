mod commands;

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use livemux_core::source::FetchError;
use livemux_core::{
    list_local_videos, load_livemux_config, CommandBuilder, HttpClient, LivemuxConfig,
    PlaylistInspector, PlaylistSummary, QualityPreset, RegistryError, ReqwestClient,
    SourceDescriptor, SourceKind, SourceValidator, StreamConfig, ValidationError,
};
use serde::Serialize;
use thiserror::Error;

pub use commands::run::{RunArgs, SessionManifest};

pub type Result<T> = std::result::Result<T, AppError>;

/// Key placeholder for previews; the destination is always redacted on output.
const PREVIEW_KEY: &str = "preview";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] livemux_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("http client error: {0}")]
    Http(#[from] FetchError),
    #[error("environment variable {0} is not set")]
    MissingKey(String),
    #[error("playlist unavailable: {0}")]
    PlaylistUnavailable(String),
    #[error("no session could be started")]
    NothingStarted,
    #[error("{0} session(s) ended with an error")]
    SessionsFailed(usize),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live stream session control interface", long_about = None)]
pub struct Cli {
    /// Path to livemux.toml
    #[arg(long, default_value = "configs/livemux.toml")]
    pub config: PathBuf,
    /// Overrides media.directory
    #[arg(long)]
    pub media_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Checks that a source is usable without starting anything
    Validate(ValidateArgs),
    /// Summarizes a remote HLS playlist
    Inspect(InspectArgs),
    /// Prints the transcoder invocation for a source, key redacted
    Command(CommandArgs),
    /// Lists video files in the media directory
    Videos,
    /// Starts sessions and supervises them until interrupted
    Run(RunArgs),
    /// Generates shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// File path, video URL or playlist URL
    pub input: String,
    #[arg(long, default_value = "file")]
    pub kind: SourceKind,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    pub url: String,
}

#[derive(Args, Debug)]
pub struct CommandArgs {
    #[arg(long)]
    pub kind: SourceKind,
    #[arg(long)]
    pub source: String,
    #[command(flatten)]
    pub quality: QualityArgs,
}

/// Encoding knobs shared by `command` and `run`. Explicit values override the preset.
#[derive(Args, Debug, Clone, Default)]
pub struct QualityArgs {
    /// low | medium | high | ultra
    #[arg(long)]
    pub quality: Option<QualityPreset>,
    /// Scales output to 720x1280
    #[arg(long)]
    pub vertical: bool,
    /// Video bitrate in kbps
    #[arg(long)]
    pub video_bitrate: Option<u32>,
    /// Audio bitrate in kbps
    #[arg(long)]
    pub audio_bitrate: Option<u32>,
    /// Rate-control buffer in kb
    #[arg(long)]
    pub buffer_size: Option<u32>,
}

impl QualityArgs {
    pub fn stream_config(&self) -> StreamConfig {
        let mut config = self.quality.unwrap_or_default().stream_config(self.vertical);
        if let Some(kbps) = self.video_bitrate {
            config.video_bitrate_kbps = kbps;
        }
        if let Some(kbps) = self.audio_bitrate {
            config.audio_bitrate_kbps = kbps;
        }
        if let Some(kb) = self.buffer_size {
            config.buffer_kb = kb;
        }
        config
    }
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "livemuxctl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(context.dispatch(&cli.command, cli.format))
}

pub(crate) fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

pub(crate) trait DisplayFallback {
    fn display(&self) -> String;
}

pub(crate) struct AppContext {
    config: LivemuxConfig,
    client: Arc<dyn HttpClient>,
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_livemux_config(&cli.config)?;
        if let Some(dir) = &cli.media_dir {
            config.media.directory = dir.clone();
        }
        let client = ReqwestClient::new(&config.probe.user_agent)?;
        Ok(Self::with_client(config, Arc::new(client)))
    }

    pub(crate) fn with_client(config: LivemuxConfig, client: Arc<dyn HttpClient>) -> Self {
        Self { config, client }
    }

    pub(crate) fn config(&self) -> &LivemuxConfig {
        &self.config
    }

    pub(crate) fn client(&self) -> Arc<dyn HttpClient> {
        Arc::clone(&self.client)
    }

    fn validator(&self) -> SourceValidator {
        SourceValidator::from_config(&self.config, self.client())
    }

    async fn dispatch(&self, command: &Commands, format: OutputFormat) -> Result<()> {
        match command {
            Commands::Validate(args) => {
                let source = self.validator().validate(&args.input, args.kind).await?;
                render(&source, format)
            }
            Commands::Inspect(args) => {
                let report = self.inspect(&args.url).await?;
                render(&report, format)
            }
            Commands::Command(args) => {
                let preview = self.command_preview(args).await?;
                render(&preview, format)
            }
            Commands::Videos => {
                let videos = self.videos()?;
                render(&videos, format)
            }
            Commands::Run(args) => commands::run::execute(self, args, format).await,
            Commands::Completions { .. } => Ok(()),
        }
    }

    async fn inspect(&self, url: &str) -> Result<PlaylistReport> {
        let url = livemux_core::check_url_shape(url)?;
        let inspector = PlaylistInspector::new(self.client(), self.config.probe.timeout());
        let summary = inspector
            .inspect(url.as_str())
            .await
            .ok_or_else(|| AppError::PlaylistUnavailable(url.to_string()))?;
        Ok(PlaylistReport {
            url: url.to_string(),
            live: summary.is_live(),
            summary,
        })
    }

    async fn command_preview(&self, args: &CommandArgs) -> Result<CommandPreview> {
        let stream = args.quality.stream_config();
        stream.validate()?;
        let source = self.validator().validate(&args.source, args.kind).await?;
        let spec = CommandBuilder::from_config(&self.config).build(&source, &stream, PREVIEW_KEY);
        Ok(CommandPreview {
            program: spec.program.display().to_string(),
            args: spec.redacted_args(),
            loops_input: spec.loops_input(),
        })
    }

    fn videos(&self) -> Result<VideoList> {
        let directory = self.config.media.directory.clone();
        let mut files = Vec::new();
        for path in list_local_videos(&directory)? {
            let size_bytes = fs::metadata(&path)?.len();
            files.push(VideoEntry {
                name: path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default(),
                path,
                size_bytes,
            });
        }
        Ok(VideoList { directory, files })
    }
}

#[derive(Debug, Serialize)]
struct PlaylistReport {
    url: String,
    live: bool,
    summary: PlaylistSummary,
}

#[derive(Debug, Serialize)]
struct CommandPreview {
    program: String,
    args: Vec<String>,
    loops_input: bool,
}

#[derive(Debug, Serialize)]
struct VideoList {
    directory: PathBuf,
    files: Vec<VideoEntry>,
}

#[derive(Debug, Serialize)]
struct VideoEntry {
    name: String,
    path: PathBuf,
    size_bytes: u64,
}

impl DisplayFallback for SourceDescriptor {
    fn display(&self) -> String {
        format!("ok: {} source {}", self.kind, self.display_label)
    }
}

impl DisplayFallback for PlaylistReport {
    fn display(&self) -> String {
        format!("{}\n  {}", self.url, self.summary)
    }
}

impl DisplayFallback for CommandPreview {
    fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|arg| {
            if arg.contains(' ') {
                format!("'{arg}'")
            } else {
                arg.clone()
            }
        }));
        parts.join(" ")
    }
}

impl DisplayFallback for VideoList {
    fn display(&self) -> String {
        if self.files.is_empty() {
            return format!("no videos in {}", self.directory.display());
        }
        self.files
            .iter()
            .map(|entry| format!("{} ({} KiB)", entry.name, entry.size_bytes / 1024))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
