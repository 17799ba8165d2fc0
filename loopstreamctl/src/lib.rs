use std::fmt::Write as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use loopstream_core::catalog::CatalogFetch;
use loopstream_core::{
    load_run_config, ConfigError, OutputMode, Pipeline, PipelineError, RunConfig, RunReport, Stage,
};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

pub const DEFAULT_LOG_FILTER: &str = "loopstream_core=info,loopstreamctl=info";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl AppError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 2,
            AppError::Pipeline(err) => err.exit_code(),
            AppError::Io(_) | AppError::Serialize(_) => 1,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Builds one continuous video stream from a batch of trending looping clips",
    long_about = None
)]
pub struct Cli {
    /// Path to a loopstream.toml; built-in defaults apply without one
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Catalog API key
    #[arg(long, global = true, env = "LOOPSTREAM_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
    /// Public page to scrape a key from when none is configured
    #[arg(long, global = true)]
    pub key_page_url: Option<String>,
    /// Number of clips to request
    #[arg(short = 'n', long, global = true)]
    pub count: Option<u32>,
    /// Drop clips carrying this tag (repeatable)
    #[arg(long = "exclude-tag", value_name = "TAG", global = true)]
    pub exclude_tags: Vec<String>,
    /// Flat MP4 destination
    #[arg(short, long, global = true, conflicts_with = "hls_root")]
    pub output: Option<PathBuf>,
    /// Publish an HLS bundle under a timestamped directory of this root
    #[arg(long, global = true)]
    pub hls_root: Option<PathBuf>,
    /// Playlist base name for HLS output
    #[arg(long, global = true)]
    pub stream_name: Option<String>,
    #[arg(long, global = true)]
    pub ffmpeg_path: Option<PathBuf>,
    #[arg(long, global = true)]
    pub cpulimit_path: Option<PathBuf>,
    /// CPU ceiling in percent for every transcoder invocation (0 disables)
    #[arg(long, global = true)]
    pub cpu_limit: Option<u32>,
    /// Transcoder thread count (0 lets ffmpeg decide)
    #[arg(long, global = true)]
    pub threads: Option<u32>,
    /// Parent directory for the scratch workspace
    #[arg(long, global = true)]
    pub temp_dir: Option<PathBuf>,
    /// Burn each clip's position into its lower-right corner
    #[arg(long, global = true, default_value_t = false)]
    pub overlay: bool,
    /// Write a redirect rule pointing at the newest output
    #[arg(long, global = true, default_value_t = false)]
    pub redirect: bool,
    /// Enable debug logging when RUST_LOG is unset
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,
    /// Report format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Fetch, normalize, concatenate and publish one stream
    Build,
    /// Only query the catalog and list the clip urls that would be used
    Urls,
}

/// Installs the fmt subscriber on stderr so stdout stays parseable.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "loopstream_core=debug,loopstreamctl=debug"
    } else {
        DEFAULT_LOG_FILTER
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// File (or defaults) first, then command-line overrides.
pub fn build_config(cli: &Cli) -> Result<RunConfig> {
    let mut config = match &cli.config {
        Some(path) => load_run_config(path)?,
        None => RunConfig::default(),
    };

    if let Some(key) = &cli.api_key {
        config.catalog.api_key = Some(key.clone());
    }
    if let Some(url) = &cli.key_page_url {
        config.catalog.key_page_url = Some(url.clone());
    }
    if let Some(count) = cli.count {
        config.catalog.count = count;
    }
    config
        .catalog
        .exclude_tags
        .extend(cli.exclude_tags.iter().cloned());

    if let Some(path) = &cli.output {
        config.output.mode = OutputMode::File;
        config.output.path = Some(path.clone());
    }
    if let Some(root) = &cli.hls_root {
        config.output.mode = OutputMode::Hls;
        config.output.hls_root = root.clone();
    }
    if let Some(name) = &cli.stream_name {
        config.output.stream_name = name.clone();
    }

    if let Some(path) = &cli.ffmpeg_path {
        config.transcode.ffmpeg_path = path.clone();
    }
    if let Some(path) = &cli.cpulimit_path {
        config.transcode.cpulimit_path = path.clone();
    }
    if let Some(limit) = cli.cpu_limit {
        config.transcode.cpu_limit = limit;
    }
    if let Some(threads) = cli.threads {
        config.transcode.threads = threads;
    }
    if cli.overlay {
        config.transcode.overlay = true;
    }
    if cli.redirect {
        config.redirect.enabled = true;
    }
    if let Some(root) = &cli.temp_dir {
        config.workspace.root = Some(root.clone());
    }

    config.validate()?;
    Ok(config)
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = build_config(&cli)?;
    debug!(command = ?cli.command, count = config.catalog.count, "configuration resolved");
    let pipeline = Pipeline::new(config)?;

    match cli.command {
        Commands::Build => {
            let report = pipeline.run().await?;
            render(&report, cli.format)?;
        }
        Commands::Urls => {
            let fetch = pipeline.fetch_loop_urls().await?;
            render(&fetch, cli.format)?;
        }
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
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

trait DisplayFallback {
    fn display(&self) -> String;
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut out = String::new();
        let elapsed = self.finished_at - self.started_at;
        let _ = writeln!(out, "Output: {}", self.artifact.location.display());
        let _ = writeln!(out, "SHA-256: {}", self.artifact.sha256);
        if self.artifact.files.len() > 1 {
            let _ = writeln!(out, "Files: {}", self.artifact.files.len());
        }
        if let Some(rule) = &self.artifact.redirect_rule {
            let _ = writeln!(out, "Redirect: {}", rule.display());
        }
        let _ = writeln!(
            out,
            "Clips: requested {} | found {} in {} request(s) | downloaded {} | normalized {}",
            self.requested, self.urls_found, self.catalog_requests, self.downloaded, self.normalized
        );
        if !self.skipped.is_empty() {
            let _ = writeln!(out, "Skipped:");
            for item in &self.skipped {
                let stage = match item.stage {
                    Stage::Download => "download",
                    Stage::Normalize => "normalize",
                };
                let _ = writeln!(out, "  - [{stage}] {}: {}", item.subject, item.reason);
            }
        }
        let _ = write!(out, "Elapsed: {}s", elapsed.num_seconds());
        out
    }
}

impl DisplayFallback for CatalogFetch {
    fn display(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            let _ = writeln!(out, "{}", record.source_url);
        }
        let _ = write!(
            out,
            "{} url(s) in {} request(s); excluded {}, unusable {}, duplicates {}",
            self.records.len(),
            self.requests,
            self.excluded,
            self.unusable,
            self.duplicates
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["loopstreamctl"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_apply_without_a_config_file() {
        let cli = parse(&["--api-key", "abc123", "build"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.catalog.count, 100);
        assert_eq!(config.catalog.api_key.as_deref(), Some("abc123"));
        assert_eq!(config.output.mode, OutputMode::File);
        assert_eq!(cli.command, Commands::Build);
        assert_eq!(cli.format, OutputFormat::Text);
    }

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loopstream.toml");
        fs::write(
            &path,
            r#"
[catalog]
count = 40
exclude_tags = ["nsfw"]

[transcode]
cpu_limit = 50
threads = 2
"#,
        )
        .unwrap();

        let cli = parse(&[
            "--config",
            path.to_str().unwrap(),
            "--count",
            "7",
            "--exclude-tag",
            "cats",
            "--hls-root",
            "/srv/www",
            "--threads",
            "4",
            "--overlay",
            "--redirect",
            "urls",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.catalog.count, 7);
        assert_eq!(config.catalog.exclude_tags, vec!["nsfw", "cats"]);
        assert_eq!(config.transcode.cpu_limit, 50);
        assert_eq!(config.transcode.threads, 4);
        assert!(config.transcode.overlay);
        assert!(config.redirect.enabled);
        assert_eq!(config.output.mode, OutputMode::Hls);
        assert_eq!(config.output.hls_root, PathBuf::from("/srv/www"));
        assert_eq!(cli.command, Commands::Urls);
    }

    #[test]
    fn out_of_range_count_maps_to_config_exit_code() {
        let cli = parse(&["--count", "0", "build"]);
        let err = build_config(&cli).unwrap_err();
        assert!(matches!(err, AppError::Config(ConfigError::Invalid { .. })));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn missing_config_file_is_reported() {
        let cli = parse(&["--config", "/nonexistent/loopstream.toml", "build"]);
        let err = build_config(&cli).unwrap_err();
        assert!(matches!(err, AppError::Config(ConfigError::Io { .. })));
    }

    #[test]
    fn flat_output_and_hls_root_conflict() {
        let result = Cli::try_parse_from([
            "loopstreamctl",
            "--output",
            "a.mp4",
            "--hls-root",
            "/srv",
            "build",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn pipeline_errors_keep_their_exit_codes() {
        let err = AppError::from(PipelineError::NoVideosDownloaded);
        assert_eq!(err.exit_code(), 4);
        assert_eq!(err.to_string(), "no videos downloaded");
    }
}
