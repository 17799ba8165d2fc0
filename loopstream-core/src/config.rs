use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub const MIN_CLIP_COUNT: u32 = 1;
pub const MAX_CLIP_COUNT: u32 = 1000;
/// Largest page the catalog accepts per request.
pub const MAX_BATCH_SIZE: u32 = 100;

pub const DEFAULT_ENDPOINT: &str = "https://api.giphy.com/v1";
pub const DEFAULT_ROUTE: &str = "gifs/trending";
pub const DEFAULT_STREAM_NAME: &str = "loops";
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RunConfig {
    pub catalog: CatalogSection,
    pub download: DownloadSection,
    pub transcode: TranscodeSection,
    pub output: OutputSection,
    pub redirect: RedirectSection,
    pub workspace: WorkspaceSection,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        let count = self.catalog.count;
        if !(MIN_CLIP_COUNT..=MAX_CLIP_COUNT).contains(&count) {
            return Err(ConfigError::invalid(
                "catalog.count",
                format!("{count} is outside {MIN_CLIP_COUNT}..={MAX_CLIP_COUNT}"),
            ));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.catalog.batch_size) {
            return Err(ConfigError::invalid(
                "catalog.batch_size",
                format!("{} is outside 1..={MAX_BATCH_SIZE}", self.catalog.batch_size),
            ));
        }
        if self.catalog.max_requests == 0 {
            return Err(ConfigError::invalid(
                "catalog.max_requests",
                "must be greater than zero",
            ));
        }
        if self.catalog.endpoint.trim().is_empty() {
            return Err(ConfigError::invalid("catalog.endpoint", "must not be empty"));
        }
        if self.download.connect_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "download.connect_timeout_seconds",
                "must be greater than zero",
            ));
        }
        if self.transcode.width == 0 || self.transcode.height == 0 {
            return Err(ConfigError::invalid(
                "transcode.width/height",
                "target resolution must be non-zero",
            ));
        }
        if self.transcode.frame_rate == 0 {
            return Err(ConfigError::invalid(
                "transcode.frame_rate",
                "must be greater than zero",
            ));
        }
        if self.output.stream_name.trim().is_empty() {
            return Err(ConfigError::invalid("output.stream_name", "must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogSection {
    pub endpoint: String,
    pub route: String,
    pub api_key: Option<String>,
    /// Public page scraped for an embedded key when `api_key` is unset.
    pub key_page_url: Option<String>,
    pub count: u32,
    pub exclude_tags: Vec<String>,
    pub batch_size: u32,
    pub max_requests: u32,
    pub max_retries: u32,
    pub backoff_unit_ms: u64,
    pub request_timeout_seconds: u64,
}

impl CatalogSection {
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for CatalogSection {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            route: DEFAULT_ROUTE.to_string(),
            api_key: None,
            key_page_url: None,
            count: 100,
            exclude_tags: Vec::new(),
            batch_size: MAX_BATCH_SIZE,
            max_requests: 10,
            max_retries: 10,
            backoff_unit_ms: 1000,
            request_timeout_seconds: 30,
        }
    }
}

/// Clip transfers. Kept apart from the catalog client so a slow but live
/// download is not cut off by the page request timeout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadSection {
    pub connect_timeout_seconds: u64,
    /// Longest wait for the next body chunk; 0 disables the check.
    pub stall_timeout_seconds: u64,
    /// Cap on a whole transfer; 0 means none.
    pub total_timeout_seconds: u64,
}

impl DownloadSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        (self.stall_timeout_seconds > 0).then(|| Duration::from_secs(self.stall_timeout_seconds))
    }

    pub fn total_timeout(&self) -> Option<Duration> {
        (self.total_timeout_seconds > 0).then(|| Duration::from_secs(self.total_timeout_seconds))
    }
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 10,
            stall_timeout_seconds: 30,
            total_timeout_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TranscodeSection {
    pub ffmpeg_path: PathBuf,
    pub cpulimit_path: PathBuf,
    /// Percentage handed to the cpu limiter; 0 disables the wrapper.
    pub cpu_limit: u32,
    /// 0 lets the transcoder pick.
    pub threads: u32,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub preset: String,
    pub log_level: String,
    pub overlay: bool,
}

impl Default for TranscodeSection {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            cpulimit_path: PathBuf::from("cpulimit"),
            cpu_limit: 0,
            threads: 0,
            width: 1280,
            height: 720,
            frame_rate: 25,
            preset: "superfast".to_string(),
            log_level: "error".to_string(),
            overlay: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    File,
    Hls,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputSection {
    pub mode: OutputMode,
    /// Flat output file; defaults to `Loops_<timestamp>.mp4` in the working directory.
    pub path: Option<PathBuf>,
    pub hls_root: PathBuf,
    pub stream_name: String,
    /// Pause before deleting a previous flat file so readers can finish.
    pub replace_linger_seconds: u64,
}

impl OutputSection {
    pub fn file_path(&self, started_at: &DateTime<Utc>) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let cwd = std::env::current_dir().map_err(|source| ConfigError::Io {
            source,
            path: PathBuf::from("."),
        })?;
        Ok(cwd.join(format!(
            "Loops_{}.mp4",
            started_at.format(RUN_TIMESTAMP_FORMAT)
        )))
    }

    pub fn replace_linger(&self) -> Duration {
        Duration::from_secs(self.replace_linger_seconds)
    }
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            mode: OutputMode::File,
            path: None,
            hls_root: PathBuf::from("."),
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            replace_linger_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedirectSection {
    pub enabled: bool,
    pub file_name: String,
    pub latest_path: String,
    /// URL prefix under which the destination root is served.
    pub public_prefix: String,
}

impl Default for RedirectSection {
    fn default() -> Self {
        Self {
            enabled: false,
            file_name: ".htaccess".to_string(),
            latest_path: "/latest.m3u8".to_string(),
            public_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkspaceSection {
    pub root: Option<PathBuf>,
}

pub fn load_run_config<P: AsRef<Path>>(path: P) -> Result<RunConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
