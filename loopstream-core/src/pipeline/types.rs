use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{RunConfig, RUN_TIMESTAMP_FORMAT};

/// Read-only state shared by every stage of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: Arc<RunConfig>,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    /// `20240305T070809`, used for versioned output directories.
    pub fn run_stamp(&self) -> String {
        self.started_at.format(RUN_TIMESTAMP_FORMAT).to_string()
    }

    pub fn unix_stamp(&self) -> i64 {
        self.started_at.timestamp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Normalize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
    pub stage: Stage,
    pub subject: String,
    pub reason: String,
}

/// Result of processing one clip: either the value for the next stage or the
/// reason the clip was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome<T> {
    Ready(T),
    Skipped(SkippedItem),
}

impl<T> ItemOutcome<T> {
    pub fn skipped(stage: Stage, subject: impl Into<String>, reason: impl Into<String>) -> Self {
        ItemOutcome::Skipped(SkippedItem {
            stage,
            subject: subject.into(),
            reason: reason.into(),
        })
    }

    pub fn ready(self) -> Option<T> {
        match self {
            ItemOutcome::Ready(value) => Some(value),
            ItemOutcome::Skipped(_) => None,
        }
    }
}

/// Folds per-item outcomes into the surviving values, in order, and the
/// skip records.
pub fn partition_outcomes<T>(outcomes: Vec<ItemOutcome<T>>) -> (Vec<T>, Vec<SkippedItem>) {
    let mut ready = Vec::new();
    let mut skipped = Vec::new();
    for outcome in outcomes {
        match outcome {
            ItemOutcome::Ready(value) => ready.push(value),
            ItemOutcome::Skipped(item) => skipped.push(item),
        }
    }
    (ready, skipped)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedClip {
    /// Position of the source in retrieval order.
    pub index: usize,
    pub source_url: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedClip {
    pub index: usize,
    pub source_url: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamArtifact {
    /// Flat file written to `staged`, to be swapped into `destination`.
    File { staged: PathBuf, destination: PathBuf },
    /// Playlist plus segments written in place under `directory`.
    Hls {
        root: PathBuf,
        directory: PathBuf,
        playlist: PathBuf,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishedArtifact {
    pub location: PathBuf,
    pub files: Vec<PathBuf>,
    pub sha256: String,
    pub redirect_rule: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested: u32,
    pub urls_found: usize,
    pub catalog_requests: u32,
    pub downloaded: usize,
    pub normalized: usize,
    pub skipped: Vec<SkippedItem>,
    pub artifact: PublishedArtifact,
}
