use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::error::ConfigError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("failed to create scratch workspace under {root}: {source}")]
    Workspace {
        root: PathBuf,
        source: std::io::Error,
    },
    #[error("no videos downloaded")]
    NoVideosDownloaded,
    #[error("no clips survived normalization")]
    NoClipsNormalized,
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: PathBuf,
        source: std::io::Error,
    },
    /// Filesystem failure while assembling or publishing the artifact.
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            source,
            path: path.into(),
        }
    }

    /// Process exit code reported by the command-line front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::Catalog(CatalogError::KeyNotFound { .. }) => 2,
            PipelineError::Catalog(_) => 3,
            PipelineError::NoVideosDownloaded | PipelineError::NoClipsNormalized => 4,
            PipelineError::CommandFailure { .. }
            | PipelineError::Launch { .. }
            | PipelineError::Io { .. } => 5,
            PipelineError::Workspace { .. } => 1,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
