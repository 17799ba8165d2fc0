pub mod catalog;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod runner;

pub use catalog::{CatalogClient, CatalogError, CatalogFetch, CatalogTransport, LoopRecord};
pub use config::{
    load_run_config, CatalogSection, DownloadSection, OutputMode, OutputSection, RedirectSection,
    RunConfig, TranscodeSection, WorkspaceSection,
};
pub use error::{ConfigError, Result};
pub use pipeline::{
    Pipeline, PipelineError, PipelineResult, PublishedArtifact, RunContext, RunReport,
    SkippedItem, Stage,
};
pub use runner::{CommandExecutor, CommandOutput, CommandRequest, CpuLimit, SystemCommandExecutor};
