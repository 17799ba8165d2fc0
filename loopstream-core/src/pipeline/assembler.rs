use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{info, warn};

use crate::config::{OutputMode, OutputSection, TranscodeSection};
use crate::runner::{path_arg, CommandExecutor, CommandRequest, CpuLimit};

use super::error::{PipelineError, PipelineResult};
use super::types::{NormalizedClip, RunContext, StreamArtifact};
use super::workspace::ScratchWorkspace;

/// Bumped whenever the concatenation arguments change shape.
pub const CONCAT_TEMPLATE_VERSION: u32 = 2;
pub const MANIFEST_NAME: &str = "concat.txt";

const STAGED_PREFIX: &str = ".tmp_";

/// One concat-demuxer line for `path`. Inside single quotes only the quote
/// itself is special; it is closed, escaped and reopened.
pub fn quote_concat_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("file '{}'", raw.replace('\'', "'\\''"))
}

pub fn concat_manifest(clips: &[NormalizedClip]) -> String {
    let mut manifest = String::from("ffconcat version 1.0\n");
    for clip in clips {
        manifest.push_str(&quote_concat_path(&clip.path));
        manifest.push('\n');
    }
    manifest
}

/// Temporary sibling a flat output is written to before being swapped in.
pub fn staged_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!("{STAGED_PREFIX}{name}"))
}

pub struct Assembler {
    transcode: TranscodeSection,
    output: OutputSection,
    cpu_limit: Option<CpuLimit>,
    executor: Arc<dyn CommandExecutor>,
}

impl Assembler {
    pub fn new(
        transcode: TranscodeSection,
        output: OutputSection,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let cpu_limit = CpuLimit::from_transcode(&transcode);
        Self {
            transcode,
            output,
            cpu_limit,
            executor,
        }
    }

    /// Where this run's artifact lands; derived from the run start time.
    pub fn plan(&self, context: &RunContext) -> PipelineResult<StreamArtifact> {
        match self.output.mode {
            OutputMode::File => {
                let destination = self.output.file_path(&context.started_at)?;
                Ok(StreamArtifact::File {
                    staged: staged_path(&destination),
                    destination,
                })
            }
            OutputMode::Hls => {
                let root = self.output.hls_root.clone();
                let directory = root.join(context.run_stamp());
                let playlist = directory.join(format!("{}.m3u8", self.output.stream_name));
                Ok(StreamArtifact::Hls {
                    root,
                    directory,
                    playlist,
                })
            }
        }
    }

    pub fn request(
        &self,
        manifest: &Path,
        artifact: &StreamArtifact,
        context: &RunContext,
    ) -> CommandRequest {
        let request = CommandRequest::new(&self.transcode.ffmpeg_path)
            .args(["-y", "-loglevel", self.transcode.log_level.as_str()])
            .args(["-safe", "0", "-f", "concat", "-i"])
            .arg(path_arg(manifest))
            .args(["-c", "copy"]);
        let request = match artifact {
            // staged name may lack a usable extension
            StreamArtifact::File { staged, .. } => request
                .args(["-f", "mp4"])
                .arg("-threads")
                .arg(self.transcode.threads.to_string())
                .arg(file_name_arg(staged)),
            StreamArtifact::Hls { playlist, .. } => request
                .args(["-f", "hls", "-hls_list_size", "0", "-hls_segment_filename"])
                .arg(format!("{}_%05d.ts", context.unix_stamp()))
                .arg("-threads")
                .arg(self.transcode.threads.to_string())
                .arg(file_name_arg(playlist)),
        };
        request
            .current_dir(artifact_directory(artifact))
            .with_cpu_limit(self.cpu_limit.clone())
    }

    pub async fn concatenate(
        &self,
        clips: &[NormalizedClip],
        workspace: &ScratchWorkspace,
        context: &RunContext,
    ) -> PipelineResult<StreamArtifact> {
        let artifact = self.plan(context)?;
        let directory = artifact_directory(&artifact);
        fs::create_dir_all(&directory)
            .await
            .map_err(|source| PipelineError::io(&directory, source))?;

        let manifest = workspace.path().join(MANIFEST_NAME);
        fs::write(&manifest, concat_manifest(clips))
            .await
            .map_err(|source| PipelineError::io(&manifest, source))?;

        let request = self.request(&manifest, &artifact, context);
        info!(
            clips = clips.len(),
            directory = %directory.display(),
            "concatenating scaled clips"
        );
        let output = self
            .executor
            .run(&request)
            .await
            .map_err(|source| PipelineError::Launch {
                program: request.argv().0,
                source,
            })?;
        if !output.success {
            if let StreamArtifact::File { staged, .. } = &artifact {
                if let Err(err) = fs::remove_file(staged).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %staged.display(), error = %err, "failed to remove partial output");
                    }
                }
            }
            return Err(PipelineError::CommandFailure {
                command: request.display(),
                status: output.status,
                stderr: output.stderr,
            });
        }
        Ok(artifact)
    }
}

pub fn artifact_directory(artifact: &StreamArtifact) -> PathBuf {
    match artifact {
        StreamArtifact::File { destination, .. } => match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        },
        StreamArtifact::Hls { directory, .. } => directory.clone(),
    }
}

fn file_name_arg(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path_arg(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::runner::CommandOutput;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    struct ScriptedExecutor {
        output: CommandOutput,
        calls: Arc<Mutex<Vec<CommandRequest>>>,
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn run(&self, request: &CommandRequest) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(request.clone());
            Ok(self.output.clone())
        }
    }

    fn context() -> RunContext {
        let started_at = DateTime::parse_from_rfc3339("2024-03-05T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);
        RunContext::new(RunConfig::default()).with_started_at(started_at)
    }

    fn clip(index: usize, path: &str) -> NormalizedClip {
        NormalizedClip {
            index,
            source_url: format!("https://media.example/{index}.mp4"),
            path: PathBuf::from(path),
        }
    }

    #[test]
    fn quoting_handles_spaces_and_quotes() {
        assert_eq!(
            quote_concat_path(Path::new("/tmp/my clips/a.mp4")),
            "file '/tmp/my clips/a.mp4'"
        );
        assert_eq!(
            quote_concat_path(Path::new("/tmp/it's/b.mp4")),
            "file '/tmp/it'\\''s/b.mp4'"
        );
        assert_eq!(
            quote_concat_path(Path::new("/tmp/back\\slash \"dq\".mp4")),
            "file '/tmp/back\\slash \"dq\".mp4'"
        );
    }

    #[test]
    fn manifest_lists_clips_in_order() {
        let manifest = concat_manifest(&[clip(0, "/w/a"), clip(1, "/w/b"), clip(2, "/w/c")]);
        assert_eq!(
            manifest,
            "ffconcat version 1.0\nfile '/w/a'\nfile '/w/b'\nfile '/w/c'\n"
        );
    }

    #[test]
    fn hls_request_uses_timestamped_segments_and_directory() {
        let output = OutputSection {
            mode: OutputMode::Hls,
            hls_root: PathBuf::from("/srv/loops"),
            ..OutputSection::default()
        };
        let calls = Arc::new(Mutex::new(Vec::new()));
        let assembler = Assembler::new(
            TranscodeSection::default(),
            output,
            Arc::new(ScriptedExecutor {
                output: CommandOutput::success(),
                calls,
            }),
        );
        let context = context();
        let artifact = assembler.plan(&context).unwrap();
        assert_eq!(
            artifact,
            StreamArtifact::Hls {
                root: PathBuf::from("/srv/loops"),
                directory: PathBuf::from("/srv/loops/20240305T070809"),
                playlist: PathBuf::from("/srv/loops/20240305T070809/loops.m3u8"),
            }
        );
        let request = assembler.request(Path::new("/w/concat.txt"), &artifact, &context);
        assert_eq!(request.value_of("-c"), Some("copy"));
        assert_eq!(request.value_of("-i"), Some("/w/concat.txt"));
        assert_eq!(
            request.value_of("-hls_segment_filename"),
            Some(format!("{}_%05d.ts", context.unix_stamp()).as_str())
        );
        assert_eq!(request.args.last().map(String::as_str), Some("loops.m3u8"));
        assert_eq!(
            request.current_dir,
            Some(PathBuf::from("/srv/loops/20240305T070809"))
        );
    }

    #[test]
    fn flat_request_names_the_muxer_for_extensionless_destinations() {
        let output = OutputSection {
            path: Some(PathBuf::from("/srv/out/loops")),
            ..OutputSection::default()
        };
        let assembler = Assembler::new(
            TranscodeSection::default(),
            output,
            Arc::new(ScriptedExecutor {
                output: CommandOutput::success(),
                calls: Arc::new(Mutex::new(Vec::new())),
            }),
        );
        let context = context();
        let artifact = assembler.plan(&context).unwrap();
        let request = assembler.request(Path::new("/w/concat.txt"), &artifact, &context);

        let muxers: Vec<&str> = request
            .args
            .windows(2)
            .filter(|pair| pair[0] == "-f")
            .map(|pair| pair[1].as_str())
            .collect();
        assert_eq!(muxers, vec!["concat", "mp4"]);
        assert_eq!(request.args.last().map(String::as_str), Some(".tmp_loops"));
    }

    #[tokio::test]
    async fn failed_concatenation_is_fatal_and_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("out").join("loops.mp4");
        let output = OutputSection {
            path: Some(destination.clone()),
            ..OutputSection::default()
        };
        let calls = Arc::new(Mutex::new(Vec::new()));
        let assembler = Assembler::new(
            TranscodeSection::default(),
            output,
            Arc::new(ScriptedExecutor {
                output: CommandOutput::failure(1, "Impossible to open"),
                calls: Arc::clone(&calls),
            }),
        );
        let workspace = ScratchWorkspace::create(None).unwrap();
        std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
        std::fs::write(staged_path(&destination), b"partial").unwrap();

        let err = assembler
            .concatenate(&[clip(0, "/w/a")], &workspace, &context())
            .await
            .unwrap_err();
        match err {
            PipelineError::CommandFailure { stderr, status, .. } => {
                assert_eq!(status, Some(1));
                assert_eq!(stderr, "Impossible to open");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!staged_path(&destination).exists());
        assert!(workspace.path().join(MANIFEST_NAME).exists());

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].current_dir.as_deref(), destination.parent());
        assert_eq!(calls[0].args.last().map(String::as_str), Some(".tmp_loops.mp4"));
    }

    #[test]
    fn staged_path_is_hidden_sibling() {
        assert_eq!(
            staged_path(Path::new("/srv/out/Loops.mp4")),
            PathBuf::from("/srv/out/.tmp_Loops.mp4")
        );
    }
}
