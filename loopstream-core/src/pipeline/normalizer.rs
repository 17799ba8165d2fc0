use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::fs;
use tracing::{info, warn};

use crate::config::TranscodeSection;
use crate::runner::{path_arg, CommandExecutor, CommandRequest, CpuLimit};

use super::error::{PipelineError, PipelineResult};
use super::types::{partition_outcomes, DownloadedClip, ItemOutcome, NormalizedClip, SkippedItem, Stage};

/// Bumped whenever the per-clip transcoder arguments change shape.
pub const NORMALIZE_TEMPLATE_VERSION: u32 = 2;

const NORMALIZED_SUFFIX: &str = "_scaled.mp4";
const OVERLAY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct Normalizer {
    transcode: TranscodeSection,
    cpu_limit: Option<CpuLimit>,
    executor: Arc<dyn CommandExecutor>,
}

impl Normalizer {
    pub fn new(transcode: TranscodeSection, executor: Arc<dyn CommandExecutor>) -> Self {
        let cpu_limit = CpuLimit::from_transcode(&transcode);
        Self {
            transcode,
            cpu_limit,
            executor,
        }
    }

    /// Fit inside the target frame keeping aspect ratio, centre on black
    /// bars, force square pixels.
    pub fn filter(&self, overlay: Option<&str>) -> String {
        let w = self.transcode.width;
        let h = self.transcode.height;
        let factor = format!("min({w}/iw\\,{h}/ih)");
        let mut filter = format!(
            "scale=iw*{factor}:ih*{factor},pad={w}:{h}:({w}-iw*{factor})/2:({h}-ih*{factor})/2,setsar=1:1"
        );
        if let Some(text) = overlay {
            filter.push_str(&format!(
                ",drawtext=text={}:x=w-tw-10:y=h-th-10:fontsize=24:fontcolor=white:box=1:boxcolor=black@0.5",
                escape_drawtext(text)
            ));
        }
        filter
    }

    pub fn request(&self, source: &Path, destination: &Path, overlay: Option<&str>) -> CommandRequest {
        CommandRequest::new(&self.transcode.ffmpeg_path)
            .args(["-y", "-i"])
            .arg(path_arg(source))
            .args(["-loglevel", self.transcode.log_level.as_str()])
            .args(["-preset", self.transcode.preset.as_str()])
            .args(["-c:v", "libx264"])
            .arg("-r")
            .arg(self.transcode.frame_rate.to_string())
            .arg("-filter:v")
            .arg(self.filter(overlay))
            .arg("-threads")
            .arg(self.transcode.threads.to_string())
            .arg(path_arg(destination))
            .with_cpu_limit(self.cpu_limit.clone())
    }

    pub async fn normalize_all(
        &self,
        clips: Vec<DownloadedClip>,
    ) -> PipelineResult<(Vec<NormalizedClip>, Vec<SkippedItem>)> {
        info!(
            clips = clips.len(),
            width = self.transcode.width,
            height = self.transcode.height,
            "scaling clips"
        );
        let total = clips.len();
        let mut outcomes = Vec::with_capacity(total);
        for (position, clip) in clips.into_iter().enumerate() {
            outcomes.push(self.normalize(clip, position + 1, total).await);
        }
        let (normalized, skipped) = partition_outcomes(outcomes);
        if normalized.is_empty() {
            return Err(PipelineError::NoClipsNormalized);
        }
        info!(
            normalized = normalized.len(),
            failed = skipped.len(),
            "scaling finished"
        );
        Ok((normalized, skipped))
    }

    /// Transcodes one clip. The raw download is removed whatever the outcome.
    pub async fn normalize(
        &self,
        clip: DownloadedClip,
        position: usize,
        total: usize,
    ) -> ItemOutcome<NormalizedClip> {
        let destination = normalized_path(&clip.path);
        let overlay = self.transcode.overlay.then(|| {
            format!(
                "{position}/{total} {}",
                Utc::now().format(OVERLAY_TIMESTAMP_FORMAT)
            )
        });
        let request = self.request(&clip.path, &destination, overlay.as_deref());

        let result = match self.executor.run(&request).await {
            Ok(output) if output.success => {
                if fs::metadata(&destination).await.is_ok() {
                    Ok(())
                } else {
                    Err("transcoder exited cleanly but wrote no output".to_string())
                }
            }
            Ok(output) => Err(format!(
                "exit status {:?}: {}",
                output.status, output.stderr
            )),
            Err(err) => Err(format!("failed to launch transcoder: {err}")),
        };

        remove_quietly(&clip.path).await;

        match result {
            Ok(()) => ItemOutcome::Ready(NormalizedClip {
                index: clip.index,
                source_url: clip.source_url,
                path: destination,
            }),
            Err(reason) => {
                warn!(
                    source = %clip.path.display(),
                    destination = %destination.display(),
                    url = %clip.source_url,
                    reason = %reason,
                    "failed to scale clip, dropping it"
                );
                remove_quietly(&destination).await;
                ItemOutcome::skipped(Stage::Normalize, clip.source_url, reason)
            }
        }
    }
}

pub fn normalized_path(raw: &Path) -> PathBuf {
    let mut name = raw.as_os_str().to_os_string();
    name.push(NORMALIZED_SUFFIX);
    PathBuf::from(name)
}

/// Escapes literal drawtext text for use inside a `-filter:v` graph. Three
/// layers are peeled off by ffmpeg in turn: the filtergraph parser, the
/// filter option parser, then drawtext's own `%{...}` expansion.
pub fn escape_drawtext(text: &str) -> String {
    escape_filtergraph(&escape_option_value(&escape_with(text, &['\\', '%'])))
}

/// Option-level escaping for a `key=value:...` filter argument.
pub fn escape_option_value(value: &str) -> String {
    escape_with(value, &['\\', '\'', ':'])
}

/// Filtergraph-level escaping for a whole filter description.
pub fn escape_filtergraph(description: &str) -> String {
    escape_with(description, &['\\', '\'', '[', ']', ',', ';'])
}

fn escape_with(text: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if special.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove scratch file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<CommandRequest>>>;

    /// Writes the output file for every request except those whose input
    /// path contains `fail_marker`.
    struct FakeTranscoder {
        fail_marker: Option<String>,
        calls: Calls,
    }

    impl FakeTranscoder {
        fn build(fail_marker: Option<&str>) -> (Arc<dyn CommandExecutor>, Calls) {
            let calls: Calls = Arc::new(Mutex::new(Vec::new()));
            let executor: Arc<dyn CommandExecutor> = Arc::new(Self {
                fail_marker: fail_marker.map(str::to_string),
                calls: Arc::clone(&calls),
            });
            (executor, calls)
        }
    }

    #[async_trait]
    impl CommandExecutor for FakeTranscoder {
        async fn run(&self, request: &CommandRequest) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(request.clone());
            let input = request.value_of("-i").unwrap_or_default().to_string();
            if let Some(marker) = &self.fail_marker {
                if input.contains(marker.as_str()) {
                    return Ok(CommandOutput::failure(1, "Invalid data found"));
                }
            }
            let output = request.args.last().cloned().unwrap_or_default();
            std::fs::write(output, b"scaled")?;
            Ok(CommandOutput::success())
        }
    }

    fn clip(dir: &Path, name: &str, index: usize) -> DownloadedClip {
        let path = dir.join(name);
        std::fs::write(&path, b"raw").unwrap();
        DownloadedClip {
            index,
            source_url: format!("https://media.example/{name}.mp4"),
            path,
        }
    }

    #[test]
    fn filter_targets_exact_frame_size() {
        let (executor, _) = FakeTranscoder::build(None);
        let normalizer = Normalizer::new(TranscodeSection::default(), executor);
        assert_eq!(
            normalizer.filter(None),
            "scale=iw*min(1280/iw\\,720/ih):ih*min(1280/iw\\,720/ih),\
             pad=1280:720:(1280-iw*min(1280/iw\\,720/ih))/2:(720-ih*min(1280/iw\\,720/ih))/2,\
             setsar=1:1"
        );
    }

    #[test]
    fn overlay_is_appended_in_bottom_right_corner() {
        let (executor, _) = FakeTranscoder::build(None);
        let normalizer = Normalizer::new(TranscodeSection::default(), executor);
        let filter = normalizer.filter(Some("3/10 2024-03-05 07:08:09"));
        assert!(filter.ends_with(
            r",drawtext=text=3/10 2024-03-05 07\\:08\\:09:x=w-tw-10:y=h-th-10:fontsize=24:fontcolor=white:box=1:boxcolor=black@0.5"
        ));
    }

    #[test]
    fn request_pins_frame_rate_threads_and_cpu_limit() {
        let (executor, _) = FakeTranscoder::build(None);
        let section = TranscodeSection {
            cpu_limit: 40,
            threads: 2,
            ..TranscodeSection::default()
        };
        let normalizer = Normalizer::new(section, executor);
        let request = normalizer.request(Path::new("/w/raw"), Path::new("/w/raw_scaled.mp4"), None);
        assert_eq!(request.value_of("-r"), Some("25"));
        assert_eq!(request.value_of("-threads"), Some("2"));
        assert_eq!(request.value_of("-c:v"), Some("libx264"));
        assert_eq!(request.value_of("-i"), Some("/w/raw"));
        assert_eq!(request.args.last().map(String::as_str), Some("/w/raw_scaled.mp4"));
        assert_eq!(request.cpu_limit.as_ref().map(|limit| limit.percent), Some(40));
    }

    #[tokio::test]
    async fn failed_clip_is_dropped_and_raw_files_removed() {
        let dir = tempfile::tempdir().unwrap();
        let clips = vec![
            clip(dir.path(), "a", 0),
            clip(dir.path(), "broken", 1),
            clip(dir.path(), "c", 2),
        ];
        let raw_paths: Vec<PathBuf> = clips.iter().map(|c| c.path.clone()).collect();
        let (executor, calls) = FakeTranscoder::build(Some("broken"));
        let normalizer = Normalizer::new(TranscodeSection::default(), executor);

        let (normalized, skipped) = normalizer.normalize_all(clips).await.unwrap();
        let indices: Vec<usize> = normalized.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].stage, Stage::Normalize);
        assert!(skipped[0].reason.contains("Invalid data found"));
        assert_eq!(calls.lock().unwrap().len(), 3);
        for raw in raw_paths {
            assert!(!raw.exists(), "{} should be deleted", raw.display());
        }
        for clip in &normalized {
            assert!(clip.path.exists());
            assert!(clip.path.to_string_lossy().ends_with(NORMALIZED_SUFFIX));
        }
    }

    #[tokio::test]
    async fn overlay_counts_position_among_clips() {
        let dir = tempfile::tempdir().unwrap();
        let clips = vec![clip(dir.path(), "a", 4), clip(dir.path(), "b", 7)];
        let (executor, calls) = FakeTranscoder::build(None);
        let section = TranscodeSection {
            overlay: true,
            ..TranscodeSection::default()
        };
        let normalizer = Normalizer::new(section, executor);
        normalizer.normalize_all(clips).await.unwrap();

        let calls = calls.lock().unwrap();
        assert!(calls[0].value_of("-filter:v").unwrap().contains("text=1/2 "));
        assert!(calls[1].value_of("-filter:v").unwrap().contains("text=2/2 "));
    }

    #[tokio::test]
    async fn all_failures_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let clips = vec![clip(dir.path(), "broken-1", 0)];
        let (executor, _) = FakeTranscoder::build(Some("broken"));
        let normalizer = Normalizer::new(TranscodeSection::default(), executor);
        let err = normalizer.normalize_all(clips).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoClipsNormalized));
    }

    #[test]
    fn option_and_filtergraph_escaping_match_ffmpeg_documentation() {
        let text = "this is a 'string': may contain one, or more, special characters";
        let option = escape_option_value(text);
        assert_eq!(
            option,
            r"this is a \'string\'\: may contain one, or more, special characters"
        );
        assert_eq!(
            escape_filtergraph(&option),
            r"this is a \\\'string\\\'\\: may contain one\, or more\, special characters"
        );
    }

    #[test]
    fn drawtext_escaping_protects_colons_through_both_parsers() {
        assert_eq!(escape_drawtext("07:08:09"), r"07\\:08\\:09");
        assert_eq!(escape_drawtext("50%"), r"50\\\\%");
        assert_eq!(escape_drawtext("a,b"), r"a\,b");
    }
}
