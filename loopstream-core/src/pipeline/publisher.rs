use std::path::{Component, Path, PathBuf};

use hex::encode as hex_encode;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::time::sleep;
use tracing::info;
use walkdir::WalkDir;

use crate::config::{OutputSection, RedirectSection};

use super::assembler::artifact_directory;
use super::error::{PipelineError, PipelineResult};
use super::types::{PublishedArtifact, StreamArtifact};

pub struct Publisher {
    output: OutputSection,
    redirect: RedirectSection,
}

impl Publisher {
    pub fn new(output: OutputSection, redirect: RedirectSection) -> Self {
        Self { output, redirect }
    }

    pub async fn publish(&self, artifact: &StreamArtifact) -> PipelineResult<PublishedArtifact> {
        let (location, root, files) = match artifact {
            StreamArtifact::File {
                staged,
                destination,
            } => {
                self.replace_file(staged, destination).await?;
                (
                    destination.clone(),
                    artifact_directory(artifact),
                    vec![destination.clone()],
                )
            }
            StreamArtifact::Hls {
                root,
                directory,
                playlist,
            } => {
                fs::metadata(playlist)
                    .await
                    .map_err(|source| PipelineError::io(playlist, source))?;
                (playlist.clone(), root.clone(), list_files(directory)?)
            }
        };

        let sha256 = compute_sha256(&location).await?;
        let redirect_rule = if self.redirect.enabled {
            Some(self.write_redirect(&root, &location).await?)
        } else {
            None
        };
        info!(
            location = %location.display(),
            files = files.len(),
            sha256 = %sha256,
            "artifact published"
        );
        Ok(PublishedArtifact {
            location,
            files,
            sha256,
            redirect_rule,
        })
    }

    /// Swaps a fully written staged file into place. `rename` replaces an
    /// existing destination in one step, so the path always names either
    /// the previous or the new artifact.
    async fn replace_file(&self, staged: &Path, destination: &Path) -> PipelineResult<()> {
        fs::metadata(staged)
            .await
            .map_err(|source| PipelineError::io(staged, source))?;

        if fs::metadata(destination).await.is_ok() {
            let linger = self.output.replace_linger();
            if !linger.is_zero() {
                info!(path = %destination.display(), wait = ?linger, "waiting for readers of previous output");
                sleep(linger).await;
            }
        }
        fs::rename(staged, destination)
            .await
            .map_err(|source| PipelineError::io(destination, source))
    }

    pub fn redirect_rule(&self, relative_target: &Path) -> String {
        let target = relative_target
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "Redirect temp {} {}/{}\n",
            self.redirect.latest_path,
            self.redirect.public_prefix.trim_end_matches('/'),
            target
        )
    }

    async fn write_redirect(&self, root: &Path, location: &Path) -> PipelineResult<PathBuf> {
        let relative = location.strip_prefix(root).unwrap_or(location);
        let rule = self.redirect_rule(relative);
        let path = root.join(&self.redirect.file_name);
        let staged = super::assembler::staged_path(&path);
        fs::write(&staged, rule)
            .await
            .map_err(|source| PipelineError::io(&staged, source))?;
        fs::rename(&staged, &path)
            .await
            .map_err(|source| PipelineError::io(&path, source))?;
        info!(path = %path.display(), "redirect rule written");
        Ok(path)
    }
}

fn list_files(directory: &Path) -> PipelineResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(directory).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(directory).to_path_buf();
            PipelineError::io(path, std::io::Error::other(err.to_string()))
        })?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

pub async fn compute_sha256(path: &Path) -> PipelineResult<String> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|source| PipelineError::io(path, source))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|source| PipelineError::io(path, source))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}
