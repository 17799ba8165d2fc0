use std::fs;
use std::path::{Path, PathBuf};

use tempfile::{Builder, TempDir};
use uuid::Uuid;

use super::error::{PipelineError, PipelineResult};

pub const WORKSPACE_PREFIX: &str = "loopstream_";

/// Private scratch directory owned by one run. Removed recursively when
/// closed or dropped.
#[derive(Debug)]
pub struct ScratchWorkspace {
    dir: TempDir,
}

impl ScratchWorkspace {
    pub fn create(root: Option<&Path>) -> PipelineResult<Self> {
        let mut builder = Builder::new();
        builder.prefix(WORKSPACE_PREFIX);
        let dir = match root {
            // canonical so paths stay valid after a child changes directory
            Some(root) => fs::create_dir_all(root)
                .and_then(|_| fs::canonicalize(root))
                .and_then(|root| builder.tempdir_in(root))
                .map_err(|source| PipelineError::Workspace {
                    root: root.to_path_buf(),
                    source,
                })?,
            None => builder.tempdir().map_err(|source| PipelineError::Workspace {
                root: std::env::temp_dir(),
                source,
            })?,
        };
        restrict_permissions(dir.path())?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Fresh random file name inside the workspace.
    pub fn unique_path(&self) -> PathBuf {
        self.path().join(Uuid::new_v4().simple().to_string())
    }

    pub fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> PipelineResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .map_err(|source| PipelineError::Workspace {
            root: path.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> PipelineResult<()> {
    Ok(())
}
