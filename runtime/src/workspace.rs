use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use zip::result::ZipError;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("archive is not a readable zip file: {0}")]
    InvalidArchive(#[from] ZipError),
    #[error("archive entry '{name}' escapes the workspace")]
    UnsafeEntry { name: String },
    #[error("workspace io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("workspace task failed: {0}")]
    Task(String),
}

impl WorkspaceError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkspaceError::InvalidArchive(_) => "WORKSPACE_INVALID_ARCHIVE",
            WorkspaceError::UnsafeEntry { .. } => "WORKSPACE_UNSAFE_ENTRY",
            WorkspaceError::Io { .. } => "WORKSPACE_IO",
            WorkspaceError::Task(_) => "WORKSPACE_TASK",
        }
    }
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Owns the per-run directories under a common root.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Deterministic location of a run's workspace, known before extraction.
    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Creates the workspace and unpacks the archive into it. A failure may
    /// leave partial files behind; the caller still owns removal.
    pub async fn extract(&self, run_id: &str, archive: Vec<u8>) -> Result<PathBuf, WorkspaceError> {
        let target = self.path_for(run_id);
        let dest = target.clone();
        let entries = tokio::task::spawn_blocking(move || unpack(&dest, archive))
            .await
            .map_err(|err| WorkspaceError::Task(err.to_string()))??;
        info!(run = %run_id, path = %target.display(), entries, "workspace extracted");
        Ok(target)
    }

    /// Recursive delete. Returns whether anything was there to remove.
    pub async fn remove(&self, path: &Path) -> Result<bool, WorkspaceError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "workspace removed");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(WorkspaceError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

fn unpack(dest: &Path, bytes: Vec<u8>) -> Result<usize, WorkspaceError> {
    fs::create_dir_all(dest).map_err(io_at(dest))?;
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let relative = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => {
                return Err(WorkspaceError::UnsafeEntry {
                    name: entry.name().to_string(),
                })
            }
        };
        let out_path = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(io_at(&out_path))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(io_at(parent))?;
        }
        let mut file = fs::File::create(&out_path).map_err(io_at(&out_path))?;
        io::copy(&mut entry, &mut file).map_err(io_at(&out_path))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(io_at(&out_path))?;
        }
    }

    Ok(archive.len())
}
