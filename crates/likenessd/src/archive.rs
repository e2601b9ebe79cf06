//! On-disk archive of enrollment source images.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

const TRAINED_DIR: &str = "trained";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("image reference escapes the archive: {0}")]
    InvalidRef(String),
}

/// Stores enrollment images below `<root>/trained/`.
///
/// Every stored file gets a UUID prefix, so two uploads with the same name
/// never overwrite each other. References handed out are relative to `root`.
#[derive(Debug, Clone)]
pub struct ImageArchive {
    root: PathBuf,
}

impl ImageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` and return the new image reference.
    pub fn store(&self, filename: &str, bytes: &[u8]) -> Result<String, ArchiveError> {
        let dir = self.root.join(TRAINED_DIR);
        std::fs::create_dir_all(&dir).map_err(|source| ArchiveError::Io {
            path: dir.clone(),
            source,
        })?;

        let name = format!("{}-{}", Uuid::new_v4().simple(), sanitize_filename(filename));
        let path = dir.join(&name);
        std::fs::write(&path, bytes).map_err(|source| ArchiveError::Io {
            path: path.clone(),
            source,
        })?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "image archived");
        Ok(format!("{TRAINED_DIR}/{name}"))
    }

    /// Absolute path of a reference, refusing anything outside the archive.
    pub fn path_of(&self, image_ref: &str) -> Result<PathBuf, ArchiveError> {
        let relative = Path::new(image_ref);
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !contained || image_ref.is_empty() {
            return Err(ArchiveError::InvalidRef(image_ref.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Remove an archived image. Already-missing files are not an error.
    pub fn discard(&self, image_ref: &str) -> Result<(), ArchiveError> {
        let path = self.path_of(image_ref)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ArchiveError::Io { path, source }),
        }
    }
}

/// Reduce an uploaded filename to `[A-Za-z0-9._-]` with no leading dots.
pub fn sanitize_filename(name: &str) -> String {
    // Only the last path segment is meaningful.
    let base = name.rsplit(&['/', '\\'][..]).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned.to_string()
    }
}
