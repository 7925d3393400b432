use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// A file written to upload storage.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub file_name: String,
}

/// Local directory for uploaded documents and payment proofs.
///
/// Every file gets a fresh uuid name, so concurrent uploads never collide
/// and no locking is needed.
#[derive(Debug, Clone)]
pub struct UploadStorage {
    root: PathBuf,
}

impl UploadStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write `bytes` under `<root>/<subdir>/<uuid>.<extension>`.
    pub async fn store(&self, subdir: &str, extension: &str, bytes: &[u8]) -> AppResult<StoredFile> {
        let dir = self.root.join(subdir);
        tokio::fs::create_dir_all(&dir).await?;

        let file_name = format!("{}.{}", Uuid::new_v4(), extension);
        let path = dir.join(&file_name);
        tokio::fs::write(&path, bytes).await?;

        debug!(path = %path.display(), size = bytes.len(), "Stored upload");
        Ok(StoredFile { path, file_name })
    }

    /// Best-effort delete; failures are logged and swallowed.
    pub async fn remove(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove stored upload");
        }
    }
}

/// Lower-cased extension of an uploaded filename, checked against `allowed`.
pub fn checked_extension(filename: &str, allowed: &[&str]) -> AppResult<String> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .ok_or_else(|| AppError::Validation(format!("File '{}' has no extension", filename)))?;

    if !allowed.contains(&extension.as_str()) {
        return Err(AppError::Validation(format!(
            "File type .{} is not allowed. Allowed: {}",
            extension,
            allowed.join(", ")
        )));
    }
    Ok(extension)
}
