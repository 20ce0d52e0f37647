//! # Upload Staging
//!
//! The decoder reads from a file, so every upload is first written to a
//! temporary file that belongs to exactly one request.
//!
//! ## Guarantees:
//! - **Unique**: names are random and the file is created with `O_EXCL`
//!   (via the `tempfile` crate), so concurrent requests never share a path
//! - **Complete**: `write` flushes and fsyncs before returning, so the decoder
//!   never observes a partially written file
//! - **Scoped**: the file is deleted by `release`, or by `Drop` on every other
//!   exit path (errors, panics, dropped futures)

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::audio::codec::FormatHint;
use crate::error::{AppError, AppResult};

const STAGING_PREFIX: &str = "soundbite-";

/// Exclusive, self-deleting on-disk copy of one upload.
#[derive(Debug)]
pub struct TempAsset {
    file: NamedTempFile,
    hint: FormatHint,
    bytes_written: usize,
}

impl TempAsset {
    /// Create a new uniquely named file in `dir` with the hint's extension.
    pub fn acquire(dir: &Path, hint: FormatHint) -> AppResult<Self> {
        let suffix = format!(".{}", hint.extension());
        let file = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(&suffix)
            .tempfile_in(dir)
            .map_err(|e| {
                AppError::Staging(format!(
                    "failed to create temp file in {}: {}",
                    dir.display(),
                    e
                ))
            })?;

        debug!(path = %file.path().display(), "Acquired staging file");
        Ok(Self {
            file,
            hint,
            bytes_written: 0,
        })
    }

    /// Write the payload and make it durable before anyone reads it.
    pub fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        let path = self.file.path().to_path_buf();
        let io_err = |e: std::io::Error| {
            AppError::Staging(format!("failed to write {}: {}", path.display(), e))
        };

        let handle: &mut File = self.file.as_file_mut();
        handle.write_all(bytes).map_err(io_err)?;
        handle.flush().map_err(io_err)?;
        handle.sync_all().map_err(io_err)?;

        self.bytes_written += bytes.len();
        debug!(path = %path.display(), bytes = bytes.len(), "Staged upload");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn hint(&self) -> FormatHint {
        self.hint
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Delete the backing file now, reporting any failure.
    ///
    /// Dropping the asset also deletes the file, but silently.
    pub fn release(self) -> AppResult<()> {
        let path: PathBuf = self.file.path().to_path_buf();
        match self.file.close() {
            Ok(()) => {
                debug!(path = %path.display(), "Released staging file");
                Ok(())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete staging file");
                Err(AppError::Staging(format!(
                    "failed to delete {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }
}
