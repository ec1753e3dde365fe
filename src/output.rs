//! Write-then-publish helper shared by every artifact writer.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::Builder;
use tracing::warn;

/// Write a file through `write` and move it to `path` only on success.
///
/// The temporary file lives in the destination directory so the final rename
/// stays on one filesystem. On any error the temporary file is removed and
/// `path` is left untouched.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let tmp = Builder::new()
        .prefix(".medvba-")
        .suffix(".part")
        .tempfile_in(dir)
        .map_err(|e| Error::write(path, e))?;

    let file = tmp.as_file().try_clone().map_err(|e| Error::write(path, e))?;
    let mut writer = BufWriter::with_capacity(1024 * 1024, file);
    write(&mut writer)
        .and_then(|()| writer.flush())
        .map_err(|e| Error::write(path, e))?;
    drop(writer);

    tmp.as_file().sync_all().map_err(|e| Error::write(path, e))?;
    tmp.persist(path).map_err(|e| Error::write(path, e.error))?;
    Ok(())
}

/// Write an in-memory buffer atomically.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic(path, |writer| writer.write_all(bytes))
}

/// Outputs of one operation, published one by one but kept or dropped together.
///
/// Dropping the set before [`OutputSet::commit`] removes every file it
/// published, so a failure on a later output leaves none of the earlier ones.
#[derive(Debug, Default)]
pub struct OutputSet {
    published: Vec<PathBuf>,
}

impl OutputSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `path` through `write` and track it.
    pub fn publish<F>(&mut self, path: &Path, write: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        write(path)?;
        self.published.push(path.to_path_buf());
        Ok(())
    }

    /// Keep every published file.
    pub fn commit(mut self) {
        self.published.clear();
    }
}

impl Drop for OutputSet {
    fn drop(&mut self) {
        for path in self.published.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "cannot remove partial output");
            }
        }
    }
}
