use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use common::{DbError, DbResult, PAGE_SIZE};

/// Owns the single database file: creation, opening, and the seekable byte
/// stream the disk manager reads and writes through.
#[derive(Debug)]
pub struct DbFile {
    path: PathBuf,
    file: Option<File>,
}

impl DbFile {
    /// Create a new database file, truncating any existing one.
    ///
    /// Parent directories are created as needed. The file is seeded with a
    /// zeroed header page whose page count is 1 (the header page counts
    /// itself) and left open for read/write.
    pub fn create(path: impl Into<PathBuf>) -> DbResult<DbFile> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut header = [0u8; PAGE_SIZE];
        header[..4].copy_from_slice(&1u32.to_le_bytes());
        file.write_all(&header)?;
        file.flush()?;

        Ok(DbFile {
            path,
            file: Some(file),
        })
    }

    /// Open an existing database file for read/write.
    ///
    /// A missing file surfaces as `Io` with `NotFound`.
    pub fn open(path: impl Into<PathBuf>) -> DbResult<DbFile> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Ok(DbFile {
            path,
            file: Some(file),
        })
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seekable access to the raw bytes; `NotOpen` after `close`.
    pub fn stream(&mut self) -> DbResult<&mut File> {
        self.file.as_mut().ok_or(DbError::NotOpen)
    }

    /// Flush OS buffers and release the handle. Idempotent.
    pub fn close(&mut self) -> DbResult<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}
