//! The on-disk replica log.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A replica log kept in one file.
///
/// Opening takes an exclusive advisory lock that is held until the backend
/// is dropped; a second opener gets [`StorageError::Locked`]. The logical
/// length is tracked in memory, so bytes left behind by a failed append are
/// invisible to readers until the next `truncate` cuts them off.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    // Reads take `&self` but still move the cursor.
    file: Mutex<File>,
    len: u64,
}

impl FileBackend {
    /// Opens the log at `path`, creating it and its directory if missing.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another handle owns the file, or `Io`.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked {
                path: path.display().to_string(),
            });
        }
        let len = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            len,
        })
    }

    /// Location of the log.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.len) {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: self.len,
            });
        }
        let mut out = vec![0; len];
        if len > 0 {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut out)?;
        }
        Ok(out)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let at = self.len;
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(at))?;
        file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(at)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(self.file.get_mut().flush()?)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.len)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(self.file.get_mut().sync_data()?)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        if new_size > self.len {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size: self.len,
            });
        }
        let file = self.file.get_mut();
        file.set_len(new_size)?;
        file.sync_data()?;
        self.len = new_size;
        Ok(())
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        let _ = FileExt::unlock(self.file.get_mut());
    }
}
