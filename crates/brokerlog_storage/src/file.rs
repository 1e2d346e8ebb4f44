//! File-based storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A storage backend over a single OS file.
///
/// `flush()` pushes to the OS; `sync()` calls `File::sync_all()`.
/// The cached size is kept under the same lock as the handle so that
/// concurrent readers never observe a size the file has not reached yet.
///
/// ```no_run
/// use brokerlog_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("txnlog")).unwrap();
/// backend.append(b"record").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    state: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    size: u64,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(path, file)
    }

    /// Opens an existing file without creating it.
    ///
    /// Used by offline tools that must not leave empty files behind.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be opened.
    pub fn open_existing(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(path, file)
    }

    /// Opens or creates a file backend, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    fn from_file(path: &Path, file: File) -> StorageResult<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(FileState { file, size }),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut state = self.state.lock();
        let size = state.size;
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        state.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        state.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut state = self.state.lock();
        let offset = state.size;
        if data.is_empty() {
            return Ok(offset);
        }

        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(data)?;
        state.size += data.len() as u64;
        Ok(offset)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(data)?;
        state.size = state.size.max(offset + data.len() as u64);
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.state.lock().file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.state.lock().size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.state.lock().file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut state = self.state.lock();
        if new_size > state.size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size: state.size,
            });
        }

        state.file.set_len(new_size)?;
        state.file.sync_all()?;
        state.size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("txnlog");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(backend.path(), path);
    }

    #[test]
    fn file_open_existing_requires_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing");

        assert!(FileBackend::open_existing(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn file_append_then_overwrite_tag() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("1");

        let mut backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.append(b"WRIT").unwrap(), 0);
        assert_eq!(backend.append(b"payload").unwrap(), 4);

        backend.write_at(0, b"GOOD").unwrap();
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(0, 11).unwrap(), b"GOODpayload");
    }

    #[test]
    fn file_write_at_extends_with_zeroes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vrfile");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"ab").unwrap();
        backend.write_at(6, b"z").unwrap();

        assert_eq!(backend.size().unwrap(), 7);
        assert_eq!(backend.read_at(0, 7).unwrap(), b"ab\0\0\0\0z");

        // Appends land after the extended end.
        assert_eq!(backend.append(b"!").unwrap(), 7);
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("f")).unwrap();
        backend.append(b"hello").unwrap();

        let result = backend.read_at(3, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
        assert!(backend.read_at(5, 0).unwrap().is_empty());
    }

    #[test]
    fn file_contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("txnlog");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"durable").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open_existing(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 7);
        assert_eq!(backend.read_at(0, 7).unwrap(), b"durable");
    }

    #[test]
    fn file_truncate_shrinks_only() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("f")).unwrap();
        backend.append(b"header+records").unwrap();

        backend.truncate(6).unwrap();
        assert_eq!(backend.read_at(0, 6).unwrap(), b"header");
        assert!(matches!(
            backend.truncate(100),
            Err(StorageError::TruncateBeyondEnd { .. })
        ));
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("incompleteTxnStore").join("vrfile");

        let mut backend = FileBackend::open_with_create_dirs(&path).unwrap();
        backend.append(b"x").unwrap();
        assert!(backend.flush().is_ok());
        assert!(path.exists());
    }
}
