//! Individual numbered record files and the pool that recycles them.
//!
//! ```text
//! <n>: | tag (4) | data_len (8) | data_crc (4) | client (8) | data ... |
//! ```
//!
//! Idle files sit in one of two tiers. The free tier keeps files tagged
//! FREE with their old contents, so reuse costs a single rewrite. The
//! truncated tier keeps zero-length files. Once both tiers are full a freed
//! file is deleted.

use crate::error::{CoreError, CoreResult, CorruptionWarning};
use crate::record::tag::FileTag;
use crate::record::{ClientData, CLIENT_DATA_LEN};
use crate::wal::compute_crc32;
use brokerlog_storage::{FileBackend, StorageBackend};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Size of an overflow file header.
pub(crate) const FILE_HEADER_SIZE: usize = FileTag::LEN + 8 + 4 + CLIENT_DATA_LEN;

const CLIENT_OFFSET: u64 = (FileTag::LEN + 8 + 4) as u64;

/// A record read back from an overflow file.
#[derive(Debug, Clone)]
pub(crate) struct PooledRecord {
    pub number: u32,
    pub data: Vec<u8>,
    pub client: ClientData,
}

/// Numbered overflow files in the store directory.
#[derive(Debug)]
pub(crate) struct FilePool {
    dir: PathBuf,
    live: BTreeSet<u32>,
    reserved: BTreeSet<u32>,
    free_tier: Vec<u32>,
    truncated_tier: Vec<u32>,
    free_capacity: usize,
    truncated_capacity: usize,
    next_number: u32,
    sync_on_write: bool,
}

impl FilePool {
    /// Scans `dir` and sorts every numbered file into live, free or
    /// truncated. `keep` names non-numeric files that belong to someone
    /// else; any other stray file is deleted.
    pub fn open(
        dir: &Path,
        keep: &[&str],
        free_capacity: usize,
        truncated_capacity: usize,
        sync_on_write: bool,
    ) -> CoreResult<(Self, Vec<CorruptionWarning>)> {
        let mut pool = Self {
            dir: dir.to_path_buf(),
            live: BTreeSet::new(),
            reserved: BTreeSet::new(),
            free_tier: Vec::new(),
            truncated_tier: Vec::new(),
            free_capacity,
            truncated_capacity,
            next_number: 1,
            sync_on_write,
        };
        let mut warnings = Vec::new();

        let mut numbered = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(&name.as_str()) {
                continue;
            }
            match name.parse::<u32>() {
                Ok(n) if n > 0 && entry.file_type()?.is_file() => {
                    numbered.insert(n, entry.metadata()?.len());
                }
                _ => {
                    warn!(file = %entry.path().display(), "removing stray file from record store");
                    if entry.file_type()?.is_dir() {
                        fs::remove_dir_all(entry.path())?;
                    } else {
                        fs::remove_file(entry.path())?;
                    }
                }
            }
        }

        for (number, len) in numbered {
            pool.next_number = pool.next_number.max(number + 1);
            if len == 0 {
                pool.release_truncated(number)?;
                continue;
            }
            match pool.classify(number, len) {
                Ok(Some(FileTag::Good)) => {
                    pool.live.insert(number);
                }
                Ok(Some(FileTag::Free)) => pool.release(number)?,
                Ok(Some(FileTag::Writing)) => {
                    warnings.push(pool.discard(number, "file left WRITING by an interrupted write")?);
                }
                Ok(None) => {
                    warnings.push(pool.discard(number, "file has no valid tag")?);
                }
                Err(e) => {
                    warnings.push(pool.discard(number, &e.to_string())?);
                }
            }
        }

        debug!(
            live = pool.live.len(),
            free = pool.free_tier.len(),
            truncated = pool.truncated_tier.len(),
            "record file pool scanned"
        );
        Ok((pool, warnings))
    }

    fn classify(&self, number: u32, len: u64) -> CoreResult<Option<FileTag>> {
        if len < FILE_HEADER_SIZE as u64 {
            return Ok(None);
        }
        let backend = FileBackend::open_existing(&self.path(number))?;
        let header = backend.read_at(0, FILE_HEADER_SIZE)?;
        let tag = FileTag::from_bytes(&header[..FileTag::LEN]);
        if tag == Some(FileTag::Good) {
            read_body(&backend, &header)?;
        }
        Ok(tag)
    }

    fn discard(&mut self, number: u32, message: &str) -> CoreResult<CorruptionWarning> {
        let warning = CorruptionWarning::new(format!("record file {number}"), message);
        warn!(%warning, "freed corrupt prepared-store record, its data is lost");
        self.release(number)?;
        Ok(warning)
    }

    /// Path of a numbered file.
    pub fn path(&self, number: u32) -> PathBuf {
        self.dir.join(number.to_string())
    }

    /// Reserves a file number for a new record.
    pub fn allocate(&mut self) -> u32 {
        let number = self
            .free_tier
            .pop()
            .or_else(|| self.truncated_tier.pop())
            .unwrap_or_else(|| {
                let n = self.next_number;
                self.next_number += 1;
                n
            });
        self.reserved.insert(number);
        number
    }

    /// Writes a record into a reserved file: WRITING tag first, GOOD last.
    pub fn write(&mut self, number: u32, data: &[u8], client: ClientData) -> CoreResult<()> {
        if !self.reserved.contains(&number) {
            return Err(CoreError::invalid_operation(format!(
                "record file {number} was not allocated"
            )));
        }

        let mut backend = FileBackend::open(&self.path(number))?;
        let size = backend.size()?;
        if size > 0 {
            backend.truncate(0)?;
        }

        let mut buf = Vec::with_capacity(FILE_HEADER_SIZE + data.len());
        buf.extend_from_slice(&FileTag::Writing.as_bytes());
        buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
        buf.extend_from_slice(&compute_crc32(data).to_le_bytes());
        buf.extend_from_slice(client.as_bytes());
        buf.extend_from_slice(data);
        backend.append(&buf)?;
        backend.write_at(0, &FileTag::Good.as_bytes())?;
        if self.sync_on_write {
            backend.sync()?;
        } else {
            backend.flush()?;
        }

        self.reserved.remove(&number);
        self.live.insert(number);
        Ok(())
    }

    /// Reads a live record.
    pub fn read(&self, number: u32) -> CoreResult<PooledRecord> {
        self.require_live(number)?;
        let backend = FileBackend::open_existing(&self.path(number))?;
        let header = backend.read_at(0, FILE_HEADER_SIZE)?;
        if FileTag::from_bytes(&header[..FileTag::LEN]) != Some(FileTag::Good) {
            return Err(CoreError::corruption(format!("record file {number} is not GOOD")));
        }
        let data = read_body(&backend, &header)?;
        let client = ClientData::from_slice(&header[CLIENT_OFFSET as usize..]);
        Ok(PooledRecord {
            number,
            data,
            client,
        })
    }

    /// Overwrites the client-data bytes of a live record.
    pub fn update_client_data(&mut self, number: u32, client: ClientData) -> CoreResult<()> {
        self.require_live(number)?;
        let mut backend = FileBackend::open_existing(&self.path(number))?;
        backend.write_at(CLIENT_OFFSET, client.as_bytes())?;
        if self.sync_on_write {
            backend.sync()?;
        }
        Ok(())
    }

    /// Frees a live or reserved file.
    pub fn free(&mut self, number: u32) -> CoreResult<()> {
        if self.reserved.remove(&number) {
            // Nothing reached the disk unless it came from a tier.
            if self.path(number).exists() {
                return self.release(number);
            }
            return Ok(());
        }
        if !self.live.remove(&number) {
            return Err(CoreError::record_not_found(format!("record file {number}")));
        }
        self.release(number)
    }

    /// Tags a file FREE and places it in the first tier with room.
    fn release(&mut self, number: u32) -> CoreResult<()> {
        let path = self.path(number);
        if self.free_tier.len() < self.free_capacity {
            let mut backend = FileBackend::open(&path)?;
            backend.write_at(0, &FileTag::Free.as_bytes())?;
            backend.flush()?;
            self.free_tier.push(number);
            return Ok(());
        }
        self.release_truncated(number)
    }

    fn release_truncated(&mut self, number: u32) -> CoreResult<()> {
        let path = self.path(number);
        if self.truncated_tier.len() < self.truncated_capacity {
            let mut backend = FileBackend::open(&path)?;
            backend.truncate(0)?;
            self.truncated_tier.push(number);
        } else if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Live record numbers in ascending order.
    pub fn live_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.live.iter().copied()
    }

    /// Number of live records.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Number of idle files in (free tier, truncated tier).
    pub fn idle_counts(&self) -> (usize, usize) {
        (self.free_tier.len(), self.truncated_tier.len())
    }

    /// Deletes every numbered file.
    pub fn clear(&mut self) -> CoreResult<()> {
        let numbers: Vec<u32> = self
            .live
            .iter()
            .chain(&self.reserved)
            .chain(&self.free_tier)
            .chain(&self.truncated_tier)
            .copied()
            .collect();
        for number in numbers {
            let path = self.path(number);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        self.live.clear();
        self.reserved.clear();
        self.free_tier.clear();
        self.truncated_tier.clear();
        Ok(())
    }

    /// Checks the contents of one overflow file without touching the disk.
    pub fn check_bytes(bytes: &[u8]) -> CoreResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(CoreError::corruption("file shorter than its header"));
        }
        match FileTag::from_bytes(&bytes[..FileTag::LEN]) {
            Some(FileTag::Free) => Ok(()),
            Some(FileTag::Writing) => Err(CoreError::corruption("file left WRITING by an interrupted write")),
            None => Err(CoreError::corruption("file has no valid tag")),
            Some(FileTag::Good) => {
                let backend = brokerlog_storage::InMemoryBackend::with_data(bytes.to_vec());
                read_body(&backend, &bytes[..FILE_HEADER_SIZE]).map(|_| ())
            }
        }
    }

    fn require_live(&self, number: u32) -> CoreResult<()> {
        if self.live.contains(&number) {
            Ok(())
        } else {
            Err(CoreError::record_not_found(format!("record file {number}")))
        }
    }
}

fn read_body(backend: &dyn StorageBackend, header: &[u8]) -> CoreResult<Vec<u8>> {
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[FileTag::LEN..FileTag::LEN + 8]);
    let data_len = u64::from_le_bytes(len);
    let available = backend.size()?.saturating_sub(FILE_HEADER_SIZE as u64);
    if data_len > available {
        return Err(CoreError::corruption(format!(
            "data length {data_len} exceeds the {available} bytes on disk"
        )));
    }
    let data = backend.read_at(FILE_HEADER_SIZE as u64, data_len as usize)?;
    let at = FileTag::LEN + 8;
    let expected = u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let actual = compute_crc32(&data);
    if expected != actual {
        return Err(CoreError::ChecksumMismatch { expected, actual });
    }
    Ok(data)
}
