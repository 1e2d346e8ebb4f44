//! Directory-backed record store: region file plus overflow file pool.

use crate::config::RecordStoreConfig;
use crate::dir::sync_directory;
use crate::error::{CoreError, CoreResult, CorruptionWarning};
use crate::record::pool::FilePool;
use crate::record::region::RegionFile;
use crate::record::{ClientData, RecordHandle};
use brokerlog_storage::{FileBackend, InMemoryBackend};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const REGION_FILE: &str = "vrfile";
const COMPACT_FILE: &str = "vrfile.compact";

/// A record read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Where the record lives.
    pub handle: RecordHandle,
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Client data bytes.
    pub client: ClientData,
}

/// Variable-length record allocator over a directory.
///
/// Operations take `&mut self`; callers that share a store wrap it in a
/// lock, which serializes every change to the region.
pub struct RecordStore {
    dir: PathBuf,
    config: RecordStoreConfig,
    cookie: u64,
    region: Option<RegionFile>,
    pool: FilePool,
}

impl RecordStore {
    /// Opens the store in `dir`, creating it if needed, and scans every
    /// record. Torn or damaged records are freed and returned as warnings.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or when the region file was written by a newer
    /// record format than `cookie`.
    pub fn open(
        dir: &Path,
        config: &RecordStoreConfig,
        cookie: u64,
    ) -> CoreResult<(Self, Vec<CorruptionWarning>)> {
        fs::create_dir_all(dir)?;

        let compact_path = dir.join(COMPACT_FILE);
        if compact_path.exists() {
            info!(path = %compact_path.display(), "removing unfinished region compaction");
            fs::remove_file(&compact_path)?;
        }

        let mut warnings = Vec::new();
        let region_path = dir.join(REGION_FILE);
        let region = if config.use_region_file || region_path.exists() {
            let (region, found) = open_region(&region_path, config, cookie)?;
            warnings.extend(found);
            Some(region)
        } else {
            None
        };

        let (pool, found) = FilePool::open(
            dir,
            &[REGION_FILE],
            config.free_tier_capacity(),
            config.truncated_tier_capacity(),
            config.sync_on_write,
        )?;
        warnings.extend(found);

        debug!(
            dir = %dir.display(),
            region = region.is_some(),
            warnings = warnings.len(),
            "record store opened"
        );
        Ok((
            Self {
                dir: dir.to_path_buf(),
                config: config.clone(),
                cookie,
                region,
                pool,
            },
            warnings,
        ))
    }

    /// Scans the store in `dir` without changing anything on disk.
    ///
    /// The region file is scanned from an in-memory copy; overflow files are
    /// only read.
    pub fn verify(dir: &Path, cookie: u64) -> CoreResult<Vec<CorruptionWarning>> {
        let mut warnings = Vec::new();
        let region_path = dir.join(REGION_FILE);
        if region_path.exists() {
            let copy = InMemoryBackend::with_data(fs::read(&region_path)?);
            let (_, found) = RegionFile::open(Box::new(copy), cookie, 0, false)?;
            warnings.extend(found);
        }

        let copy = read_numbered_files(dir)?;
        for (name, bytes) in copy {
            if let Err(e) = FilePool::check_bytes(&bytes) {
                warnings.push(CorruptionWarning::new(format!("record file {name}"), e.to_string()));
            }
        }
        Ok(warnings)
    }

    /// Directory the store lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserves space for a record of `size` bytes.
    pub fn allocate(&mut self, size: usize) -> CoreResult<RecordHandle> {
        match self.region.as_mut() {
            Some(region)
                if self.config.use_region_file && size <= self.config.max_region_record_size =>
            {
                Ok(RecordHandle::Region(region.allocate(size)?))
            }
            _ => Ok(RecordHandle::File(self.pool.allocate())),
        }
    }

    /// Writes a record into allocated space. The record becomes visible to
    /// a later scan only once the write has finished.
    pub fn write(&mut self, handle: RecordHandle, data: &[u8], client: ClientData) -> CoreResult<()> {
        match handle {
            RecordHandle::Region(offset) => self.region_mut()?.write(offset, data, client),
            RecordHandle::File(number) => self.pool.write(number, data, client),
        }
    }

    /// Allocates and writes a record in one step.
    pub fn insert(&mut self, data: &[u8], client: ClientData) -> CoreResult<RecordHandle> {
        let handle = self.allocate(data.len())?;
        if let Err(e) = self.write(handle, data, client) {
            if let Err(free_err) = self.free(handle) {
                warn!(%handle, error = %free_err, "failed to release record after a failed write");
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Frees a record.
    pub fn free(&mut self, handle: RecordHandle) -> CoreResult<()> {
        match handle {
            RecordHandle::Region(offset) => self.region_mut()?.free(offset),
            RecordHandle::File(number) => self.pool.free(number),
        }
    }

    /// Reads a record.
    pub fn read(&self, handle: RecordHandle) -> CoreResult<StoredRecord> {
        match handle {
            RecordHandle::Region(offset) => {
                let record = self.region_ref()?.read(offset)?;
                Ok(StoredRecord {
                    handle,
                    data: record.data,
                    client: record.client,
                })
            }
            RecordHandle::File(number) => {
                let record = self.pool.read(number)?;
                Ok(StoredRecord {
                    handle,
                    data: record.data,
                    client: record.client,
                })
            }
        }
    }

    /// Rewrites the client data of a record in place.
    pub fn update_client_data(&mut self, handle: RecordHandle, client: ClientData) -> CoreResult<()> {
        match handle {
            RecordHandle::Region(offset) => self.region_mut()?.update_client_data(offset, client),
            RecordHandle::File(number) => self.pool.update_client_data(number, client),
        }
    }

    /// Reads every live record, region records first.
    pub fn iterate(&self) -> CoreResult<Vec<StoredRecord>> {
        let mut out = Vec::new();
        if let Some(region) = &self.region {
            for record in region.records()? {
                out.push(StoredRecord {
                    handle: RecordHandle::Region(record.offset),
                    data: record.data,
                    client: record.client,
                });
            }
        }
        let numbers: Vec<u32> = self.pool.live_numbers().collect();
        for number in numbers {
            let record = self.pool.read(number)?;
            out.push(StoredRecord {
                handle: RecordHandle::File(record.number),
                data: record.data,
                client: record.client,
            });
        }
        Ok(out)
    }

    /// Rewrites the region so its live records are contiguous.
    ///
    /// Every region handle handed out before is invalid afterwards. Returns
    /// the number of bytes reclaimed.
    pub fn compact(&mut self) -> CoreResult<u64> {
        let Some(region) = self.region.take() else {
            return Ok(0);
        };
        let before = region.file_size();
        let region_path = self.dir.join(REGION_FILE);
        let compact_path = self.dir.join(COMPACT_FILE);

        let built = FileBackend::open(&compact_path)
            .map_err(CoreError::from)
            .and_then(|target| region.compact_into(Box::new(target)));
        let compacted = match built {
            Ok(compacted) => compacted,
            Err(e) => {
                self.region = Some(region);
                if let Err(rm) = fs::remove_file(&compact_path) {
                    warn!(error = %rm, "failed to remove partial region compaction");
                }
                return Err(e);
            }
        };
        let after = compacted.file_size();
        drop(compacted);
        drop(region);

        let renamed = fs::rename(&compact_path, &region_path);
        let (reopened, _) = open_region(&region_path, &self.config, self.cookie)?;
        self.region = Some(reopened);
        renamed?;
        sync_directory(&self.dir)?;

        info!(before, after, "region compacted");
        Ok(before.saturating_sub(after))
    }

    /// Syncs the region file.
    pub fn sync(&mut self) -> CoreResult<()> {
        if let Some(region) = self.region.as_mut() {
            region.sync()?;
        }
        Ok(())
    }

    /// Drops every record.
    pub fn clear(&mut self) -> CoreResult<()> {
        if let Some(region) = self.region.as_mut() {
            region.clear()?;
        }
        self.pool.clear()?;
        sync_directory(&self.dir)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.region.as_ref().map_or(0, RegionFile::live_count) + self.pool.live_count()
    }

    /// Returns true if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes on disk: the region file plus every live overflow file.
    pub fn byte_count(&self) -> CoreResult<u64> {
        let mut total = self.region.as_ref().map_or(0, RegionFile::file_size);
        for number in self.pool.live_numbers() {
            total += fs::metadata(self.pool.path(number))?.len();
        }
        Ok(total)
    }

    /// Bytes in free region blocks.
    pub fn free_bytes(&self) -> u64 {
        self.region.as_ref().map_or(0, RegionFile::free_bytes)
    }

    fn region_ref(&self) -> CoreResult<&RegionFile> {
        self.region
            .as_ref()
            .ok_or_else(|| CoreError::invalid_operation("region file is disabled"))
    }

    fn region_mut(&mut self) -> CoreResult<&mut RegionFile> {
        self.region
            .as_mut()
            .ok_or_else(|| CoreError::invalid_operation("region file is disabled"))
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("dir", &self.dir)
            .field("cookie", &self.cookie)
            .field("records", &self.len())
            .finish_non_exhaustive()
    }
}

fn open_region(
    path: &Path,
    config: &RecordStoreConfig,
    cookie: u64,
) -> CoreResult<(RegionFile, Vec<CorruptionWarning>)> {
    let backend = FileBackend::open(path)?;
    RegionFile::open(
        Box::new(backend),
        cookie,
        config.region_growth,
        config.sync_on_write,
    )
}

/// Reads every numbered file in `dir` without opening it for writing.
fn read_numbered_files(dir: &Path) -> CoreResult<Vec<(String, Vec<u8>)>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.parse::<u32>().is_ok() && entry.file_type()?.is_file() {
            files.push((name, fs::read(entry.path())?));
        }
    }
    files.sort();
    Ok(files)
}
