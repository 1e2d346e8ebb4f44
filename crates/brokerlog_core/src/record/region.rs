//! The shared region file (`vrfile`).
//!
//! ```text
//! | magic (4) | version (2) | reserved (2) | cookie (8) | crc32 (4) | pad (4) |
//! | block | block | ...
//!
//! block:
//! | capacity (4) | tag (2) | reserved (2) | data_len (4) | data_crc (4) | client (8) | data ... |
//! ```
//!
//! Blocks tile the file from the header to the end. Free blocks are tracked
//! in memory after the opening scan; growing the region appends one free
//! block that later allocations split.

use crate::error::{CoreError, CoreResult, CorruptionWarning};
use crate::record::tag::RecordTag;
use crate::record::ClientData;
use crate::wal::compute_crc32;
use brokerlog_storage::StorageBackend;
use std::collections::BTreeMap;
use tracing::warn;

const REGION_MAGIC: [u8; 4] = *b"BLVR";
const REGION_VERSION: u16 = 1;

/// Size of the file header.
pub(crate) const REGION_HEADER_SIZE: u64 = 24;

/// Size of a block header.
pub(crate) const BLOCK_HEADER_SIZE: u64 = 24;

const TAG_OFFSET: u64 = 4;
const CLIENT_OFFSET: u64 = 16;
const ALIGN: u64 = 8;

/// Smallest remainder worth splitting off as its own free block.
const MIN_SPLIT: u64 = BLOCK_HEADER_SIZE + 32;

#[derive(Debug, Clone, Copy)]
struct Block {
    capacity: u64,
    tag: RecordTag,
}

/// A record read back from the region.
#[derive(Debug, Clone)]
pub(crate) struct RegionRecord {
    pub offset: u64,
    pub data: Vec<u8>,
    pub client: ClientData,
}

/// Variable-length records in one growable file.
pub(crate) struct RegionFile {
    backend: Box<dyn StorageBackend>,
    cookie: u64,
    blocks: BTreeMap<u64, Block>,
    end: u64,
    growth: u64,
    sync_on_write: bool,
}

impl RegionFile {
    /// Opens a region, scanning every block.
    ///
    /// Pending or allocated blocks are torn writes: they are freed and
    /// reported. A block header that cannot be parsed ends the region there.
    pub fn open(
        mut backend: Box<dyn StorageBackend>,
        cookie: u64,
        growth: u64,
        sync_on_write: bool,
    ) -> CoreResult<(Self, Vec<CorruptionWarning>)> {
        let size = backend.size()?;
        if size < REGION_HEADER_SIZE {
            if size > 0 {
                warn!(size, "region file shorter than its header, reinitializing");
                backend.truncate(0)?;
            }
            backend.append(&encode_header(cookie))?;
            backend.sync()?;
            let region = Self::empty(backend, cookie, growth, sync_on_write);
            return Ok((region, Vec::new()));
        }

        let header = backend.read_at(0, REGION_HEADER_SIZE as usize)?;
        let stored_cookie = check_header(&header, cookie)?;

        let mut region = Self::empty(backend, stored_cookie, growth, sync_on_write);
        let warnings = region.scan(size)?;
        Ok((region, warnings))
    }

    fn empty(backend: Box<dyn StorageBackend>, cookie: u64, growth: u64, sync_on_write: bool) -> Self {
        Self {
            backend,
            cookie,
            blocks: BTreeMap::new(),
            end: REGION_HEADER_SIZE,
            growth: growth.max(MIN_SPLIT),
            sync_on_write,
        }
    }

    fn scan(&mut self, size: u64) -> CoreResult<Vec<CorruptionWarning>> {
        let mut warnings = Vec::new();
        let mut offset = REGION_HEADER_SIZE;

        while offset + BLOCK_HEADER_SIZE <= size {
            let header = self.backend.read_at(offset, BLOCK_HEADER_SIZE as usize)?;
            let capacity = u64::from(read_u32(&header, 0));
            let raw_tag = u16::from_le_bytes([header[4], header[5]]);
            let tag = RecordTag::from_u16(raw_tag);

            let fits = capacity >= BLOCK_HEADER_SIZE && offset + capacity <= size;
            let Some(tag) = tag.filter(|_| fits) else {
                if tag != Some(RecordTag::Free) || capacity < BLOCK_HEADER_SIZE {
                    let warning = CorruptionWarning::new(
                        format!("vrfile@{offset}"),
                        format!(
                            "unreadable block header (tag {raw_tag:#06x}, capacity {capacity}); \
                             discarding the rest of the region"
                        ),
                    );
                    warn!(%warning, "prepared store data may be lost");
                    warnings.push(warning);
                }
                break;
            };

            let tag = match tag {
                RecordTag::Done => match self.verify_block(offset, &header) {
                    Ok(()) => RecordTag::Done,
                    Err(e) => {
                        warnings.push(self.discard(offset, e.to_string())?);
                        RecordTag::Free
                    }
                },
                RecordTag::Allocated | RecordTag::Pending => {
                    let msg = format!("record left {tag} by an interrupted write");
                    warnings.push(self.discard(offset, msg)?);
                    RecordTag::Free
                }
                RecordTag::Free => RecordTag::Free,
            };

            self.blocks.insert(offset, Block { capacity, tag });
            offset += capacity;
        }

        if offset < size {
            self.backend.truncate(offset)?;
        }
        self.end = offset;
        Ok(warnings)
    }

    fn verify_block(&self, offset: u64, header: &[u8]) -> CoreResult<()> {
        let capacity = u64::from(read_u32(header, 0));
        let data_len = u64::from(read_u32(header, 8));
        if BLOCK_HEADER_SIZE + data_len > capacity {
            return Err(CoreError::corruption(format!(
                "data length {data_len} exceeds block capacity {capacity}"
            )));
        }
        let data = self
            .backend
            .read_at(offset + BLOCK_HEADER_SIZE, data_len as usize)?;
        let expected = read_u32(header, 12);
        let actual = compute_crc32(&data);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }

    fn discard(&mut self, offset: u64, message: String) -> CoreResult<CorruptionWarning> {
        self.write_tag(offset, RecordTag::Free)?;
        let warning = CorruptionWarning::new(format!("vrfile@{offset}"), message);
        warn!(%warning, "freed corrupt prepared-store record, its data is lost");
        Ok(warning)
    }

    /// Returns the cookie stored in the header.
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Reserves a block able to hold `size` bytes.
    pub fn allocate(&mut self, size: usize) -> CoreResult<u64> {
        let needed = align(BLOCK_HEADER_SIZE + size as u64);
        let found = self
            .blocks
            .iter()
            .find(|(_, b)| b.tag == RecordTag::Free && b.capacity >= needed)
            .map(|(&off, b)| (off, b.capacity));

        let (offset, capacity) = match found {
            Some(hit) => hit,
            None => self.grow(needed)?,
        };

        let capacity = if capacity - needed >= MIN_SPLIT {
            let rest = offset + needed;
            self.write_block_header(rest, capacity - needed, RecordTag::Free)?;
            self.blocks.insert(
                rest,
                Block {
                    capacity: capacity - needed,
                    tag: RecordTag::Free,
                },
            );
            needed
        } else {
            capacity
        };

        self.write_block_header(offset, capacity, RecordTag::Allocated)?;
        self.blocks.insert(
            offset,
            Block {
                capacity,
                tag: RecordTag::Allocated,
            },
        );
        Ok(offset)
    }

    fn grow(&mut self, needed: u64) -> CoreResult<(u64, u64)> {
        let offset = self.end;
        let capacity = align(needed.max(self.growth));
        self.write_block_header(offset, capacity, RecordTag::Free)?;
        // Materialize the last byte so a later scan sees the whole block.
        self.backend.write_at(offset + capacity - 1, &[0])?;
        self.end += capacity;
        self.blocks.insert(
            offset,
            Block {
                capacity,
                tag: RecordTag::Free,
            },
        );
        Ok((offset, capacity))
    }

    /// Writes `data` into an allocated block and marks it done.
    pub fn write(&mut self, offset: u64, data: &[u8], client: ClientData) -> CoreResult<()> {
        let block = self.block(offset)?;
        if block.tag != RecordTag::Allocated {
            return Err(CoreError::invalid_operation(format!(
                "vrfile@{offset} is {}, not allocated",
                block.tag
            )));
        }
        if BLOCK_HEADER_SIZE + data.len() as u64 > block.capacity {
            return Err(CoreError::invalid_operation(format!(
                "{} bytes do not fit block of capacity {}",
                data.len(),
                block.capacity
            )));
        }
        let data_len = u32::try_from(data.len())
            .map_err(|_| CoreError::invalid_operation("record too large"))?;

        let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE as usize + data.len());
        buf.extend_from_slice(&(block.capacity as u32).to_le_bytes());
        buf.extend_from_slice(&RecordTag::Pending.as_u16().to_le_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&data_len.to_le_bytes());
        buf.extend_from_slice(&compute_crc32(data).to_le_bytes());
        buf.extend_from_slice(client.as_bytes());
        buf.extend_from_slice(data);
        self.backend.write_at(offset, &buf)?;

        self.write_tag(offset, RecordTag::Done)?;
        self.set_tag(offset, RecordTag::Done);
        if self.sync_on_write {
            self.backend.sync()?;
        }
        Ok(())
    }

    /// Frees a block, merging it with free neighbours.
    pub fn free(&mut self, offset: u64) -> CoreResult<()> {
        let block = self.block(offset)?;
        if block.tag == RecordTag::Free {
            return Err(CoreError::record_not_found(format!("vrfile@{offset} is already free")));
        }
        self.write_tag(offset, RecordTag::Free)?;

        let mut start = offset;
        let mut capacity = block.capacity;

        let next = offset + capacity;
        if let Some(nb) = self.blocks.get(&next).copied() {
            if nb.tag == RecordTag::Free {
                self.blocks.remove(&next);
                capacity += nb.capacity;
            }
        }
        let before = self.blocks.range(..offset).next_back().map(|(&p, b)| (p, *b));
        if let Some((prev, pb)) = before {
            if pb.tag == RecordTag::Free && prev + pb.capacity == offset {
                self.blocks.remove(&offset);
                start = prev;
                capacity += pb.capacity;
            }
        }

        if capacity != block.capacity || start != offset {
            self.backend
                .write_at(start, &(capacity as u32).to_le_bytes())?;
        }
        self.blocks.insert(
            start,
            Block {
                capacity,
                tag: RecordTag::Free,
            },
        );
        if self.sync_on_write {
            self.backend.sync()?;
        }
        Ok(())
    }

    /// Reads a done record.
    pub fn read(&self, offset: u64) -> CoreResult<RegionRecord> {
        self.done_block(offset)?;
        let header = self.backend.read_at(offset, BLOCK_HEADER_SIZE as usize)?;
        let data_len = read_u32(&header, 8) as usize;
        let data = self.backend.read_at(offset + BLOCK_HEADER_SIZE, data_len)?;

        let expected = read_u32(&header, 12);
        let actual = compute_crc32(&data);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }
        let client = ClientData::from_slice(&header[CLIENT_OFFSET as usize..]);
        Ok(RegionRecord {
            offset,
            data,
            client,
        })
    }

    /// Overwrites the client-data bytes of a done record.
    pub fn update_client_data(&mut self, offset: u64, client: ClientData) -> CoreResult<()> {
        self.done_block(offset)?;
        self.backend
            .write_at(offset + CLIENT_OFFSET, client.as_bytes())?;
        if self.sync_on_write {
            self.backend.sync()?;
        }
        Ok(())
    }

    /// Reads every done record in file order.
    pub fn records(&self) -> CoreResult<Vec<RegionRecord>> {
        self.blocks
            .iter()
            .filter(|(_, b)| b.tag == RecordTag::Done)
            .map(|(&offset, _)| self.read(offset))
            .collect()
    }

    /// Copies every done record contiguously into a fresh region on `target`.
    pub fn compact_into(&self, target: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let (mut fresh, _) = Self::open(target, self.cookie, self.growth, false)?;
        for record in self.records()? {
            let offset = fresh.allocate_exact(record.data.len())?;
            fresh.write(offset, &record.data, record.client)?;
        }
        fresh.backend.sync()?;
        fresh.sync_on_write = self.sync_on_write;
        Ok(fresh)
    }

    fn allocate_exact(&mut self, size: usize) -> CoreResult<u64> {
        let capacity = align(BLOCK_HEADER_SIZE + size as u64);
        let offset = self.end;
        self.write_block_header(offset, capacity, RecordTag::Allocated)?;
        self.backend.write_at(offset + capacity - 1, &[0])?;
        self.end += capacity;
        self.blocks.insert(
            offset,
            Block {
                capacity,
                tag: RecordTag::Allocated,
            },
        );
        Ok(offset)
    }

    /// Drops every record.
    pub fn clear(&mut self) -> CoreResult<()> {
        self.backend.truncate(REGION_HEADER_SIZE)?;
        self.backend.sync()?;
        self.blocks.clear();
        self.end = REGION_HEADER_SIZE;
        Ok(())
    }

    /// Syncs the region to disk.
    pub fn sync(&mut self) -> CoreResult<()> {
        self.backend.sync()?;
        Ok(())
    }

    /// Number of done records.
    pub fn live_count(&self) -> usize {
        self.blocks
            .values()
            .filter(|b| b.tag == RecordTag::Done)
            .count()
    }

    /// Bytes held in free blocks.
    pub fn free_bytes(&self) -> u64 {
        self.blocks
            .values()
            .filter(|b| b.tag == RecordTag::Free)
            .map(|b| b.capacity)
            .sum()
    }

    /// Size of the region file.
    pub fn file_size(&self) -> u64 {
        self.end
    }

    fn block(&self, offset: u64) -> CoreResult<Block> {
        self.blocks
            .get(&offset)
            .copied()
            .ok_or_else(|| CoreError::record_not_found(format!("no block at vrfile@{offset}")))
    }

    fn done_block(&self, offset: u64) -> CoreResult<Block> {
        let block = self.block(offset)?;
        if block.tag != RecordTag::Done {
            return Err(CoreError::record_not_found(format!(
                "vrfile@{offset} is {}",
                block.tag
            )));
        }
        Ok(block)
    }

    fn set_tag(&mut self, offset: u64, tag: RecordTag) {
        if let Some(b) = self.blocks.get_mut(&offset) {
            b.tag = tag;
        }
    }

    fn write_tag(&mut self, offset: u64, tag: RecordTag) -> CoreResult<()> {
        self.backend
            .write_at(offset + TAG_OFFSET, &tag.as_u16().to_le_bytes())?;
        Ok(())
    }

    fn write_block_header(&mut self, offset: u64, capacity: u64, tag: RecordTag) -> CoreResult<()> {
        let capacity = u32::try_from(capacity)
            .map_err(|_| CoreError::invalid_operation("block capacity exceeds 4 GiB"))?;
        let mut buf = [0u8; BLOCK_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&capacity.to_le_bytes());
        buf[4..6].copy_from_slice(&tag.as_u16().to_le_bytes());
        self.backend.write_at(offset, &buf)?;
        Ok(())
    }
}

impl std::fmt::Debug for RegionFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionFile")
            .field("cookie", &self.cookie)
            .field("blocks", &self.blocks.len())
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

fn align(n: u64) -> u64 {
    n.div_ceil(ALIGN) * ALIGN
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn encode_header(cookie: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(REGION_HEADER_SIZE as usize);
    buf.extend_from_slice(&REGION_MAGIC);
    buf.extend_from_slice(&REGION_VERSION.to_le_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&cookie.to_le_bytes());
    let crc = compute_crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&[0; 4]);
    buf
}

/// Validates the header and returns the stored cookie.
///
/// An older cookie is accepted with a warning; a newer one is refused.
fn check_header(header: &[u8], cookie: u64) -> CoreResult<u64> {
    if header[0..4] != REGION_MAGIC {
        return Err(CoreError::invalid_format("vrfile has an unknown magic number"));
    }
    let expected = read_u32(header, 16);
    let actual = compute_crc32(&header[0..16]);
    if expected != actual {
        return Err(CoreError::ChecksumMismatch { expected, actual });
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version > REGION_VERSION {
        return Err(CoreError::invalid_format(format!(
            "vrfile version {version} is newer than supported {REGION_VERSION}"
        )));
    }

    let mut raw = [0u8; 8];
    raw.copy_from_slice(&header[8..16]);
    let stored = u64::from_le_bytes(raw);
    if stored > cookie {
        return Err(CoreError::invalid_format(format!(
            "vrfile cookie {stored} is newer than record format {cookie}"
        )));
    }
    if stored < cookie {
        warn!(stored, current = cookie, "vrfile written by an older record format");
    }
    Ok(stored)
}
