//! Streaming log record iterator.
//!
//! Records are read through a bounded buffer, so replaying a large log does
//! not load it into memory.

use crate::error::{CoreError, CoreResult};
use crate::types::SequenceNumber;
use crate::wal::record::{
    compute_crc32, LogRecord, LogRecordType, CRC_SIZE, ENVELOPE_HEADER_SIZE, LOG_HEADER_SIZE,
};
use brokerlog_storage::StorageBackend;
use parking_lot::MutexGuard;

/// Read buffer size for streaming iteration.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A streaming iterator over log records.
///
/// Yields `(offset, record)` pairs. A record cut short by a crash ends the
/// iteration cleanly; a checksum mismatch or unknown type is an error and
/// ends it too.
///
/// The iterator holds the log's backend lock, so nothing can be appended
/// while it is alive.
pub struct LogIterator<'a> {
    backend: MutexGuard<'a, Box<dyn StorageBackend>>,
    total_size: u64,
    current_offset: u64,
    buffer: Vec<u8>,
    buffer_pos: usize,
    buffer_len: usize,
    finished: bool,
}

impl<'a> LogIterator<'a> {
    /// Creates an iterator positioned at the first record.
    pub fn new(backend: MutexGuard<'a, Box<dyn StorageBackend>>) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            current_offset: LOG_HEADER_SIZE,
            buffer: vec![0u8; READ_BUFFER_SIZE],
            buffer_pos: 0,
            buffer_len: 0,
            finished: total_size <= LOG_HEADER_SIZE,
        })
    }

    /// Offset just past the last record returned.
    pub fn offset(&self) -> u64 {
        self.current_offset
    }

    /// Ensures `min_bytes` are buffered from the current position. Returns
    /// false if the log ends first.
    fn ensure_buffered(&mut self, min_bytes: usize) -> CoreResult<bool> {
        let available = self.buffer_len - self.buffer_pos;
        if available >= min_bytes {
            return Ok(true);
        }

        let unread = self.total_size.saturating_sub(self.current_offset);
        if unread < min_bytes as u64 {
            return Ok(false);
        }

        if self.buffer_pos > 0 && available > 0 {
            self.buffer.copy_within(self.buffer_pos..self.buffer_len, 0);
        }
        self.buffer_len = available;
        self.buffer_pos = 0;

        if min_bytes > self.buffer.len() {
            self.buffer.resize(min_bytes.next_power_of_two(), 0);
        }

        let remaining = unread - available as u64;
        let to_read = (self.buffer.len() - self.buffer_len).min(remaining as usize);
        if to_read > 0 {
            let read_offset = self.current_offset + available as u64;
            let data = self.backend.read_at(read_offset, to_read)?;
            self.buffer[self.buffer_len..self.buffer_len + data.len()].copy_from_slice(&data);
            self.buffer_len += data.len();
        }

        Ok(self.buffer_len - self.buffer_pos >= min_bytes)
    }

    fn read_next_record(&mut self) -> CoreResult<Option<(u64, LogRecord)>> {
        let start = self.current_offset;

        if !self.ensure_buffered(ENVELOPE_HEADER_SIZE)? {
            return Ok(None);
        }
        let header = &self.buffer[self.buffer_pos..self.buffer_pos + ENVELOPE_HEADER_SIZE];
        let body_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let raw_type = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&header[8..16]);
        let sequence = SequenceNumber::new(u64::from_le_bytes(seq));

        let total_len = ENVELOPE_HEADER_SIZE + body_len + CRC_SIZE;
        if !self.ensure_buffered(total_len)? {
            return Ok(None);
        }

        let body_start = self.buffer_pos + ENVELOPE_HEADER_SIZE;
        let body_end = body_start + body_len;
        let stored_crc = u32::from_le_bytes([
            self.buffer[body_end],
            self.buffer[body_end + 1],
            self.buffer[body_end + 2],
            self.buffer[body_end + 3],
        ]);
        let computed_crc = compute_crc32(&self.buffer[self.buffer_pos..body_end]);
        if stored_crc != computed_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let record_type = LogRecordType::from_u32(raw_type).ok_or_else(|| {
            CoreError::log_corruption(format!("unknown record type {raw_type} at offset {start}"))
        })?;
        let body = self.buffer[body_start..body_end].to_vec();

        self.buffer_pos += total_len;
        self.current_offset += total_len as u64;

        Ok(Some((
            start,
            LogRecord {
                sequence,
                record_type,
                body,
            },
        )))
    }
}

impl Iterator for LogIterator<'_> {
    type Item = CoreResult<(u64, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next_record() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// What a scan of the log found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScanSummary {
    /// Offset just past the last intact record.
    pub valid_end: u64,
    /// Number of intact records.
    pub records: u64,
    /// Sequence number of the last intact record.
    pub last_sequence: Option<SequenceNumber>,
    /// Why the scan stopped before the end of the file, if it did.
    pub stopped_by: Option<String>,
}

/// Walks the log and reports how much of it is intact.
pub(crate) fn scan(mut iter: LogIterator<'_>) -> ScanSummary {
    let total = iter.total_size;
    let mut records = 0;
    let mut last_sequence = None;
    let mut stopped_by = None;
    for item in iter.by_ref() {
        match item {
            Ok((_, record)) => {
                records += 1;
                last_sequence = Some(record.sequence);
            }
            Err(e) => {
                stopped_by = Some(e.to_string());
                break;
            }
        }
    }
    let valid_end = iter.offset();
    if stopped_by.is_none() && valid_end < total {
        stopped_by = Some(format!(
            "{} bytes of a torn record at offset {valid_end}",
            total - valid_end
        ));
    }
    ScanSummary {
        valid_end,
        records,
        last_sequence,
        stopped_by,
    }
}
