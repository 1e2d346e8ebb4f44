//! The transaction log: header management, appends, reset.

use crate::codec::RECORD_FORMAT_VERSION;
use crate::config::Config;
use crate::error::{CoreError, CoreResult, CorruptionWarning};
use crate::types::SequenceNumber;
use crate::wal::iterator::{scan, LogIterator};
use crate::wal::record::{
    encode_envelope, LogEvent, LogHeader, LogRecordType, LogStatus, LOG_HEADER_SIZE,
};
use brokerlog_storage::StorageBackend;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why the log asked for a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointReason {
    /// The log grew past its checkpoint size.
    Size,
    /// The log holds more records than the configured threshold.
    RecordCount,
    /// Asked for explicitly.
    Requested,
}

/// Receives checkpoint requests from the log.
///
/// Called on the appending thread after the log's locks are released; the
/// implementation must hand the work off rather than run a checkpoint
/// inline.
pub trait CheckpointListener: Send + Sync {
    /// A threshold was crossed.
    fn checkpoint_requested(&self, reason: CheckpointReason);
}

/// Settings the log is opened with.
#[derive(Debug, Clone, Copy)]
pub struct LogOptions {
    /// Record format cookie written to and expected in the header.
    pub cookie: u64,
    /// Ask for a checkpoint once the log reaches this many bytes.
    pub checkpoint_size: u64,
    /// Ask for a checkpoint after this many records (0 = never).
    pub record_threshold: u64,
    /// Sync after every append.
    pub sync_on_write: bool,
}

impl LogOptions {
    /// Options for a broker log opened with `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            cookie: RECORD_FORMAT_VERSION,
            checkpoint_size: config.checkpoint_size(),
            record_threshold: config.checkpoint_record_threshold,
            sync_on_write: config.sync_on_write,
        }
    }
}

#[derive(Debug)]
struct LogState {
    header: LogHeader,
    next_sequence: SequenceNumber,
    size: u64,
    records: u64,
    playback_required: bool,
    checkpoint_requested: bool,
    closed: bool,
}

/// Append-only log of transaction records.
///
/// ```text
/// | header | record | record | ... |
/// record: | length (4) | type (4) | sequence (8) | body | crc32 (4) |
/// ```
///
/// A checkpoint truncates the log back to its header. The header status
/// tells a restart whether the previous owner closed the log cleanly.
pub struct TransactionLog {
    backend: Mutex<Box<dyn StorageBackend>>,
    state: Mutex<LogState>,
    listener: RwLock<Option<Arc<dyn CheckpointListener>>>,
    options: LogOptions,
    warnings: Mutex<Vec<CorruptionWarning>>,
}

impl TransactionLog {
    /// Opens a log, writing a fresh header if the backend is empty.
    ///
    /// A torn or damaged tail left by a crash is cut off and reported as a
    /// warning (see [`take_warnings`](Self::take_warnings)).
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidFormat`] if the header belongs to another record
    /// format; [`CoreError::LogCorruption`] if the header is damaged.
    pub fn open(mut backend: Box<dyn StorageBackend>, options: LogOptions) -> CoreResult<Self> {
        let mut size = backend.size()?;
        let mut warnings = Vec::new();

        if size > 0 && size < LOG_HEADER_SIZE {
            // Only a crash while creating the log leaves a partial header.
            warn!(size, "transaction log header incomplete, recreating the log");
            backend.truncate(0)?;
            size = 0;
        }

        if size == 0 {
            let header = LogHeader::new(options.cookie);
            backend.append(&header.encode())?;
            backend.sync()?;
            debug!(cookie = options.cookie, "created transaction log");
            return Ok(Self::with_state(
                backend,
                options,
                LogState {
                    header,
                    next_sequence: header.checkpoint_seq,
                    size: LOG_HEADER_SIZE,
                    records: 0,
                    playback_required: false,
                    checkpoint_requested: false,
                    closed: false,
                },
                warnings,
            ));
        }

        let header = LogHeader::decode(&backend.read_at(0, LOG_HEADER_SIZE as usize)?)?;
        if header.cookie != options.cookie {
            return Err(CoreError::invalid_format(format!(
                "transaction log cookie {} does not match record format {}",
                header.cookie, options.cookie
            )));
        }

        let backend = Mutex::new(backend);
        let summary = scan(LogIterator::new(backend.lock())?);
        let mut backend = backend.into_inner();
        if let Some(reason) = &summary.stopped_by {
            let warning = CorruptionWarning::new(
                format!("txnlog@{}", summary.valid_end),
                format!("{reason}; discarding the rest of the log"),
            );
            warn!(%warning, "transaction log tail discarded");
            backend.truncate(summary.valid_end)?;
            backend.sync()?;
            warnings.push(warning);
        }

        let found_status = header.status;
        let clean = found_status == LogStatus::CleanShutdown;
        let playback_required = !clean || summary.records > 0;
        let next_sequence = summary
            .last_sequence
            .map_or(header.checkpoint_seq, SequenceNumber::next);

        // Mark the log in use so a crash from here on is detected.
        let mut header = header;
        if clean {
            header.status = LogStatus::Checkpointed;
            backend.write_at(0, &header.encode())?;
            backend.sync()?;
        }

        info!(
            status = %found_status,
            records = summary.records,
            playback_required,
            "opened transaction log"
        );
        Ok(Self::with_state(
            backend,
            options,
            LogState {
                header,
                next_sequence,
                size: summary.valid_end,
                records: summary.records,
                playback_required,
                checkpoint_requested: false,
                closed: false,
            },
            warnings,
        ))
    }

    fn with_state(
        backend: Box<dyn StorageBackend>,
        options: LogOptions,
        state: LogState,
        warnings: Vec<CorruptionWarning>,
    ) -> Self {
        Self {
            backend: Mutex::new(backend),
            state: Mutex::new(state),
            listener: RwLock::new(None),
            options,
            warnings: Mutex::new(warnings),
        }
    }

    /// Installs the receiver of threshold callbacks.
    pub fn set_listener(&self, listener: Arc<dyn CheckpointListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Returns and clears the warnings found when the log was opened.
    pub fn take_warnings(&self) -> Vec<CorruptionWarning> {
        std::mem::take(&mut *self.warnings.lock())
    }

    /// Appends an event.
    pub fn append_event(&self, event: &LogEvent) -> CoreResult<SequenceNumber> {
        self.append(event.record_type(), &event.encode()?)
    }

    /// Appends a record and returns its sequence number.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidOperation`] while the log still needs to be
    /// replayed; [`CoreError::Closed`] after [`close`](Self::close).
    pub fn append(&self, record_type: LogRecordType, body: &[u8]) -> CoreResult<SequenceNumber> {
        let (reason, sequence) = {
            let mut backend = self.backend.lock();
            let mut state = self.state.lock();
            if state.closed {
                return Err(CoreError::Closed);
            }
            if state.playback_required {
                return Err(CoreError::invalid_operation(
                    "transaction log must be replayed before new records are appended",
                ));
            }

            let sequence = state.next_sequence;
            let data = encode_envelope(record_type, sequence, body)?;
            backend.append(&data)?;
            if self.options.sync_on_write {
                backend.sync()?;
            } else {
                backend.flush()?;
            }

            state.next_sequence = sequence.next();
            state.size += data.len() as u64;
            state.records += 1;

            let reason = self.threshold_crossed(&state);
            if reason.is_some() {
                state.checkpoint_requested = true;
            }
            (reason, sequence)
        };

        if let Some(reason) = reason {
            debug!(?reason, "transaction log requests a checkpoint");
            if let Some(listener) = self.listener.read().clone() {
                listener.checkpoint_requested(reason);
            }
        }
        Ok(sequence)
    }

    fn threshold_crossed(&self, state: &LogState) -> Option<CheckpointReason> {
        if state.checkpoint_requested {
            return None;
        }
        if state.size >= self.options.checkpoint_size {
            Some(CheckpointReason::Size)
        } else if self.options.record_threshold > 0 && state.records >= self.options.record_threshold
        {
            Some(CheckpointReason::RecordCount)
        } else {
            None
        }
    }

    /// Returns a streaming iterator over every record since the last reset.
    ///
    /// Appends block until the iterator is dropped.
    pub fn iter(&self) -> CoreResult<LogIterator<'_>> {
        LogIterator::new(self.backend.lock())
    }

    /// True until the records left by an unclean shutdown have been
    /// replayed and the log reset.
    pub fn playback_required(&self) -> bool {
        self.state.lock().playback_required
    }

    /// Truncates the log to its header and starts a new generation.
    pub fn reset(&self) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        let mut state = self.state.lock();
        if state.closed {
            return Err(CoreError::Closed);
        }

        let mut header = state.header;
        header.status = LogStatus::Checkpointed;
        header.checkpoint_seq = state.next_sequence;
        header.cookie = self.options.cookie;

        backend.write_at(0, &header.encode())?;
        backend.truncate(LOG_HEADER_SIZE)?;
        backend.sync()?;

        debug!(
            discarded = state.records,
            checkpoint_seq = %header.checkpoint_seq,
            "transaction log reset"
        );
        state.header = header;
        state.size = LOG_HEADER_SIZE;
        state.records = 0;
        state.playback_required = false;
        state.checkpoint_requested = false;
        Ok(())
    }

    /// Marks the log cleanly shut down. No appends are accepted afterwards.
    pub fn close(&self) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        let mut header = state.header;
        header.status = LogStatus::CleanShutdown;
        backend.write_at(0, &header.encode())?;
        backend.sync()?;
        state.header = header;
        state.closed = true;
        info!(records = state.records, "transaction log closed cleanly");
        Ok(())
    }

    /// Current header.
    pub fn header(&self) -> LogHeader {
        self.state.lock().header
    }

    /// Size of the log in bytes.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Records since the last reset.
    pub fn record_count(&self) -> u64 {
        self.state.lock().records
    }

    /// Sequence number the next record will get.
    pub fn next_sequence(&self) -> SequenceNumber {
        self.state.lock().next_sequence
    }

    /// Syncs the log to durable storage.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.lock().sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionLog")
            .field("status", &state.header.status)
            .field("size", &state.size)
            .field("records", &state.records)
            .field("playback_required", &state.playback_required)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DestinationId, MessageId};
    use brokerlog_storage::InMemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn options() -> LogOptions {
        LogOptions {
            cookie: 1,
            checkpoint_size: 1024 * 1024,
            record_threshold: 0,
            sync_on_write: true,
        }
    }

    fn removal(id: u64) -> LogEvent {
        LogEvent::MessageRemoval {
            destination: DestinationId::queue("q"),
            message_id: MessageId::new(id),
        }
    }

    fn open(backend: &InMemoryBackend, options: LogOptions) -> TransactionLog {
        TransactionLog::open(Box::new(backend.clone()), options).unwrap()
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl CheckpointListener for Counter {
        fn checkpoint_requested(&self, _reason: CheckpointReason) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn fresh_log_needs_no_playback() {
        let backend = InMemoryBackend::new();
        let log = open(&backend, options());
        assert!(!log.playback_required());
        assert_eq!(log.header().status, LogStatus::Created);
        assert_eq!(backend.size().unwrap(), LOG_HEADER_SIZE);
    }

    #[test]
    fn records_survive_unclean_reopen() {
        let backend = InMemoryBackend::new();
        {
            let log = open(&backend, options());
            assert_eq!(log.append_event(&removal(1)).unwrap(), SequenceNumber::new(1));
            assert_eq!(log.append_event(&removal(2)).unwrap(), SequenceNumber::new(2));
        }
        let log = open(&backend, options());
        assert!(log.playback_required());
        assert_eq!(log.record_count(), 2);
        assert_eq!(log.next_sequence(), SequenceNumber::new(3));

        let events: Vec<LogEvent> = log
            .iter()
            .unwrap()
            .map(|r| r.unwrap().1.event().unwrap())
            .collect();
        assert_eq!(events, vec![removal(1), removal(2)]);
    }

    #[test]
    fn appends_refused_until_reset() {
        let backend = InMemoryBackend::new();
        {
            let log = open(&backend, options());
            log.append_event(&removal(1)).unwrap();
        }
        let log = open(&backend, options());
        assert!(matches!(
            log.append_event(&removal(2)),
            Err(CoreError::InvalidOperation { .. })
        ));
        log.reset().unwrap();
        assert_eq!(log.append_event(&removal(2)).unwrap(), SequenceNumber::new(2));
    }

    #[test]
    fn reset_truncates_and_keeps_sequence_monotonic() {
        let backend = InMemoryBackend::new();
        let log = open(&backend, options());
        for i in 0..5 {
            log.append_event(&removal(i)).unwrap();
        }
        log.reset().unwrap();
        assert_eq!(backend.size().unwrap(), LOG_HEADER_SIZE);
        assert_eq!(log.record_count(), 0);
        assert_eq!(log.header().status, LogStatus::Checkpointed);
        assert_eq!(log.header().checkpoint_seq, SequenceNumber::new(6));
        assert_eq!(log.iter().unwrap().count(), 0);
        assert_eq!(log.append_event(&removal(9)).unwrap(), SequenceNumber::new(6));
    }

    #[test]
    fn clean_close_skips_playback() {
        let backend = InMemoryBackend::new();
        {
            let log = open(&backend, options());
            log.append_event(&removal(1)).unwrap();
            log.reset().unwrap();
            log.close().unwrap();
            assert!(matches!(log.append_event(&removal(2)), Err(CoreError::Closed)));
        }
        let log = open(&backend, options());
        assert!(!log.playback_required());
        // Reopening marks the log in use again.
        drop(log);
        let log = open(&backend, options());
        assert!(log.playback_required());
    }

    #[test]
    fn cookie_mismatch_is_fatal() {
        let backend = InMemoryBackend::new();
        drop(open(&backend, options()));
        let result = TransactionLog::open(
            Box::new(backend.clone()),
            LogOptions {
                cookie: 2,
                ..options()
            },
        );
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn damaged_tail_is_cut_with_warning() {
        let backend = InMemoryBackend::new();
        let second;
        {
            let log = open(&backend, options());
            log.append_event(&removal(1)).unwrap();
            second = log.size();
            log.append_event(&removal(2)).unwrap();
        }
        backend.poke(second as usize + 20, 0xEE);

        let log = open(&backend, options());
        let warnings = log.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(log.record_count(), 1);
        assert_eq!(backend.size().unwrap(), second);
    }

    #[test]
    fn size_threshold_fires_once_per_generation() {
        let backend = InMemoryBackend::new();
        let log = open(
            &backend,
            LogOptions {
                checkpoint_size: LOG_HEADER_SIZE + 100,
                ..options()
            },
        );
        let counter = Arc::new(Counter::default());
        log.set_listener(counter.clone());

        for i in 0..10 {
            log.append_event(&removal(i)).unwrap();
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        log.reset().unwrap();
        for i in 0..10 {
            log.append_event(&removal(i)).unwrap();
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn record_threshold_fires() {
        let backend = InMemoryBackend::new();
        let log = open(
            &backend,
            LogOptions {
                record_threshold: 3,
                ..options()
            },
        );
        let counter = Arc::new(Counter::default());
        log.set_listener(counter.clone());
        log.append_event(&removal(1)).unwrap();
        log.append_event(&removal(2)).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        log.append_event(&removal(3)).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
