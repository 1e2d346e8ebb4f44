//! Crash simulation for the transaction log.
//!
//! [`CrashableBackend`] wraps an [`InMemoryBackend`] and starts failing
//! writes once a byte budget is spent. An append that crosses the budget is
//! torn: the bytes before the crash point land, the rest do not. Positioned
//! writes are small header rewrites and land whole or not at all, like a
//! sector write.
//!
//! Clones share the data and the crash state, so a test can keep a handle,
//! let the manager crash, and reopen over the surviving bytes.
//!
//! ```rust,ignore
//! let backend = CrashableBackend::new();
//! backend.crash_after(40);
//! // ... drive a manager until a write fails ...
//! let survivor = backend.surviving_data();
//! ```

use brokerlog_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct CrashState {
    budget: AtomicU64,
    written: AtomicU64,
    crashed: AtomicBool,
    fail_sync: AtomicBool,
}

/// A storage backend that can simulate a power cut.
#[derive(Debug, Clone)]
pub struct CrashableBackend {
    inner: InMemoryBackend,
    state: Arc<CrashState>,
}

impl Default for CrashableBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashableBackend {
    /// Creates an empty backend that never crashes until told to.
    pub fn new() -> Self {
        Self::wrap(InMemoryBackend::new())
    }

    /// Wraps existing data.
    pub fn wrap(inner: InMemoryBackend) -> Self {
        Self {
            inner,
            state: Arc::new(CrashState {
                budget: AtomicU64::new(u64::MAX),
                written: AtomicU64::new(0),
                crashed: AtomicBool::new(false),
                fail_sync: AtomicBool::new(false),
            }),
        }
    }

    /// Crashes once `bytes` more bytes have been written.
    pub fn crash_after(&self, bytes: u64) {
        let written = self.state.written.load(Ordering::SeqCst);
        self.state
            .budget
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Crashes now; every later write fails.
    pub fn crash_now(&self) {
        self.state.crashed.store(true, Ordering::SeqCst);
    }

    /// Makes `sync` and `flush` fail without crashing.
    pub fn set_fail_sync(&self, fail: bool) {
        self.state.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Returns true once a simulated crash happened.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// Bytes written through this backend so far.
    pub fn bytes_written(&self) -> u64 {
        self.state.written.load(Ordering::SeqCst)
    }

    /// A fresh, healthy backend over a copy of the bytes that reached the
    /// medium.
    pub fn surviving_data(&self) -> InMemoryBackend {
        InMemoryBackend::with_data(self.inner.data())
    }

    fn crash_error(what: &str) -> StorageError {
        StorageError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("simulated crash during {what}"),
        ))
    }

    /// Charges `len` bytes against the budget. Returns how many may still
    /// be written, or an error if the crash already happened.
    fn charge(&self, len: usize, what: &str) -> StorageResult<usize> {
        if self.has_crashed() {
            return Err(Self::crash_error(what));
        }
        let len = len as u64;
        let before = self.state.written.fetch_add(len, Ordering::SeqCst);
        let budget = self.state.budget.load(Ordering::SeqCst);
        if before.saturating_add(len) <= budget {
            return Ok(len as usize);
        }
        self.state.crashed.store(true, Ordering::SeqCst);
        Ok(budget.saturating_sub(before) as usize)
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let allowed = self.charge(data.len(), "append")?;
        if allowed < data.len() {
            if allowed > 0 {
                self.inner.append(&data[..allowed])?;
            }
            return Err(Self::crash_error("append"));
        }
        self.inner.append(data)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if self.charge(data.len(), "write")? < data.len() {
            return Err(Self::crash_error("write"));
        }
        self.inner.write_at(offset, data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.has_crashed() || self.state.fail_sync.load(Ordering::SeqCst) {
            return Err(Self::crash_error("flush"));
        }
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.has_crashed() || self.state.fail_sync.load(Ordering::SeqCst) {
            return Err(Self::crash_error("sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        if self.has_crashed() {
            return Err(Self::crash_error("truncate"));
        }
        self.inner.truncate(new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_pass_through_until_the_budget() {
        let mut backend = CrashableBackend::new();
        backend.append(b"hello").unwrap();
        backend.crash_after(3);
        assert!(backend.append(b"world").is_err());
        assert!(backend.has_crashed());
        assert_eq!(backend.surviving_data().data(), b"hellowor");
        assert!(backend.append(b"!").is_err());
        assert!(backend.sync().is_err());
    }

    #[test]
    fn clones_share_the_crash() {
        let backend = CrashableBackend::new();
        let mut other = backend.clone();
        backend.crash_now();
        assert!(other.append(b"x").is_err());
    }

    #[test]
    fn positioned_writes_are_all_or_nothing() {
        let mut backend = CrashableBackend::new();
        backend.append(b"aaaa").unwrap();
        backend.crash_after(2);
        assert!(backend.write_at(0, b"bbbb").is_err());
        assert_eq!(backend.surviving_data().data(), b"aaaa");
    }

    #[test]
    fn surviving_data_is_writable() {
        let mut backend = CrashableBackend::new();
        backend.append(b"abc").unwrap();
        backend.crash_now();
        let mut survivor = backend.surviving_data();
        survivor.append(b"d").unwrap();
        assert_eq!(survivor.data(), b"abcd");
    }

    #[test]
    fn failing_sync_does_not_crash() {
        let mut backend = CrashableBackend::new();
        backend.set_fail_sync(true);
        assert!(backend.sync().is_err());
        assert!(!backend.has_crashed());
        backend.set_fail_sync(false);
        backend.append(b"ok").unwrap();
        backend.sync().unwrap();
    }
}
