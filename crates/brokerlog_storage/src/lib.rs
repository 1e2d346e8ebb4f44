//! # brokerlog storage
//!
//! Byte-level storage backends used by the broker's transaction log and
//! prepared-transaction record store.
//!
//! Backends are **opaque byte stores**. They know nothing about log headers,
//! record tags or transaction encodings; `brokerlog_core` owns every file
//! format.
//!
//! Two access patterns are supported:
//!
//! - append-only writes (the transaction log)
//! - positioned overwrites via [`StorageBackend::write_at`] (record tags and
//!   client-data regions in the record store)
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - tests and crash simulations
//! - [`FileBackend`] - persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use brokerlog_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"GOOD....").unwrap();
//! backend.write_at(offset, b"FREE").unwrap();
//! assert_eq!(backend.read_at(0, 4).unwrap(), b"FREE");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
