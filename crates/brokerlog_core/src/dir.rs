//! Broker directory management.
//!
//! ```text
//! <broker_dir>/
//! ├─ LOCK                       # advisory lock, single owner
//! ├─ txnlog                     # transaction log
//! ├─ incompleteTxnStore/        # prepared transaction store
//! │   ├─ vrfile
//! │   └─ 1, 2, ...              # overflow record files
//! ├─ convertingToTxnLogMode     # migration markers (zero bytes)
//! └─ convertingFromTxnLogMode
//! ```
//!
//! Brokers that predate the log kept transaction state in the `txn` and
//! `txnack` tables. Both layouts may only coexist while a migration marker
//! says a conversion is in progress.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const LOCK_FILE: &str = "LOCK";
/// File name of the transaction log inside a broker directory.
pub const TXN_LOG_FILE: &str = "txnlog";
/// Directory name of the prepared transaction store.
pub const PREPARED_STORE_DIR: &str = "incompleteTxnStore";
const LEGACY_TABLES: [&str; 2] = ["txn", "txnack"];

/// Direction of a migration between the legacy tables and the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionDirection {
    /// Legacy tables are being converted into the log.
    ToTxnLog,
    /// The log is being converted back into legacy tables.
    FromTxnLog,
}

impl ConversionDirection {
    /// File name of the marker for this direction.
    #[must_use]
    pub const fn marker_name(self) -> &'static str {
        match self {
            Self::ToTxnLog => "convertingToTxnLogMode",
            Self::FromTxnLog => "convertingFromTxnLogMode",
        }
    }
}

impl fmt::Display for ConversionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ToTxnLog => "to transaction log",
            Self::FromTxnLog => "from transaction log",
        })
    }
}

/// An exclusively locked broker directory.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens a broker directory and takes its lock.
    ///
    /// # Errors
    ///
    /// - `InvalidFormat` if the directory is missing and `create_if_missing`
    ///   is false, or the path is not a directory
    /// - `StoreLocked` if another process holds the directory
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "broker directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StoreLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the transaction log.
    #[must_use]
    pub fn txn_log_path(&self) -> PathBuf {
        self.path.join(TXN_LOG_FILE)
    }

    /// Directory of the prepared transaction store.
    #[must_use]
    pub fn prepared_store_dir(&self) -> PathBuf {
        self.path.join(PREPARED_STORE_DIR)
    }

    /// Returns true if either legacy transaction table exists.
    #[must_use]
    pub fn has_legacy_tables(&self) -> bool {
        LEGACY_TABLES.iter().any(|t| self.path.join(t).exists())
    }

    /// Returns true if the transaction log exists.
    #[must_use]
    pub fn has_txn_log(&self) -> bool {
        self.txn_log_path().exists()
    }

    /// Writes the marker for a conversion about to start.
    pub fn begin_conversion(&self, direction: ConversionDirection) -> CoreResult<()> {
        File::create(self.path.join(direction.marker_name()))?.sync_all()?;
        sync_directory(&self.path)?;
        info!(%direction, "conversion started");
        Ok(())
    }

    /// Removes the marker once a conversion is complete.
    pub fn finish_conversion(&self, direction: ConversionDirection) -> CoreResult<()> {
        remove_if_present(&self.path.join(direction.marker_name()))?;
        sync_directory(&self.path)?;
        info!(%direction, "conversion finished");
        Ok(())
    }

    /// Returns the conversion left unfinished by a previous run, if any.
    ///
    /// Both markers at once cannot be produced by a single conversion and
    /// are reported as `InvalidFormat`.
    pub fn pending_conversion(&self) -> CoreResult<Option<ConversionDirection>> {
        let to = self.path.join(ConversionDirection::ToTxnLog.marker_name()).exists();
        let from = self.path.join(ConversionDirection::FromTxnLog.marker_name()).exists();
        match (to, from) {
            (true, true) => Err(CoreError::invalid_format(
                "both conversion markers are present",
            )),
            (true, false) => Ok(Some(ConversionDirection::ToTxnLog)),
            (false, true) => Ok(Some(ConversionDirection::FromTxnLog)),
            (false, false) => Ok(None),
        }
    }

    /// Deletes whatever an interrupted conversion built, so it can be redone
    /// from the source format.
    pub fn discard_partial_conversion(&self, direction: ConversionDirection) -> CoreResult<()> {
        match direction {
            ConversionDirection::ToTxnLog => {
                remove_if_present(&self.txn_log_path())?;
                let store = self.prepared_store_dir();
                if store.exists() {
                    fs::remove_dir_all(&store)?;
                }
            }
            ConversionDirection::FromTxnLog => {
                for table in LEGACY_TABLES {
                    remove_if_present(&self.path.join(table))?;
                }
            }
        }
        sync_directory(&self.path)?;
        warn!(%direction, "discarded partial conversion");
        Ok(())
    }

    /// Fails if log-based and table-based state coexist outside a
    /// conversion.
    pub fn check_format_consistency(&self) -> CoreResult<()> {
        if self.pending_conversion()?.is_none() && self.has_legacy_tables() && self.has_txn_log() {
            return Err(CoreError::dual_format(format!(
                "{} holds both a transaction log and legacy transaction tables",
                self.path.display()
            )));
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> CoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Syncs a directory so created, renamed and deleted entries are durable.
#[cfg(unix)]
pub(crate) fn sync_directory(path: &Path) -> CoreResult<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

/// NTFS journals metadata; there is no directory handle to sync.
#[cfg(not(unix))]
pub(crate) fn sync_directory(_path: &Path) -> CoreResult<()> {
    Ok(())
}
