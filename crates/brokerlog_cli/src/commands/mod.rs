//! CLI command implementations.

pub mod dump_log;
pub mod inspect;
pub mod verify;

use brokerlog_core::{Config, LogOptions, TransactionLog, TXN_LOG_FILE};
use brokerlog_storage::InMemoryBackend;
use std::path::Path;

/// How command results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Opens a copy of the broker's transaction log.
///
/// Opening a log cuts a damaged tail and marks the header in use, so the
/// tools work on an in-memory copy and leave the file as they found it.
pub fn open_log_copy(dir: &Path) -> Result<TransactionLog, Box<dyn std::error::Error>> {
    let log_path = dir.join(TXN_LOG_FILE);
    if !log_path.exists() {
        return Err(format!("No transaction log found at {}", log_path.display()).into());
    }
    let copy = InMemoryBackend::with_data(std::fs::read(&log_path)?);
    let options = LogOptions::from_config(&Config::default().sync_on_write(false));
    Ok(TransactionLog::open(Box::new(copy), options)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use brokerlog_core::{DestinationId, LogEvent, MessageId};

    #[test]
    fn copy_leaves_the_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join(TXN_LOG_FILE);
        {
            let backend = brokerlog_storage::FileBackend::open(&log_path).unwrap();
            let log = TransactionLog::open(
                Box::new(backend),
                LogOptions::from_config(&Config::default()),
            )
            .unwrap();
            log.append_event(&LogEvent::MessageRemoval {
                destination: DestinationId::queue("q"),
                message_id: MessageId::new(1),
            })
            .unwrap();
        }
        let before = std::fs::read(&log_path).unwrap();
        let mut torn = before.clone();
        torn.truncate(before.len() - 2);
        std::fs::write(&log_path, &torn).unwrap();

        let log = open_log_copy(dir.path()).unwrap();
        assert_eq!(log.record_count(), 0);
        assert_eq!(log.take_warnings().len(), 1);
        assert_eq!(std::fs::read(&log_path).unwrap(), torn);
    }

    #[test]
    fn missing_log_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_log_copy(dir.path()).is_err());
    }
}
