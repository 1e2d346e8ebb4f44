//! Verify command implementation.
//!
//! Nothing on disk is changed: the log is checked through an in-memory copy
//! and the prepared store through [`RecordStore::verify`].

use super::open_log_copy;
use brokerlog_core::{LogEvent, RecordStore, PREPARED_STORE_DIR, RECORD_FORMAT_VERSION};
use std::path::Path;

/// Verification result for one component.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of records checked.
    pub records_checked: usize,
    /// Number of records that decoded.
    pub valid_records: usize,
    /// Problems found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying broker directory {}", path.display());
    println!();

    println!("Checking transaction log...");
    let log_result = verify_log(path);
    print_result("Log", &log_result);

    let store_dir = path.join(PREPARED_STORE_DIR);
    let mut store_result = VerifyResult::default();
    if store_dir.is_dir() {
        println!("Checking prepared transaction store...");
        store_result = verify_store(&store_dir);
        print_result("Prepared store", &store_result);
    } else {
        println!("Prepared store not found (normal before the first checkpoint)");
    }

    println!();
    if log_result.is_ok() && store_result.is_ok() {
        println!("✓ Verification passed");
        Ok(())
    } else {
        println!("✗ Verification failed");
        Err("Verification failed".into())
    }
}

fn verify_log(path: &Path) -> VerifyResult {
    let mut result = VerifyResult::default();
    let log = match open_log_copy(path) {
        Ok(log) => log,
        Err(e) => {
            result.errors.push(e.to_string());
            return result;
        }
    };
    let iter = match log.iter() {
        Ok(iter) => iter,
        Err(e) => {
            result.errors.push(e.to_string());
            return result;
        }
    };
    for item in iter {
        result.records_checked += 1;
        match item {
            Ok((offset, record)) => match LogEvent::decode(record.record_type, &record.body) {
                Ok(_) => result.valid_records += 1,
                Err(e) => result
                    .errors
                    .push(format!("record at offset {offset} does not decode: {e}")),
            },
            Err(e) => result.errors.push(e.to_string()),
        }
    }
    result
        .errors
        .extend(log.take_warnings().into_iter().map(|w| w.to_string()));
    result
}

fn verify_store(dir: &Path) -> VerifyResult {
    let mut result = VerifyResult::default();
    match RecordStore::verify(dir, RECORD_FORMAT_VERSION) {
        Ok(warnings) => result
            .errors
            .extend(warnings.into_iter().map(|w| w.to_string())),
        Err(e) => result.errors.push(e.to_string()),
    }
    result
}

fn print_result(name: &str, result: &VerifyResult) {
    if result.records_checked > 0 {
        println!(
            "  {name}: {}/{} records valid",
            result.valid_records, result.records_checked
        );
    }
    if result.is_ok() {
        println!("  {name}: OK");
    } else {
        for error in &result.errors {
            println!("  {name}: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brokerlog_core::{Config, LogOptions, TransactionLog, TXN_LOG_FILE};
    use brokerlog_storage::FileBackend;

    fn write_log(dir: &Path) {
        let backend = FileBackend::open(&dir.join(TXN_LOG_FILE)).unwrap();
        TransactionLog::open(Box::new(backend), LogOptions::from_config(&Config::default()))
            .unwrap();
    }

    #[test]
    fn empty_log_verifies() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path());
        let result = verify_log(dir.path());
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.records_checked, 0);
    }

    #[test]
    fn foreign_header_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TXN_LOG_FILE), vec![0x5a; 64]).unwrap();
        assert!(!verify_log(dir.path()).is_ok());
    }
}
