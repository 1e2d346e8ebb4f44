//! Dump-log command implementation.

use super::{open_log_copy, OutputFormat};
use brokerlog_core::{LogEvent, LogRecord};
use serde::Serialize;
use std::path::Path;

/// One log record as printed.
#[derive(Debug, Serialize)]
pub struct LogRecordInfo {
    /// Offset in the log file.
    pub offset: u64,
    /// Sequence number.
    pub sequence: u64,
    /// Record type.
    pub record_type: String,
    /// Body size in bytes.
    pub body_size: usize,
    /// Decoded event, or the decode error.
    pub summary: String,
    /// Whether the body decoded.
    pub decoded: bool,
}

impl LogRecordInfo {
    fn new(offset: u64, record: &LogRecord) -> Self {
        let (summary, decoded) = match LogEvent::decode(record.record_type, &record.body) {
            Ok(event) => (event.summary(), true),
            Err(e) => (format!("undecodable: {e}"), false),
        };
        Self {
            offset,
            sequence: record.sequence.as_u64(),
            record_type: record.record_type.to_string(),
            body_size: record.body.len(),
            summary,
            decoded,
        }
    }
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let log = open_log_copy(path)?;
    let mut records = Vec::new();
    for item in log.iter()?.take(limit.unwrap_or(usize::MAX)) {
        let (offset, record) = item?;
        records.push(LogRecordInfo::new(offset, &record));
    }
    let warnings = log.take_warnings();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Text => {
            println!(
                "{:>10}  {:>8}  {:<28}  {:>6}  SUMMARY",
                "OFFSET", "SEQ", "TYPE", "BYTES"
            );
            for r in &records {
                println!(
                    "{:>10}  {:>8}  {:<28}  {:>6}  {}",
                    r.offset, r.sequence, r.record_type, r.body_size, r.summary
                );
            }
            println!();
            println!("{} records", records.len());
            for warning in &warnings {
                println!("warning: {warning}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use brokerlog_core::{DestinationId, LogRecordType, MessageId, SequenceNumber};

    #[test]
    fn info_carries_the_event_summary() {
        let event = LogEvent::MessageRemoval {
            destination: DestinationId::queue("q"),
            message_id: MessageId::new(3),
        };
        let record = LogRecord {
            sequence: SequenceNumber::new(7),
            record_type: event.record_type(),
            body: event.encode().unwrap(),
        };
        let info = LogRecordInfo::new(28, &record);
        assert!(info.decoded);
        assert_eq!(info.sequence, 7);
        assert_eq!(info.summary, event.summary());
    }

    #[test]
    fn undecodable_body_is_reported() {
        let record = LogRecord {
            sequence: SequenceNumber::new(1),
            record_type: LogRecordType::TransactionPrepare,
            body: vec![0xff, 0x00],
        };
        let info = LogRecordInfo::new(28, &record);
        assert!(!info.decoded);
        assert!(info.summary.starts_with("undecodable"));
    }
}
