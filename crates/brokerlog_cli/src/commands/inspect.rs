//! Inspect command implementation.

use super::{open_log_copy, OutputFormat};
use brokerlog_core::{
    Config, LogEvent, LogRecordType, PreparedTransactionStore, StoreDir, TransactionRecord,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Broker directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Broker directory.
    pub path: String,
    /// Log file size in bytes.
    pub log_size: u64,
    /// Header status.
    pub log_status: String,
    /// Sequence number the current log generation starts at.
    pub checkpoint_seq: u64,
    /// Record format cookie.
    pub cookie: u64,
    /// Whether a broker start would replay the log.
    pub playback_required: bool,
    /// Records by type.
    pub records: BTreeMap<String, u64>,
    /// Damage found in the log tail.
    pub log_warnings: Vec<String>,
    /// Migration in progress, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_conversion: Option<String>,
    /// Prepared transactions by kind and state.
    pub prepared: BTreeMap<String, usize>,
    /// Every prepared transaction (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transactions: Option<Vec<PreparedSummary>>,
}

/// One prepared transaction.
#[derive(Debug, Serialize)]
pub struct PreparedSummary {
    /// Transaction id.
    pub id: u64,
    /// Transaction kind.
    pub kind: String,
    /// Transaction state.
    pub state: String,
    /// Whether nothing more is outstanding.
    pub complete: bool,
    /// Messages sent.
    pub sent: usize,
    /// Acknowledgements, including relayed ones.
    pub acks: usize,
    /// Participants that confirmed, out of all participants.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<(usize, usize)>,
}

impl From<&TransactionRecord> for PreparedSummary {
    fn from(txn: &TransactionRecord) -> Self {
        let participants = txn.participants();
        Self {
            id: txn.id.as_u64(),
            kind: txn.kind().to_string(),
            state: txn.state.to_string(),
            complete: txn.complete,
            sent: txn.workload.sent.len(),
            acks: txn.workload.acks.len() + txn.remote_acks().len(),
            participants: (!participants.is_empty()).then(|| {
                (
                    participants.iter().filter(|p| p.completed).count(),
                    participants.len(),
                )
            }),
        }
    }
}

/// Runs the inspect command.
///
/// Takes the directory lock, so it fails while a broker owns the directory.
pub fn run(
    path: &Path,
    show_transactions: bool,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = StoreDir::open(path, false)?;
    let log = open_log_copy(path)?;
    let header = log.header();

    let mut records: BTreeMap<String, u64> = LogRecordType::ALL
        .iter()
        .map(|t| (t.to_string(), 0))
        .collect();
    for item in log.iter()? {
        let (_, record) = item?;
        *records.entry(record.record_type.to_string()).or_default() += 1;
        // An undecodable body would be skipped by replay; count it apart.
        if LogEvent::decode(record.record_type, &record.body).is_err() {
            *records.entry("UNDECODABLE".to_string()).or_default() += 1;
        }
    }

    let store = PreparedTransactionStore::open(&dir.prepared_store_dir(), &Config::default())?;
    let loaded = store.load()?;
    let mut prepared = BTreeMap::new();
    for txn in &loaded.transactions {
        *prepared
            .entry(format!("{} {}", txn.kind(), txn.state))
            .or_default() += 1;
    }

    let result = InspectResult {
        path: path.display().to_string(),
        log_size: log.size(),
        log_status: header.status.to_string(),
        checkpoint_seq: header.checkpoint_seq.as_u64(),
        cookie: header.cookie,
        playback_required: log.playback_required(),
        records,
        log_warnings: log
            .take_warnings()
            .into_iter()
            .chain(loaded.warnings)
            .map(|w| w.to_string())
            .collect(),
        pending_conversion: dir.pending_conversion()?.map(|d| d.to_string()),
        prepared,
        transactions: show_transactions
            .then(|| loaded.transactions.iter().map(PreparedSummary::from).collect()),
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Broker Transaction Log Inspection");
    println!("=================================");
    println!();
    println!("Path: {}", result.path);
    if let Some(direction) = &result.pending_conversion {
        println!("Conversion in progress: {direction}");
    }
    println!();
    println!("Log:");
    println!("  Size:            {}", format_size(result.log_size));
    println!("  Status:          {}", result.log_status);
    println!("  Checkpoint seq:  {}", result.checkpoint_seq);
    println!("  Format cookie:   {}", result.cookie);
    println!("  Needs playback:  {}", result.playback_required);
    println!();
    println!("Records:");
    for (kind, count) in &result.records {
        println!("  {kind:<28} {count}");
    }
    println!();
    println!("Prepared transactions:");
    if result.prepared.is_empty() {
        println!("  (none)");
    }
    for (kind, count) in &result.prepared {
        println!("  {kind:<28} {count}");
    }

    if let Some(transactions) = &result.transactions {
        println!();
        for txn in transactions {
            let participants = txn
                .participants
                .map(|(done, all)| format!(" participants={done}/{all}"))
                .unwrap_or_default();
            println!(
                "  [{}] {} {} complete={} sent={} acks={}{}",
                txn.id, txn.kind, txn.state, txn.complete, txn.sent, txn.acks, participants
            );
        }
    }

    if !result.log_warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &result.log_warnings {
            println!("  {warning}");
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
