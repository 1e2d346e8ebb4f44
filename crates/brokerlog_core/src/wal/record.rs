//! Log header, record envelope and record bodies.

use crate::codec;
use crate::error::{CoreError, CoreResult};
use crate::transaction::{MessageAck, SentMessage, TransactionKind, TransactionRecord, TransactionState};
use crate::types::{DestinationId, MessageId, SequenceNumber, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Magic bytes at the start of the log file.
pub const LOG_MAGIC: [u8; 4] = *b"BTXL";

/// Current log layout version.
pub const LOG_VERSION: u16 = 1;

/// Size of the log header.
/// magic (4) + version (2) + status (2) + checkpoint_seq (8) + cookie (8) + crc (4)
pub const LOG_HEADER_SIZE: u64 = 28;

/// Envelope bytes around each record body.
/// length (4) + type (4) + sequence (8) before the body, crc (4) after it.
pub const ENVELOPE_HEADER_SIZE: usize = 16;

/// CRC size.
pub const CRC_SIZE: usize = 4;

/// Type of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LogRecordType {
    /// A two-phase transaction was prepared.
    TransactionPrepare = 1,
    /// A transaction committed or rolled back.
    TransactionComplete = 2,
    /// A message was sent outside any transaction.
    NonTransactedMessageSent = 3,
    /// A message was acknowledged outside any transaction.
    NonTransactedMessageAck = 4,
    /// A message was removed from its destination.
    MessageRemoval = 5,
}

impl LogRecordType {
    /// Every record type.
    pub const ALL: [Self; 5] = [
        Self::TransactionPrepare,
        Self::TransactionComplete,
        Self::NonTransactedMessageSent,
        Self::NonTransactedMessageAck,
        Self::MessageRemoval,
    ];

    /// Converts a raw value to a record type.
    pub fn from_u32(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_u32() == raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for LogRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TransactionPrepare => "prepare",
            Self::TransactionComplete => "complete",
            Self::NonTransactedMessageSent => "message-sent",
            Self::NonTransactedMessageAck => "message-ack",
            Self::MessageRemoval => "message-removal",
        })
    }
}

/// Decoded body of a log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEvent {
    /// Phase one of a two-phase transaction.
    Prepare {
        /// The prepared transaction with its workload.
        txn: TransactionRecord,
    },
    /// Outcome of a transaction.
    Complete {
        /// Transaction id.
        id: TransactionId,
        /// Coordinator that owns the transaction.
        kind: TransactionKind,
        /// New state.
        state: TransactionState,
        /// The whole transaction, for one-phase commits that had no
        /// prepare record.
        txn: Option<TransactionRecord>,
    },
    /// Non-transacted send.
    MessageSent {
        /// The message as routed.
        message: SentMessage,
    },
    /// Non-transacted acknowledgement.
    MessageAck {
        /// The acknowledgement.
        ack: MessageAck,
    },
    /// Removal of a message.
    MessageRemoval {
        /// Destination holding the message.
        destination: DestinationId,
        /// Removed message.
        message_id: MessageId,
    },
}

impl LogEvent {
    /// Returns the record type the event is logged under.
    #[must_use]
    pub fn record_type(&self) -> LogRecordType {
        match self {
            Self::Prepare { .. } => LogRecordType::TransactionPrepare,
            Self::Complete { .. } => LogRecordType::TransactionComplete,
            Self::MessageSent { .. } => LogRecordType::NonTransactedMessageSent,
            Self::MessageAck { .. } => LogRecordType::NonTransactedMessageAck,
            Self::MessageRemoval { .. } => LogRecordType::MessageRemoval,
        }
    }

    /// Encodes the event body.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        codec::encode(self)
    }

    /// Decodes an event body and checks it matches its envelope type.
    pub fn decode(record_type: LogRecordType, body: &[u8]) -> CoreResult<Self> {
        let event: Self = codec::decode(body)?;
        if event.record_type() != record_type {
            return Err(CoreError::log_corruption(format!(
                "{} body in a {} record",
                event.record_type(),
                record_type
            )));
        }
        Ok(event)
    }

    /// One-line description for tools.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Prepare { txn } => format!(
                "{} {} sent={} acks={}",
                txn.kind(),
                txn.id,
                txn.workload.sent.len(),
                txn.workload.acks.len()
            ),
            Self::Complete { id, kind, state, txn } => {
                let one_phase = if txn.is_some() { " one-phase" } else { "" };
                format!("{kind} {id} {state}{one_phase}")
            }
            Self::MessageSent { message } => format!(
                "{} -> {} interests={}",
                message.message_id,
                message.destination,
                message.interests.len()
            ),
            Self::MessageAck { ack } => {
                format!("{} on {} by {}", ack.message_id, ack.destination, ack.consumer)
            }
            Self::MessageRemoval {
                destination,
                message_id,
            } => format!("{message_id} from {destination}"),
        }
    }
}

/// A record read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Sequence number assigned at append.
    pub sequence: SequenceNumber,
    /// Record type.
    pub record_type: LogRecordType,
    /// Encoded body.
    pub body: Vec<u8>,
}

impl LogRecord {
    /// Decodes the body.
    pub fn event(&self) -> CoreResult<LogEvent> {
        LogEvent::decode(self.record_type, &self.body)
    }

    /// Total bytes the record occupies on disk.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ENVELOPE_HEADER_SIZE + self.body.len() + CRC_SIZE
    }
}

/// Builds the on-disk envelope for a record.
pub(crate) fn encode_envelope(
    record_type: LogRecordType,
    sequence: SequenceNumber,
    body: &[u8],
) -> CoreResult<Vec<u8>> {
    let len = u32::try_from(body.len())
        .map_err(|_| CoreError::invalid_operation("log record body too large"))?;
    let mut data = Vec::with_capacity(ENVELOPE_HEADER_SIZE + body.len() + CRC_SIZE);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&record_type.as_u32().to_le_bytes());
    data.extend_from_slice(&sequence.as_u64().to_le_bytes());
    data.extend_from_slice(body);
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Lifecycle status recorded in the log header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum LogStatus {
    /// Fresh log, never checkpointed.
    Created = 1,
    /// Reset by a checkpoint; records may follow.
    Checkpointed = 2,
    /// Closed cleanly by its owner.
    CleanShutdown = 3,
}

impl LogStatus {
    fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Created),
            2 => Some(Self::Checkpointed),
            3 => Some(Self::CleanShutdown),
            _ => None,
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "CREATED",
            Self::Checkpointed => "CHECKPOINTED",
            Self::CleanShutdown => "CLEAN_SHUTDOWN",
        })
    }
}

/// Header at the start of the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    /// Layout version.
    pub version: u16,
    /// Lifecycle status.
    pub status: LogStatus,
    /// Sequence number of the first record after the last reset.
    pub checkpoint_seq: SequenceNumber,
    /// Record format cookie.
    pub cookie: u64,
}

impl LogHeader {
    /// Creates a header for a fresh log.
    #[must_use]
    pub fn new(cookie: u64) -> Self {
        Self {
            version: LOG_VERSION,
            status: LogStatus::Created,
            checkpoint_seq: SequenceNumber::new(1),
            cookie,
        }
    }

    /// Serializes the header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LOG_HEADER_SIZE as usize);
        buf.extend_from_slice(&LOG_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(self.status as u16).to_le_bytes());
        buf.extend_from_slice(&self.checkpoint_seq.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.cookie.to_le_bytes());
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parses a header.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < LOG_HEADER_SIZE as usize {
            return Err(CoreError::log_corruption(format!(
                "header is {} bytes, need {LOG_HEADER_SIZE}",
                bytes.len()
            )));
        }
        if bytes[0..4] != LOG_MAGIC {
            return Err(CoreError::invalid_format("not a transaction log (bad magic)"));
        }
        let stored_crc = u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
        let computed = compute_crc32(&bytes[..24]);
        if stored_crc != computed {
            return Err(CoreError::log_corruption(format!(
                "header checksum mismatch: expected {stored_crc:08x}, got {computed:08x}"
            )));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version > LOG_VERSION {
            return Err(CoreError::invalid_format(format!(
                "log version {version} is newer than supported {LOG_VERSION}"
            )));
        }
        let raw_status = u16::from_le_bytes([bytes[6], bytes[7]]);
        let status = LogStatus::from_u16(raw_status)
            .ok_or_else(|| CoreError::log_corruption(format!("unknown log status {raw_status}")))?;

        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[8..16]);
        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&bytes[16..24]);
        Ok(Self {
            version,
            status,
            checkpoint_seq: SequenceNumber::new(u64::from_le_bytes(seq)),
            cookie: u64::from_le_bytes(cookie),
        })
    }
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, reflected
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Workload;

    #[test]
    fn record_type_roundtrip() {
        for t in LogRecordType::ALL {
            assert_eq!(LogRecordType::from_u32(t.as_u32()), Some(t));
        }
        assert_eq!(LogRecordType::from_u32(0), None);
        assert_eq!(LogRecordType::from_u32(6), None);
    }

    #[test]
    fn header_roundtrip_and_damage() {
        let mut header = LogHeader::new(7);
        header.status = LogStatus::CleanShutdown;
        header.checkpoint_seq = SequenceNumber::new(42);
        let mut bytes = header.encode();
        assert_eq!(bytes.len() as u64, LOG_HEADER_SIZE);
        assert_eq!(LogHeader::decode(&bytes).unwrap(), header);

        bytes[10] ^= 1;
        assert!(matches!(
            LogHeader::decode(&bytes),
            Err(CoreError::LogCorruption { .. })
        ));
        bytes[0] = b'X';
        assert!(matches!(
            LogHeader::decode(&bytes),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn body_must_match_envelope_type() {
        let event = LogEvent::Prepare {
            txn: TransactionRecord::local(TransactionId::new(1), Workload::new()),
        };
        let body = event.encode().unwrap();
        assert_eq!(
            LogEvent::decode(LogRecordType::TransactionPrepare, &body).unwrap(),
            event
        );
        assert!(matches!(
            LogEvent::decode(LogRecordType::MessageRemoval, &body),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn summary_names_the_transaction() {
        let event = LogEvent::Complete {
            id: TransactionId::new(3),
            kind: TransactionKind::Local,
            state: TransactionState::Committed,
            txn: None,
        };
        assert_eq!(event.summary(), "local txn:3 COMMITTED");
    }

    #[test]
    fn crc32_known_value() {
        // Known test vector: "123456789" should give 0xCBF43926
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc32_empty() {
        assert_eq!(compute_crc32(b""), 0x0000_0000);
    }
}
