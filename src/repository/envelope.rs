use serde::{Deserialize, Serialize};

use crate::model::{
    ParticipantDescriptor, TransactionPattern, TransactionRecord, TransactionRole,
    TransactionStatus,
};

/// On-disk (and in-node) layout of a transaction record.
///
/// Field names follow the columns administrative tooling already reads
/// (`trans_id`, `retried_count`, `create_time`, `last_time`), so a JSON
/// encoded envelope can be inspected directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub trans_id: String,
    pub status: TransactionStatus,
    pub role: TransactionRole,
    pub pattern: TransactionPattern,
    pub retried_count: u32,
    pub version: u64,
    pub create_time: u64,
    pub last_time: u64,
    pub participants: Vec<ParticipantDescriptor>,
}

impl From<&TransactionRecord> for RecordEnvelope {
    fn from(record: &TransactionRecord) -> Self {
        Self {
            trans_id: record.id.clone(),
            status: record.status,
            role: record.role,
            pattern: record.pattern,
            retried_count: record.retry_count,
            version: record.version,
            create_time: record.created_at,
            last_time: record.last_updated_at,
            participants: record.participants.clone(),
        }
    }
}

impl From<RecordEnvelope> for TransactionRecord {
    fn from(envelope: RecordEnvelope) -> Self {
        Self {
            id: envelope.trans_id,
            status: envelope.status,
            role: envelope.role,
            pattern: envelope.pattern,
            retry_count: envelope.retried_count,
            version: envelope.version,
            created_at: envelope.create_time,
            last_updated_at: envelope.last_time,
            participants: envelope.participants,
        }
    }
}
