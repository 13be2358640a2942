use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::invocation::ParticipantDescriptor;

/// Status of a TCC transaction as stored in the log.
///
/// There is no terminal status: a finished transaction is represented by the
/// absence of its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Recorded before the local try has started.
    PreTry,
    /// Try is running or finished without a decision yet.
    Trying,
    /// The initiator decided to confirm.
    Confirming,
    /// The initiator decided to cancel, or try failed.
    Canceling,
}

impl TransactionStatus {
    /// Compensation action the recovery scheduler takes for this status.
    pub fn recovery_action(&self) -> TccAction {
        match self {
            TransactionStatus::Confirming => TccAction::Confirming,
            TransactionStatus::PreTry | TransactionStatus::Trying | TransactionStatus::Canceling => {
                TccAction::Canceling
            }
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::PreTry => "PRE_TRY",
            TransactionStatus::Trying => "TRYING",
            TransactionStatus::Confirming => "CONFIRMING",
            TransactionStatus::Canceling => "CANCELING",
        };
        f.write_str(s)
    }
}

/// Which half of the TCC protocol is being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TccAction {
    Confirming,
    Canceling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionRole {
    /// Owns the confirm/cancel decision.
    Initiator,
    /// Executes the initiator's decision and never decides on its own.
    Participant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionPattern {
    /// Full try/confirm/cancel.
    Tcc,
    /// Confirm/cancel only, there is no observable try phase.
    Cc,
}

/// One TCC transaction in the coordinator log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Globally unique id, never reused.
    pub id: String,
    pub status: TransactionStatus,
    pub role: TransactionRole,
    pub pattern: TransactionPattern,
    /// Compensation attempts made so far.
    pub retry_count: u32,
    /// Optimistic concurrency token, bumped by every successful conditional update.
    pub version: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Milliseconds since the Unix epoch. Drives recovery eligibility.
    pub last_updated_at: u64,
    pub participants: Vec<ParticipantDescriptor>,
}

impl TransactionRecord {
    /// Creates a fresh record as the interception layer would at try time.
    ///
    /// `retry_count` and `version` start at zero and both timestamps are set
    /// to `now_ms`.
    pub fn new(
        id: impl Into<String>,
        status: TransactionStatus,
        role: TransactionRole,
        pattern: TransactionPattern,
        now_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            status,
            role,
            pattern,
            retry_count: 0,
            version: 0,
            created_at: now_ms,
            last_updated_at: now_ms,
            participants: Vec::new(),
        }
    }

    pub fn with_participant(mut self, participant: ParticipantDescriptor) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn with_participants(mut self, participants: Vec<ParticipantDescriptor>) -> Self {
        self.participants = participants;
        self
    }

    /// Applies the bookkeeping of one successful conditional update.
    pub(crate) fn bump_for_update(&mut self, now_ms: u64) {
        self.version = self.version.saturating_add(1);
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_updated_at = now_ms;
    }
}
