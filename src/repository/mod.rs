//! Persistence of the TCC transaction log.
//!
//! [`CoordinatorRepository`] is the storage-agnostic contract the recovery
//! scheduler and the interception layer write through. Backends differ in
//! the concurrency primitive they can offer, which they declare through
//! [`RepositoryCapabilities`]:
//!
//! | backend                                   | `update` semantics                         |
//! |-------------------------------------------|--------------------------------------------|
//! | [`file::FileCoordinatorRepository`]       | last write wins, single replica only       |
//! | [`zookeeper::ZookeeperCoordinatorRepository`] | compare-and-swap on the node version   |
//! | `rocks::RocksCoordinatorRepository`       | optimistic transaction, conflict aborts    |
//!
//! The hierarchical backend runs over any [`node::NodeStore`]: the in-process
//! [`node::MemoryNodeStore`], or `zk_client::ZkNodeStore` against a real
//! ensemble with the `zookeeper` feature.

pub mod envelope;
pub mod file;
pub mod node;
#[cfg(feature = "rocks")]
pub mod rocks;
pub mod zookeeper;
#[cfg(feature = "zookeeper")]
pub mod zk_client;

pub use envelope::RecordEnvelope;

use crate::config::RepositoryConfig;
use crate::errors::{Result, TccError};
use crate::model::{TransactionRecord, TransactionStatus};

/// Rows affected when a single-record operation succeeds.
pub const ROWS: usize = 1;

/// Concurrency guarantees a backend can actually honour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryCapabilities {
    /// `true` when `update` rejects a write whose expected version no longer
    /// matches the stored one. Without it, two coordinator replicas sharing
    /// the store may compensate the same transaction in the same cycle.
    pub conditional_update: bool,
}

/// Storage contract for TCC transaction records.
///
/// Implementations must be `Send` and `Sync`; after [`initialize`] the
/// repository is shared behind an `Arc` by the interception layer and the
/// recovery scheduler.
///
/// [`initialize`]: CoordinatorRepository::initialize
pub trait CoordinatorRepository: Send + Sync {
    /// Short backend name, e.g. `"file"`.
    fn scheme(&self) -> &'static str;

    fn capabilities(&self) -> RepositoryCapabilities;

    /// Prepares the namespace (directory, node path, database) for
    /// `namespace`.
    ///
    /// Idempotent and safe to call on every process start. Every other
    /// operation returns [`TccError::NotInitialized`] until this has
    /// succeeded.
    fn initialize(&mut self, namespace: &str, config: &RepositoryConfig) -> Result<()>;

    /// Persists a new record.
    ///
    /// # Errors
    ///
    /// [`TccError::AlreadyExists`] if a record with the same id is stored,
    /// [`TccError::Storage`] or [`TccError::Io`] if the backend is unreachable.
    fn create(&self, record: &TransactionRecord) -> Result<usize>;

    /// Conditional write of the whole record.
    ///
    /// On success the record's `version` and `retry_count` are incremented
    /// and `last_updated_at` is set to now, both in the store and in
    /// `record`, and `1` is returned. If the stored version no longer equals
    /// `record.version` (another replica got there first) nothing is written
    /// and `0` is returned. Losing the race is not an error.
    fn update(&self, record: &mut TransactionRecord) -> Result<usize>;

    /// Replaces the persisted participant list with `record.participants`.
    ///
    /// Not conditional: only the replica that won the preceding `update`
    /// claim calls this. Returns `0` when the record no longer exists.
    fn update_participants(&self, record: &TransactionRecord) -> Result<usize>;

    /// Direct status write used by the interception layer.
    ///
    /// Returns `0` when the record does not exist.
    fn update_status(&self, id: &str, status: TransactionStatus) -> Result<usize>;

    /// Deletes a record. Removing an absent id is a no-op returning `0`.
    fn remove(&self, id: &str) -> Result<usize>;

    fn find_by_id(&self, id: &str) -> Result<Option<TransactionRecord>>;

    /// Every readable record. Unreadable entries are logged and skipped.
    fn list_all(&self) -> Result<Vec<TransactionRecord>>;

    /// Records whose `last_updated_at` is strictly older than `cutoff_ms`.
    fn list_eligible_for_recovery(&self, cutoff_ms: u64) -> Result<Vec<TransactionRecord>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|record| record.last_updated_at < cutoff_ms)
            .collect())
    }
}

/// Maps an application name to a string safe for paths and node names.
pub fn sanitize_namespace(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Directory name used for one application's transaction log.
pub fn namespace_dir_name(namespace: &str) -> String {
    format!("tcc_{}", sanitize_namespace(namespace))
}

/// Rejects ids that cannot safely become a file or node name.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.starts_with('.') || id.contains('/') || id.contains('\\') {
        return Err(TccError::InvalidId(id.to_string()));
    }
    Ok(())
}
