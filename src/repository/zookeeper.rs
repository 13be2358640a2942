use std::sync::Arc;

use log::{debug, error};

use crate::clock::{Clock, SystemClock};
use crate::config::RepositoryConfig;
use crate::errors::{Result, TccError};
use crate::model::{TransactionRecord, TransactionStatus};
use crate::repository::node::{NodeError, NodeStat, NodeStore};
use crate::repository::{
    CoordinatorRepository, RecordEnvelope, RepositoryCapabilities, ROWS, namespace_dir_name,
    validate_id,
};
use crate::serializer::RecordSerializer;

const MAX_MODIFY_ATTEMPTS: usize = 16;

/// Hierarchical-store backend: one node per transaction under
/// `/tcc_<namespace>`.
///
/// The node's data version *is* the record version. Reads overwrite the
/// `version` carried in the envelope with the node stat, and `update` writes
/// with the version the caller last observed as the expected node version.
/// The coordination service rejects the write if anybody else touched the
/// node in between, which gives a true conditional update across replicas.
#[derive(Debug)]
pub struct ZookeeperCoordinatorRepository {
    store: Arc<dyn NodeStore>,
    root: Option<String>,
    serializer: RecordSerializer,
    clock: Arc<dyn Clock>,
}

impl ZookeeperCoordinatorRepository {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self {
            store,
            root: None,
            serializer: RecordSerializer::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The namespace node path, once initialized.
    pub fn root_path(&self) -> Option<&str> {
        self.root.as_deref()
    }

    fn node_path(&self, id: &str) -> Result<String> {
        validate_id(id)?;
        let root = self.root.as_deref().ok_or(TccError::NotInitialized)?;
        Ok(format!("{}/{}", root, id))
    }

    fn decode(&self, data: &[u8], stat: NodeStat) -> Result<RecordEnvelope> {
        let mut envelope: RecordEnvelope = self.serializer.deserialize(data)?;
        envelope.version = stat.version as u64;
        Ok(envelope)
    }

    fn read(&self, path: &str) -> Result<Option<(RecordEnvelope, NodeStat)>> {
        match self.store.get_data(path) {
            Ok((data, stat)) => Ok(Some((self.decode(&data, stat)?, stat))),
            Err(NodeError::NoNode(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write guarded by the node version. A concurrent write
    /// between the read and the write makes the store reject ours, in which
    /// case the change is re-applied on top of the fresh node. Returns `0`
    /// when the node is absent.
    fn modify<F>(&self, id: &str, change: F) -> Result<usize>
    where
        F: Fn(&mut RecordEnvelope),
    {
        let path = self.node_path(id)?;
        for _ in 0..MAX_MODIFY_ATTEMPTS {
            let Some((mut envelope, stat)) = self.read(&path)? else {
                return Ok(0);
            };
            change(&mut envelope);
            let data = self.serializer.serialize(&envelope)?;
            match self.store.set_data(&path, data, Some(stat.version)) {
                Ok(_) => return Ok(ROWS),
                Err(NodeError::NoNode(_)) => return Ok(0),
                Err(NodeError::BadVersion { .. }) => {
                    debug!("transaction node {} changed since it was read, retrying", path);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(TccError::Storage(format!(
            "transaction node {} kept changing after {} attempts",
            path, MAX_MODIFY_ATTEMPTS
        )))
    }
}

impl CoordinatorRepository for ZookeeperCoordinatorRepository {
    fn scheme(&self) -> &'static str {
        "zookeeper"
    }

    fn capabilities(&self) -> RepositoryCapabilities {
        RepositoryCapabilities {
            conditional_update: true,
        }
    }

    fn initialize(&mut self, namespace: &str, config: &RepositoryConfig) -> Result<()> {
        let root = format!("/{}", namespace_dir_name(namespace));
        self.store.ensure_path(&root)?;
        self.serializer = RecordSerializer::new(config.serializer);
        debug!(
            "zookeeper repository initialized at {} ({:?} records)",
            root,
            self.serializer.kind()
        );
        self.root = Some(root);
        Ok(())
    }

    fn create(&self, record: &TransactionRecord) -> Result<usize> {
        let path = self.node_path(&record.id)?;
        let mut envelope = RecordEnvelope::from(record);
        // Fresh nodes start at data version 0.
        envelope.version = 0;
        let data = self.serializer.serialize(&envelope)?;
        match self.store.create(&path, data) {
            Ok(()) => Ok(ROWS),
            Err(NodeError::NodeExists(_)) => Err(TccError::AlreadyExists(record.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, record: &mut TransactionRecord) -> Result<usize> {
        let path = self.node_path(&record.id)?;
        let expected = i32::try_from(record.version)
            .map_err(|_| TccError::Storage(format!("version {} out of range", record.version)))?;
        let mut updated = record.clone();
        updated.bump_for_update(self.clock.now_ms());
        let data = self.serializer.serialize(&RecordEnvelope::from(&updated))?;
        match self.store.set_data(&path, data, Some(expected)) {
            Ok(stat) => {
                updated.version = stat.version as u64;
                *record = updated;
                Ok(ROWS)
            }
            Err(NodeError::BadVersion { .. }) | Err(NodeError::NoNode(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn update_participants(&self, record: &TransactionRecord) -> Result<usize> {
        let participants = record.participants.clone();
        self.modify(&record.id, move |envelope| {
            envelope.participants = participants.clone();
        })
    }

    fn update_status(&self, id: &str, status: TransactionStatus) -> Result<usize> {
        self.modify(id, |envelope| {
            envelope.status = status;
        })
    }

    fn remove(&self, id: &str) -> Result<usize> {
        let path = self.node_path(id)?;
        match self.store.delete(&path, None) {
            Ok(()) => Ok(ROWS),
            Err(NodeError::NoNode(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn find_by_id(&self, id: &str) -> Result<Option<TransactionRecord>> {
        let path = self.node_path(id)?;
        Ok(self.read(&path)?.map(|(envelope, _)| envelope.into()))
    }

    fn list_all(&self) -> Result<Vec<TransactionRecord>> {
        let root = self.root.as_deref().ok_or(TccError::NotInitialized)?;
        let mut records = Vec::new();
        for child in self.store.get_children(root)? {
            let path = format!("{}/{}", root, child);
            match self.read(&path) {
                Ok(Some((envelope, _))) => records.push(envelope.into()),
                Ok(None) => {}
                Err(TccError::Serialization(e)) => {
                    error!("skipping unreadable transaction node {}: {}", path, e)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }
}
