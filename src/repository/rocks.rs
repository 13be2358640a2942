use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error};
use rocksdb::{ErrorKind, IteratorMode, OptimisticTransactionDB, Options};

use crate::clock::{Clock, SystemClock};
use crate::config::RepositoryConfig;
use crate::errors::{Result, TccError};
use crate::model::{TransactionRecord, TransactionStatus};
use crate::repository::{
    CoordinatorRepository, RecordEnvelope, RepositoryCapabilities, ROWS, namespace_dir_name,
    validate_id,
};
use crate::serializer::RecordSerializer;

impl From<rocksdb::Error> for TccError {
    fn from(e: rocksdb::Error) -> Self {
        TccError::Storage(e.to_string())
    }
}

fn is_conflict(e: &rocksdb::Error) -> bool {
    matches!(e.kind(), ErrorKind::Busy | ErrorKind::TryAgain)
}

/// RocksDB backend built on an optimistic transaction database.
///
/// Records are keyed by id. `update` reads the stored envelope with
/// `get_for_update`, compares versions and commits the bumped envelope; a
/// version mismatch or a commit conflict from a concurrent writer in the same
/// process both yield `Ok(0)`. A RocksDB directory can only be opened by one
/// process, so cross-process replicas need one of the other backends.
pub struct RocksCoordinatorRepository {
    db: Option<OptimisticTransactionDB>,
    path: Option<PathBuf>,
    serializer: RecordSerializer,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RocksCoordinatorRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksCoordinatorRepository")
            .field("path", &self.path)
            .field("serializer", &self.serializer)
            .finish()
    }
}

impl Default for RocksCoordinatorRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl RocksCoordinatorRepository {
    pub fn new() -> Self {
        Self {
            db: None,
            path: None,
            serializer: RecordSerializer::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn db(&self) -> Result<&OptimisticTransactionDB> {
        self.db.as_ref().ok_or(TccError::NotInitialized)
    }

    fn decode(&self, bytes: &[u8]) -> Result<RecordEnvelope> {
        self.serializer.deserialize(bytes)
    }

    /// Transactional read-modify-write. Every successful write bumps the
    /// stored version so a claim taken on the old version loses. Returns `0`
    /// when the key is absent.
    fn modify<F>(&self, id: &str, change: F) -> Result<usize>
    where
        F: FnOnce(&mut RecordEnvelope),
    {
        validate_id(id)?;
        let db = self.db()?;
        let txn = db.transaction();
        let Some(bytes) = txn.get_for_update(id, true)? else {
            return Ok(0);
        };
        let mut envelope = self.decode(&bytes)?;
        change(&mut envelope);
        envelope.version = envelope.version.saturating_add(1);
        txn.put(id, self.serializer.serialize(&envelope)?)?;
        txn.commit()?;
        Ok(ROWS)
    }
}

impl CoordinatorRepository for RocksCoordinatorRepository {
    fn scheme(&self) -> &'static str {
        "rocksdb"
    }

    fn capabilities(&self) -> RepositoryCapabilities {
        RepositoryCapabilities {
            conditional_update: true,
        }
    }

    fn initialize(&mut self, namespace: &str, config: &RepositoryConfig) -> Result<()> {
        let path = config.rocks_path.clone().unwrap_or_else(|| {
            config
                .root
                .join(format!("{}_rocks", namespace_dir_name(namespace)))
        });
        self.serializer = RecordSerializer::new(config.serializer);
        if self.db.is_some() && self.path.as_ref() == Some(&path) {
            return Ok(());
        }
        std::fs::create_dir_all(&path)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = OptimisticTransactionDB::open(&opts, &path)?;
        debug!(
            "rocksdb repository initialized at {} ({:?} records)",
            path.display(),
            self.serializer.kind()
        );
        self.db = Some(db);
        self.path = Some(path);
        Ok(())
    }

    fn create(&self, record: &TransactionRecord) -> Result<usize> {
        validate_id(&record.id)?;
        let db = self.db()?;
        let txn = db.transaction();
        if txn.get_for_update(&record.id, true)?.is_some() {
            return Err(TccError::AlreadyExists(record.id.clone()));
        }
        txn.put(&record.id, self.serializer.serialize(&RecordEnvelope::from(record))?)?;
        match txn.commit() {
            Ok(()) => Ok(ROWS),
            Err(e) if is_conflict(&e) => Err(TccError::AlreadyExists(record.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, record: &mut TransactionRecord) -> Result<usize> {
        validate_id(&record.id)?;
        let db = self.db()?;
        let txn = db.transaction();
        let Some(bytes) = txn.get_for_update(&record.id, true)? else {
            return Ok(0);
        };
        let stored = self.decode(&bytes)?;
        if stored.version != record.version {
            return Ok(0);
        }
        let mut updated = record.clone();
        updated.bump_for_update(self.clock.now_ms());
        txn.put(&record.id, self.serializer.serialize(&RecordEnvelope::from(&updated))?)?;
        match txn.commit() {
            Ok(()) => {
                *record = updated;
                Ok(ROWS)
            }
            Err(e) if is_conflict(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn update_participants(&self, record: &TransactionRecord) -> Result<usize> {
        let participants = record.participants.clone();
        self.modify(&record.id, move |envelope| {
            envelope.participants = participants;
        })
    }

    fn update_status(&self, id: &str, status: TransactionStatus) -> Result<usize> {
        self.modify(id, |envelope| {
            envelope.status = status;
        })
    }

    fn remove(&self, id: &str) -> Result<usize> {
        validate_id(id)?;
        let db = self.db()?;
        let txn = db.transaction();
        if txn.get_for_update(id, true)?.is_none() {
            return Ok(0);
        }
        txn.delete(id)?;
        txn.commit()?;
        Ok(ROWS)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<TransactionRecord>> {
        validate_id(id)?;
        match self.db()?.get(id)? {
            Some(bytes) => Ok(Some(self.decode(&bytes)?.into())),
            None => Ok(None),
        }
    }

    fn list_all(&self) -> Result<Vec<TransactionRecord>> {
        let mut records = Vec::new();
        for item in self.db()?.iterator(IteratorMode::Start) {
            let (key, value) = item?;
            match self.decode(&value) {
                Ok(envelope) => records.push(envelope.into()),
                Err(e) => error!(
                    "skipping unreadable transaction {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(records)
    }
}
