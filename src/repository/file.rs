use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error};

use crate::clock::{Clock, SystemClock};
use crate::config::RepositoryConfig;
use crate::errors::{Result, TccError};
use crate::model::{TransactionRecord, TransactionStatus};
use crate::repository::{
    CoordinatorRepository, RecordEnvelope, RepositoryCapabilities, ROWS, namespace_dir_name,
    validate_id,
};
use crate::serializer::RecordSerializer;

/// File-per-transaction backend.
///
/// Every record lives in `<root>/tcc_<namespace>/<id>`. Writes go through a
/// hidden temporary file followed by a rename, so a crash never leaves a
/// half-written record behind.
///
/// `update` is **last write wins**: a plain filesystem has no atomic
/// compare-and-swap, so the stored version is not checked against the
/// caller's. The backend declares `conditional_update: false` and must only
/// be shared by a single coordinator replica.
#[derive(Debug)]
pub struct FileCoordinatorRepository {
    dir: Option<PathBuf>,
    serializer: RecordSerializer,
    clock: Arc<dyn Clock>,
    tmp_seq: AtomicU64,
}

impl Default for FileCoordinatorRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl FileCoordinatorRepository {
    pub fn new() -> Self {
        Self {
            dir: None,
            serializer: RecordSerializer::default(),
            clock: Arc::new(SystemClock),
            tmp_seq: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The namespace directory, once initialized.
    pub fn directory(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn dir(&self) -> Result<&Path> {
        self.dir.as_deref().ok_or(TccError::NotInitialized)
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.dir()?.join(id))
    }

    fn tmp_path(&self, id: &str) -> Result<PathBuf> {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .dir()?
            .join(format!(".{}.{}.{}.tmp", id, std::process::id(), seq)))
    }

    fn write_tmp(&self, id: &str, envelope: &RecordEnvelope) -> Result<PathBuf> {
        let bytes = self.serializer.serialize(envelope)?;
        let tmp = self.tmp_path(id)?;
        fs::write(&tmp, bytes)?;
        Ok(tmp)
    }

    /// Replaces the record file atomically.
    fn write_envelope(&self, envelope: &RecordEnvelope) -> Result<()> {
        let path = self.record_path(&envelope.trans_id)?;
        let tmp = self.write_tmp(&envelope.trans_id, envelope)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn read_envelope(&self, path: &Path) -> Result<Option<RecordEnvelope>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(self.serializer.deserialize(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write of a stored envelope. Returns `0` when absent.
    fn modify<F>(&self, id: &str, change: F) -> Result<usize>
    where
        F: FnOnce(&mut RecordEnvelope),
    {
        let path = self.record_path(id)?;
        match self.read_envelope(&path)? {
            Some(mut envelope) => {
                change(&mut envelope);
                self.write_envelope(&envelope)?;
                Ok(ROWS)
            }
            None => Ok(0),
        }
    }
}

impl CoordinatorRepository for FileCoordinatorRepository {
    fn scheme(&self) -> &'static str {
        "file"
    }

    fn capabilities(&self) -> RepositoryCapabilities {
        RepositoryCapabilities {
            conditional_update: false,
        }
    }

    fn initialize(&mut self, namespace: &str, config: &RepositoryConfig) -> Result<()> {
        let dir = config.root.join(namespace_dir_name(namespace));
        if dir.exists() && !dir.is_dir() {
            return Err(TccError::Storage(format!(
                "{} exists and is not a directory",
                dir.display()
            )));
        }
        fs::create_dir_all(&dir)?;
        self.serializer = RecordSerializer::new(config.serializer);
        debug!(
            "file repository initialized at {} ({:?} records)",
            dir.display(),
            self.serializer.kind()
        );
        self.dir = Some(dir);
        Ok(())
    }

    fn create(&self, record: &TransactionRecord) -> Result<usize> {
        let path = self.record_path(&record.id)?;
        let tmp = self.write_tmp(&record.id, &RecordEnvelope::from(record))?;
        // hard_link fails if the target exists, which makes create exclusive.
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(ROWS),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(TccError::AlreadyExists(record.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, record: &mut TransactionRecord) -> Result<usize> {
        let path = self.record_path(&record.id)?;
        // A removed record stays removed; everything else is last write wins.
        if !path.exists() {
            return Ok(0);
        }
        let mut updated = record.clone();
        updated.bump_for_update(self.clock.now_ms());
        self.write_envelope(&RecordEnvelope::from(&updated))?;
        *record = updated;
        Ok(ROWS)
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
        let path = self.record_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(ROWS),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn find_by_id(&self, id: &str) -> Result<Option<TransactionRecord>> {
        let path = self.record_path(id)?;
        Ok(self.read_envelope(&path)?.map(TransactionRecord::from))
    }

    fn list_all(&self) -> Result<Vec<TransactionRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(self.dir()?)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || !entry.file_type()?.is_file() {
                continue;
            }
            match self.read_envelope(&entry.path()) {
                Ok(Some(envelope)) => records.push(envelope.into()),
                // Removed between read_dir and read.
                Ok(None) => {}
                Err(e) => error!("skipping unreadable transaction file {}: {}", name, e),
            }
        }
        Ok(records)
    }
}
