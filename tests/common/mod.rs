//! Common utilities for the coordinator integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashSet as HashSet;
use parking_lot::Mutex;
use tcc_coordinator::prelude::*;

/// Arbitrary fixed starting point for manual clocks.
pub const T0: u64 = 1_700_000_000_000;

// --- Record builders ---

/// A participant whose confirm and cancel are `<name>::confirm(String)` and
/// `<name>::cancel(String)`.
pub fn participant(name: &str) -> ParticipantDescriptor {
    ParticipantDescriptor::new(
        OperationInvocation::new(name, "confirm").arg("String", name),
        OperationInvocation::new(name, "cancel").arg("String", name),
    )
}

pub fn record(
    id: &str,
    status: TransactionStatus,
    role: TransactionRole,
    pattern: TransactionPattern,
    now_ms: u64,
    participants: &[&str],
) -> TransactionRecord {
    TransactionRecord::new(id, status, role, pattern, now_ms)
        .with_participants(participants.iter().map(|name| participant(name)).collect())
}

/// An initiator-role, TCC-pattern record.
pub fn initiator(
    id: &str,
    status: TransactionStatus,
    now_ms: u64,
    participants: &[&str],
) -> TransactionRecord {
    record(
        id,
        status,
        TransactionRole::Initiator,
        TransactionPattern::Tcc,
        now_ms,
        participants,
    )
}

pub fn participant_names(record: &TransactionRecord) -> Vec<String> {
    record
        .participants
        .iter()
        .map(|p| p.confirm.target.clone())
        .collect()
}

pub fn recovery_config(recovery_delay_ms: u64, retry_max: u32) -> RecoveryConfig {
    RecoveryConfig {
        scheduled_delay_ms: 50,
        initial_delay_ms: 0,
        recovery_delay_ms,
        retry_max,
    }
}

// --- Participants ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub participant: String,
    pub operation: String,
    pub action: TccAction,
    pub transaction_id: String,
    pub retry_count: u32,
}

/// A set of participants registered with one [`LocalDispatcher`].
///
/// Every handler call is recorded. Participants marked as failing return a
/// handler error until they are healed.
pub struct Participants {
    dispatcher: Arc<LocalDispatcher>,
    calls: Arc<Mutex<Vec<Call>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl Participants {
    pub fn new(names: &[&str]) -> Self {
        let dispatcher = Arc::new(LocalDispatcher::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(Mutex::new(HashSet::new()));
        for name in names {
            for operation in ["confirm", "cancel"] {
                let calls = Arc::clone(&calls);
                let failing = Arc::clone(&failing);
                let owned = name.to_string();
                dispatcher.register(name, operation, &["String"], move |ctx, _args| {
                    calls.lock().push(Call {
                        participant: owned.clone(),
                        operation: operation.to_string(),
                        action: ctx.action,
                        transaction_id: ctx.transaction_id.clone(),
                        retry_count: ctx.retry_count,
                    });
                    if failing.lock().contains(&owned) {
                        return Err(HandlerError::new(format!("{} unavailable", owned)));
                    }
                    Ok(())
                });
            }
        }
        Self {
            dispatcher,
            calls,
            failing,
        }
    }

    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn local(&self) -> &LocalDispatcher {
        &self.dispatcher
    }

    pub fn fail(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.failing.lock().remove(name);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, name: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.participant == name)
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

// --- Fault injection ---

/// Wraps an initialized repository and fails every call touching selected
/// ids with a storage error.
pub struct FaultyRepository {
    inner: Arc<dyn CoordinatorRepository>,
    failing_ids: Mutex<HashSet<String>>,
    failing_scan: AtomicBool,
    updates: Mutex<Vec<String>>,
}

impl FaultyRepository {
    pub fn new(inner: Arc<dyn CoordinatorRepository>) -> Self {
        Self {
            inner,
            failing_ids: Mutex::new(HashSet::new()),
            failing_scan: AtomicBool::new(false),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_id(&self, id: &str) {
        self.failing_ids.lock().insert(id.to_string());
    }

    pub fn heal_id(&self, id: &str) {
        self.failing_ids.lock().remove(id);
    }

    pub fn fail_scan(&self, failing: bool) {
        self.failing_scan.store(failing, Ordering::SeqCst);
    }

    /// Ids passed to `update`, in call order.
    pub fn update_calls(&self) -> Vec<String> {
        self.updates.lock().clone()
    }

    fn check(&self, id: &str) -> Result<()> {
        if self.failing_ids.lock().contains(id) {
            return Err(TccError::Storage(format!("injected failure for {}", id)));
        }
        Ok(())
    }
}

impl CoordinatorRepository for FaultyRepository {
    fn scheme(&self) -> &'static str {
        self.inner.scheme()
    }

    fn capabilities(&self) -> RepositoryCapabilities {
        self.inner.capabilities()
    }

    fn initialize(&mut self, _namespace: &str, _config: &RepositoryConfig) -> Result<()> {
        Ok(())
    }

    fn create(&self, record: &TransactionRecord) -> Result<usize> {
        self.check(&record.id)?;
        self.inner.create(record)
    }

    fn update(&self, record: &mut TransactionRecord) -> Result<usize> {
        self.updates.lock().push(record.id.clone());
        self.check(&record.id)?;
        self.inner.update(record)
    }

    fn update_participants(&self, record: &TransactionRecord) -> Result<usize> {
        self.check(&record.id)?;
        self.inner.update_participants(record)
    }

    fn update_status(&self, id: &str, status: TransactionStatus) -> Result<usize> {
        self.check(id)?;
        self.inner.update_status(id, status)
    }

    fn remove(&self, id: &str) -> Result<usize> {
        self.check(id)?;
        self.inner.remove(id)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<TransactionRecord>> {
        self.check(id)?;
        self.inner.find_by_id(id)
    }

    fn list_all(&self) -> Result<Vec<TransactionRecord>> {
        if self.failing_scan.load(Ordering::SeqCst) {
            return Err(TccError::Storage("injected scan failure".to_string()));
        }
        self.inner.list_all()
    }
}

// --- Repositories ---

/// A file repository under `root`, initialized for `namespace`.
pub fn file_repository(
    root: &std::path::Path,
    namespace: &str,
    clock: &ManualClock,
) -> FileCoordinatorRepository {
    let mut repo = FileCoordinatorRepository::new().with_clock(Arc::new(clock.clone()));
    let config = RepositoryConfig {
        root: root.to_path_buf(),
        ..RepositoryConfig::default()
    };
    repo.initialize(namespace, &config)
        .expect("file repository should initialize");
    repo
}

/// A node-store repository over `store`, initialized for `namespace`.
pub fn zookeeper_repository(
    store: &MemoryNodeStore,
    namespace: &str,
    clock: &ManualClock,
) -> ZookeeperCoordinatorRepository {
    let mut repo = ZookeeperCoordinatorRepository::new(Arc::new(store.clone()))
        .with_clock(Arc::new(clock.clone()));
    repo.initialize(namespace, &RepositoryConfig::default())
        .expect("zookeeper repository should initialize");
    repo
}

// --- Conformance suite ---

/// Checks every backend has to pass. The repository must have been built
/// with `clock`.
pub fn conformance_suite(repo: &dyn CoordinatorRepository, clock: &ManualClock) {
    clock.set(T0);
    create_then_find(repo);
    create_rejects_duplicates(repo);
    update_bumps_bookkeeping(repo, clock);
    stale_update_follows_capabilities(repo);
    update_of_absent_record_is_lost(repo);
    update_participants_replaces_list(repo);
    update_status_is_idempotent(repo);
    status_write_between_find_and_claim(repo);
    remove_is_idempotent(repo);
    eligibility_uses_strict_cutoff(repo);
    invalid_ids_are_rejected(repo);
}

fn create_then_find(repo: &dyn CoordinatorRepository) {
    let rec = initiator("conf-find", TransactionStatus::Trying, T0, &["a", "b"]);
    assert_eq!(repo.create(&rec).unwrap(), 1);
    assert_eq!(repo.find_by_id("conf-find").unwrap(), Some(rec));
    assert_eq!(repo.find_by_id("conf-missing").unwrap(), None);
}

fn create_rejects_duplicates(repo: &dyn CoordinatorRepository) {
    let rec = initiator("conf-dup", TransactionStatus::Trying, T0, &["a"]);
    repo.create(&rec).unwrap();
    let again = initiator("conf-dup", TransactionStatus::Canceling, T0, &["b"]);
    assert!(matches!(repo.create(&again), Err(TccError::AlreadyExists(id)) if id == "conf-dup"));
    // The original record is untouched.
    assert_eq!(repo.find_by_id("conf-dup").unwrap(), Some(rec));
}

fn update_bumps_bookkeeping(repo: &dyn CoordinatorRepository, clock: &ManualClock) {
    let rec = initiator("conf-update", TransactionStatus::Canceling, T0, &["a"]);
    repo.create(&rec).unwrap();
    clock.advance(std::time::Duration::from_secs(5));

    let mut claimed = repo.find_by_id("conf-update").unwrap().unwrap();
    assert_eq!(repo.update(&mut claimed).unwrap(), 1);
    assert_eq!(claimed.version, 1);
    assert_eq!(claimed.retry_count, 1);
    assert_eq!(claimed.last_updated_at, clock.now_ms());
    assert_eq!(claimed.created_at, T0);

    let stored = repo.find_by_id("conf-update").unwrap().unwrap();
    assert_eq!(stored, claimed);
    clock.set(T0);
}

fn stale_update_follows_capabilities(repo: &dyn CoordinatorRepository) {
    let rec = initiator("conf-race", TransactionStatus::Confirming, T0, &["a"]);
    repo.create(&rec).unwrap();
    let mut first = repo.find_by_id("conf-race").unwrap().unwrap();
    let mut second = first.clone();

    assert_eq!(repo.update(&mut first).unwrap(), 1);
    let rows = repo.update(&mut second).unwrap();
    if repo.capabilities().conditional_update {
        assert_eq!(rows, 0, "stale version must lose on {}", repo.scheme());
        assert_eq!(second.version, 0, "a lost claim leaves the caller's record alone");
        assert_eq!(repo.find_by_id("conf-race").unwrap().unwrap().version, 1);
    } else {
        // Last write wins.
        assert_eq!(rows, 1);
    }
}

fn update_of_absent_record_is_lost(repo: &dyn CoordinatorRepository) {
    let mut ghost = initiator("conf-ghost", TransactionStatus::Canceling, T0, &["a"]);
    assert_eq!(repo.update(&mut ghost).unwrap(), 0);
    assert_eq!(repo.find_by_id("conf-ghost").unwrap(), None);
    assert_eq!(ghost.retry_count, 0);
}

fn update_participants_replaces_list(repo: &dyn CoordinatorRepository) {
    let rec = initiator("conf-narrow", TransactionStatus::Canceling, T0, &["a", "b", "c"]);
    repo.create(&rec).unwrap();

    let narrowed = rec.clone().with_participants(vec![participant("b"), participant("c")]);
    assert_eq!(repo.update_participants(&narrowed).unwrap(), 1);
    let stored = repo.find_by_id("conf-narrow").unwrap().unwrap();
    assert_eq!(participant_names(&stored), vec!["b", "c"]);
    assert_eq!(stored.status, TransactionStatus::Canceling);

    let absent = initiator("conf-narrow-missing", TransactionStatus::Canceling, T0, &["a"]);
    assert_eq!(repo.update_participants(&absent).unwrap(), 0);
}

fn update_status_is_idempotent(repo: &dyn CoordinatorRepository) {
    let rec = initiator("conf-status", TransactionStatus::Trying, T0, &["a"]);
    repo.create(&rec).unwrap();

    assert_eq!(repo.update_status("conf-status", TransactionStatus::Confirming).unwrap(), 1);
    let once = repo.find_by_id("conf-status").unwrap().unwrap();
    assert_eq!(repo.update_status("conf-status", TransactionStatus::Confirming).unwrap(), 1);
    let twice = repo.find_by_id("conf-status").unwrap().unwrap();

    assert_eq!(once.status, TransactionStatus::Confirming);
    assert_eq!(twice.status, once.status);
    assert_eq!(twice.participants, once.participants);
    assert_eq!(twice.retry_count, once.retry_count);
    assert_eq!(twice.last_updated_at, once.last_updated_at);

    assert_eq!(repo.update_status("conf-status-missing", TransactionStatus::Canceling).unwrap(), 0);
}

fn status_write_between_find_and_claim(repo: &dyn CoordinatorRepository) {
    let rec = initiator("conf-status-race", TransactionStatus::Trying, T0, &["a"]);
    repo.create(&rec).unwrap();

    // The scheduler reads the record, then the initiator moves it on.
    let mut seen = repo.find_by_id("conf-status-race").unwrap().unwrap();
    assert_eq!(
        repo.update_status("conf-status-race", TransactionStatus::Confirming).unwrap(),
        1
    );
    let rows = repo.update(&mut seen).unwrap();
    let stored = repo.find_by_id("conf-status-race").unwrap().unwrap();

    if repo.capabilities().conditional_update {
        assert_eq!(rows, 0, "a claim on a stale status must lose on {}", repo.scheme());
        assert_eq!(stored.status, TransactionStatus::Confirming);
        assert_eq!(stored.retry_count, 0);
    } else {
        // Last write wins, the stale status comes back.
        assert_eq!(rows, 1);
        assert_eq!(stored.status, TransactionStatus::Trying);
        assert_eq!(stored.retry_count, 1);
    }
}

fn remove_is_idempotent(repo: &dyn CoordinatorRepository) {
    let rec = initiator("conf-remove", TransactionStatus::Canceling, T0, &["a"]);
    repo.create(&rec).unwrap();
    assert_eq!(repo.remove("conf-remove").unwrap(), 1);
    assert_eq!(repo.remove("conf-remove").unwrap(), 0);
    assert_eq!(repo.find_by_id("conf-remove").unwrap(), None);

    // A removed record is not brought back by a late claim.
    let mut late = rec;
    assert_eq!(repo.update(&mut late).unwrap(), 0);
    assert_eq!(repo.find_by_id("conf-remove").unwrap(), None);
}

fn eligibility_uses_strict_cutoff(repo: &dyn CoordinatorRepository) {
    let cutoff = T0 - 10_000;
    repo.create(&initiator("list-old", TransactionStatus::Canceling, cutoff - 1, &["a"]))
        .unwrap();
    repo.create(&initiator("list-edge", TransactionStatus::Canceling, cutoff, &["a"]))
        .unwrap();
    repo.create(&initiator("list-new", TransactionStatus::Canceling, T0, &["a"]))
        .unwrap();

    let mut all: Vec<String> = repo
        .list_all()
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .filter(|id| id.starts_with("list-"))
        .collect();
    all.sort();
    assert_eq!(all, vec!["list-edge", "list-new", "list-old"]);

    let eligible: Vec<String> = repo
        .list_eligible_for_recovery(cutoff)
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .filter(|id| id.starts_with("list-"))
        .collect();
    assert_eq!(eligible, vec!["list-old"]);
}

fn invalid_ids_are_rejected(repo: &dyn CoordinatorRepository) {
    for id in ["", ".hidden", "a/b", "a\\b"] {
        let rec = initiator(id, TransactionStatus::Trying, T0, &["a"]);
        assert!(
            matches!(repo.create(&rec), Err(TccError::InvalidId(_))),
            "{:?} should be rejected",
            id
        );
        assert!(matches!(repo.find_by_id(id), Err(TccError::InvalidId(_))));
    }
}
