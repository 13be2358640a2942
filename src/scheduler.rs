//! Periodic recovery of unfinished TCC transactions.
//!
//! Each recovery cycle scans the repository for records that have not been
//! touched for `recovery_delay`, filters out the ones that must not be
//! compensated yet, claims each remaining record through the repository's
//! conditional `update`, and drives the claimed record through confirm or
//! cancel. Participants that fail stay in the record for the next cycle;
//! a record whose participants all succeeded is removed.
//!
//! At most one replica wins the claim of a given record per cycle on a
//! backend with `conditional_update`. Every failure inside a cycle is
//! absorbed into the [`CycleReport`]; nothing escapes the background thread.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use ahash::AHashMap as HashMap;
use crossbeam_channel::{RecvTimeoutError, Sender, TrySendError, bounded};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::config::RecoveryConfig;
use crate::dispatch::{Dispatcher, TransactionContext};
use crate::errors::{Result, TccError};
use crate::model::{
    TccAction, TransactionPattern, TransactionRecord, TransactionRole, TransactionStatus,
};
use crate::repository::CoordinatorRepository;

/// Why an otherwise eligible record was left alone this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Participant record still in `PRE_TRY`: the local try may be mid-flight.
    TryInFlight,
    /// `retry_count` is above `retry_max`. Needs an operator.
    RetryBudgetExhausted,
    /// `CC` pattern record still `TRYING`; there is no signal that try committed.
    CcStillTrying,
    /// Participant record inside the initiator's retry window.
    DeferredToInitiator,
}

/// What happened to one claimed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Another replica claimed the record first.
    LostClaim,
    /// Every participant succeeded and the record was removed.
    Completed,
    /// Some participants failed; the record now lists only those.
    Narrowed { remaining: usize },
}

/// Summary of one recovery cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Candidates returned by the repository scan.
    pub scanned: usize,
    pub skipped: HashMap<SkipReason, usize>,
    /// Ids left for an operator because their retry budget is spent.
    pub exhausted: Vec<String>,
    pub lost_claims: usize,
    pub completed: usize,
    pub narrowed: usize,
    /// Repository failures. The cycle carries on with the next candidate.
    pub errors: usize,
}

impl CycleReport {
    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_skipped(&self) -> usize {
        self.skipped.values().sum()
    }

    /// Records this replica successfully claimed and compensated.
    pub fn claimed(&self) -> usize {
        self.completed + self.narrowed
    }
}

/// Drives unfinished transactions to completion.
pub struct RecoveryScheduler {
    repository: Arc<dyn CoordinatorRepository>,
    dispatcher: Arc<dyn Dispatcher>,
    config: RecoveryConfig,
    clock: Arc<dyn Clock>,
}

impl RecoveryScheduler {
    pub fn new(
        repository: Arc<dyn CoordinatorRepository>,
        dispatcher: Arc<dyn Dispatcher>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            repository,
            dispatcher,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Applies the eligibility filters in order. The first one that matches
    /// wins; `None` means the record may be claimed.
    pub fn evaluate(&self, record: &TransactionRecord, now_ms: u64) -> Option<SkipReason> {
        if record.role == TransactionRole::Participant && record.status == TransactionStatus::PreTry
        {
            return Some(SkipReason::TryInFlight);
        }
        if record.retry_count > self.config.retry_max {
            return Some(SkipReason::RetryBudgetExhausted);
        }
        if record.pattern == TransactionPattern::Cc && record.status == TransactionStatus::Trying {
            return Some(SkipReason::CcStillTrying);
        }
        if record.role == TransactionRole::Participant
            && now_ms < record.created_at.saturating_add(self.config.participant_grace_ms())
        {
            return Some(SkipReason::DeferredToInitiator);
        }
        None
    }

    /// Runs one scan-claim-dispatch pass and reports what it did.
    pub fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(self.config.recovery_delay_ms);
        debug!("recovery cycle started, cutoff {}", cutoff);

        let candidates = match self.repository.list_eligible_for_recovery(cutoff) {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("recovery scan failed: {}", e);
                report.errors += 1;
                return report;
            }
        };

        for record in candidates {
            report.scanned += 1;
            if let Some(reason) = self.evaluate(&record, now) {
                if reason == SkipReason::RetryBudgetExhausted {
                    error!(
                        "transaction {} exceeded the retry budget ({} > {}), manual intervention required",
                        record.id, record.retry_count, self.config.retry_max
                    );
                    report.exhausted.push(record.id.clone());
                } else {
                    debug!("skipping transaction {}: {:?}", record.id, reason);
                }
                *report.skipped.entry(reason).or_insert(0) += 1;
                continue;
            }

            let id = record.id.clone();
            match self.recover(record) {
                Ok(RecoveryOutcome::LostClaim) => {
                    debug!("transaction {} claimed by another coordinator", id);
                    report.lost_claims += 1;
                }
                Ok(RecoveryOutcome::Completed) => report.completed += 1,
                Ok(RecoveryOutcome::Narrowed { .. }) => report.narrowed += 1,
                Err(e) => {
                    error!("recovery of transaction {} aborted: {}", id, e);
                    report.errors += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                "recovery cycle done: scanned={} completed={} narrowed={} lost={} skipped={} errors={}",
                report.scanned,
                report.completed,
                report.narrowed,
                report.lost_claims,
                report.total_skipped(),
                report.errors
            );
        }
        report
    }

    /// Claims `record` and, if the claim holds, compensates every participant.
    pub fn recover(&self, mut record: TransactionRecord) -> Result<RecoveryOutcome> {
        if self.repository.update(&mut record)? == 0 {
            return Ok(RecoveryOutcome::LostClaim);
        }

        let action = record.status.recovery_action();
        let context = TransactionContext {
            transaction_id: record.id.clone(),
            action,
            role: record.role,
            retry_count: record.retry_count,
        };
        debug!(
            "claimed transaction {} (retry {}), running {:?}",
            record.id, record.retry_count, action
        );

        let mut failed = Vec::with_capacity(record.participants.len());
        for participant in &record.participants {
            let invocation = match action {
                TccAction::Confirming => &participant.confirm,
                TccAction::Canceling => &participant.cancel,
            };
            if let Err(e) = self.dispatcher.invoke(&context, invocation) {
                warn!(
                    "{:?} of {} failed for transaction {}: {}",
                    action,
                    invocation.label(),
                    record.id,
                    e
                );
                failed.push(participant.clone());
            }
        }

        if failed.is_empty() {
            self.repository.remove(&record.id)?;
            info!("transaction {} completed by recovery ({:?})", record.id, action);
            return Ok(RecoveryOutcome::Completed);
        }

        let remaining = failed.len();
        record.participants = failed;
        self.repository.update_participants(&record)?;
        warn!(
            "transaction {} still has {} failed participant(s), retrying next cycle",
            record.id, remaining
        );
        Ok(RecoveryOutcome::Narrowed { remaining })
    }

    /// Moves the scheduler onto its own thread.
    ///
    /// The first cycle runs after `initial_delay`, later cycles
    /// `scheduled_delay` after the previous one finished.
    pub fn start(self) -> Result<SchedulerHandle> {
        if !self.repository.capabilities().conditional_update {
            warn!(
                "{} repository has no conditional update; run a single coordinator replica against it",
                self.repository.scheme()
            );
        }
        let (sender, receiver) = bounded::<SchedulerCommand>(16);
        let cycles = Arc::new(AtomicU64::new(0));
        let last_report = Arc::new(Mutex::new(None));

        let initial_delay = self.config.initial_delay();
        let scheduled_delay = self.config.scheduled_delay();
        let loop_cycles = Arc::clone(&cycles);
        let loop_report = Arc::clone(&last_report);
        let handle = thread::Builder::new()
            .name("tcc-recovery".to_string())
            .spawn(move || {
                let mut wait = initial_delay;
                loop {
                    match receiver.recv_timeout(wait) {
                        Ok(SchedulerCommand::RunNow) | Err(RecvTimeoutError::Timeout) => {}
                        Ok(SchedulerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            info!("recovery scheduler shutting down");
                            break;
                        }
                    }
                    match catch_unwind(AssertUnwindSafe(|| self.run_cycle())) {
                        Ok(report) => *loop_report.lock() = Some(report),
                        Err(_) => error!("recovery cycle panicked, continuing with the next cycle"),
                    }
                    loop_cycles.fetch_add(1, Ordering::SeqCst);
                    wait = scheduled_delay;
                }
            })?;
        info!(
            "recovery scheduler started (initial delay {:?}, delay {:?})",
            initial_delay, scheduled_delay
        );

        Ok(SchedulerHandle {
            sender,
            handle: Some(handle),
            cycles,
            last_report,
        })
    }
}

enum SchedulerCommand {
    RunNow,
    Shutdown,
}

/// Control handle of a running [`RecoveryScheduler`].
///
/// Dropping the handle shuts the scheduler down the same way
/// [`SchedulerHandle::shutdown`] does.
pub struct SchedulerHandle {
    sender: Sender<SchedulerCommand>,
    handle: Option<JoinHandle<()>>,
    cycles: Arc<AtomicU64>,
    last_report: Arc<Mutex<Option<CycleReport>>>,
}

impl SchedulerHandle {
    /// Asks for a cycle right away instead of waiting for the next tick.
    ///
    /// Never blocks. When enough requests are already queued the call is
    /// folded into them, since one pending cycle covers every request made
    /// before it starts.
    pub fn trigger(&self) -> Result<()> {
        match self.sender.try_send(SchedulerCommand::RunNow) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => {
                Err(TccError::Other("recovery scheduler is not running".to_string()))
            }
        }
    }

    /// Number of cycles finished so far.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.last_report.lock().clone()
    }

    /// Stops the scheduler. A cycle in progress runs to completion first.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        // The loop may already be gone; joining is what matters.
        let _ = self.sender.send(SchedulerCommand::Shutdown);
        handle
            .join()
            .map_err(|_| TccError::Other("recovery thread panicked".to_string()))
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("{}", e);
        }
    }
}
