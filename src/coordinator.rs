use std::sync::Arc;

use log::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::config::TccConfig;
use crate::dispatch::Dispatcher;
use crate::errors::Result;
use crate::model::{TransactionRecord, TransactionStatus};
use crate::repository::CoordinatorRepository;
use crate::scheduler::{RecoveryScheduler, SchedulerHandle};

/// TCC Coordinator Prelude
pub mod prelude {
    pub use crate::clock::*;
    pub use crate::config::*;
    pub use crate::coordinator::TccCoordinator;
    pub use crate::dispatch::*;
    pub use crate::errors::*;
    pub use crate::model::*;
    pub use crate::repository::file::FileCoordinatorRepository;
    pub use crate::repository::node::{MemoryNodeStore, NodeError, NodeStat, NodeStore};
    #[cfg(feature = "rocks")]
    pub use crate::repository::rocks::RocksCoordinatorRepository;
    #[cfg(feature = "zookeeper")]
    pub use crate::repository::zk_client::ZkNodeStore;
    pub use crate::repository::zookeeper::ZookeeperCoordinatorRepository;
    pub use crate::repository::{CoordinatorRepository, RepositoryCapabilities};
    pub use crate::scheduler::*;
    pub use crate::serializer::*;
}

/// The main entry point of the coordinator.
///
/// Owns an initialized repository and the dispatcher, and is the surface the
/// interception layer writes through. Recovery runs separately via
/// [`TccCoordinator::start_recovery`].
pub struct TccCoordinator {
    repository: Arc<dyn CoordinatorRepository>,
    dispatcher: Arc<dyn Dispatcher>,
    config: TccConfig,
    clock: Arc<dyn Clock>,
}

impl TccCoordinator {
    /// Validates `config` and initializes `repository` for its namespace.
    ///
    /// The repository stamps `last_updated_at` on claims with its own clock.
    /// It must be built with the same clock later passed to
    /// [`TccCoordinator::with_clock`], or the eligibility cutoff and the
    /// stored timestamps drift apart.
    pub fn new<R>(
        mut repository: R,
        dispatcher: Arc<dyn Dispatcher>,
        config: TccConfig,
    ) -> Result<Self>
    where
        R: CoordinatorRepository + 'static,
    {
        config.validate()?;
        repository.initialize(&config.namespace, &config.repository)?;
        info!(
            "tcc coordinator ready: namespace={} repository={}",
            config.namespace,
            repository.scheme()
        );
        Ok(Self {
            repository: Arc::new(repository),
            dispatcher,
            config,
            clock: Arc::new(SystemClock),
        })
    }

    /// Clock behind [`TccCoordinator::now_ms`] and the recovery scheduler.
    ///
    /// The repository was handed over already built and keeps its own clock,
    /// so pass the same one to the repository's `with_clock` first.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &TccConfig {
        &self.config
    }

    pub fn repository(&self) -> Arc<dyn CoordinatorRepository> {
        Arc::clone(&self.repository)
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Records a new transaction at try time.
    pub fn begin(&self, record: &TransactionRecord) -> Result<()> {
        self.repository.create(record)?;
        debug!(
            "transaction {} logged ({}, {:?}, {:?})",
            record.id, record.status, record.role, record.pattern
        );
        Ok(())
    }

    /// Moves a transaction to `status`. Returns `false` if it is not logged.
    pub fn update_status(&self, id: &str, status: TransactionStatus) -> Result<bool> {
        let found = self.repository.update_status(id, status)? > 0;
        debug!("transaction {} -> {} (found: {})", id, status, found);
        Ok(found)
    }

    pub fn find(&self, id: &str) -> Result<Option<TransactionRecord>> {
        self.repository.find_by_id(id)
    }

    /// Operator-initiated removal of a record, e.g. one that exhausted its
    /// retry budget and was resolved by hand.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let removed = self.repository.remove(id)? > 0;
        if removed {
            info!("transaction {} removed by operator", id);
        }
        Ok(removed)
    }

    /// A scheduler over this coordinator's repository and dispatcher, for
    /// driving cycles by hand.
    pub fn scheduler(&self) -> RecoveryScheduler {
        RecoveryScheduler::new(
            Arc::clone(&self.repository),
            Arc::clone(&self.dispatcher),
            self.config.recovery.clone(),
        )
        .with_clock(Arc::clone(&self.clock))
    }

    /// Starts periodic recovery on a background thread.
    pub fn start_recovery(&self) -> Result<SchedulerHandle> {
        self.scheduler().start()
    }
}
