pub mod errors;
pub mod model;
pub mod config;
pub mod clock;
pub mod serializer;
pub mod repository;
pub mod dispatch;
pub mod scheduler;
pub mod coordinator;

// Re-export key types and structs for easier access
pub use errors::{DispatchError, HandlerError, Result, TccError};
pub use model::{
    ArgValue, OperationInvocation, ParticipantDescriptor, TccAction, TransactionPattern,
    TransactionRecord, TransactionRole, TransactionStatus,
};
pub use config::{RecoveryConfig, RepositoryConfig, TccConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use serializer::{RecordSerializer, SerializerKind};
pub use repository::{CoordinatorRepository, RepositoryCapabilities};
pub use dispatch::{Dispatcher, LocalDispatcher, TransactionContext};
pub use scheduler::{CycleReport, RecoveryOutcome, RecoveryScheduler, SchedulerHandle, SkipReason};
pub use coordinator::{TccCoordinator, prelude};
