pub mod invocation;
pub mod record;

pub use invocation::{ArgValue, OperationInvocation, ParticipantDescriptor};
pub use record::{TccAction, TransactionPattern, TransactionRecord, TransactionRole, TransactionStatus};
