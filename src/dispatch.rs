//! Resolution of stored confirm/cancel invocations to callable handlers.
//!
//! Handlers are registered under a stable target identity and an operation
//! name. When a target registers the same operation name with several
//! parameter signatures, the declared `parameter_types` of the stored
//! invocation select the exact one; a handler registered without a
//! signature accepts any arguments for that name.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use crossbeam_channel::{RecvTimeoutError, bounded};
use log::debug;
use parking_lot::RwLock;

use crate::errors::{DispatchError, HandlerError};
use crate::model::{ArgValue, OperationInvocation, TccAction, TransactionRole};

/// Per-call transaction context handed to every handler.
///
/// Passed explicitly so nested calls made by a handler can tell which
/// transaction and which phase they run under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionContext {
    pub transaction_id: String,
    pub action: TccAction,
    pub role: TransactionRole,
    /// Retry count of the record at the time of the call.
    pub retry_count: u32,
}

/// Result type a confirm or cancel handler returns.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// A registered confirm or cancel operation.
pub type Handler = Arc<dyn Fn(&TransactionContext, &[ArgValue]) -> HandlerResult + Send + Sync>;

/// Boundary between the recovery scheduler and participant code.
///
/// Implementations invoke exactly once and never retry; retries happen at
/// participant granularity in the scheduler.
pub trait Dispatcher: Send + Sync {
    fn invoke(
        &self,
        context: &TransactionContext,
        invocation: &OperationInvocation,
    ) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HandlerKey {
    target: String,
    operation: String,
    /// `None` accepts any signature.
    parameter_types: Option<Vec<String>>,
}

/// Registry-backed [`Dispatcher`] for handlers living in this process.
///
/// Remote participants are reached by registering a proxy handler that
/// performs the remote call and maps its failure to a [`HandlerError`].
#[derive(Default)]
pub struct LocalDispatcher {
    handlers: RwLock<HashMap<HandlerKey, Handler>>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for LocalDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDispatcher")
            .field("handlers", &self.handlers.read().len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LocalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds every invocation to `timeout`.
    ///
    /// Timed handlers run on a helper thread. A handler that overruns is
    /// reported as [`DispatchError::Timeout`] and left to finish in the
    /// background; its eventual result is discarded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Registers a handler for one exact parameter signature.
    pub fn register<F>(&self, target: &str, operation: &str, parameter_types: &[&str], handler: F)
    where
        F: Fn(&TransactionContext, &[ArgValue]) -> HandlerResult + Send + Sync + 'static,
    {
        let key = HandlerKey {
            target: target.to_string(),
            operation: operation.to_string(),
            parameter_types: Some(parameter_types.iter().map(|t| t.to_string()).collect()),
        };
        self.handlers.write().insert(key, Arc::new(handler));
    }

    /// Registers a handler that accepts any signature for `operation`.
    ///
    /// An exact-signature registration for the same name takes precedence.
    pub fn register_any<F>(&self, target: &str, operation: &str, handler: F)
    where
        F: Fn(&TransactionContext, &[ArgValue]) -> HandlerResult + Send + Sync + 'static,
    {
        let key = HandlerKey {
            target: target.to_string(),
            operation: operation.to_string(),
            parameter_types: None,
        };
        self.handlers.write().insert(key, Arc::new(handler));
    }

    /// Drops every registration for `target`. Returns how many were removed.
    pub fn unregister_target(&self, target: &str) -> usize {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|key, _| key.target != target);
        before - handlers.len()
    }

    fn resolve(&self, invocation: &OperationInvocation) -> Result<Handler, DispatchError> {
        let handlers = self.handlers.read();
        let mut key = HandlerKey {
            target: invocation.target.clone(),
            operation: invocation.operation.clone(),
            parameter_types: Some(invocation.parameter_types.clone()),
        };
        if let Some(handler) = handlers.get(&key) {
            return Ok(Arc::clone(handler));
        }
        key.parameter_types = None;
        handlers
            .get(&key)
            .cloned()
            .ok_or_else(|| DispatchError::HandlerNotFound {
                target: invocation.target.clone(),
                operation: invocation.operation.clone(),
                parameter_types: invocation.parameter_types.clone(),
            })
    }

    fn call_timed(
        handler: Handler,
        context: &TransactionContext,
        args: &[ArgValue],
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        let (tx, rx) = bounded(1);
        let context = context.clone();
        let args = args.to_vec();
        std::thread::Builder::new()
            .name("tcc-dispatch".to_string())
            .spawn(move || {
                let _ = tx.send(call_guarded(&handler, &context, &args));
            })
            .map_err(|e| {
                DispatchError::Handler(HandlerError::new(format!(
                    "cannot spawn dispatch thread: {}",
                    e
                )))
            })?;
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(DispatchError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::Panicked(
                "dispatch thread exited without a result".to_string(),
            )),
        }
    }
}

/// Runs a handler, turning a panic into [`DispatchError::Panicked`].
fn call_guarded(
    handler: &Handler,
    context: &TransactionContext,
    args: &[ArgValue],
) -> Result<(), DispatchError> {
    match catch_unwind(AssertUnwindSafe(|| (**handler)(context, args))) {
        Ok(result) => result.map_err(DispatchError::from),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(DispatchError::Panicked(msg))
        }
    }
}

impl Dispatcher for LocalDispatcher {
    fn invoke(
        &self,
        context: &TransactionContext,
        invocation: &OperationInvocation,
    ) -> Result<(), DispatchError> {
        if invocation.args.len() != invocation.parameter_types.len() {
            return Err(DispatchError::ArgumentMismatch {
                expected: invocation.parameter_types.len(),
                actual: invocation.args.len(),
            });
        }
        let handler = self.resolve(invocation)?;
        debug!(
            "invoking {} for transaction {} ({:?})",
            invocation.label(),
            context.transaction_id,
            context.action
        );
        match self.timeout {
            Some(timeout) => Self::call_timed(handler, context, &invocation.args, timeout),
            None => call_guarded(&handler, context, &invocation.args),
        }
    }
}
