use serde::{Deserialize, Serialize};

/// A single argument value carried by a stored invocation.
///
/// Arguments are persisted inside the transaction log, so they are limited to
/// plain data. Anything richer is expected to be encoded by the interception
/// layer (for example into `Bytes` or `Str`) and decoded again by the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<ArgValue>),
}

impl ArgValue {
    /// Returns the string payload if this is an `ArgValue::Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ArgValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        ArgValue::Str(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        ArgValue::Str(s)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::I64(v)
    }
}

impl From<u64> for ArgValue {
    fn from(v: u64) -> Self {
        ArgValue::U64(v)
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<Vec<u8>> for ArgValue {
    fn from(v: Vec<u8>) -> Self {
        ArgValue::Bytes(v)
    }
}

/// A stored reference to a confirm or cancel operation.
///
/// `target` is the stable identity under which a handler was registered with
/// the dispatcher, `operation` the operation name on that target. The
/// declared `parameter_types` let the dispatcher pick the exact overload when
/// a target registers the same operation name more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInvocation {
    pub target: String,
    pub operation: String,
    pub args: Vec<ArgValue>,
    pub parameter_types: Vec<String>,
}

impl OperationInvocation {
    /// Creates an invocation without arguments.
    pub fn new(target: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            operation: operation.into(),
            args: Vec::new(),
            parameter_types: Vec::new(),
        }
    }

    /// Appends one argument together with its declared type name.
    pub fn arg(mut self, type_name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.parameter_types.push(type_name.into());
        self.args.push(value.into());
        self
    }

    /// Human readable `target::operation` label used in logs.
    pub fn label(&self) -> String {
        format!("{}::{}", self.target, self.operation)
    }
}

/// One enlisted resource of a transaction: how to confirm it and how to
/// cancel it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantDescriptor {
    pub confirm: OperationInvocation,
    pub cancel: OperationInvocation,
}

impl ParticipantDescriptor {
    pub fn new(confirm: OperationInvocation, cancel: OperationInvocation) -> Self {
        Self { confirm, cancel }
    }
}
