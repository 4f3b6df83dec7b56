use std::fmt;
use std::time::Duration;

use crate::rpc::RpcError;

#[derive(Debug)]
pub enum DevnetError {
    /// A bounded wait did not resolve before its deadline.
    Timeout { what: String, after: Duration },
    SyncTimeout { node: String, height: u64, target: u64 },
    Rpc(RpcError),
    /// An on-chain or cross-chain check failed. Never retried.
    StateMismatch {
        what: String,
        expected: String,
        observed: String,
    },
    SeedMismatch { submitted: u64, reported: u64 },
    /// A wallet tried to spend before its outputs matured.
    InsufficientOutputs { wallet: String, detail: String },
    Config(String),
    Process(String),
    Io(String),
    Interrupted,
}

impl DevnetError {
    pub fn mismatch(
        what: impl Into<String>,
        expected: impl fmt::Display,
        observed: impl fmt::Display,
    ) -> Self {
        DevnetError::StateMismatch {
            what: what.into(),
            expected: expected.to_string(),
            observed: observed.to_string(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, DevnetError::Interrupted)
    }
}

impl fmt::Display for DevnetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevnetError::Timeout { what, after } => {
                write!(f, "timed out after {:.1}s waiting for {what}", after.as_secs_f64())
            }
            DevnetError::SyncTimeout {
                node,
                height,
                target,
            } => write!(
                f,
                "timed out syncing nodes: {node} stuck at height {height}, expected >= {target}"
            ),
            DevnetError::Rpc(err) => write!(f, "{err}"),
            DevnetError::StateMismatch {
                what,
                expected,
                observed,
            } => write!(f, "{what}: expected {expected}, observed {observed}"),
            DevnetError::SeedMismatch {
                submitted,
                reported,
            } => write!(
                f,
                "seeded {submitted} service nodes but the contract reports {reported}"
            ),
            DevnetError::InsufficientOutputs { wallet, detail } => {
                write!(f, "wallet {wallet} has insufficient spendable outputs: {detail}")
            }
            DevnetError::Config(message) => write!(f, "configuration error: {message}"),
            DevnetError::Process(message) => write!(f, "process error: {message}"),
            DevnetError::Io(message) => write!(f, "io error: {message}"),
            DevnetError::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for DevnetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DevnetError::Rpc(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RpcError> for DevnetError {
    fn from(err: RpcError) -> Self {
        DevnetError::Rpc(err)
    }
}
