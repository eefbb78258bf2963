//! Invocation runtime core of the Keel durable execution SDK.
//!
//! One [`InvocationStateMachine`] is born per stream, journals every
//! externally-observable effect of the handler it drives, and
//! deterministically replays recorded effects when the supervisor restarts
//! the invocation with a longer journal.

mod completions;
pub mod context;
pub mod discovery;
mod error;
mod headers;
mod journal;
mod machine;
mod protocol;
pub mod registry;
mod retries;
mod run;
mod state;

use std::borrow::Cow;

use bytes::Bytes;

pub use crate::retries::RetryPolicy;
pub use context::{all, race, Awaitable, Context};
pub use error::{codes, Error};
pub use headers::HeaderMap;
pub use machine::{HandlerFn, HandlerResult, InvocationStateMachine, MachineOptions};
pub use protocol::Version;
pub use run::{CancelWatcher, RunError};

#[derive(Debug, Eq, PartialEq)]
pub struct Header {
    pub key: Cow<'static, str>,
    pub value: Cow<'static, str>,
}

#[derive(Debug)]
pub struct ResponseHead {
    pub status_code: u16,
    pub headers: Vec<Header>,
    pub version: Version,
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("Suspended execution")]
pub struct SuspendedError;

/// Invocation input, unwrapped from the journal's Input entry.
#[derive(Debug, Eq, PartialEq)]
pub struct Input {
    pub invocation_id: String,
    pub random_seed: u64,
    pub key: String,
    pub headers: Vec<Header>,
    pub input: Bytes,
}

/// Addressee of a durable call or send.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Target {
    pub service: String,
    pub handler: String,
    pub key: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl Target {
    pub fn service(service: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            handler: handler.into(),
            key: None,
            headers: vec![],
        }
    }

    pub fn keyed(
        service: impl Into<String>,
        key: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            handler: handler.into(),
            key: Some(key.into()),
            headers: vec![],
        }
    }
}

/// Handler-visible non-retryable business failure.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct TerminalFailure {
    pub code: u16,
    pub message: String,
}

impl TerminalFailure {
    pub fn new(code: impl Into<u16>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// What a completion resolves to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Value {
    /// A void/None/undefined success.
    Void,
    Success(Bytes),
    Failure(TerminalFailure),
    /// Only produced by get state keys.
    StateKeys(Vec<String>),
}

#[derive(Debug, Clone)]
pub enum NonEmptyValue {
    Success(Bytes),
    Failure(TerminalFailure),
}

impl From<NonEmptyValue> for Value {
    fn from(value: NonEmptyValue) -> Self {
        match value {
            NonEmptyValue::Success(s) => Value::Success(s),
            NonEmptyValue::Failure(f) => Value::Failure(f),
        }
    }
}

/// Outcome of one side-effect closure execution, as journaled.
#[derive(Debug, Clone)]
pub enum RunExitResult {
    Success(Bytes),
    TerminalFailure(TerminalFailure),
}

/// Result of any durable operation, and what a handler hands back to the
/// machine: retryable vs terminal is encoded in the variant, never in a
/// thrown type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Terminal(#[from] TerminalFailure),
    #[error(transparent)]
    Retryable(#[from] Error),
    #[error(transparent)]
    Suspended(#[from] SuspendedError),
    #[error("invocation cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn terminal(code: impl Into<u16>, message: impl Into<String>) -> Self {
        HandlerError::Terminal(TerminalFailure::new(code, message))
    }
}

#[cfg(test)]
mod tests;
