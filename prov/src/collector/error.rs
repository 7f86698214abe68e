// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

/// Collection result.
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// A guest-level exception: raised by user code or by a builtin on bad
/// input. Recorded against the current activation and re-raised.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct UserError {
    pub kind: String,
    pub message: String,
}

impl UserError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        UserError {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    /// A guest exception in flight. Host exception semantics are preserved:
    /// the error propagates unchanged once recorded.
    #[error("guest exception: {0}")]
    Raised(#[from] UserError),

    /// The collector reached a state its invariants forbid (empty scope stack
    /// on pop, unknown activation, …). Fatal: the trial should be aborted as
    /// unfinished after a best-effort flush.
    #[error("collector invariant violated: {0}")]
    Invariant(String),

    /// A storage or system failure. Fatal to provenance, but must not mask a
    /// guest exception also in flight.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl ExecutionError {
    pub fn invariant(message: impl Into<String>) -> Self {
        ExecutionError::Invariant(message.into())
    }

    /// The guest exception carried by this error, if any.
    pub fn raised(&self) -> Option<&UserError> {
        match self {
            ExecutionError::Raised(user) => Some(user),
            _ => None,
        }
    }

    /// Whether this error ends the trial as `unfinished` rather than crashing
    /// provenance outright.
    pub fn is_guest(&self) -> bool {
        matches!(self, ExecutionError::Raised(_))
    }
}
