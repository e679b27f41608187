use std::fmt;

use thiserror::Error;

use crate::agent::AgentId;
use crate::message::MessageId;

/// The result of one `check` or `receive` call on a behavior.
pub type InvokeResult = Result<(), AgentError>;

/// Runtime error for agent invocations, with variants designed around what
/// the caller can do about them.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Bad input or agent logic error. Don't retry, fix the options.
    #[error("invalid: {0}")]
    Invalid(String),
    /// The agent attempted something its capability set forbids.
    #[error("{0}")]
    Capability(String),
    /// A template could not be parsed or rendered.
    #[error("template error: {0}")]
    Template(String),
    /// No behavior is registered under this type name.
    #[error("unknown agent type: {0}")]
    UnknownType(String),
    /// Transient failure (network, rate limit). Retrying might help.
    #[error("transient: {0}")]
    Transient(String),
    /// The backing store refused the operation.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Everything else. Inspect the message for details.
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Create an [`Invalid`](AgentError::Invalid) error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        AgentError::Invalid(msg.into())
    }

    /// Create an [`Other`](AgentError::Other) error.
    pub fn other(msg: impl Into<String>) -> Self {
        AgentError::Other(msg.into())
    }

    /// Create a [`Transient`](AgentError::Transient) error.
    pub fn transient(msg: impl Into<String>) -> Self {
        AgentError::Transient(msg.into())
    }

    pub(crate) fn cannot_create_messages() -> Self {
        AgentError::Capability("This agent cannot create messages".into())
    }

    pub(crate) fn cannot_receive_messages() -> Self {
        AgentError::Capability("This agent cannot receive messages".into())
    }
}

/// Errors raised by the message and agent stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("message {0} not found")]
    MessageNotFound(MessageId),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

/// A configuration problem attached to one option field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Configuration-time validation errors, in the order they were found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.errors.iter()
    }

    /// Messages attached to a single field.
    pub fn on(&self, field: &str) -> Vec<&str> {
        self.errors
            .iter()
            .filter(|e| e.field == field)
            .map(|e| e.message.as_str())
            .collect()
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for e in &self.errors {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.field, e.message)?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}
