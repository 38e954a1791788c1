//! Handler-level control-flow signals
//!
//! Handlers steer dispatch by returning these as errors: none of them is a
//! crash. The runtime interprets [`HandlerError::Switched`] and
//! [`HandlerError::Canceled`]; the executor yields the rest as task
//! results.

use thiserror::Error;

use crate::message::MessageChain;

/// Convenience result type for handler bodies.
pub type HandlerResult = std::result::Result<serde_json::Value, HandlerError>;

/// Why a suspended handler was woken with an error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    /// The wait deadline passed before a matching event arrived.
    #[error("wait timed out")]
    Timeout,
    /// The task was cancelled while suspended.
    #[error("task cancelled while waiting")]
    Cancelled,
}

#[derive(Clone, Debug, Error)]
pub enum HandlerError {
    /// Abort handling of the current event silently (preprocessor origin).
    #[error("event handling canceled: {reason}")]
    Canceled { reason: String },

    /// Terminate the current handler chain with a boolean outcome.
    #[error("handler chain finished (success: {success})")]
    Finished { success: bool },

    /// Replace the current event's message and restart dispatch. Used for
    /// command aliases and message de-sugaring.
    #[error("dispatch switched to a rewritten message")]
    Switched { message: MessageChain },

    /// This processor cannot handle the event; others should continue.
    #[error("handler not applicable: {reason}")]
    Failed { reason: String },

    /// A suspension ended abnormally.
    #[error(transparent)]
    Wait(#[from] WaitError),

    /// Application-defined failure.
    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    pub fn canceled(reason: impl Into<String>) -> Self {
        HandlerError::Canceled { reason: reason.into() }
    }

    pub fn finished(success: bool) -> Self {
        HandlerError::Finished { success }
    }

    pub fn switched(message: impl Into<MessageChain>) -> Self {
        HandlerError::Switched { message: message.into() }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed { reason: reason.into() }
    }

    pub fn other(reason: impl Into<String>) -> Self {
        HandlerError::Other(reason.into())
    }
}
