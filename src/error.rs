//! Error types, split by where they travel.
//!
//! [`WorkflowError`] values are part of workflow state: they are persisted
//! inside history events (activity failures, panics, cancellation,
//! non-determinism) and re-materialize on replay. [`BackendError`] and
//! [`ClientError`] are infrastructure errors that never enter history.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::converter::ConversionError;

const ERROR_TYPE_APPLICATION: &str = "application";
const ERROR_TYPE_PANIC: &str = "panic";
const ERROR_TYPE_CANCELED: &str = "canceled";
const ERROR_TYPE_TERMINATED: &str = "terminated";
const ERROR_TYPE_NON_DETERMINISTIC: &str = "non_deterministic_workflow";
const ERROR_TYPE_CONVERSION: &str = "conversion";
const ERROR_TYPE_SUB_WORKFLOW: &str = "sub_workflow";
const ERROR_TYPE_CONTINUED_AS_NEW: &str = "continued_as_new";

/// Error carried through workflow history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{error_type}: {message}")]
pub struct WorkflowError {
    pub error_type: String,
    pub message: String,
}

impl WorkflowError {
    fn new(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.to_string(),
            message: message.into(),
        }
    }

    /// Failure raised by user workflow or activity code.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ERROR_TYPE_APPLICATION, message)
    }

    /// User code panicked; the panic payload becomes the message.
    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(ERROR_TYPE_PANIC, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ERROR_TYPE_CANCELED, message)
    }

    pub fn terminated(message: impl Into<String>) -> Self {
        Self::new(ERROR_TYPE_TERMINATED, message)
    }

    /// Replay produced commands that do not match recorded history. Fatal to
    /// the execution.
    pub fn non_deterministic(message: impl Into<String>) -> Self {
        Self::new(ERROR_TYPE_NON_DETERMINISTIC, message)
    }

    pub fn sub_workflow(message: impl Into<String>) -> Self {
        Self::new(ERROR_TYPE_SUB_WORKFLOW, message)
    }

    /// Sentinel returned by `WorkflowContext::continue_as_new`; recognized by
    /// the executor, never persisted.
    pub(crate) fn continued_as_new() -> Self {
        Self::new(ERROR_TYPE_CONTINUED_AS_NEW, "workflow continued as new")
    }

    pub fn is_canceled(&self) -> bool {
        self.error_type == ERROR_TYPE_CANCELED
    }

    pub fn is_panic(&self) -> bool {
        self.error_type == ERROR_TYPE_PANIC
    }

    pub fn is_non_deterministic(&self) -> bool {
        self.error_type == ERROR_TYPE_NON_DETERMINISTIC
    }
}

impl From<String> for WorkflowError {
    fn from(message: String) -> Self {
        Self::application(message)
    }
}

impl From<&str> for WorkflowError {
    fn from(message: &str) -> Self {
        Self::application(message)
    }
}

impl From<ConversionError> for WorkflowError {
    fn from(err: ConversionError) -> Self {
        Self::new(ERROR_TYPE_CONVERSION, err.to_string())
    }
}

/// Extract a printable message from a captured panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Errors surfaced by a [`crate::backend::Backend`] implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("workflow instance already exists")]
    InstanceAlreadyExists,
    #[error("workflow instance not found")]
    InstanceNotFound,
    /// The task lease expired or was taken over; results must be discarded.
    #[error("task lease lost: {0}")]
    TaskLeaseLost(String),
    #[error("backend failure: {0}")]
    Other(String),
}

/// Errors surfaced by the [`crate::client::Client`] API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("timed out waiting for workflow instance")]
    Timeout,
}
