//! Error types for the VM host.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    /// The engine or context could not be created.
    #[error("failed to create VM: {0}")]
    Create(String),

    /// A script evaluation raised; the message is the JS-side
    /// stringification of the exception.
    #[error("{0}")]
    Js(String),

    /// The worker module failed to parse or evaluate.
    #[error("{0}")]
    Compile(String),

    /// A bridge wait ran past its deadline.
    #[error("deadline exceeded")]
    Deadline,

    /// Execution was cut short by `interrupt()`; the VM must be retired.
    #[error("VM interrupted")]
    Interrupted,

    /// `reset()` found state it could not clear; the VM must be retired.
    #[error("VM left dirty state: {0}")]
    Dirty(String),
}

impl VmError {
    pub fn create(msg: impl Into<String>) -> Self {
        Self::Create(msg.into())
    }

    pub fn js(msg: impl Into<String>) -> Self {
        Self::Js(msg.into())
    }
}

pub type VmResult<T> = Result<T, VmError>;
