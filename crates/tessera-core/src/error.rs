//! Error taxonomy shared by every Tessera crate.
//!
//! Every public operation returns [`Result`]; a [`CoreError`] is the status of
//! a failed call and [`CoreError::code`] reduces it to a [`StatusCode`].

use std::fmt;

use thiserror::Error;

use crate::types::NodeId;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while building, loading or running a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A provider options record failed validation.
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// A provider with the same `(type, name)` key is already registered.
    #[error("Provider {0} is already registered")]
    DuplicateProvider(String),

    /// An identical kernel signature is already registered for the provider.
    #[error("Duplicate kernel: {0}")]
    DuplicateKernel(String),

    /// No registered provider has a kernel for the node.
    #[error("No kernel found for node {node} ('{node_name}', op {op_type}): {reason}")]
    KernelNotFound {
        /// Index of the node in the graph.
        node: NodeId,
        /// Node name.
        node_name: String,
        /// Operation type.
        op_type: String,
        /// Why resolution failed.
        reason: String,
    },

    /// The memory planner could not satisfy an allocator constraint.
    #[error("Memory planning failed: {0}")]
    PlanningFailed(String),

    /// Bad input to a public operation (graph structure, run inputs, state).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A kernel failed during a run.
    #[error("Dispatch failed at node {node} ('{node_name}', op {op_type}): {message}")]
    DispatchFailure {
        /// Index of the failing node.
        node: NodeId,
        /// Name of the failing node.
        node_name: String,
        /// Operation type of the failing node.
        op_type: String,
        /// Kernel error message.
        message: String,
    },

    /// The session has been closed.
    #[error("Session is closed")]
    SessionClosed,

    /// An internal invariant was violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result code of a status, one per [`CoreError`] variant plus `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// The call succeeded.
    Ok,
    /// See [`CoreError::InvalidOption`].
    InvalidOption,
    /// See [`CoreError::DuplicateProvider`].
    DuplicateProvider,
    /// See [`CoreError::DuplicateKernel`].
    DuplicateKernel,
    /// See [`CoreError::KernelNotFound`].
    KernelNotFound,
    /// See [`CoreError::PlanningFailed`].
    PlanningFailed,
    /// See [`CoreError::InvalidArgument`].
    InvalidArgument,
    /// See [`CoreError::DispatchFailure`].
    DispatchFailure,
    /// See [`CoreError::SessionClosed`].
    SessionClosed,
    /// See [`CoreError::Internal`].
    Internal,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl CoreError {
    /// The status code of this error.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::InvalidOption(_) => StatusCode::InvalidOption,
            Self::DuplicateProvider(_) => StatusCode::DuplicateProvider,
            Self::DuplicateKernel(_) => StatusCode::DuplicateKernel,
            Self::KernelNotFound { .. } => StatusCode::KernelNotFound,
            Self::PlanningFailed(_) => StatusCode::PlanningFailed,
            Self::InvalidArgument(_) => StatusCode::InvalidArgument,
            Self::DispatchFailure { .. } => StatusCode::DispatchFailure,
            Self::SessionClosed => StatusCode::SessionClosed,
            Self::Internal(_) => StatusCode::Internal,
        }
    }

    /// Whether this error means shared session state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// Build a [`CoreError::DispatchFailure`] from a kernel error.
    pub fn dispatch(node: NodeId, node_name: &str, op_type: &str, err: &anyhow::Error) -> Self {
        Self::DispatchFailure {
            node,
            node_name: node_name.to_string(),
            op_type: op_type.to_string(),
            message: format!("{err:#}"),
        }
    }

    /// Shorthand for [`CoreError::InvalidArgument`].
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Shorthand for [`CoreError::InvalidOption`].
    pub fn invalid_option(msg: impl Into<String>) -> Self {
        Self::InvalidOption(msg.into())
    }

    /// Shorthand for [`CoreError::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Extension for turning a `Result` into its status code.
pub trait StatusExt {
    /// `StatusCode::Ok` on success, the error's code otherwise.
    fn status(&self) -> StatusCode;
}

impl<T> StatusExt for Result<T> {
    fn status(&self) -> StatusCode {
        match self {
            Ok(_) => StatusCode::Ok,
            Err(e) => e.code(),
        }
    }
}
