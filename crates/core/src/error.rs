//! Error types for capgraph.

use thiserror::Error;

/// Result type alias using capgraph's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for capgraph.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Routing Errors
    // =========================================================================
    #[error("Routing failed: {0}")]
    Routing(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Capability Errors
    // =========================================================================
    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Capability execution failed: {0}")]
    CapabilityExecution(String),

    // =========================================================================
    // Provider Errors
    // =========================================================================
    #[error("Completion provider error: {0}")]
    Provider(String),

    #[error("Remote workflow error: {0}")]
    RemoteWorkflow(String),

    // =========================================================================
    // Graph / Configuration Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Storage error: {0}")]
    Store(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a routing error.
    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a capability not found error.
    pub fn capability_not_found(name: impl Into<String>) -> Self {
        Self::CapabilityNotFound(name.into())
    }

    /// Create a capability execution error.
    pub fn capability_execution(msg: impl Into<String>) -> Self {
        Self::CapabilityExecution(msg.into())
    }

    /// Create a completion provider error.
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a remote workflow error.
    pub fn remote_workflow(msg: impl Into<String>) -> Self {
        Self::RemoteWorkflow(msg.into())
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a checkpoint error.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a storage error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error came from a client mistake rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}
