//! Error handling for lockstep
//!
//! This module defines the error taxonomy shared by node controllers,
//! barriers, command channels and execution units, plus a Result alias.
//!
//! Connection, launch, timeout and sync failures are recoverable: they are
//! handed back to the coordinator, which decides whether to retry, drop the
//! node or abort the configuration. Protocol violations are programming
//! errors and are logged at error level where they are raised.

use thiserror::Error;

/// Main error type for lockstep operations
#[derive(Error, Debug)]
pub enum LockstepError {
    /// The transport could not be established or was lost
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// The remote process could not be started or never connected back
    #[error("Launch failure: {0}")]
    LaunchFailure(String),

    /// An operation was invoked in a state that does not permit it
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A bounded wait was exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The remote side acknowledged init or exit with a failure
    #[error("Sync failure: {0}")]
    SyncFailure(String),

    /// A blocking wait was interrupted by cancellation of the calling unit
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The task of an execution unit panicked
    #[error("Thread panicked: {0}")]
    ThreadPanic(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed packets or config documents
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<LockstepError>,
    },
}

impl LockstepError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        LockstepError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Raise a protocol violation, logging it loudly
    pub fn protocol(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("Protocol violation: {}", message);
        LockstepError::ProtocolViolation(message)
    }

    /// The innermost error, looking through any added context
    pub fn root(&self) -> &LockstepError {
        match self {
            LockstepError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the coordinator may recover from this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self.root(),
            LockstepError::ProtocolViolation(_) | LockstepError::ThreadPanic(_)
        )
    }

    /// Whether this error is a protocol violation
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self.root(), LockstepError::ProtocolViolation(_))
    }
}

/// Result type alias for lockstep operations
pub type Result<T> = std::result::Result<T, LockstepError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
