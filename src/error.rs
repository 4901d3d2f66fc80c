//! Error types for the versioned cache engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the versioned cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Invalid usage (fatal, never retried)
    // =========================================================================
    /// Malformed dependency declaration
    #[error("Invalid dependency: {0}")]
    InvalidDependency(String),

    /// A batch was opened while another batch is open on the same scope
    #[error("A batch is already open in this scope")]
    NestedBatch,

    /// A batched future was read before its batch executed
    #[error("Future result read before its batch was executed")]
    FutureNotResolved,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Backing store errors
    // =========================================================================
    /// Connection failure (refused, dropped, pool exhausted)
    #[error("Backing store connection error: {0}")]
    Connection(String),

    /// Backing store operation timed out
    #[error("Backing store timeout: {0}")]
    Timeout(String),

    /// Script hash is not loaded on the node
    #[error("Script not loaded: {0}")]
    ScriptNotLoaded(String),

    /// Script or protocol error other than "not loaded"
    #[error("Script error: {0}")]
    Script(String),

    // =========================================================================
    // Values
    // =========================================================================
    /// Cached value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error raised by the memoized computation itself
    #[error(transparent)]
    Computation(#[from] anyhow::Error),
}

impl Error {
    /// Connection and timeout errors are recovered locally: reads fail open,
    /// writes are dropped and invalidations are requeued.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout(_))
    }

    /// Errors caused by the calling code rather than the environment.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            Error::InvalidDependency(_)
                | Error::NestedBatch
                | Error::FutureNotResolved
                | Error::Config(_)
        )
    }
}
