//! Error types for procpool.

use thiserror::Error;

/// Main error type for pool, channel, server and client operations.
///
/// The first four variants travel over the wire as tagged replies
/// (`SpawnException`, `BusyException`, `IOException`, `SecurityException`);
/// the rest are local to one process.
#[derive(Error, Debug)]
pub enum PoolError {
    /// A worker failed to start or initialize. The optional error page body
    /// is an opaque blob produced by the application's startup failure.
    #[error("could not spawn application process: {message}")]
    Spawn {
        message: String,
        error_page: Option<Vec<u8>>,
    },

    /// All capacity is exhausted and the request deadline elapsed.
    #[error("the application pool is too busy: {0}")]
    Busy(String),

    /// Transport fault on a channel, or an OS-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent bytes that do not form a valid frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A channel operation exceeded its read or write deadline.
    #[error("channel operation timed out")]
    Timeout,

    /// A blocking call was cancelled before transferring any part of a frame.
    #[error("operation interrupted")]
    Interrupted,

    /// Authentication or authorization failure. Recoverable: the connection
    /// it occurred on stays usable.
    #[error("security error: {0}")]
    Security(String),

    /// Precondition violation by the caller, e.g. a command before connect.
    #[error("{0}")]
    Runtime(String),
}

impl PoolError {
    /// Construct a spawn error without an error page.
    pub fn spawn(message: impl Into<String>) -> Self {
        Self::Spawn {
            message: message.into(),
            error_page: None,
        }
    }

    /// True when the connection this error occurred on may keep being used.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Security(_) | Self::Busy(_) | Self::Spawn { .. })
    }
}

/// Result type alias for procpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(PoolError::Security("denied".into()).is_recoverable());
        assert!(PoolError::Busy("full".into()).is_recoverable());
        assert!(PoolError::spawn("boom").is_recoverable());

        assert!(!PoolError::Timeout.is_recoverable());
        assert!(!PoolError::Protocol("bad frame".into()).is_recoverable());
        assert!(!PoolError::Interrupted.is_recoverable());
    }

    #[test]
    fn test_spawn_display() {
        let err = PoolError::spawn("exit status 1");
        assert!(err.to_string().contains("exit status 1"));
    }
}
