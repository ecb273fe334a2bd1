//! Fatal startup errors and their process exit codes.

use crate::config::ConfigError;
use std::io;

/// An unrecoverable failure while bringing the server up.
///
/// Each variant maps to a distinct process exit code so scripts can tell
/// a busy port apart from a kernel without io_uring.
#[derive(Debug)]
pub enum StartupError {
    /// Configuration could not be loaded or was invalid.
    Config(ConfigError),
    /// The listening socket could not be created.
    Socket(io::Error),
    /// The listening socket could not be bound.
    Bind(io::Error),
    /// The bound socket could not be put into listening mode.
    Listen(io::Error),
    /// The completion queue could not be created.
    CompletionQueue(io::Error),
    /// Threads, signal handlers or other runtime plumbing failed.
    Runtime(io::Error),
}

impl StartupError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Runtime(_) => 1,
            StartupError::Config(_) => 2,
            StartupError::Socket(_) => 3,
            StartupError::Bind(_) => 4,
            StartupError::Listen(_) => 5,
            StartupError::CompletionQueue(_) => 6,
        }
    }
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "{}", e),
            StartupError::Socket(e) => write!(f, "failed to create socket: {}", e),
            StartupError::Bind(e) => write!(f, "failed to bind the address: {}", e),
            StartupError::Listen(e) => write!(f, "failed to listen: {}", e),
            StartupError::CompletionQueue(e) => {
                write!(f, "failed to create completion queue: {}", e)
            }
            StartupError::Runtime(e) => write!(f, "runtime failure: {}", e),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartupError::Config(e) => Some(e),
            StartupError::Socket(e)
            | StartupError::Bind(e)
            | StartupError::Listen(e)
            | StartupError::CompletionQueue(e)
            | StartupError::Runtime(e) => Some(e),
        }
    }
}

impl From<ConfigError> for StartupError {
    fn from(e: ConfigError) -> Self {
        StartupError::Config(e)
    }
}
