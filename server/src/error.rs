//! Error types for the command center

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while starting, probing or stopping a game process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be spawned.
    #[error("failed to start {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },

    /// `start` was called on a handle that already owns a process.
    #[error("process already started (pid {0})")]
    AlreadyStarted(u32),

    /// The process survived both the graceful stop and the forced kill.
    #[error("failed to terminate process {pid}: {reason}")]
    Terminate { pid: u32, reason: String },
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Game not found: {0}")]
    UnknownGame(String),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("a session is already active")]
    AlreadyActive,
    #[error("session duration must be positive")]
    ZeroDuration,
    #[error("No active session to pause")]
    NotRunning,
    #[error("No active session to resume")]
    NotPaused,
}

/// A host metric could not be read; the poller keeps its previous snapshot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("resource sampling failed: {0}")]
pub struct SampleError(pub String);

/// Failures reading or validating the game catalog.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid catalog: {0}")]
    Invalid(String),
}

/// Error reported back to the client that issued a command.
///
/// The `Display` text is what ends up in the response's `error` field.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("Failed to launch game: {0}")]
    Process(#[from] ProcessError),
}

impl From<LaunchError> for CommandError {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::UnknownGame(id) => {
                CommandError::NotFound(format!("Game not found: {}", id))
            }
            LaunchError::Process(e) => CommandError::Process(e),
        }
    }
}

impl From<TimerError> for CommandError {
    fn from(err: TimerError) -> Self {
        CommandError::InvalidState(err.to_string())
    }
}
