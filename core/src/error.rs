//! Core error types and utilities

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("tombstone not found at {0}")]
    TombstoneNotFound(PathBuf),

    #[error("malformed tombstone at {path}: {source}")]
    MalformedTombstone {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to serialize tombstone: {0}")]
    TombstoneSerialize(#[source] serde_yaml::Error),

    #[error("failed to start child process: {0}")]
    ChildStart(#[source] std::io::Error),

    #[error("child process already started")]
    AlreadyStarted,

    #[error("child process not started")]
    NotStarted,

    #[error("shutdown already started")]
    ShutdownInProgress,

    #[error("failed to signal child process: {0}")]
    ChildSignal(#[source] nix::errno::Errno),

    #[error("failed to wait for child process: {0}")]
    ChildWait(#[source] std::io::Error),

    #[error("timed out waiting for birth deps to be ready: {0:?}")]
    BirthTimeout(Duration),

    #[error("timed out reaping child process after {0:?}")]
    ReapTimeout(Duration),

    #[error("kubernetes client error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<CoreError>,
    },

    #[error("{primary}; additionally: {secondary}")]
    Composed {
        #[source]
        primary: Box<CoreError>,
        secondary: Box<CoreError>,
    },
}

impl CoreError {
    /// Wrap this error with a human-readable prefix describing the failed
    /// operation.
    pub fn context(self, context: impl Into<String>) -> Self {
        CoreError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Attach a secondary failure observed while handling this error.
    ///
    /// Used on the fatal path so that cleanup failures never mask the
    /// original error.
    pub fn compose(self, secondary: CoreError) -> Self {
        CoreError::Composed {
            primary: Box::new(self),
            secondary: Box::new(secondary),
        }
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;
