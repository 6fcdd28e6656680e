use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort a whole session. Per-instance problems never surface
/// here; they are logged and collected into the run report instead.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Required command '{0}' not found")]
    Dependency(String),

    #[error("Runtime version '{0}' not found in any library root")]
    RuntimeNotFound(String),

    #[error("Invalid profile: {0}")]
    ProfileInvalid(String),

    /// `pid` is `None` while the holder has not written its lock record yet.
    #[error(
        "Session for '{game}' already running{}",
        .pid.map(|pid| format!(" with PID {pid}")).unwrap_or_default()
    )]
    AlreadyRunning { game: String, pid: Option<u32> },

    #[error("Failed to spawn {argv0}: {source}")]
    Spawn {
        argv0: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LaunchError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LaunchError::Io {
            path: path.into(),
            source,
        }
    }
}
