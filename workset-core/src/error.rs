//! Error types for workset

use std::time::Duration;

use thiserror::Error;

/// Result type alias for workset operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for workset operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// libgit2 error
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// A git subprocess exited unsuccessfully
    #[error("git {args} failed{}: {message}", .code.map(|c| format!(" (exit {c})")).unwrap_or_default())]
    GitCommand {
        /// Space-joined arguments, for diagnostics
        args: String,
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Trimmed stderr (or stdout when stderr was empty)
        message: String,
    },

    /// The named worktree has no admin entry in the repository
    #[error("worktree not found: {0}")]
    WorktreeNotFound(String),

    /// The call context was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// The call context deadline passed
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    /// Configuration or input error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A destructive operation was refused by the safety check
    #[error("refusing to remove {repo}: {}", .details.join("; "))]
    Unsafe {
        /// Repository the check ran against
        repo: String,
        /// One line per offending branch
        details: Vec<String>,
    },

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the distinguished "worktree not found" condition
    pub fn is_worktree_not_found(&self) -> bool {
        matches!(self, Error::WorktreeNotFound(_))
    }
}
