pub mod cache;
pub mod repository;

use thiserror::Error;

pub use cache::{OperationRepo, RepoCache};
pub use repository::GitRepository;

/// Errors returned by git operations.
///
/// The `Display` form ends up verbatim in `Operation::error`, so messages are
/// written for the orchestrator's users.
#[derive(Error, Debug)]
pub enum GitError {
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// LoadFiles against a repository that was never cloned.
    #[error("repository not checked out at {0}")]
    NotCheckedOut(String),
    /// Clone failed.
    #[error("clone of {url} failed: {source}")]
    Clone { url: String, source: git2::Error },
    /// Fetch failed.
    #[error("fetch of {refspec} failed: {source}")]
    Fetch { refspec: String, source: git2::Error },
    /// The remote refused the pushed reference.
    #[error("push rejected: {0}")]
    PushRejected(String),
    /// A tracked file is not valid UTF-8.
    #[error("file is not valid UTF-8: {0}")]
    InvalidUtf8(String),
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
