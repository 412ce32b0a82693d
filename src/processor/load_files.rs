//! LoadFiles executor: read tracked files matching a glob.

use std::collections::BTreeMap;

use crate::git::{GitError, GitRepository, OperationRepo};

/// Contents of every tracked file matching `pattern`, keyed by path relative
/// to the working-tree root. The working tree must already be checked out.
pub fn load_files(
    target: &OperationRepo,
    pattern: &str,
) -> Result<BTreeMap<String, String>, GitError> {
    if pattern.is_empty() {
        return Err(GitError::InvalidInput("pattern cannot be empty".to_string()));
    }

    let repo = GitRepository::open(&target.basedir, &target.strategy)?;
    let mut results = BTreeMap::new();

    for path in repo.glob(pattern)? {
        let content = std::fs::read(repo.path().join(&path))?;
        let content = String::from_utf8(content).map_err(|_| GitError::InvalidUtf8(path.clone()))?;
        results.insert(path, content);
    }

    tracing::debug!("Pattern {} matched {} files", pattern, results.len());
    Ok(results)
}
