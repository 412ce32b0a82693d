//! On-disk working-tree cache.
//!
//! Maps a repository URL to a stable directory under the cache root:
//!
//! ```text
//! <basedir>/
//! ├── <repo_id>/      # working tree of one repository URL
//! └── <repo_id>/
//! ```
//!
//! `repo_id` is the hex SHA-256 of the URL, so equal URLs share a working tree
//! across restarts and the name is always a safe single path component.
//!
//! Used by: the processor (resolving an operation's working tree) and the
//! vacuum daemon (enumerating and deleting working trees).

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::ConfigError;
use crate::models::{Operation, RepositoryStrategy};

/// Working tree of one operation, derived from its URL
#[derive(Debug, Clone)]
pub struct OperationRepo {
    pub url: String,
    pub repo_id: String,
    pub basedir: PathBuf,
    pub strategy: RepositoryStrategy,
}

#[derive(Debug, Clone)]
pub struct RepoCache {
    root: PathBuf,
}

impl RepoCache {
    /// Wrap an existing cache root. A missing root or a non-directory is a
    /// configuration error; the service refuses to start.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let root = root.into();
        let metadata = std::fs::metadata(&root)
            .map_err(|e| ConfigError::CacheRoot(root.clone(), e.to_string()))?;
        if !metadata.is_dir() {
            return Err(ConfigError::CacheRoot(root, "not a directory".to_string()));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_id(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    pub fn basedir(&self, repo_id: &str) -> PathBuf {
        self.root.join(repo_id)
    }

    pub fn repo(&self, op: &Operation) -> OperationRepo {
        let repo_id = Self::repo_id(&op.url);
        OperationRepo {
            url: op.url.clone(),
            basedir: self.basedir(&repo_id),
            repo_id,
            strategy: op.repository_strategy.clone(),
        }
    }

    /// Names of the working-tree directories currently on disk.
    pub fn list_repo_ids(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn remove(&self, repo_id: &str) -> io::Result<()> {
        let dir = self.basedir(repo_id);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Create `dir` and missing parents, owner-only on unix.
pub fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}
