//! Push executor: commit generated files on a new branch and push it.
//!
//! The branch starts from the remote tip of the default branch. Everything
//! under `GENERATED_DIR` is replaced by the operation's file set.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use git2::Signature;

use crate::config::CommitConfig;
use crate::git::cache::create_private_dir;
use crate::git::{GitError, GitRepository, OperationRepo};
use crate::models::{PushSetup, RepositoryInfo};

/// Directory holding the generated files inside the repository.
pub const GENERATED_DIR: &str = ".cds";

/// Only plain relative paths may be written into the working tree.
fn checked_relative(path: &str) -> Result<&Path, GitError> {
    let candidate = Path::new(path);
    let plain = !path.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(candidate)
    } else {
        Err(GitError::InvalidInput(format!("invalid file path: {}", path)))
    }
}

pub fn push(
    target: &OperationRepo,
    setup: &PushSetup,
    files: &BTreeMap<String, String>,
    author: &CommitConfig,
) -> Result<RepositoryInfo, GitError> {
    if setup.message.trim().is_empty() {
        return Err(GitError::InvalidInput("commit message cannot be empty".to_string()));
    }
    for path in files.keys() {
        checked_relative(path)?;
    }

    let repo = GitRepository::open_or_clone(target)?;
    let info = repo.info(&target.url)?;
    let default_branch = info.default_branch.as_str();

    repo.discard_changes()?;
    repo.fetch_branch(default_branch)?;
    // Local commits on the default branch never reach the pushed branch.
    repo.switch_branch(default_branch, &format!("refs/remotes/origin/{}", default_branch))?;
    repo.switch_branch(&setup.branch, "HEAD")?;

    let generated = repo.path().join(GENERATED_DIR);
    if generated.exists() {
        std::fs::remove_dir_all(&generated)?;
    }
    create_private_dir(&generated)?;

    for (path, content) in files {
        let relative = Path::new(GENERATED_DIR).join(checked_relative(path)?);
        let full = repo.path().join(&relative);
        if let Some(parent) = full.parent() {
            create_private_dir(parent)?;
        }
        std::fs::write(&full, content)?;
        repo.add(&relative)?;
    }
    repo.stage_deletions(Path::new(GENERATED_DIR))?;

    let signature = Signature::now(&author.name, &author.email)?;
    let oid = repo.commit(&setup.message, &signature)?;
    repo.push_branch(&setup.branch)?;

    tracing::info!("Pushed {} ({}) to {}", setup.branch, oid, target.url);
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::repository::testutil::Remote;
    use crate::git::RepoCache;
    use crate::models::{CheckoutSetup, Operation};
    use crate::processor::checkout::checkout;
    use tempfile::tempdir;

    fn setup(branch: &str) -> PushSetup {
        PushSetup {
            branch: branch.to_string(),
            message: "Update workflow".to_string(),
        }
    }

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn target(dir: &std::path::Path, remote: &Remote) -> OperationRepo {
        let root = dir.join("cache");
        std::fs::create_dir_all(&root).unwrap();
        RepoCache::new(root).unwrap().repo(&Operation {
            url: remote.url(),
            ..Default::default()
        })
    }

    #[test]
    fn pushes_generated_files_on_new_branch() {
        let dir = tempdir().unwrap();
        let remote = Remote::new(
            dir.path(),
            &[("README.md", "hello"), (".cds/old.yml", "stale")],
        );
        let target = target(dir.path(), &remote);
        checkout(&target, &CheckoutSetup::default()).unwrap();

        let info = push(
            &target,
            &setup("cds-export"),
            &files(&[("w.yml", "name: w"), ("sub/p.yml", "name: p")]),
            &CommitConfig::default(),
        )
        .unwrap();

        assert_eq!(info.default_branch, "main");
        assert!(remote.branch_tip("cds-export").is_some());
        assert_eq!(remote.file_at("cds-export", ".cds/w.yml").as_deref(), Some("name: w"));
        assert_eq!(remote.file_at("cds-export", ".cds/sub/p.yml").as_deref(), Some("name: p"));
        assert_eq!(remote.file_at("cds-export", ".cds/old.yml"), None);
        assert_eq!(remote.file_at("cds-export", "README.md").as_deref(), Some("hello"));
    }

    #[test]
    fn push_clones_when_no_working_tree() {
        let dir = tempdir().unwrap();
        let remote = Remote::new(dir.path(), &[("README.md", "hello")]);
        let target = target(dir.path(), &remote);

        push(
            &target,
            &setup("fresh"),
            &files(&[("w.yml", "x")]),
            &CommitConfig::default(),
        )
        .unwrap();

        assert!(remote.branch_tip("fresh").is_some());
    }

    #[test]
    fn push_starts_from_remote_tip() {
        let dir = tempdir().unwrap();
        let remote = Remote::new(dir.path(), &[("README.md", "v1")]);
        let target = target(dir.path(), &remote);
        checkout(&target, &CheckoutSetup::default()).unwrap();
        remote.commit(&[("README.md", "v2")], "upstream change");

        push(
            &target,
            &setup("export"),
            &files(&[("w.yml", "x")]),
            &CommitConfig::default(),
        )
        .unwrap();

        assert_eq!(remote.file_at("export", "README.md").as_deref(), Some("v2"));
    }

    #[test]
    fn push_drops_local_commits_on_default_branch() {
        let dir = tempdir().unwrap();
        let remote = Remote::new(dir.path(), &[("README.md", "v1")]);
        let target = target(dir.path(), &remote);
        checkout(&target, &CheckoutSetup::default()).unwrap();

        let local = git2::Repository::open(&target.basedir).unwrap();
        std::fs::write(target.basedir.join("local.txt"), "local").unwrap();
        let mut index = local.index().unwrap();
        index.add_path(Path::new("local.txt")).unwrap();
        index.write().unwrap();
        let tree = local.find_tree(index.write_tree().unwrap()).unwrap();
        let parent = local.head().unwrap().peel_to_commit().unwrap();
        let signature = Signature::now("local", "local@example.com").unwrap();
        local
            .commit(Some("HEAD"), &signature, &signature, "local only", &tree, &[&parent])
            .unwrap();

        push(
            &target,
            &setup("exp"),
            &files(&[("w.yml", "x")]),
            &CommitConfig::default(),
        )
        .unwrap();

        assert_eq!(remote.file_at("exp", "local.txt"), None);
        assert_eq!(remote.file_at("exp", "README.md").as_deref(), Some("v1"));
        assert_eq!(remote.file_at("exp", ".cds/w.yml").as_deref(), Some("x"));
    }

    #[test]
    fn rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let remote = Remote::new(dir.path(), &[("README.md", "v1")]);
        let target = target(dir.path(), &remote);

        let err = push(
            &target,
            &setup("export"),
            &files(&[("../evil", "x")]),
            &CommitConfig::default(),
        )
        .unwrap_err();

        assert!(matches!(err, GitError::InvalidInput(_)));
        assert!(remote.branch_tip("export").is_none());
    }

    #[test]
    fn rejects_empty_message() {
        let dir = tempdir().unwrap();
        let remote = Remote::new(dir.path(), &[("README.md", "v1")]);
        let target = target(dir.path(), &remote);
        let mut push_setup = setup("export");
        push_setup.message = String::new();

        let err =
            push(&target, &push_setup, &BTreeMap::new(), &CommitConfig::default()).unwrap_err();
        assert!(matches!(err, GitError::InvalidInput(_)));
    }
}
