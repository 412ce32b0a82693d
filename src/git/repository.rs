//! Thin wrapper over `git2::Repository` exposing the primitives the executors
//! need: clone, fetch, hard reset, branch switching, glob, add, commit, push.
//!
//! Every network call goes through `origin` with credentials taken from the
//! operation's `RepositoryStrategy`.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    BranchType, Cred, ErrorCode, FetchOptions, Oid, Pathspec, PathspecFlags, PushOptions,
    RemoteCallbacks, Repository, ResetType, Signature,
};

use super::cache::{create_private_dir, OperationRepo};
use super::GitError;
use crate::models::{ConnectionType, RepositoryInfo, RepositoryStrategy};

const REMOTE: &str = "origin";
/// libgit2 keeps asking for credentials while the remote rejects them.
const MAX_AUTH_ATTEMPTS: u32 = 3;

pub struct GitRepository {
    repo: Repository,
    path: PathBuf,
    strategy: RepositoryStrategy,
}

impl std::fmt::Debug for GitRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepository")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Reject ref names that could escape their namespace or read as flags.
pub fn validate_ref(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.contains("..") {
        return Err(GitError::InvalidInput(format!("{} cannot contain '..'", name)));
    }
    if value.starts_with('-') || value.starts_with('/') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '-' or '/'",
            name
        )));
    }
    if value.bytes().any(|b| b < 0x20 || b == 0x7f || b == b' ') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain spaces or control characters",
            name
        )));
    }
    Ok(())
}

fn remote_callbacks(strategy: &RepositoryStrategy) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0;
    callbacks.credentials(move |_url, username_from_url, allowed| {
        attempts += 1;
        if attempts > MAX_AUTH_ATTEMPTS {
            return Err(git2::Error::from_str("authentication failed"));
        }
        match strategy.connection_type {
            ConnectionType::Ssh if allowed.is_ssh_key() => Cred::ssh_key_from_memory(
                username_from_url.unwrap_or("git"),
                None,
                &strategy.ssh_key_content,
                None,
            ),
            ConnectionType::Https
                if allowed.is_user_pass_plaintext() && !strategy.user.is_empty() =>
            {
                Cred::userpass_plaintext(&strategy.user, &strategy.password)
            }
            _ => Cred::default(),
        }
    });
    callbacks
}

fn fetch_options(strategy: &RepositoryStrategy) -> FetchOptions<'_> {
    let mut options = FetchOptions::new();
    options.remote_callbacks(remote_callbacks(strategy));
    options
}

/// Repository name as shown to users: last URL segment without `.git`.
pub fn repository_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(url)
        .trim_end_matches(".git")
        .to_string()
}

impl GitRepository {
    /// Open the working tree at `path`; `NotCheckedOut` when there is none.
    pub fn open(path: &Path, strategy: &RepositoryStrategy) -> Result<Self, GitError> {
        let repo = Repository::open(path).map_err(|e| {
            if e.code() == ErrorCode::NotFound {
                GitError::NotCheckedOut(path.display().to_string())
            } else {
                GitError::Git(e)
            }
        })?;
        Ok(Self {
            repo,
            path: path.to_path_buf(),
            strategy: strategy.clone(),
        })
    }

    pub fn clone(url: &str, path: &Path, strategy: &RepositoryStrategy) -> Result<Self, GitError> {
        create_private_dir(path)?;
        let repo = RepoBuilder::new()
            .fetch_options(fetch_options(strategy))
            .clone(url, path)
            .map_err(|source| GitError::Clone {
                url: url.to_string(),
                source,
            })?;
        Ok(Self {
            repo,
            path: path.to_path_buf(),
            strategy: strategy.clone(),
        })
    }

    /// Reuse the cached working tree or clone it on first use.
    pub fn open_or_clone(target: &OperationRepo) -> Result<Self, GitError> {
        match Self::open(&target.basedir, &target.strategy) {
            Ok(repo) => Ok(repo),
            Err(GitError::NotCheckedOut(_)) => {
                // Leftovers of an interrupted clone would make the clone fail.
                if target.basedir.exists() {
                    std::fs::remove_dir_all(&target.basedir)?;
                }
                tracing::info!("Cloning {} into {}", target.url, target.basedir.display());
                Self::clone(&target.url, &target.basedir, &target.strategy)
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fetch_url(&self) -> Result<String, GitError> {
        let remote = self.repo.find_remote(REMOTE)?;
        Ok(remote.url().unwrap_or_default().to_string())
    }

    pub fn current_branch(&self) -> Option<String> {
        self.repo.head().ok().and_then(|h| {
            if h.is_branch() {
                h.shorthand().map(|s| s.to_string())
            } else {
                None
            }
        })
    }

    pub fn head_commit(&self) -> Option<String> {
        self.repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .map(|c| c.id().to_string())
    }

    /// Default branch: the caller's hint, else `origin/HEAD`, else the
    /// checked-out branch, else the first of main/master known to origin.
    pub fn default_branch(&self) -> String {
        if let Some(hint) = self.strategy.default_branch.as_deref().filter(|b| !b.is_empty()) {
            return hint.to_string();
        }

        let origin_head = format!("refs/remotes/{}/HEAD", REMOTE);
        if let Some(target) = self
            .repo
            .find_reference(&origin_head)
            .ok()
            .and_then(|r| r.symbolic_target().map(|s| s.to_string()))
        {
            if let Some(branch) = target.strip_prefix(&format!("refs/remotes/{}/", REMOTE)) {
                return branch.to_string();
            }
        }

        if let Some(branch) = self.current_branch() {
            return branch;
        }

        for candidate in ["main", "master"] {
            let remote_branch = format!("{}/{}", REMOTE, candidate);
            if self.repo.find_branch(&remote_branch, BranchType::Remote).is_ok() {
                return candidate.to_string();
            }
        }
        "master".to_string()
    }

    pub fn info(&self, url: &str) -> Result<RepositoryInfo, GitError> {
        Ok(RepositoryInfo {
            name: repository_name(url),
            fetch_url: self.fetch_url()?,
            default_branch: self.default_branch(),
        })
    }

    fn fetch(&self, refspec: &str) -> Result<(), GitError> {
        let mut remote = self.repo.find_remote(REMOTE)?;
        let mut options = fetch_options(&self.strategy);
        remote
            .fetch(&[refspec], Some(&mut options), None)
            .map_err(|source| GitError::Fetch {
                refspec: refspec.to_string(),
                source,
            })
    }

    /// Update `refs/remotes/origin/<branch>` from the remote.
    pub fn fetch_branch(&self, branch: &str) -> Result<(), GitError> {
        validate_ref(branch, "branch")?;
        self.fetch(&format!(
            "+refs/heads/{b}:refs/remotes/{r}/{b}",
            b = branch,
            r = REMOTE
        ))
    }

    pub fn fetch_tag(&self, tag: &str) -> Result<(), GitError> {
        validate_ref(tag, "tag")?;
        self.fetch(&format!("+refs/tags/{t}:refs/tags/{t}", t = tag))
    }

    fn resolve(&self, spec: &str) -> Result<git2::Commit<'_>, GitError> {
        Ok(self.repo.revparse_single(spec)?.peel_to_commit()?)
    }

    /// `git reset --hard <spec>`
    pub fn reset_hard(&self, spec: &str) -> Result<(), GitError> {
        let commit = self.resolve(spec)?;
        self.repo.reset(commit.as_object(), ResetType::Hard, None)?;
        Ok(())
    }

    /// Throw away uncommitted changes. No-op on a repository without commits.
    pub fn discard_changes(&self) -> Result<(), GitError> {
        if self.head_commit().is_none() {
            return Ok(());
        }
        self.reset_hard("HEAD")
    }

    /// Point local `branch` at `spec`, attach HEAD to it and reset the tree.
    pub fn switch_branch(&self, branch: &str, spec: &str) -> Result<(), GitError> {
        validate_ref(branch, "branch")?;
        let commit = self.resolve(spec)?;
        let refname = format!("refs/heads/{}", branch);
        self.repo
            .reference(&refname, commit.id(), true, &format!("switch to {}", spec))?;
        self.repo.set_head(&refname)?;
        self.repo.reset(commit.as_object(), ResetType::Hard, None)?;
        Ok(())
    }

    /// Check out a tag with a detached HEAD.
    pub fn checkout_tag(&self, tag: &str) -> Result<(), GitError> {
        let commit = self.resolve(&format!("refs/tags/{}", tag))?;
        self.repo.set_head_detached(commit.id())?;
        self.repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
        Ok(())
    }

    /// Tracked paths matching a git pathspec glob.
    ///
    /// `*` also crosses `/`, and `**/` matches zero or more directories.
    pub fn glob(&self, pattern: &str) -> Result<Vec<String>, GitError> {
        let index = self.repo.index()?;
        let mut specs = vec![pattern.to_string()];
        if pattern.contains("**/") {
            specs.push(pattern.replace("**/", ""));
        }
        let pathspec = Pathspec::new(specs)?;
        let matches = pathspec.match_index(&index, PathspecFlags::DEFAULT)?;
        Ok(matches
            .entries()
            .filter_map(|entry| std::str::from_utf8(entry).ok().map(str::to_string))
            .collect())
    }

    /// Stage a path relative to the working tree root.
    pub fn add(&self, relative: &Path) -> Result<(), GitError> {
        let mut index = self.repo.index()?;
        index.add_path(relative)?;
        index.write()?;
        Ok(())
    }

    /// Stage removals of tracked files under `dir` that no longer exist.
    pub fn stage_deletions(&self, dir: &Path) -> Result<(), GitError> {
        let mut index = self.repo.index()?;
        let prefix = dir.to_string_lossy().to_string();
        index.update_all([prefix.as_str()], None)?;
        index.write()?;
        Ok(())
    }

    pub fn commit(&self, message: &str, signature: &Signature<'_>) -> Result<Oid, GitError> {
        let mut index = self.repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let parent = self.repo.head()?.peel_to_commit()?;
        let oid = self
            .repo
            .commit(Some("HEAD"), signature, signature, message, &tree, &[&parent])?;
        Ok(oid)
    }

    /// Push local `branch` to the same name on origin.
    pub fn push_branch(&self, branch: &str) -> Result<(), GitError> {
        validate_ref(branch, "branch")?;
        let refspec = format!("refs/heads/{b}:refs/heads/{b}", b = branch);
        let rejection: RefCell<Option<String>> = RefCell::new(None);

        {
            let mut callbacks = remote_callbacks(&self.strategy);
            callbacks.push_update_reference(|_refname, status| {
                if let Some(msg) = status {
                    *rejection.borrow_mut() = Some(msg.to_string());
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);

            let mut remote = self.repo.find_remote(REMOTE)?;
            remote.push(&[refspec.as_str()], Some(&mut options))?;
        }

        match rejection.into_inner() {
            Some(msg) => Err(GitError::PushRejected(msg)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Local "remote" repositories for executor tests.

    use std::path::{Path, PathBuf};

    use git2::{Oid, Repository, Signature};

    pub struct Remote {
        pub path: PathBuf,
        work: Repository,
    }

    impl Remote {
        /// Bare remote at `<dir>/remote.git` with one commit on `main`.
        pub fn new(dir: &Path, files: &[(&str, &str)]) -> Self {
            let path = dir.join("remote.git");
            let bare = Repository::init_bare(&path).unwrap();
            bare.set_head("refs/heads/main").unwrap();

            let work_path = dir.join("author");
            let work = Repository::clone(path.to_str().unwrap(), &work_path).unwrap();
            let remote = Self { path, work };
            remote.commit(files, "initial");
            remote
        }

        pub fn url(&self) -> String {
            self.path.to_string_lossy().to_string()
        }

        /// Commit files on `main` and push them to the bare remote.
        pub fn commit(&self, files: &[(&str, &str)], message: &str) -> Oid {
            let workdir = self.work.workdir().unwrap().to_path_buf();
            let mut index = self.work.index().unwrap();
            for (name, content) in files {
                let full = workdir.join(name);
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent).unwrap();
                }
                std::fs::write(&full, content).unwrap();
                index.add_path(Path::new(name)).unwrap();
            }
            index.write().unwrap();
            let tree = self.work.find_tree(index.write_tree().unwrap()).unwrap();
            let sig = Signature::now("test", "test@example.com").unwrap();
            let parent = self
                .work
                .find_reference("refs/heads/main")
                .ok()
                .and_then(|r| r.peel_to_commit().ok());
            let parents: Vec<&git2::Commit> = parent.iter().collect();
            let oid = self
                .work
                .commit(Some("refs/heads/main"), &sig, &sig, message, &tree, &parents)
                .unwrap();
            self.work.set_head("refs/heads/main").unwrap();

            let mut origin = self.work.find_remote("origin").unwrap();
            origin
                .push(&["refs/heads/main:refs/heads/main"], None)
                .unwrap();
            oid
        }

        pub fn tag(&self, name: &str, oid: Oid) {
            let bare = Repository::open_bare(&self.path).unwrap();
            let commit = bare.find_object(oid, None).unwrap();
            bare.tag_lightweight(name, &commit, false).unwrap();
        }

        pub fn branch_tip(&self, branch: &str) -> Option<Oid> {
            let bare = Repository::open_bare(&self.path).unwrap();
            bare.find_reference(&format!("refs/heads/{}", branch))
                .ok()
                .and_then(|r| r.target())
        }

        pub fn file_at(&self, branch: &str, path: &str) -> Option<String> {
            let bare = Repository::open_bare(&self.path).unwrap();
            let commit = bare
                .find_reference(&format!("refs/heads/{}", branch))
                .ok()?
                .peel_to_commit()
                .ok()?;
            let entry = commit.tree().ok()?.get_path(Path::new(path)).ok()?;
            let blob = entry.to_object(&bare).ok()?.peel_to_blob().ok()?;
            Some(String::from_utf8_lossy(blob.content()).to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::Remote;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_repository_name() {
        assert_eq!(repository_name("https://example.com/org/repo.git"), "repo");
        assert_eq!(repository_name("git@example.com:org/repo.git"), "repo");
        assert_eq!(repository_name("/srv/git/repo/"), "repo");
    }

    #[test]
    fn test_validate_ref() {
        assert!(validate_ref("feature/x", "branch").is_ok());
        assert!(validate_ref("", "branch").is_err());
        assert!(validate_ref("../etc", "branch").is_err());
        assert!(validate_ref("-rf", "branch").is_err());
        assert!(validate_ref("a b", "branch").is_err());
    }

    #[test]
    fn test_open_missing_is_not_checked_out() {
        let dir = tempdir().unwrap();
        let result =
            GitRepository::open(&dir.path().join("nothing"), &RepositoryStrategy::default());
        assert!(matches!(result, Err(GitError::NotCheckedOut(_))));
    }

    #[test]
    fn test_clone_and_info() {
        let dir = tempdir().unwrap();
        let remote = Remote::new(dir.path(), &[("README.md", "hello")]);
        let target = dir.path().join("clone");

        let repo =
            GitRepository::clone(&remote.url(), &target, &RepositoryStrategy::default()).unwrap();
        let info = repo.info(&remote.url()).unwrap();

        assert_eq!(info.default_branch, "main");
        assert_eq!(info.fetch_url, remote.url());
        assert_eq!(info.name, "remote");
        assert_eq!(repo.current_branch().as_deref(), Some("main"));
        assert!(target.join("README.md").exists());
    }

    #[test]
    fn test_default_branch_hint_wins() {
        let dir = tempdir().unwrap();
        let remote = Remote::new(dir.path(), &[("README.md", "hello")]);
        let strategy = RepositoryStrategy {
            default_branch: Some("develop".to_string()),
            ..Default::default()
        };
        let repo =
            GitRepository::clone(&remote.url(), &dir.path().join("clone"), &strategy).unwrap();
        assert_eq!(repo.default_branch(), "develop");
    }

    fn clone_default(remote: &Remote, dir: &Path) -> GitRepository {
        GitRepository::clone(&remote.url(), &dir.join("clone"), &RepositoryStrategy::default())
            .unwrap()
    }

    #[test]
    fn test_glob_matches_tracked_files() {
        let dir = tempdir().unwrap();
        let remote = Remote::new(
            dir.path(),
            &[("a.yml", "a"), ("b.txt", "b"), (".cds/w.yml", "w")],
        );
        let repo = clone_default(&remote, dir.path());

        let cds = repo.glob(".cds/*.yml").unwrap();
        assert_eq!(cds, vec![".cds/w.yml".to_string()]);
        assert!(repo.glob("*.json").unwrap().is_empty());
    }

    #[test]
    fn test_glob_double_star_matches_zero_directories() {
        let dir = tempdir().unwrap();
        let remote = Remote::new(
            dir.path(),
            &[(".cds/w.yml", "w"), (".cds/sub/p.yml", "p"), ("top.yml", "t")],
        );
        let repo = clone_default(&remote, dir.path());

        let mut cds = repo.glob(".cds/**/*.yml").unwrap();
        cds.sort();
        assert_eq!(cds, vec![".cds/sub/p.yml".to_string(), ".cds/w.yml".to_string()]);

        let mut all = repo.glob("**/*.yml").unwrap();
        all.sort();
        assert_eq!(all.len(), 3);
        assert!(all.contains(&"top.yml".to_string()));
    }
}
