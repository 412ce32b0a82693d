//! Checkout executor: bring the cached working tree to a branch, tag or commit.
//!
//! Tag checkouts are terminal: fetch the tag, check it out detached, stop.
//! Branch checkouts take the remote tip, then optionally pin a commit. When
//! the pinned commit is already HEAD nothing is fetched or reset.

use crate::git::{GitError, GitRepository, OperationRepo};
use crate::models::{CheckoutSetup, RepositoryInfo};

/// What the executor did to the working tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckoutReport {
    /// Refs fetched from origin
    pub fetches: Vec<String>,
    /// Targets of hard resets, in order
    pub resets: Vec<String>,
}

fn is_head(head: Option<&str>, commit: &str) -> bool {
    match head {
        Some(head) => head == commit || (commit.len() >= 7 && head.starts_with(commit)),
        None => false,
    }
}

pub fn checkout(
    target: &OperationRepo,
    setup: &CheckoutSetup,
) -> Result<(RepositoryInfo, CheckoutReport), GitError> {
    let repo = GitRepository::open_or_clone(target)?;
    let info = repo.info(&target.url)?;
    let mut report = CheckoutReport::default();

    repo.discard_changes()?;

    if !setup.tag.is_empty() {
        repo.fetch_tag(&setup.tag)?;
        report.fetches.push(format!("refs/tags/{}", setup.tag));
        repo.checkout_tag(&setup.tag)?;
        report.resets.push(format!("refs/tags/{}", setup.tag));
        return Ok((info, report));
    }

    let branch = if setup.branch.is_empty() {
        info.default_branch.clone()
    } else {
        setup.branch.clone()
    };

    if !setup.commit.is_empty() && is_head(repo.head_commit().as_deref(), &setup.commit) {
        tracing::debug!(
            "{} already at {}, nothing to fetch",
            target.basedir.display(),
            setup.commit
        );
        return Ok((info, report));
    }

    repo.fetch_branch(&branch)?;
    report.fetches.push(branch.clone());

    let remote_tip = format!("refs/remotes/origin/{}", branch);
    repo.switch_branch(&branch, &remote_tip)?;
    report.resets.push(format!("origin/{}", branch));

    if !setup.commit.is_empty() {
        repo.reset_hard(&setup.commit)?;
        report.resets.push(setup.commit.clone());
    }

    Ok((info, report))
}
