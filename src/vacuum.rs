//! Vacuum daemon: prune finished operations and idle working trees.
//!
//! Two sweeps run on every tick:
//! - store sweep: terminal operations older than the operation retention
//! - filesystem sweep: working trees not touched within the repository
//!   retention, taken under the repository lock so a running executor is
//!   never pulled out from under
//!
//! Per-item failures are logged and skipped; a sweep never aborts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::config::Config;
use crate::git::RepoCache;
use crate::store::{LockToken, Store, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: u64,
    pub removed: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Delete terminal operations completed more than `retention` ago.
pub fn vacuum_store(store: &Store, retention: Duration) -> SweepStats {
    let operations = match store.list_operations() {
        Ok(operations) => operations,
        Err(e) => {
            tracing::warn!("vacuum: failed to list operations: {}", e);
            return SweepStats {
                errors: 1,
                ..SweepStats::default()
            };
        }
    };

    let mut stats = SweepStats {
        scanned: operations.len() as u64,
        ..SweepStats::default()
    };
    let now = Utc::now();

    for op in operations {
        let completed = match op.date {
            Some(date) if op.status.is_terminal() => date,
            _ => {
                stats.skipped += 1;
                continue;
            }
        };
        let age = (now - completed).to_std().unwrap_or_default();
        if age <= retention {
            stats.skipped += 1;
            continue;
        }

        match store.delete_operation(&op.uuid) {
            Ok(()) => {
                tracing::debug!("vacuum: deleted operation {}", op.uuid);
                stats.removed += 1;
            }
            Err(e) => {
                tracing::warn!("vacuum: failed to delete operation {}: {}", op.uuid, e);
                stats.errors += 1;
            }
        }
    }

    stats
}

/// Delete working trees whose last access is older than `retention`.
pub fn vacuum_filesystem(
    store: &Store,
    cache: &RepoCache,
    lock_ttl: Duration,
    retention: Duration,
) -> SweepStats {
    let repo_ids = match cache.list_repo_ids() {
        Ok(ids) => ids,
        Err(e) => {
            tracing::warn!(
                "vacuum: failed to list {}: {}",
                cache.root().display(),
                e
            );
            return SweepStats {
                errors: 1,
                ..SweepStats::default()
            };
        }
    };

    let mut stats = SweepStats {
        scanned: repo_ids.len() as u64,
        ..SweepStats::default()
    };

    for repo_id in repo_ids {
        let token = match store.lock(&repo_id, lock_ttl) {
            Ok(token) => token,
            Err(StoreError::LockUnavailable(_)) => {
                tracing::debug!("vacuum: {} is in use, skipping", repo_id);
                stats.skipped += 1;
                continue;
            }
            Err(e) => {
                tracing::warn!("vacuum: failed to lock {}: {}", repo_id, e);
                stats.errors += 1;
                continue;
            }
        };

        let expired = match store.is_expired(&repo_id, retention) {
            Ok(expired) => expired,
            Err(e) => {
                tracing::warn!("vacuum: failed to check expiry of {}: {}", repo_id, e);
                stats.errors += 1;
                release(store, &repo_id, &token);
                continue;
            }
        };
        if !expired {
            stats.skipped += 1;
            release(store, &repo_id, &token);
            continue;
        }

        if let Err(e) = cache.remove(&repo_id) {
            tracing::warn!("vacuum: failed to delete working tree {}: {}", repo_id, e);
            stats.errors += 1;
            release(store, &repo_id, &token);
            continue;
        }
        // Dropping the records also drops the lock taken above.
        match store.delete_repo_records(&repo_id, &token) {
            Ok(()) => {
                tracing::info!("vacuum: deleted working tree {}", repo_id);
                stats.removed += 1;
            }
            Err(e) => {
                tracing::warn!("vacuum: failed to delete records of {}: {}", repo_id, e);
                stats.errors += 1;
            }
        }
    }

    stats
}

fn release(store: &Store, repo_id: &str, token: &LockToken) {
    if let Err(e) = store.unlock(repo_id, token) {
        tracing::warn!("vacuum: failed to unlock {}: {}", repo_id, e);
    }
}

/// Run both sweeps every `vacuum.interval` until `cancel` fires.
pub async fn run(
    store: Arc<Store>,
    cache: RepoCache,
    config: Arc<Config>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.vacuum.interval);
    // The first tick completes immediately; skip it so startup is not a sweep.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.changed() => break,
        }
        if *cancel.borrow() {
            break;
        }

        let store = store.clone();
        let cache = cache.clone();
        let config = config.clone();
        let sweep = tokio::task::spawn_blocking(move || {
            let ops = vacuum_store(&store, config.operation_retention());
            let trees = vacuum_filesystem(
                &store,
                &cache,
                config.lock_ttl,
                config.repositories_retention(),
            );
            (ops, trees)
        });

        match sweep.await {
            Ok((ops, trees)) => tracing::info!(
                "vacuum: operations {:?}, working trees {:?}",
                ops,
                trees
            ),
            Err(e) => tracing::error!("vacuum: sweep failed: {}", e),
        }
    }
    tracing::info!("Vacuum daemon stopped");
}
