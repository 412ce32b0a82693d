//! Single-consumer operation processor.
//!
//! Pops UUIDs from the dispatch queue one at a time, runs the executor chosen
//! by the operation's setup and writes the outcome back to the store. The
//! repository lock is held for the whole executor run so the vacuum daemon
//! never deletes a working tree in use. Git work runs on the blocking pool.

pub mod checkout;
pub mod load_files;
pub mod push;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{CommitConfig, Config};
use crate::git::{GitError, OperationRepo, RepoCache};
use crate::models::{Operation, OperationLoadFiles, OperationStatus, RepositoryInfo, Setup};
use crate::store::{Delivery, LockToken, Store, StoreError};

/// Pause after a store failure before polling the queue again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const LOCK_RETRY_MAX: Duration = Duration::from_millis(500);

/// Releases the repository lock when dropped.
struct RepoLockGuard {
    store: Arc<Store>,
    repo_id: String,
    token: LockToken,
}

impl Drop for RepoLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.store.unlock(&self.repo_id, &self.token) {
            tracing::warn!("Failed to release lock for {}: {}", self.repo_id, e);
        }
    }
}

/// Everything an executor needs, moved onto the blocking pool.
struct Job {
    setup: Setup,
    target: OperationRepo,
    load_files: OperationLoadFiles,
    author: CommitConfig,
}

enum Outcome {
    Checkout {
        info: RepositoryInfo,
        files: Option<BTreeMap<String, String>>,
    },
    LoadFiles(BTreeMap<String, String>),
    Push(RepositoryInfo),
}

impl Job {
    fn run(self) -> Result<Outcome, GitError> {
        match self.setup {
            Setup::Checkout(ref setup) => {
                let (info, report) = checkout::checkout(&self.target, setup)?;
                tracing::info!(
                    "Checked out {} (fetches: {:?}, resets: {:?})",
                    self.target.url,
                    report.fetches,
                    report.resets
                );
                let files = match self.load_files.pattern.as_deref().filter(|p| !p.is_empty()) {
                    Some(pattern) => Some(load_files::load_files(&self.target, pattern)?),
                    None => None,
                };
                Ok(Outcome::Checkout { info, files })
            }
            Setup::LoadFiles(ref setup) => Ok(Outcome::LoadFiles(load_files::load_files(
                &self.target,
                &setup.pattern,
            )?)),
            Setup::Push(ref setup) => Ok(Outcome::Push(push::push(
                &self.target,
                setup,
                &self.load_files.results,
                &self.author,
            )?)),
        }
    }
}

pub struct Processor {
    store: Arc<Store>,
    cache: RepoCache,
    config: Arc<Config>,
}

impl Processor {
    pub fn new(store: Arc<Store>, cache: RepoCache, config: Arc<Config>) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    /// Consume the queue until `cancel` fires. An operation already running
    /// when cancellation arrives is finished first.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        tracing::info!("Processor started");
        loop {
            let delivery = match self.store.dequeue(&mut cancel).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Unable to dequeue operation: {}", e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            self.handle(&delivery).await;
        }
        tracing::info!("Processor stopped");
    }

    /// Process one delivery and acknowledge it once its outcome is stored.
    ///
    /// On a store failure the entry stays claimed and is delivered again after
    /// the visibility timeout.
    async fn handle(&self, delivery: &Delivery) {
        if let Err(e) = self.process(&delivery.uuid).await {
            tracing::error!(
                "Unable to process operation {}, leaving it for redelivery: {}",
                delivery.uuid,
                e
            );
            return;
        }
        if let Err(e) = self.store.ack(delivery) {
            tracing::error!("Unable to acknowledge operation {}: {}", delivery.uuid, e);
        }
    }

    /// Run one operation and persist its final state.
    pub async fn process(&self, uuid: &str) -> Result<Option<Operation>, StoreError> {
        let Some(mut op) = self.store.load(uuid)? else {
            tracing::warn!("Operation {} not found, dropping it", uuid);
            return Ok(None);
        };
        if op.status.is_terminal() {
            tracing::debug!("Operation {} already {}, skipping", uuid, op.status);
            return Ok(Some(op));
        }

        op.status = OperationStatus::Processing;
        self.store.save(&op)?;

        let started = Instant::now();
        match self.execute(&op).await {
            Ok(outcome) => {
                apply(&mut op, outcome);
                op.succeed();
            }
            Err(message) => op.fail(message),
        }
        tracing::info!(
            "Operation {} on {} finished {} in {:?}",
            op.uuid,
            op.url,
            op.status,
            started.elapsed()
        );

        self.store.save(&op)?;
        Ok(Some(op))
    }

    async fn execute(&self, op: &Operation) -> Result<Outcome, String> {
        let setup = Setup::from_wire(&op.setup).map_err(|e| e.to_string())?;
        let target = self.cache.repo(op);
        tracing::debug!("Operation {}: {} in {}", op.uuid, setup.kind(), target.basedir.display());

        let _lock = self
            .acquire_lock(&target.repo_id)
            .await
            .map_err(|e| e.to_string())?;
        if let Err(e) = self.store.touch(&target.repo_id) {
            tracing::warn!("Failed to record access to {}: {}", target.repo_id, e);
        }

        let job = Job {
            setup,
            target,
            load_files: op.load_files.clone(),
            author: self.config.commit.clone(),
        };
        tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| format!("executor failed: {}", e))?
            .map_err(|e| e.to_string())
    }

    /// Take the repository lock, retrying while the vacuum daemon holds it.
    async fn acquire_lock(&self, repo_id: &str) -> Result<RepoLockGuard, StoreError> {
        let deadline = Instant::now() + self.config.lock_wait;
        let mut delay = Duration::from_millis(10);
        loop {
            match self.store.lock(repo_id, self.config.lock_ttl) {
                Ok(token) => {
                    return Ok(RepoLockGuard {
                        store: self.store.clone(),
                        repo_id: repo_id.to_string(),
                        token,
                    });
                }
                Err(StoreError::LockUnavailable(_)) if Instant::now() < deadline => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(LOCK_RETRY_MAX);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn apply(op: &mut Operation, outcome: Outcome) {
    match outcome {
        Outcome::Checkout { info, files } => {
            op.repository_info = Some(info);
            if let Some(files) = files {
                op.load_files.results = files;
            }
        }
        Outcome::LoadFiles(files) => op.load_files.results = files,
        Outcome::Push(info) => op.repository_info = Some(info),
    }
}
