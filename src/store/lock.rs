//! Per-repository lock records and access markers.
//!
//! A lock is a row with an expiry instant: acquiring fails with
//! `StoreError::LockUnavailable` while an unexpired row exists, and an expired
//! row is simply taken over. The access marker records when the processor last
//! used a working tree; the vacuum daemon compares it against the retention
//! window.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::{duration_millis, now_millis, Store, StoreError};

/// Proof of ownership handed out by `Store::lock`.
///
/// Release and record deletion only act on a row still carrying this token,
/// so a holder whose lock expired and was taken over cannot drop the new
/// holder's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl Store {
    /// Acquire the lock for `repo_id`, valid for `ttl`.
    pub fn lock(&self, repo_id: &str, ttl: Duration) -> Result<LockToken, StoreError> {
        let now = now_millis();
        let expires_at = now.saturating_add(duration_millis(ttl));
        let token = Uuid::new_v4().to_string();

        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT INTO locks (repo_id, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(repo_id) DO UPDATE
             SET owner = excluded.owner, expires_at = excluded.expires_at
             WHERE locks.expires_at <= ?4",
            params![repo_id, token, expires_at, now],
        )?;

        if changed == 0 {
            return Err(StoreError::LockUnavailable(repo_id.to_string()));
        }
        Ok(LockToken(token))
    }

    /// Release a lock taken with `token`. No-op when someone else owns it now.
    pub fn unlock(&self, repo_id: &str, token: &LockToken) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM locks WHERE repo_id = ?1 AND owner = ?2",
            params![repo_id, token.0],
        )?;
        Ok(())
    }

    /// Record that the working tree for `repo_id` was just used.
    pub fn touch(&self, repo_id: &str) -> Result<(), StoreError> {
        self.touch_at(repo_id, Utc::now())
    }

    pub fn touch_at(&self, repo_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO repo_access (repo_id, last_used) VALUES (?1, ?2)
             ON CONFLICT(repo_id) DO UPDATE SET last_used = excluded.last_used",
            params![repo_id, at.timestamp_millis()],
        )?;
        Ok(())
    }

    /// True when the working tree was not used within `retention`.
    /// A repository with no access marker counts as expired.
    pub fn is_expired(&self, repo_id: &str, retention: Duration) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let last_used: Option<i64> = conn
            .query_row(
                "SELECT last_used FROM repo_access WHERE repo_id = ?1",
                params![repo_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(match last_used {
            Some(last_used) => now_millis().saturating_sub(last_used) > duration_millis(retention),
            None => true,
        })
    }

    /// Drop both the lock and the access marker of a deleted working tree.
    pub fn delete_repo_records(&self, repo_id: &str, token: &LockToken) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM locks WHERE repo_id = ?1 AND owner = ?2",
            params![repo_id, token.0],
        )?;
        conn.execute("DELETE FROM repo_access WHERE repo_id = ?1", params![repo_id])?;
        Ok(())
    }

    pub fn is_locked(&self, repo_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let held: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM locks WHERE repo_id = ?1 AND expires_at > ?2",
                params![repo_id, now_millis()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(held.is_some())
    }
}
