//! FIFO dispatch queue of operation UUIDs.
//!
//! Delivery is at-least-once: `dequeue` claims the oldest entry and `ack`
//! removes it. A claimed entry that is never acknowledged (the worker died
//! mid-operation) becomes deliverable again once the visibility timeout has
//! passed.

use std::time::Duration;

use rusqlite::{params, OptionalExtension};
use tokio::sync::watch;

use super::{duration_millis, now_millis, Store, StoreError};

/// Re-poll interval while waiting for work, covers entries whose claim expired.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A claimed queue entry; pass it back to `Store::ack` once processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    id: i64,
    pub uuid: String,
}

impl Store {
    pub fn enqueue(&self, uuid: &str) -> Result<(), StoreError> {
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO queue (uuid, enqueued_at) VALUES (?1, ?2)",
                params![uuid, now_millis()],
            )?;
        }
        self.queue_notify.notify_one();
        Ok(())
    }

    /// Wait for the next operation UUID.
    ///
    /// Returns `None` once `cancel` is set to `true` or its sender is gone.
    pub async fn dequeue(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Option<Delivery>, StoreError> {
        loop {
            if *cancel.borrow() {
                return Ok(None);
            }

            let notified = self.queue_notify.notified();
            if let Some(delivery) = self.try_dequeue()? {
                return Ok(Some(delivery));
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                changed = cancel.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Claim the oldest deliverable entry without waiting.
    pub fn try_dequeue(&self) -> Result<Option<Delivery>, StoreError> {
        let now = now_millis();
        let reclaim_before = now.saturating_sub(duration_millis(self.visibility_timeout));

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let next: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, uuid FROM queue
                 WHERE claimed_at IS NULL OR claimed_at < ?1
                 ORDER BY id LIMIT 1",
                params![reclaim_before],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((id, uuid)) = next else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE queue SET claimed_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        tx.commit()?;

        Ok(Some(Delivery { id, uuid }))
    }

    pub fn ack(&self, delivery: &Delivery) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM queue WHERE id = ?1", params![delivery.id])?;
        Ok(())
    }

    /// Entries waiting or in flight.
    pub fn queue_len(&self) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}
