//! Per-IMEI downlink command queue: Postgres is durable storage, Redis is the delivery
//! mirror the session supervisor actually drains from.
//!
//! Grounded on the teacher's `failed_events` module: same raw-query style (`sqlx::query`
//! with positional binds, `fetch_optional`/`execute`), repurposed from "failed event retry
//! log" to "pending command queue". A command is only deleted from Postgres after the
//! socket write that delivers it has succeeded (spec §4.4, at-least-once delivery); Redis
//! is not the system of record, so a queue entry that never reaches Redis (startup crash,
//! flush) is recovered by [`super::PresenceStore::sync_allowlist`]'s sibling, the command
//! queue rebuild, below.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::{PgPool, Row};

use super::PresenceError;

fn queue_key(imei: &str) -> String {
    format!("gateway:commands:{}", imei)
}

pub struct QueuedCommand {
    pub id: i64,
    pub command: String,
}

#[derive(Clone)]
pub struct CommandQueue {
    redis: ConnectionManager,
    db: PgPool,
}

impl CommandQueue {
    pub fn new(redis: ConnectionManager, db: PgPool) -> Self {
        CommandQueue { redis, db }
    }

    /// Persists a command and mirrors it onto the Redis list, in that order: a crash
    /// between the two loses nothing (the rebuild below repopulates Redis from Postgres).
    pub async fn enqueue(&self, imei: &str, command: &str) -> Result<i64, PresenceError> {
        let row = sqlx::query(
            r#"
            INSERT INTO command_queue (imei, command)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(imei)
        .bind(command)
        .fetch_one(&self.db)
        .await?;
        let id: i64 = row.try_get("id")?;

        let mut conn = self.redis.clone();
        let _: () = conn.rpush(queue_key(imei), id).await?;
        Ok(id)
    }

    /// Pops the oldest pending command id for a device from the Redis list, then loads its
    /// text from Postgres. Returns `None` if nothing is queued.
    pub async fn pop(&self, imei: &str) -> Result<Option<QueuedCommand>, PresenceError> {
        let mut conn = self.redis.clone();
        loop {
            let id: Option<i64> = conn.lpop(queue_key(imei), None).await?;
            let Some(id) = id else {
                return Ok(None);
            };

            let row = sqlx::query("SELECT command FROM command_queue WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;

            if let Some(row) = row {
                return Ok(Some(QueuedCommand {
                    id,
                    command: row.try_get("command")?,
                }));
            }
            // Already acked (row deleted, e.g. delivered before a rebuild re-pushed it); skip.
        }
    }

    /// Re-queues a command at the head of its device's Redis list after a failed socket
    /// write, so it is the next one popped rather than lost (spec §4.3).
    pub async fn requeue_head(&self, imei: &str, id: i64) -> Result<(), PresenceError> {
        let mut conn = self.redis.clone();
        let _: () = conn.lpush(queue_key(imei), id).await?;
        Ok(())
    }

    /// Deletes a delivered command. Called only after the downlink frame has actually been
    /// written to the device socket (spec §3, §4.4 FIFO delivery invariant).
    pub async fn ack(&self, id: i64) -> Result<(), PresenceError> {
        sqlx::query("DELETE FROM command_queue WHERE id = $1").bind(id).execute(&self.db).await?;
        Ok(())
    }

    /// Rebuilds every device's Redis list from Postgres: clears each IMEI's list first, then
    /// re-pushes its pending rows ordered by `created_at`, so repeated syncs never duplicate
    /// an id in the list (spec §4.4). Run on startup and by the periodic background sync.
    pub async fn rebuild(&self) -> Result<(), PresenceError> {
        let rows = sqlx::query("SELECT id, imei FROM command_queue ORDER BY imei, created_at ASC, id ASC")
            .fetch_all(&self.db)
            .await?;

        let mut conn = self.redis.clone();
        let mut cleared = std::collections::HashSet::new();
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let imei: String = row.try_get("imei")?;
            if cleared.insert(imei.clone()) {
                let _: () = conn.del(queue_key(&imei)).await?;
            }
            let _: () = conn.rpush(queue_key(&imei), id).await?;
        }
        Ok(())
    }
}
