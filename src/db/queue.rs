use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::Row;
use tracing::{debug, info, instrument, warn};

use super::core::{iso, now_iso, Database};
use crate::error::Error;
use crate::types::{ItemType, QueueStatus};
use crate::TARGET_DB;

/// One outbound publish request.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub item_type: ItemType,
    pub item_id: i64,
    pub priority: i64,
    pub scheduled_at: Option<String>,
    pub enqueued_at: String,
    pub status: QueueStatus,
    pub dedup_key: String,
    pub attempts: i64,
    pub error: Option<String>,
    pub message_id: Option<String>,
    pub sent_at: Option<String>,
}

/// Result of an enqueue call. `inserted == false` means an earlier request
/// for the same dedup key already holds the row.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueOutcome {
    pub queue_id: i64,
    pub inserted: bool,
}

/// Deterministic dedup key: item identity plus a short hash of the item's
/// content/version marker. A materially unchanged item always maps to the
/// same key; a changed one gets a fresh key and may be enqueued again.
pub fn dedup_key(item_type: ItemType, item_id: i64, version_marker: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version_marker.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}:{}:{}", item_type.as_str(), item_id, &digest[..12])
}

fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<QueueItem, Error> {
    let raw_type: String = row.get("item_type");
    let raw_status: String = row.get("status");
    let item_type = ItemType::parse(&raw_type)
        .ok_or_else(|| Error::Validation(format!("unknown item_type: {}", raw_type)))?;
    let status = QueueStatus::parse(&raw_status)
        .ok_or_else(|| Error::Validation(format!("unknown status: {}", raw_status)))?;

    Ok(QueueItem {
        id: row.get("id"),
        item_type,
        item_id: row.get("item_id"),
        priority: row.get("priority"),
        scheduled_at: row.get("scheduled_at"),
        enqueued_at: row.get("enqueued_at"),
        status,
        dedup_key: row.get("dedup_key"),
        attempts: row.get("attempts"),
        error: row.get("error"),
        message_id: row.get("message_id"),
        sent_at: row.get("sent_at"),
    })
}

impl Database {
    /// Admits a publish request. At most one `queued` row ever exists per
    /// logical item: a still-queued row absorbs any re-enqueue regardless of
    /// its version marker. The `dedup_key` only decides whether a terminal
    /// item may enter the queue again (same key collapses, changed key
    /// re-enqueues). Either kind of duplicate is a soft no-op that returns
    /// the surviving row's id, never an error.
    #[instrument(target = "db", level = "info", skip(self, dedup_key))]
    pub async fn enqueue(
        &self,
        item_type: ItemType,
        item_id: i64,
        priority: i64,
        scheduled_at: Option<DateTime<Utc>>,
        dedup_key: &str,
    ) -> Result<EnqueueOutcome, Error> {
        let mut transaction = self.pool().begin().await?;

        let active: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM publish_queue
            WHERE item_type = ?1 AND item_id = ?2 AND status = 'queued'
            "#,
        )
        .bind(item_type.as_str())
        .bind(item_id)
        .fetch_optional(&mut *transaction)
        .await?;

        if let Some(queue_id) = active {
            transaction.rollback().await?;
            debug!(
                target: TARGET_DB,
                "Enqueue absorbed by active queue_id={} for {}#{}",
                queue_id, item_type, item_id
            );
            return Ok(EnqueueOutcome {
                queue_id,
                inserted: false,
            });
        }

        let result = sqlx::query(
            r#"
            INSERT INTO publish_queue (item_type, item_id, priority, scheduled_at, enqueued_at, status, dedup_key)
            VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6)
            ON CONFLICT(dedup_key) DO NOTHING
            "#,
        )
        .bind(item_type.as_str())
        .bind(item_id)
        .bind(priority)
        .bind(scheduled_at.map(iso))
        .bind(now_iso())
        .bind(dedup_key)
        .execute(&mut *transaction)
        .await?;

        let inserted = result.rows_affected() > 0;

        let queue_id: i64 =
            sqlx::query_scalar("SELECT id FROM publish_queue WHERE dedup_key = ?1")
                .bind(dedup_key)
                .fetch_one(&mut *transaction)
                .await?;

        transaction.commit().await?;

        if inserted {
            info!(
                target: TARGET_DB,
                "Enqueued {}#{} queue_id={} priority={}",
                item_type, item_id, queue_id, priority
            );
        } else {
            debug!(
                target: TARGET_DB,
                "Enqueue collapsed to existing queue_id={} for {}#{}",
                queue_id, item_type, item_id
            );
        }

        Ok(EnqueueOutcome { queue_id, inserted })
    }

    /// Enqueues a story, deriving the dedup key from its current title and
    /// `updated_at` so a content change can re-enqueue it once the earlier
    /// row reaches a terminal state.
    pub async fn enqueue_story(
        &self,
        story_id: i64,
        priority: i64,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<EnqueueOutcome, Error> {
        let story = self
            .get_story(story_id)
            .await?
            .ok_or_else(|| Error::Validation(format!("story not found: {}", story_id)))?;
        let marker = format!("{}\n{}", story.title, story.updated_at);
        let key = dedup_key(ItemType::Story, story_id, &marker);
        self.enqueue(ItemType::Story, story_id, priority, scheduled_at, &key)
            .await
    }

    /// Enqueues a single article; titles are immutable once ingested so the
    /// title alone is the version marker.
    pub async fn enqueue_article(
        &self,
        news_id: i64,
        priority: i64,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<EnqueueOutcome, Error> {
        let article = self
            .get_article(news_id)
            .await?
            .ok_or_else(|| Error::Validation(format!("article not found: {}", news_id)))?;
        let key = dedup_key(ItemType::Article, news_id, &article.title);
        self.enqueue(ItemType::Article, news_id, priority, scheduled_at, &key)
            .await
    }

    /// Next item eligible for dispatch: queued, due, ordered by priority
    /// descending, then scheduled_at ascending with nulls first, then
    /// enqueue order. This ordering is the scheduling contract.
    pub async fn next_ready(&self, now: DateTime<Utc>) -> Result<Option<QueueItem>, Error> {
        let row = sqlx::query(
            r#"
            SELECT *
            FROM publish_queue
            WHERE status = 'queued'
              AND (scheduled_at IS NULL OR scheduled_at <= ?1)
            ORDER BY priority DESC,
                     CASE WHEN scheduled_at IS NULL THEN 0 ELSE 1 END ASC,
                     scheduled_at ASC,
                     enqueued_at ASC,
                     id ASC
            LIMIT 1
            "#,
        )
        .bind(iso(now))
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(item_from_row).transpose()
    }

    /// Records a successful send. Conditional on the row still being
    /// `queued`, so at most one sent-transition can ever happen per row.
    /// Returns `false` if another writer already moved the row.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn mark_sent(&self, queue_id: i64, message_id: &str) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE publish_queue
            SET status = 'sent', message_id = ?1, sent_at = ?2, error = NULL
            WHERE id = ?3 AND status = 'queued'
            "#,
        )
        .bind(message_id)
        .bind(now_iso())
        .bind(queue_id)
        .execute(self.pool())
        .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            info!(target: TARGET_DB, "Marked queue_id={} sent message_id={}", queue_id, message_id);
        } else {
            warn!(target: TARGET_DB, "queue_id={} was no longer queued; sent-transition skipped", queue_id);
        }
        Ok(updated)
    }

    /// Puts a transiently failed row back in the queue with a delayed
    /// `scheduled_at` and the failure reason recorded. Bumps the attempt
    /// counter.
    pub async fn requeue_after_failure(
        &self,
        queue_id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE publish_queue
            SET attempts = attempts + 1, error = ?1, scheduled_at = ?2, status = 'queued'
            WHERE id = ?3 AND status = 'queued'
            "#,
        )
        .bind(error)
        .bind(iso(retry_at))
        .bind(queue_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Terminal failure: the row stays as the durable error record and is
    /// never picked up again.
    #[instrument(target = "db", level = "info", skip(self, error))]
    pub async fn mark_failed(&self, queue_id: i64, error: &str) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE publish_queue
            SET status = 'error', attempts = attempts + 1, error = ?1
            WHERE id = ?2 AND status = 'queued'
            "#,
        )
        .bind(error)
        .bind(queue_id)
        .execute(self.pool())
        .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            warn!(target: TARGET_DB, "queue_id={} parked in terminal error: {}", queue_id, error);
        }
        Ok(updated)
    }

    /// Explicit cancellation of a still-queued item. The only path into
    /// `skipped`.
    pub async fn mark_skipped(&self, queue_id: i64) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE publish_queue SET status = 'skipped' WHERE id = ?1 AND status = 'queued'",
        )
        .bind(queue_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_queue_item(&self, queue_id: i64) -> Result<Option<QueueItem>, Error> {
        let row = sqlx::query("SELECT * FROM publish_queue WHERE id = ?1")
            .bind(queue_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    /// Timestamp of the most recent successful send, for the min-interval
    /// rate gate.
    pub async fn last_sent_at(&self) -> Result<Option<String>, Error> {
        let sent_at: Option<String> = sqlx::query_scalar(
            r#"
            SELECT sent_at FROM publish_queue
            WHERE status = 'sent' AND sent_at IS NOT NULL
            ORDER BY sent_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(self.pool())
        .await?;
        Ok(sent_at)
    }

    /// Number of successful sends since a given instant. Persisted counts
    /// make the per-hour/per-day rate windows restart-safe.
    pub async fn count_sent_since(&self, since: &str) -> Result<i64, Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM publish_queue WHERE status = 'sent' AND sent_at >= ?1",
        )
        .bind(since)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }
}
