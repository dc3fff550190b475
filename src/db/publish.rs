use sqlx::Row;
use tracing::{debug, instrument};

use super::core::{now_iso, Database};
use crate::error::Error;
use crate::types::{EditAction, ItemType, ParseMode};
use crate::TARGET_DB;

/// Canonical "currently delivered" rendering of an item. One row per item;
/// edits update it in place.
#[derive(Debug, Clone)]
pub struct PublishMapEntry {
    pub item_type: ItemType,
    pub item_id: i64,
    pub message_id: String,
    pub sent_at: Option<String>,
    pub text: Option<String>,
    pub mode: ParseMode,
}

/// One row of the append-only edit log.
#[derive(Debug, Clone)]
pub struct PublishEditRow {
    pub id: i64,
    pub action: EditAction,
    pub message_id: String,
    pub reply_msg_id: Option<String>,
    pub old_text: Option<String>,
    pub new_text: Option<String>,
    pub mode: ParseMode,
    pub created_at: String,
    pub error: Option<String>,
}

/// Edit-log insert payload.
#[derive(Debug)]
pub struct NewPublishEdit<'a> {
    pub item_type: ItemType,
    pub item_id: i64,
    pub action: EditAction,
    pub message_id: &'a str,
    pub reply_msg_id: Option<&'a str>,
    pub old_text: Option<&'a str>,
    pub new_text: Option<&'a str>,
    pub mode: ParseMode,
    pub error: Option<&'a str>,
}

impl Database {
    /// Records (or refreshes) the delivered rendering of an item.
    #[instrument(target = "db", level = "info", skip(self, text))]
    pub async fn upsert_publish_map(
        &self,
        item_type: ItemType,
        item_id: i64,
        message_id: &str,
        text: &str,
        mode: ParseMode,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO publish_map (item_type, item_id, message_id, sent_at, text, mode)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(item_type, item_id) DO UPDATE SET
                message_id = excluded.message_id,
                sent_at = excluded.sent_at,
                text = excluded.text,
                mode = excluded.mode
            "#,
        )
        .bind(item_type.as_str())
        .bind(item_id)
        .bind(message_id)
        .bind(now_iso())
        .bind(text)
        .bind(mode.as_str())
        .execute(self.pool())
        .await?;

        debug!(
            target: TARGET_DB,
            "publish_map updated {}#{} message_id={}",
            item_type, item_id, message_id
        );
        Ok(())
    }

    pub async fn get_publish_map(
        &self,
        item_type: ItemType,
        item_id: i64,
    ) -> Result<Option<PublishMapEntry>, Error> {
        let row = sqlx::query(
            r#"
            SELECT message_id, sent_at, text, mode
            FROM publish_map
            WHERE item_type = ?1 AND item_id = ?2
            "#,
        )
        .bind(item_type.as_str())
        .bind(item_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            let raw_mode: String = row.get("mode");
            let mode = ParseMode::parse(&raw_mode)
                .ok_or_else(|| Error::Validation(format!("unknown mode: {}", raw_mode)))?;
            Ok(PublishMapEntry {
                item_type,
                item_id,
                message_id: row.get("message_id"),
                sent_at: row.get("sent_at"),
                text: row.get("text"),
                mode,
            })
        })
        .transpose()
    }

    /// Appends to the edit log. Rows are never mutated afterwards.
    pub async fn record_edit(&self, edit: NewPublishEdit<'_>) -> Result<i64, Error> {
        let id = sqlx::query(
            r#"
            INSERT INTO publish_edits
                (item_type, item_id, action, message_id, reply_msg_id,
                 old_text, new_text, mode, created_at, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(edit.item_type.as_str())
        .bind(edit.item_id)
        .bind(edit.action.as_str())
        .bind(edit.message_id)
        .bind(edit.reply_msg_id)
        .bind(edit.old_text)
        .bind(edit.new_text)
        .bind(edit.mode.as_str())
        .bind(now_iso())
        .bind(edit.error)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    /// Text of the most recent append for an item, used to warn about
    /// repeated identical updates.
    pub async fn last_append_text(
        &self,
        item_type: ItemType,
        item_id: i64,
    ) -> Result<Option<String>, Error> {
        let text: Option<String> = sqlx::query_scalar(
            r#"
            SELECT new_text FROM publish_edits
            WHERE item_type = ?1 AND item_id = ?2 AND action = 'append'
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(item_type.as_str())
        .bind(item_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(text)
    }

    pub async fn edits_for_item(
        &self,
        item_type: ItemType,
        item_id: i64,
    ) -> Result<Vec<PublishEditRow>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, action, message_id, reply_msg_id, old_text, new_text,
                   mode, created_at, error
            FROM publish_edits
            WHERE item_type = ?1 AND item_id = ?2
            ORDER BY id ASC
            "#,
        )
        .bind(item_type.as_str())
        .bind(item_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                let raw_action: String = row.get("action");
                let raw_mode: String = row.get("mode");
                let action = EditAction::parse(&raw_action).ok_or_else(|| {
                    Error::Validation(format!("unknown action: {}", raw_action))
                })?;
                let mode = ParseMode::parse(&raw_mode)
                    .ok_or_else(|| Error::Validation(format!("unknown mode: {}", raw_mode)))?;
                Ok(PublishEditRow {
                    id: row.get("id"),
                    action,
                    message_id: row.get("message_id"),
                    reply_msg_id: row.get("reply_msg_id"),
                    old_text: row.get("old_text"),
                    new_text: row.get("new_text"),
                    mode,
                    created_at: row.get("created_at"),
                    error: row.get("error"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_map_upserts_in_place() {
        let db = Database::new_in_memory().await.unwrap();

        db.upsert_publish_map(ItemType::Story, 1, "msg-1", "first", ParseMode::Html)
            .await
            .unwrap();
        db.upsert_publish_map(ItemType::Story, 1, "msg-1", "revised", ParseMode::Html)
            .await
            .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM publish_map")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);

        let entry = db
            .get_publish_map(ItemType::Story, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.text.as_deref(), Some("revised"));
    }

    #[tokio::test]
    async fn edit_log_is_append_only_and_ordered() {
        let db = Database::new_in_memory().await.unwrap();

        for text in ["update one", "update two"] {
            db.record_edit(NewPublishEdit {
                item_type: ItemType::Story,
                item_id: 1,
                action: EditAction::Append,
                message_id: "msg-1",
                reply_msg_id: Some("msg-2"),
                old_text: None,
                new_text: Some(text),
                mode: ParseMode::Html,
                error: None,
            })
            .await
            .unwrap();
        }

        let edits = db.edits_for_item(ItemType::Story, 1).await.unwrap();
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[1].new_text.as_deref(), Some("update two"));
        assert_eq!(
            db.last_append_text(ItemType::Story, 1).await.unwrap(),
            Some("update two".to_string())
        );
    }
}
