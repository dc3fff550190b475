use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS news (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                body TEXT,
                url TEXT,
                published_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_news_published_at ON news (published_at);

            CREATE TABLE IF NOT EXISTS content_fingerprints (
                news_id INTEGER PRIMARY KEY,
                title_sig TEXT NOT NULL,
                entity_sig TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (news_id) REFERENCES news (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS stories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_stories_updated_at ON stories (updated_at);

            -- An article belongs to at most one story; the unique index on
            -- news_id is what arbitrates concurrent attach attempts.
            CREATE TABLE IF NOT EXISTS story_articles (
                story_id INTEGER NOT NULL,
                news_id INTEGER NOT NULL,
                PRIMARY KEY (story_id, news_id),
                FOREIGN KEY (story_id) REFERENCES stories (id) ON DELETE CASCADE,
                FOREIGN KEY (news_id) REFERENCES news (id) ON DELETE CASCADE
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_story_articles_news_id
                ON story_articles (news_id);

            CREATE TABLE IF NOT EXISTS publish_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_type TEXT NOT NULL,
                item_id INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                scheduled_at TEXT,
                enqueued_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                dedup_key TEXT NOT NULL UNIQUE,
                attempts INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                message_id TEXT,
                sent_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_publish_queue_status ON publish_queue (status);
            CREATE INDEX IF NOT EXISTS idx_publish_queue_sent_at ON publish_queue (sent_at);

            CREATE TABLE IF NOT EXISTS publish_map (
                item_type TEXT NOT NULL,
                item_id INTEGER NOT NULL,
                message_id TEXT NOT NULL,
                sent_at TEXT,
                text TEXT,
                mode TEXT NOT NULL,
                PRIMARY KEY (item_type, item_id)
            );

            CREATE TABLE IF NOT EXISTS publish_edits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_type TEXT NOT NULL,
                item_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                message_id TEXT NOT NULL,
                reply_msg_id TEXT,
                old_text TEXT,
                new_text TEXT,
                mode TEXT NOT NULL,
                created_at TEXT NOT NULL,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_publish_edits_item ON publish_edits (item_type, item_id);
            "#,
        )
        .execute(&mut *conn)
        .await?;
        info!(target: TARGET_DB, "Tables ensured to exist");

        Ok(())
    }
}
