use sqlx::Row;
use tracing::{debug, info, instrument};

use super::core::{now_iso, Database};
use crate::clustering::types::CandidateFingerprint;
use crate::db::article::ArticleRow;
use crate::error::Error;
use crate::TARGET_DB;

#[derive(Debug, Clone)]
pub struct StoryRow {
    pub id: i64,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Database {
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn create_story(&self, title: &str) -> Result<i64, Error> {
        let now = now_iso();
        let story_id = sqlx::query(
            "INSERT INTO stories (title, created_at, updated_at) VALUES (?1, ?2, ?3)",
        )
        .bind(title)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        info!(target: TARGET_DB, "Created story id={} title={}", story_id, title);
        Ok(story_id)
    }

    pub async fn get_story(&self, story_id: i64) -> Result<Option<StoryRow>, Error> {
        let row = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM stories WHERE id = ?1",
        )
        .bind(story_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|row| StoryRow {
            id: row.get("id"),
            title: row.get("title"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    /// The story an article is already linked to, if any.
    pub async fn story_for_article(&self, news_id: i64) -> Result<Option<i64>, Error> {
        let story_id: Option<i64> = sqlx::query_scalar(
            "SELECT story_id FROM story_articles WHERE news_id = ?1",
        )
        .bind(news_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(story_id)
    }

    /// Links an article to a story and bumps the story's `updated_at`, in
    /// one transaction.
    ///
    /// Returns `false` when the exact link already exists (idempotent
    /// re-processing). A violation of the one-story-per-article index is
    /// surfaced as `Error::Storage`: two writers raced, and the caller must
    /// retry against fresh story state.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn attach_article(&self, story_id: i64, news_id: i64) -> Result<bool, Error> {
        let mut transaction = self.pool().begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT story_id FROM story_articles WHERE news_id = ?1",
        )
        .bind(news_id)
        .fetch_optional(&mut *transaction)
        .await?;

        if existing == Some(story_id) {
            debug!(target: TARGET_DB, "Link already exists: story_id={} news_id={}", story_id, news_id);
            transaction.rollback().await?;
            return Ok(false);
        }

        sqlx::query("INSERT INTO story_articles (story_id, news_id) VALUES (?1, ?2)")
            .bind(story_id)
            .bind(news_id)
            .execute(&mut *transaction)
            .await?;

        sqlx::query("UPDATE stories SET updated_at = ?1 WHERE id = ?2")
            .bind(now_iso())
            .bind(story_id)
            .execute(&mut *transaction)
            .await?;

        transaction.commit().await?;
        debug!(target: TARGET_DB, "Linked news_id={} to story_id={}", news_id, story_id);
        Ok(true)
    }

    /// Fingerprints of members of stories updated within the recency
    /// window, excluding the article being assigned. This bounds the
    /// comparison set the cluster assigner works over.
    pub async fn candidate_fingerprints(
        &self,
        exclude_news_id: i64,
        window_start: &str,
    ) -> Result<Vec<CandidateFingerprint>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT sa.story_id, cf.news_id, cf.title_sig, cf.entity_sig, s.updated_at
            FROM story_articles sa
            JOIN stories s ON s.id = sa.story_id
            JOIN content_fingerprints cf ON cf.news_id = sa.news_id
            WHERE cf.news_id != ?1
              AND s.updated_at >= ?2
            "#,
        )
        .bind(exclude_news_id)
        .bind(window_start)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| CandidateFingerprint {
                story_id: row.get("story_id"),
                news_id: row.get("news_id"),
                title_sig: row.get("title_sig"),
                entity_sig: row.get("entity_sig"),
                story_updated_at: row.get("updated_at"),
            })
            .collect())
    }

    /// Member articles of a story, most recent first.
    pub async fn story_members(
        &self,
        story_id: i64,
        limit: i64,
    ) -> Result<Vec<ArticleRow>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT n.id, n.title, n.body, n.url, n.published_at
            FROM story_articles sa
            JOIN news n ON n.id = sa.news_id
            WHERE sa.story_id = ?1
            ORDER BY COALESCE(n.published_at, n.created_at) DESC
            LIMIT ?2
            "#,
        )
        .bind(story_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ArticleRow {
                id: row.get("id"),
                title: row.get("title"),
                body: row.get("body"),
                url: row.get("url"),
                published_at: row.get("published_at"),
            })
            .collect())
    }

    pub async fn count_story_members(&self, story_id: i64) -> Result<i64, Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM story_articles WHERE story_id = ?1",
        )
        .bind(story_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Stories updated within a window, most recently updated first. Used
    /// by the bulk enqueue pass.
    pub async fn recent_stories(
        &self,
        since: &str,
        limit: i64,
    ) -> Result<Vec<StoryRow>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, created_at, updated_at
            FROM stories
            WHERE updated_at >= ?1
            ORDER BY updated_at DESC
            LIMIT ?2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoryRow {
                id: row.get("id"),
                title: row.get("title"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    /// Refreshes the representative title of a story.
    pub async fn set_story_title(&self, story_id: i64, title: &str) -> Result<(), Error> {
        sqlx::query("UPDATE stories SET title = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(title)
            .bind(now_iso())
            .bind(story_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attach_is_idempotent_for_same_pair() {
        let db = Database::new_in_memory().await.unwrap();
        let news_id = db.insert_article("Title", None, None, None).await.unwrap();
        let story_id = db.create_story("Title").await.unwrap();

        assert!(db.attach_article(story_id, news_id).await.unwrap());
        assert!(!db.attach_article(story_id, news_id).await.unwrap());
        assert_eq!(db.count_story_members(story_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn attach_to_second_story_is_a_storage_error() {
        let db = Database::new_in_memory().await.unwrap();
        let news_id = db.insert_article("Title", None, None, None).await.unwrap();
        let first = db.create_story("Title").await.unwrap();
        let second = db.create_story("Other").await.unwrap();

        db.attach_article(first, news_id).await.unwrap();
        let err = db.attach_article(second, news_id).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(db.story_for_article(news_id).await.unwrap(), Some(first));
    }
}
