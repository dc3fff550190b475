use sqlx::Row;
use tracing::{debug, instrument};

use super::core::{now_iso, Database};
use crate::error::Error;
use crate::TARGET_DB;

/// Article row as the clustering and rendering code sees it. Articles are
/// ingested by an external collaborator; the core only reads them, plus the
/// insert helper used by the CLI and tests.
#[derive(Debug, Clone)]
pub struct ArticleRow {
    pub id: i64,
    pub title: String,
    pub body: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<String>,
}

impl Database {
    #[instrument(target = "db", level = "debug", skip(self, body))]
    pub async fn insert_article(
        &self,
        title: &str,
        body: Option<&str>,
        url: Option<&str>,
        published_at: Option<&str>,
    ) -> Result<i64, Error> {
        let id = sqlx::query(
            r#"
            INSERT INTO news (title, body, url, published_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(title)
        .bind(body)
        .bind(url)
        .bind(published_at)
        .bind(now_iso())
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        debug!(target: TARGET_DB, "Inserted article id={}", id);
        Ok(id)
    }

    pub async fn get_article(&self, news_id: i64) -> Result<Option<ArticleRow>, Error> {
        let row = sqlx::query(
            "SELECT id, title, body, url, published_at FROM news WHERE id = ?1",
        )
        .bind(news_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|row| ArticleRow {
            id: row.get("id"),
            title: row.get("title"),
            body: row.get("body"),
            url: row.get("url"),
            published_at: row.get("published_at"),
        }))
    }

    /// Recent articles that are not yet linked to any story, oldest first so
    /// a batch clustering pass replays them in publication order.
    pub async fn unassigned_articles(
        &self,
        since: &str,
        limit: i64,
    ) -> Result<Vec<ArticleRow>, Error> {
        let rows = sqlx::query(
            r#"
            SELECT n.id, n.title, n.body, n.url, n.published_at
            FROM news n
            LEFT JOIN story_articles sa ON sa.news_id = n.id
            WHERE sa.news_id IS NULL
              AND COALESCE(n.published_at, n.created_at) >= ?1
            ORDER BY COALESCE(n.published_at, n.created_at) ASC
            LIMIT ?2
            "#,
        )
        .bind(since)
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
}
