use sqlx::Row;
use tracing::{debug, instrument};

use super::core::{now_iso, Database};
use crate::error::Error;
use crate::fingerprint::Fingerprint;
use crate::TARGET_DB;

impl Database {
    /// Stores the fingerprint for an article. Re-fingerprinting overwrites
    /// the existing row; there is never more than one per article.
    #[instrument(target = "db", level = "debug", skip(self, fingerprint))]
    pub async fn upsert_fingerprint(
        &self,
        news_id: i64,
        fingerprint: &Fingerprint,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO content_fingerprints (news_id, title_sig, entity_sig, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(news_id) DO UPDATE SET
                title_sig = excluded.title_sig,
                entity_sig = excluded.entity_sig
            "#,
        )
        .bind(news_id)
        .bind(&fingerprint.title_sig)
        .bind(&fingerprint.entity_sig)
        .bind(now_iso())
        .execute(self.pool())
        .await?;

        debug!(target: TARGET_DB, "Upserted fingerprint for news_id={}", news_id);
        Ok(())
    }

    pub async fn get_fingerprint(&self, news_id: i64) -> Result<Option<Fingerprint>, Error> {
        let row = sqlx::query(
            "SELECT title_sig, entity_sig FROM content_fingerprints WHERE news_id = ?1",
        )
        .bind(news_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|row| Fingerprint {
            title_sig: row.get("title_sig"),
            entity_sig: row.get("entity_sig"),
        }))
    }

    pub async fn count_fingerprints(&self, news_id: i64) -> Result<i64, Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM content_fingerprints WHERE news_id = ?1",
        )
        .bind(news_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }
}
