use sqlx::QueryBuilder;

use super::db::Database;
use super::types::{PendingChange, PendingKind, StoreError};

impl Database {
    // ========================================================================
    // Pending Change Queue
    // ========================================================================

    /// Number of queued changes, in-flight batches included.
    pub async fn pending_change_count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM pending_changes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// All queued changes in insertion order, for inspection.
    pub async fn pending_changes(&self) -> Result<Vec<PendingChange>, StoreError> {
        let rows: Vec<(String, String, bool)> =
            sqlx::query_as("SELECT article_id, kind, flag FROM pending_changes ORDER BY rowid")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(article_id, kind, flag)| {
                match PendingKind::parse(&kind) {
                    Some(kind) => Some(PendingChange {
                        article_id,
                        kind,
                        flag,
                    }),
                    None => {
                        tracing::warn!(kind = %kind, "unknown pending change kind; dropping row");
                        None
                    }
                }
            })
            .collect())
    }

    /// Claim up to `limit` unselected changes for an outgoing batch.
    ///
    /// Claimed rows are flagged `selected` so a concurrent enqueue of the same
    /// article coalesces into a fresh unselected row instead of mutating the
    /// in-flight one. The caller must follow up with [`clear_selected`] on a
    /// confirmed send or [`reset_selected`] on failure.
    ///
    /// [`clear_selected`]: Database::clear_selected
    /// [`reset_selected`]: Database::reset_selected
    pub async fn select_for_sending(&self, limit: i64) -> Result<Vec<PendingChange>, StoreError> {
        let _writer = self.writer.lock().await;
        let rows: Vec<(String, String, bool)> = sqlx::query_as(
            r#"
            UPDATE pending_changes
            SET selected = 1
            WHERE rowid IN (
                SELECT rowid FROM pending_changes WHERE selected = 0 ORDER BY rowid LIMIT ?
            )
            RETURNING article_id, kind, flag
        "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let batch: Vec<PendingChange> = rows
            .into_iter()
            .filter_map(|(article_id, kind, flag)| {
                PendingKind::parse(&kind).map(|kind| PendingChange {
                    article_id,
                    kind,
                    flag,
                })
            })
            .collect();
        tracing::debug!(count = batch.len(), "selected pending changes for sending");
        Ok(batch)
    }

    /// Delete the given changes after the remote confirmed them. Only rows
    /// still marked selected are removed: a change re-enqueued while the batch
    /// was in flight stays queued for the next send.
    pub async fn clear_selected(&self, sent: &[PendingChange]) -> Result<(), StoreError> {
        if sent.is_empty() {
            return Ok(());
        }
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        for change in sent {
            sqlx::query(
                "DELETE FROM pending_changes WHERE article_id = ? AND kind = ? AND selected = 1",
            )
            .bind(&change.article_id)
            .bind(change.kind.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Return every in-flight change to the queue after a failed send.
    pub async fn reset_selected(&self) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        sqlx::query("UPDATE pending_changes SET selected = 0 WHERE selected = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop queued changes for articles that no longer exist anywhere, used
    /// when a remote zone reset invalidates the whole queue.
    pub async fn clear_pending_changes(&self) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        sqlx::query("DELETE FROM pending_changes")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove queued changes of one kind for specific articles, e.g. when the
    /// articles were deleted locally before the queue flushed.
    pub async fn discard_pending(
        &self,
        article_ids: &[String],
        kind: PendingKind,
    ) -> Result<(), StoreError> {
        if article_ids.is_empty() {
            return Ok(());
        }
        let _writer = self.writer.lock().await;
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("DELETE FROM pending_changes WHERE kind = ");
        builder.push_bind(kind.as_str());
        builder.push(" AND article_id IN (");
        let mut separated = builder.separated(", ");
        for id in article_ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");
        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}
