use std::time::{Duration, Instant};

use sqlx::QueryBuilder;

use super::db::Database;
use super::types::{FeedId, RetentionStyle, StoreError};

// ============================================================================
// Retention Constants
// ============================================================================

/// Descending article age passes. Oldest content goes first so an aborted
/// run always freed the most space it could in the time it had.
const GC_CUTOFF_DAYS: [i64; 5] = [365, 300, 225, 150, 90];

/// Wall-clock budget for one garbage collection run. Remaining passes are
/// abandoned past this and picked up by the next run.
const GC_TIME_BUDGET: Duration = Duration::from_secs(2);

/// Statuses for vanished articles are kept this long so re-delivered items
/// do not come back unread.
const STATUS_CUTOFF_DAYS_SYNC: i64 = 180;
const STATUS_CUTOFF_DAYS_FEED: i64 = 30;

/// Unread statuses older than this are considered abandoned.
const MARK_READ_CUTOFF_DAYS: i64 = 90;

const DAY_SECONDS: i64 = 86_400;

// ============================================================================
// Clock
// ============================================================================

/// Monotonic time source for the GC budget, injectable so tests can simulate
/// slow passes.
pub trait Clock: Send + Sync {
    fn monotonic(&self) -> Duration;
}

/// Real monotonic clock, measured from construction.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Database {
    // ========================================================================
    // Article Garbage Collection
    // ========================================================================

    /// Delete read, unstarred article content in descending age passes,
    /// stopping early once the time budget is spent. Statuses survive so a
    /// re-delivered item stays read. Returns how many rows were deleted.
    pub async fn delete_old_articles(&self, clock: &dyn Clock) -> Result<usize, StoreError> {
        let _writer = self.writer.lock().await;
        let started = clock.monotonic();
        let now = chrono::Utc::now().timestamp();
        let mut total = 0usize;

        for (pass, days) in GC_CUTOFF_DAYS.iter().enumerate() {
            let cutoff = now - days * DAY_SECONDS;
            let result = sqlx::query(
                r#"
                DELETE FROM articles
                WHERE date_arrived < ?
                  AND article_id IN (
                    SELECT article_id FROM statuses WHERE read = 1 AND starred = 0
                  )
            "#,
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            total += result.rows_affected() as usize;

            let elapsed = clock.monotonic() - started;
            if elapsed > GC_TIME_BUDGET && pass + 1 < GC_CUTOFF_DAYS.len() {
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    completed_passes = pass + 1,
                    "article GC over time budget; deferring remaining passes"
                );
                break;
            }
        }

        if total > 0 {
            tracing::debug!(deleted = total, "article GC complete");
            self.cache_clear();
        }
        Ok(total)
    }

    // ========================================================================
    // Status Garbage Collection
    // ========================================================================

    /// Delete statuses whose article content is already gone, once they are
    /// old enough that re-delivery is no longer plausible. Sync-style
    /// accounts keep statuses longer and only drop read ones, since the
    /// remote may still reference them. Starred statuses are never dropped.
    pub async fn delete_old_statuses(&self, style: RetentionStyle) -> Result<usize, StoreError> {
        let _writer = self.writer.lock().await;
        let now = chrono::Utc::now().timestamp();
        let (days, require_read) = match style {
            RetentionStyle::SyncBased => (STATUS_CUTOFF_DAYS_SYNC, true),
            RetentionStyle::FeedBased => (STATUS_CUTOFF_DAYS_FEED, false),
        };
        let cutoff = now - days * DAY_SECONDS;

        let mut sql = String::from(
            "DELETE FROM statuses \
             WHERE starred = 0 AND date_arrived < ? \
               AND NOT EXISTS (SELECT 1 FROM articles a WHERE a.article_id = statuses.article_id)",
        );
        if require_read {
            sql.push_str(" AND read = 1");
        }

        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        let deleted = result.rows_affected() as usize;
        if deleted > 0 {
            tracing::debug!(deleted = deleted, style = ?style, "status GC complete");
        }
        Ok(deleted)
    }

    // ========================================================================
    // Unsubscribe Cleanup
    // ========================================================================

    /// Remove articles and statuses for feeds outside the given subscription
    /// set. An empty set is a no-op: a caller with no feeds loaded yet must
    /// not wipe the store.
    pub async fn delete_articles_not_in_feeds(
        &self,
        feed_ids: &[FeedId],
    ) -> Result<usize, StoreError> {
        if feed_ids.is_empty() {
            return Ok(0);
        }

        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "DELETE FROM statuses WHERE article_id IN \
             (SELECT article_id FROM articles WHERE feed_id NOT IN (",
        );
        let mut separated = builder.separated(", ");
        for id in feed_ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated("))");
        builder.build().execute(&mut *tx).await?;

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("DELETE FROM articles WHERE feed_id NOT IN (");
        let mut separated = builder.separated(", ");
        for id in feed_ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");
        let result = builder.build().execute(&mut *tx).await?;

        tx.commit().await?;
        self.cache_clear();

        let deleted = result.rows_affected() as usize;
        if deleted > 0 {
            tracing::debug!(deleted = deleted, "removed articles for unsubscribed feeds");
        }
        Ok(deleted)
    }

    // ========================================================================
    // Policy Migration
    // ========================================================================

    /// One-time migration for the recency policy: unread statuses that
    /// arrived before the 90-day cutoff become read, so ancient items stop
    /// counting as unread after an upgrade.
    pub async fn mark_older_statuses_read(&self) -> Result<usize, StoreError> {
        let _writer = self.writer.lock().await;
        let cutoff = chrono::Utc::now().timestamp() - MARK_READ_CUTOFF_DAYS * DAY_SECONDS;

        let result = sqlx::query("UPDATE statuses SET read = 1 WHERE read = 0 AND date_arrived < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        self.cache_clear();
        Ok(result.rows_affected() as usize)
    }
}
