use std::collections::{HashMap, HashSet};

use sqlx::{QueryBuilder, SqliteConnection};

use super::db::Database;
use super::types::{
    ArticleId, ArticleStatus, FeedId, MarkOrigin, PendingKind, StatusKind, StoreError,
};

/// Chunk size for id lists, well under SQLite's parameter limit.
const ID_BATCH_SIZE: usize = 500;

impl Database {
    // ========================================================================
    // Status Ledger
    // ========================================================================

    /// Ensure a status row exists for every given article id.
    ///
    /// Statuses are created eagerly the first time an id is referenced, even
    /// before any content is stored, so read/starred state survives content
    /// purges. Existing rows are untouched (INSERT OR IGNORE).
    pub async fn ensure_statuses(
        &self,
        ids: &[ArticleId],
        date_arrived: i64,
        read: bool,
    ) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        ensure_statuses_tx(&mut tx, ids, date_arrived, read).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Bulk set a status flag, returning only the ids actually changed.
    ///
    /// Idempotent: rows already carrying the flag are skipped (`WHERE col !=`
    /// guard), so re-marking produces an empty result and no pending entries.
    /// For `MarkOrigin::Local`, each changed id appends a pending change in
    /// the same transaction; remote-applied marks never echo back.
    pub async fn mark_statuses(
        &self,
        ids: &[ArticleId],
        kind: StatusKind,
        flag: bool,
        origin: MarkOrigin,
    ) -> Result<Vec<ArticleId>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut changed: Vec<ArticleId> = Vec::new();
        for chunk in ids.chunks(ID_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("UPDATE statuses SET ");
            builder.push(kind.column());
            builder.push(" = ");
            builder.push_bind(flag);
            builder.push(" WHERE ");
            builder.push(kind.column());
            builder.push(" != ");
            builder.push_bind(flag);
            builder.push(" AND article_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(") RETURNING article_id");

            let rows: Vec<(String,)> = builder.build_query_as().fetch_all(&mut *tx).await?;
            changed.extend(rows.into_iter().map(|(id,)| id));
        }

        if origin == MarkOrigin::Local && !changed.is_empty() {
            enqueue_pending_tx(&mut tx, &changed, kind.into(), flag).await?;
        }

        tx.commit().await?;

        // Keep cached articles in step with the committed flag.
        if let Ok(mut cache) = self.cache.lock() {
            for id in &changed {
                if let Some(article) = cache.get_mut(id) {
                    match kind {
                        StatusKind::Read => article.status.read = flag,
                        StatusKind::Starred => article.status.starred = flag,
                    }
                }
            }
        }

        Ok(changed)
    }

    /// Fetch statuses for the given ids.
    pub async fn fetch_statuses(
        &self,
        ids: &[ArticleId],
    ) -> Result<HashMap<ArticleId, ArticleStatus>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_statuses_tx(&mut conn, ids).await
    }

    // ========================================================================
    // Counts and Restoration Sets
    // ========================================================================

    /// Unread article counts per feed. An empty feed list means all feeds.
    pub async fn unread_counts(
        &self,
        feed_ids: &[FeedId],
    ) -> Result<HashMap<FeedId, i64>, StoreError> {
        self.status_counts("s.read = 0", feed_ids).await
    }

    /// Starred article counts per feed. An empty feed list means all feeds.
    pub async fn starred_counts(
        &self,
        feed_ids: &[FeedId],
    ) -> Result<HashMap<FeedId, i64>, StoreError> {
        self.status_counts("s.starred = 1", feed_ids).await
    }

    async fn status_counts(
        &self,
        predicate: &str,
        feed_ids: &[FeedId],
    ) -> Result<HashMap<FeedId, i64>, StoreError> {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT a.feed_id, COUNT(*) FROM articles a \
             JOIN statuses s ON s.article_id = a.article_id WHERE ",
        );
        builder.push(predicate);
        if !feed_ids.is_empty() {
            builder.push(" AND a.feed_id IN (");
            let mut separated = builder.separated(", ");
            for id in feed_ids {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
        }
        builder.push(" GROUP BY a.feed_id");

        let rows: Vec<(String, i64)> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().collect())
    }

    /// Ids of every currently unread status, including statuses whose content
    /// has been purged. Used for cross-session restoration.
    pub async fn unread_article_ids(&self) -> Result<HashSet<ArticleId>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT article_id FROM statuses WHERE read = 0")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Ids of every currently starred status.
    pub async fn starred_article_ids(&self) -> Result<HashSet<ArticleId>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT article_id FROM statuses WHERE starred = 1")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

// ============================================================================
// Transaction-Scoped Helpers
// ============================================================================

pub(crate) async fn ensure_statuses_tx(
    conn: &mut SqliteConnection,
    ids: &[ArticleId],
    date_arrived: i64,
    read: bool,
) -> Result<(), StoreError> {
    for chunk in ids.chunks(ID_BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO statuses (article_id, read, starred, date_arrived) ",
        );
        builder.push_values(chunk, |mut b, id| {
            b.push_bind(id)
                .push_bind(read)
                .push_bind(false)
                .push_bind(date_arrived);
        });
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

pub(crate) async fn fetch_statuses_tx(
    conn: &mut SqliteConnection,
    ids: &[ArticleId],
) -> Result<HashMap<ArticleId, ArticleStatus>, StoreError> {
    let mut statuses = HashMap::with_capacity(ids.len());
    for chunk in ids.chunks(ID_BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT article_id, read, starred, date_arrived FROM statuses WHERE article_id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in chunk {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<(String, bool, bool, i64)> =
            builder.build_query_as().fetch_all(&mut *conn).await?;
        for (article_id, read, starred, date_arrived) in rows {
            statuses.insert(
                article_id.clone(),
                ArticleStatus {
                    article_id,
                    read,
                    starred,
                    date_arrived,
                },
            );
        }
    }
    Ok(statuses)
}

/// Append pending changes, coalescing duplicates for the same (id, kind) to
/// the latest flag.
pub(crate) async fn enqueue_pending_tx(
    conn: &mut SqliteConnection,
    ids: &[ArticleId],
    kind: PendingKind,
    flag: bool,
) -> Result<(), StoreError> {
    for chunk in ids.chunks(ID_BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("INSERT INTO pending_changes (article_id, kind, flag, selected) ");
        builder.push_values(chunk, |mut b, id| {
            b.push_bind(id)
                .push_bind(kind.as_str())
                .push_bind(flag)
                .push_bind(false);
        });
        builder.push(
            " ON CONFLICT(article_id, kind) DO UPDATE SET flag = excluded.flag, selected = 0",
        );
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, MarkOrigin, StatusKind};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_ensure_statuses_creates_unread_unstarred() {
        let db = test_db().await;
        db.ensure_statuses(&ids(&["a", "b"]), 100, false)
            .await
            .unwrap();

        let statuses = db.fetch_statuses(&ids(&["a", "b"])).await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(!statuses["a"].read);
        assert!(!statuses["a"].starred);
        assert_eq!(statuses["a"].date_arrived, 100);
    }

    #[tokio::test]
    async fn test_ensure_statuses_preserves_existing() {
        let db = test_db().await;
        db.ensure_statuses(&ids(&["a"]), 100, false).await.unwrap();
        db.mark_statuses(&ids(&["a"]), StatusKind::Read, true, MarkOrigin::Local)
            .await
            .unwrap();

        // Re-ensuring with different defaults must not clobber the row
        db.ensure_statuses(&ids(&["a"]), 999, false).await.unwrap();

        let statuses = db.fetch_statuses(&ids(&["a"])).await.unwrap();
        assert!(statuses["a"].read);
        assert_eq!(statuses["a"].date_arrived, 100);
    }

    #[tokio::test]
    async fn test_ensure_statuses_read_on_ingest() {
        let db = test_db().await;
        db.ensure_statuses(&ids(&["a"]), 100, true).await.unwrap();
        let statuses = db.fetch_statuses(&ids(&["a"])).await.unwrap();
        assert!(statuses["a"].read);
    }

    #[tokio::test]
    async fn test_mark_returns_only_changed_ids() {
        let db = test_db().await;
        db.ensure_statuses(&ids(&["a", "b"]), 100, false)
            .await
            .unwrap();
        db.mark_statuses(&ids(&["a"]), StatusKind::Read, true, MarkOrigin::Local)
            .await
            .unwrap();

        let changed = db
            .mark_statuses(&ids(&["a", "b"]), StatusKind::Read, true, MarkOrigin::Local)
            .await
            .unwrap();
        assert_eq!(changed, ids(&["b"]));
    }

    #[tokio::test]
    async fn test_mark_is_idempotent() {
        let db = test_db().await;
        db.ensure_statuses(&ids(&["a"]), 100, false).await.unwrap();

        let first = db
            .mark_statuses(&ids(&["a"]), StatusKind::Starred, true, MarkOrigin::Local)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = db
            .mark_statuses(&ids(&["a"]), StatusKind::Starred, true, MarkOrigin::Local)
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_local_mark_enqueues_remote_mark_does_not() {
        let db = test_db().await;
        db.ensure_statuses(&ids(&["a", "b"]), 100, false)
            .await
            .unwrap();

        db.mark_statuses(&ids(&["a"]), StatusKind::Read, true, MarkOrigin::Local)
            .await
            .unwrap();
        db.mark_statuses(&ids(&["b"]), StatusKind::Read, true, MarkOrigin::Remote)
            .await
            .unwrap();

        assert_eq!(db.pending_change_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_status_may_exist_without_article() {
        let db = test_db().await;
        db.ensure_statuses(&ids(&["ghost"]), 100, false)
            .await
            .unwrap();

        let unread = db.unread_article_ids().await.unwrap();
        assert!(unread.contains("ghost"));
    }

    #[tokio::test]
    async fn test_restoration_sets() {
        let db = test_db().await;
        db.ensure_statuses(&ids(&["a", "b", "c"]), 100, false)
            .await
            .unwrap();
        db.mark_statuses(&ids(&["a"]), StatusKind::Read, true, MarkOrigin::Local)
            .await
            .unwrap();
        db.mark_statuses(&ids(&["b"]), StatusKind::Starred, true, MarkOrigin::Local)
            .await
            .unwrap();

        let unread = db.unread_article_ids().await.unwrap();
        assert!(!unread.contains("a"));
        assert!(unread.contains("b"));
        assert!(unread.contains("c"));

        let starred = db.starred_article_ids().await.unwrap();
        assert_eq!(starred.len(), 1);
        assert!(starred.contains("b"));
    }
}
