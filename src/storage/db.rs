use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tokio::sync::Mutex as AsyncMutex;

use super::types::{Article, ArticleId, StoreError};

/// Capacity of the in-memory id -> Article cache.
const ARTICLE_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(n) => n,
    None => panic!("cache capacity must be nonzero"),
};

// ============================================================================
// Database
// ============================================================================

/// The article store: a SQLite pool plus a serialized writer path.
///
/// Reads go straight to the pool and may run concurrently. Every mutation
/// first acquires `writer`, so transactions (and the cache mutations that
/// follow a commit) are serialized: readers observe either the pre- or
/// post-state of a transaction, never a partial write.
///
/// The cache always either lacks an id or holds the last committed value for
/// it. It is never the source of truth; queries fall through to the tables.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    pub(crate) writer: Arc<AsyncMutex<()>>,
    pub(crate) cache: Arc<std::sync::Mutex<LruCache<ArticleId, Article>>>,
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Locked` if another process holds the database
    /// (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN), `StoreError::Migration`
    /// if the schema could not be brought up to date.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to release
        // before returning SQLITE_BUSY. Handles transient contention between
        // the writer path and concurrent readers automatically.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StoreError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        // SQLite is single-writer; 5 connections covers peak concurrent
        // readers (UI fetches + search + maintenance sweeps).
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(StoreError::from_sqlx)?;

        let db = Self {
            pool,
            writer: Arc::new(AsyncMutex::new(())),
            cache: Arc::new(std::sync::Mutex::new(LruCache::new(
                ARTICLE_CACHE_CAPACITY,
            ))),
        };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
                || error_string.contains("sqlite_busy")
                || error_string.contains("sqlite_locked")
            {
                StoreError::Locked
            } else {
                StoreError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All schema changes are wrapped in a single transaction so a failure
    /// (disk full, power loss) rolls back to the previous consistent state.
    /// Every statement uses `IF NOT EXISTS`, so re-running is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Per-connection settings, outside the transaction
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&self.pool)
            .await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                article_id TEXT PRIMARY KEY,
                feed_id TEXT NOT NULL,
                title TEXT,
                content_html TEXT,
                content_text TEXT,
                summary TEXT,
                date_published INTEGER,
                date_modified INTEGER,
                date_arrived INTEGER NOT NULL,
                search_row_id INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS statuses (
                article_id TEXT PRIMARY KEY,
                read INTEGER NOT NULL DEFAULT 0,
                starred INTEGER NOT NULL DEFAULT 0,
                date_arrived INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS authors (
                author_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT,
                email TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS authors_lookup (
                article_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                PRIMARY KEY (article_id, author_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_changes (
                article_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                flag INTEGER NOT NULL,
                selected INTEGER NOT NULL DEFAULT 0,
                UNIQUE (article_id, kind)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Key-value store for sync bookkeeping: change token, last refresh.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Full-text index. Standalone FTS5 table: articles.search_row_id
        // joins to its rowid, NULL means "not indexed yet".
        sqlx::query("CREATE VIRTUAL TABLE IF NOT EXISTS search USING fts5(title, body)")
            .execute(&mut *tx)
            .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_feed ON articles(feed_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_arrived ON articles(date_arrived DESC)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_unindexed ON articles(article_id) WHERE search_row_id IS NULL",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_statuses_read ON statuses(read)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_statuses_starred ON statuses(starred)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_pending_selected ON pending_changes(selected)")
            .execute(&mut *tx)
            .await?;

        // Database-side cascade: deleting an article row removes its search
        // entry and author relations in the same statement's scope.
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS articles_search_delete
            AFTER DELETE ON articles
            WHEN old.search_row_id IS NOT NULL
            BEGIN
                DELETE FROM search WHERE rowid = old.search_row_id;
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS articles_authors_delete
            AFTER DELETE ON articles
            BEGIN
                DELETE FROM authors_lookup WHERE article_id = old.article_id;
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    // ========================================================================
    // Cache
    // ========================================================================

    pub(crate) fn cache_put(&self, article: Article) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(article.article_id.clone(), article);
        }
    }

    pub(crate) fn cache_get(&self, article_id: &str) -> Option<Article> {
        self.cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(article_id).cloned())
    }

    pub(crate) fn cache_remove(&self, article_id: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.pop(article_id);
        }
    }

    pub(crate) fn cache_clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    // ========================================================================
    // Sync State
    // ========================================================================

    /// Read a sync bookkeeping value (change token, last refresh timestamp).
    pub async fn get_sync_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM sync_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    /// Write a sync bookkeeping value.
    pub async fn set_sync_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a sync bookkeeping value (e.g. when the remote resets its zone).
    pub async fn clear_sync_state(&self, key: &str) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        sqlx::query("DELETE FROM sync_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Database;

    #[tokio::test]
    async fn test_open_in_memory() {
        let db = Database::open(":memory:").await.unwrap();
        // Re-running migrations is a no-op
        db.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_state_roundtrip() {
        let db = Database::open(":memory:").await.unwrap();

        assert_eq!(db.get_sync_state("change_token").await.unwrap(), None);

        db.set_sync_state("change_token", "tok-1").await.unwrap();
        assert_eq!(
            db.get_sync_state("change_token").await.unwrap().as_deref(),
            Some("tok-1")
        );

        db.set_sync_state("change_token", "tok-2").await.unwrap();
        assert_eq!(
            db.get_sync_state("change_token").await.unwrap().as_deref(),
            Some("tok-2")
        );

        db.clear_sync_state("change_token").await.unwrap();
        assert_eq!(db.get_sync_state("change_token").await.unwrap(), None);
    }
}
