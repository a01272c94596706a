use sqlx::QueryBuilder;

use super::db::Database;
use super::types::{Article, ArticleId, ArticleSelector, FeedId, StoreError};

// ============================================================================
// FTS5 Query Validation
// ============================================================================

const MAX_QUERY_LENGTH: usize = 256;
const MAX_OR_OPERATORS: usize = 5;
const MAX_PARENTHESES: usize = 5;
const MAX_AND_OPERATORS: usize = 10;

/// Prefix expansion appends a `*` to every term, so the wildcard cap applies
/// to the expression actually handed to FTS5, not the raw query. Sized so a
/// query at the AND cap (11 terms) still fits with user-supplied wildcards.
const MAX_EXPRESSION_WILDCARDS: usize = 15;

/// Articles indexed per batch while sweeping the backlog.
const INDEX_BATCH_SIZE: i64 = 500;

/// Validate FTS5 query complexity to prevent DoS via expensive wildcard
/// expansions and pathological operator nesting.
pub(crate) fn validate_search_query(query: &str) -> Result<(), StoreError> {
    if query.len() > MAX_QUERY_LENGTH {
        return Err(StoreError::InvalidQuery(format!(
            "query exceeds maximum length of {} characters",
            MAX_QUERY_LENGTH
        )));
    }

    let wildcard_count = build_match_expression(query).matches('*').count();
    if wildcard_count > MAX_EXPRESSION_WILDCARDS {
        return Err(StoreError::InvalidQuery(format!(
            "too many wildcard terms after prefix expansion (max {})",
            MAX_EXPRESSION_WILDCARDS
        )));
    }

    let upper = query.to_uppercase();
    if upper.matches(" OR ").count() > MAX_OR_OPERATORS {
        return Err(StoreError::InvalidQuery(format!(
            "too many OR operators (max {})",
            MAX_OR_OPERATORS
        )));
    }
    if upper.matches(" AND ").count() > MAX_AND_OPERATORS {
        return Err(StoreError::InvalidQuery(format!(
            "too many AND operators (max {})",
            MAX_AND_OPERATORS
        )));
    }

    let open_parens = query.chars().filter(|&c| c == '(').count();
    let close_parens = query.chars().filter(|&c| c == ')').count();
    if open_parens > MAX_PARENTHESES {
        return Err(StoreError::InvalidQuery(format!(
            "too many parentheses (max {})",
            MAX_PARENTHESES
        )));
    }
    if open_parens != close_parens {
        return Err(StoreError::InvalidQuery(
            "unbalanced parentheses".to_string(),
        ));
    }

    Ok(())
}

/// Turn a user query into an FTS5 MATCH expression with prefix semantics:
/// every term gets a trailing `*` so partial words match, while the literal
/// operators AND and OR pass through untouched.
pub(crate) fn build_match_expression(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| {
            if matches!(token, "AND" | "OR") || token.ends_with('*') {
                token.to_string()
            } else {
                format!("{}*", token)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl Database {
    // ========================================================================
    // Search Operations
    // ========================================================================

    /// Full-text search over title and body, newest first. Empty and
    /// whitespace-only queries return no results; over-complex queries are
    /// rejected with `StoreError::InvalidQuery`.
    pub async fn search_articles(
        &self,
        query: &str,
        feed_ids: &[FeedId],
        limit: Option<i64>,
    ) -> Result<Vec<Article>, StoreError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_articles(
            ArticleSelector::Search {
                query: query.to_string(),
                feed_ids: feed_ids.to_vec(),
            },
            limit,
        )
        .await
    }

    // ========================================================================
    // Incremental Indexing
    // ========================================================================

    /// Index or reindex specific articles, e.g. after restoring content for
    /// a starred item. Missing ids are skipped.
    pub async fn ensure_search_indexed(&self, ids: &[ArticleId]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let _writer = self.writer.lock().await;
        self.index_articles_locked(ids).await
    }

    /// Index one batch of articles never indexed before. Returns how many
    /// were indexed; a short count means the backlog is drained.
    pub async fn index_unindexed_batch(&self) -> Result<usize, StoreError> {
        let _writer = self.writer.lock().await;

        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT article_id FROM articles WHERE search_row_id IS NULL LIMIT ?",
        )
        .bind(INDEX_BATCH_SIZE)
        .fetch_all(&self.pool)
        .await?;
        let ids: Vec<ArticleId> = ids.into_iter().map(|(id,)| id).collect();

        if !ids.is_empty() {
            self.index_articles_locked(&ids).await?;
        }
        Ok(ids.len())
    }

    /// Drain the indexing backlog in the background, one batch per step with
    /// a yield between batches so foreground work is never starved. Errors
    /// are logged and end the sweep; the next sweep picks the backlog up.
    pub fn spawn_index_sweep(&self) -> tokio::task::JoinHandle<usize> {
        let db = self.clone();
        tokio::spawn(async move {
            let mut total = 0;
            loop {
                match db.index_unindexed_batch().await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        tokio::task::yield_now().await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "index sweep aborted");
                        break;
                    }
                }
            }
            if total > 0 {
                tracing::debug!(indexed = total, "index sweep complete");
            }
            total
        })
    }

    /// Write search rows for the given articles. The caller must hold the
    /// writer permit: this runs its own transaction and relies on
    /// `last_insert_rowid()` being stable within it.
    pub(crate) async fn index_articles_locked(
        &self,
        ids: &[ArticleId],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT article_id, title, content_text, summary, search_row_id \
             FROM articles WHERE article_id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");

        let rows: Vec<(String, Option<String>, Option<String>, Option<String>, Option<i64>)> =
            builder.build_query_as().fetch_all(&mut *tx).await?;

        for (article_id, title, content_text, summary, search_row_id) in rows {
            let title = title.unwrap_or_default();
            let body = content_text.or(summary).unwrap_or_default();
            match search_row_id {
                Some(rowid) => {
                    sqlx::query("UPDATE search SET title = ?, body = ? WHERE rowid = ?")
                        .bind(&title)
                        .bind(&body)
                        .bind(rowid)
                        .execute(&mut *tx)
                        .await?;
                }
                None => {
                    sqlx::query("INSERT INTO search (title, body) VALUES (?, ?)")
                        .bind(&title)
                        .bind(&body)
                        .execute(&mut *tx)
                        .await?;
                    // RETURNING is unsupported on virtual tables; the rowid is
                    // read back inside the same transaction instead.
                    let (rowid,): (i64,) = sqlx::query_as("SELECT last_insert_rowid()")
                        .fetch_one(&mut *tx)
                        .await?;
                    sqlx::query("UPDATE articles SET search_row_id = ? WHERE article_id = ?")
                        .bind(rowid)
                        .bind(&article_id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Hand articles back to the background sweep after a failed index pass:
    /// drop their stale search rows and null the join column so
    /// [`index_unindexed_batch`] sees them again. Without this, an updated
    /// article (whose `search_row_id` is already set) would keep serving its
    /// old search content forever. The caller must hold the writer permit.
    ///
    /// [`index_unindexed_batch`]: Database::index_unindexed_batch
    pub(crate) async fn queue_for_reindex_locked(
        &self,
        ids: &[ArticleId],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "DELETE FROM search WHERE rowid IN (SELECT search_row_id FROM articles \
             WHERE search_row_id IS NOT NULL AND article_id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated("))");
        builder.build().execute(&mut *tx).await?;

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("UPDATE articles SET search_row_id = NULL WHERE article_id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");
        builder.build().execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }
}
