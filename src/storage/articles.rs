use std::collections::{HashMap, HashSet};

use sqlx::{QueryBuilder, SqliteConnection};

use super::db::Database;
use super::search::{build_match_expression, validate_search_query};
use super::statuses::{ensure_statuses_tx, enqueue_pending_tx, fetch_statuses_tx};
use super::types::{
    Article, ArticleChanges, ArticleDbRow, ArticleId, ArticleSelector, Author, FeedId, MarkOrigin,
    ParsedItem, PendingKind, StoreError,
};
use crate::merge;

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of articles to return from any single query (OOM protection)
const MAX_ARTICLES: i64 = 2000;

/// Batch size for multi-row inserts, well under SQLite's parameter limit
const BATCH_SIZE: usize = 50;

/// Feed-scoped updates delete absent articles only past this arrival age
const ABSENT_DELETE_CUTOFF_DAYS: i64 = 30;

/// Account-wide updates drop read, unstarred incoming items older than this,
/// so long-aged content is never resurrected by a sync pull
pub(crate) const RECENCY_CUTOFF_DAYS: i64 = 90;

const DAY_SECONDS: i64 = 86_400;

impl Database {
    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Fetch articles matching a selector, newest first by
    /// `coalesce(date_published, date_modified, date_arrived)`.
    ///
    /// Id-selector fetches consult the cache first and query only the misses.
    /// Reads never write the cache: it is populated and invalidated only on
    /// the serialized writer path, so a concurrent reader cannot clobber a
    /// freshly committed value with a pre-commit snapshot. Rows whose status
    /// is missing (internal invariant violation) are skipped with a warning
    /// rather than failing the whole fetch.
    pub async fn fetch_articles(
        &self,
        selector: ArticleSelector,
        limit: Option<i64>,
    ) -> Result<Vec<Article>, StoreError> {
        let limit = limit.unwrap_or(MAX_ARTICLES).min(MAX_ARTICLES);
        tracing::debug!(limit = limit, selector = ?selector, "fetch_articles with limit cap");

        if let ArticleSelector::Articles(ids) = &selector {
            return self.fetch_by_ids(ids, limit).await;
        }

        let mut conn = self.pool.acquire().await?;
        let mut builder = select_articles_builder(&selector)?;
        push_order_and_limit(&mut builder, limit);

        let rows: Vec<ArticleDbRow> = builder.build_query_as().fetch_all(&mut *conn).await?;
        attach_authors(&mut conn, rows).await
    }

    /// Id-selector fast path: cache hits first, database for the misses.
    async fn fetch_by_ids(
        &self,
        ids: &[ArticleId],
        limit: i64,
    ) -> Result<Vec<Article>, StoreError> {
        let mut articles = Vec::with_capacity(ids.len());
        let mut misses = Vec::new();
        for id in ids {
            match self.cache_get(id) {
                Some(article) => articles.push(article),
                None => misses.push(id.clone()),
            }
        }

        if !misses.is_empty() {
            let mut conn = self.pool.acquire().await?;
            let mut builder = select_articles_builder(&ArticleSelector::Articles(misses))?;
            push_order_and_limit(&mut builder, limit);
            let rows: Vec<ArticleDbRow> = builder.build_query_as().fetch_all(&mut *conn).await?;
            articles.extend(attach_authors(&mut conn, rows).await?);
        }

        articles.sort_by_key(|a| std::cmp::Reverse(a.sort_date()));
        articles.truncate(limit.max(0) as usize);
        Ok(articles)
    }

    // ========================================================================
    // Article Updates
    // ========================================================================

    /// Feed-scoped merge of parsed items against the stored feed snapshot.
    ///
    /// Ensures a status for every incoming id, partitions the incoming set
    /// into new/updated by deep equality, optionally deletes stored articles
    /// that are absent from the incoming set (and read, unstarred, arrived
    /// more than 30 days ago), and commits all three sets in one transaction.
    /// Updated articles persist only their changed columns; authors are saved
    /// as a relation delta. New articles enqueue a pending `new` change for
    /// the sync queue. New and updated rows are search-indexed after commit.
    ///
    /// An empty incoming set is a no-op returning empty changes.
    pub async fn update_feed_articles(
        &self,
        feed_id: &FeedId,
        items: &[ParsedItem],
        delete_older_if_absent: bool,
    ) -> Result<ArticleChanges, StoreError> {
        if items.is_empty() {
            return Ok(ArticleChanges::default());
        }

        let _writer = self.writer.lock().await;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let incoming = build_incoming_tx(&mut tx, feed_id, items, now, false).await?;
        let stored = fetch_feed_articles_tx(&mut tx, feed_id).await?;

        let (new, updated) = merge::partition(&incoming, &stored);
        let deleted = if delete_older_if_absent {
            let incoming_ids: HashSet<ArticleId> =
                incoming.iter().map(|a| a.article_id.clone()).collect();
            let cutoff = now - ABSENT_DELETE_CUTOFF_DAYS * DAY_SECONDS;
            merge::deletable(&stored, &incoming_ids, cutoff)
        } else {
            Vec::new()
        };

        commit_article_sets_tx(&mut tx, &stored, &new, &updated, &deleted).await?;
        if !new.is_empty() {
            let new_ids: Vec<ArticleId> = new.iter().map(|a| a.article_id.clone()).collect();
            enqueue_pending_tx(&mut tx, &new_ids, PendingKind::New, true).await?;
        }
        tx.commit().await?;

        let changes = ArticleChanges {
            new,
            updated,
            deleted,
        };
        self.finish_update(&changes).await;
        Ok(changes)
    }

    /// Account-wide merge used when applying a remote sync delta.
    ///
    /// Same pipeline as the feed-scoped mode except it never deletes on
    /// absence (retention handles aging separately), never enqueues pending
    /// changes (the mutations originate remotely), and first drops ignorable
    /// incoming items: read, unstarred, and older than the 90-day recency
    /// cutoff. With `mark_read_on_ingest`, statuses created for previously
    /// unseen ids start out read.
    pub async fn update_account_articles(
        &self,
        feed_items: &[(FeedId, Vec<ParsedItem>)],
        mark_read_on_ingest: bool,
    ) -> Result<ArticleChanges, StoreError> {
        if feed_items.iter().all(|(_, items)| items.is_empty()) {
            return Ok(ArticleChanges::default());
        }

        let _writer = self.writer.lock().await;
        let now = chrono::Utc::now().timestamp();
        let recency_cutoff = now - RECENCY_CUTOFF_DAYS * DAY_SECONDS;
        let mut tx = self.pool.begin().await?;

        let mut all_new = Vec::new();
        let mut all_updated = Vec::new();
        for (feed_id, items) in feed_items {
            if items.is_empty() {
                continue;
            }
            let incoming =
                build_incoming_tx(&mut tx, feed_id, items, now, mark_read_on_ingest).await?;
            // Drop long-aged, already-read, unstarred items before diffing so
            // a sync pull cannot resurrect content retention already aged out.
            let incoming: Vec<Article> = incoming
                .into_iter()
                .filter(|a| !(a.status.read && !a.status.starred && a.sort_date() < recency_cutoff))
                .collect();
            if incoming.is_empty() {
                continue;
            }

            let stored = fetch_feed_articles_tx(&mut tx, feed_id).await?;
            let (new, updated) = merge::partition(&incoming, &stored);
            commit_article_sets_tx(&mut tx, &stored, &new, &updated, &[]).await?;
            all_new.extend(new);
            all_updated.extend(updated);
        }
        tx.commit().await?;

        let changes = ArticleChanges {
            new: all_new,
            updated: all_updated,
            deleted: Vec::new(),
        };
        self.finish_update(&changes).await;
        Ok(changes)
    }

    /// Cache and search-index maintenance after a committed update. Indexing
    /// failures degrade gracefully: the background sweep retries them.
    async fn finish_update(&self, changes: &ArticleChanges) {
        for article in changes.new.iter().chain(&changes.updated) {
            self.cache_put(article.clone());
        }
        for article in &changes.deleted {
            self.cache_remove(&article.article_id);
        }

        let mut index_ids = changes.new_article_ids();
        index_ids.extend(changes.updated_article_ids());
        if !index_ids.is_empty() {
            if let Err(e) = self.index_articles_locked(&index_ids).await {
                tracing::warn!(error = %e, "search indexing after update failed; queueing for sweep");
                // Updated rows still carry a search_row_id, which the sweep
                // skips; null it so the sweep genuinely retries them.
                if let Err(e) = self.queue_for_reindex_locked(&index_ids).await {
                    tracing::warn!(error = %e, "could not queue articles for reindex");
                }
            }
        }
    }

    // ========================================================================
    // Article Deletion
    // ========================================================================

    /// Unconditionally remove article rows. Search entries and author
    /// relations go with them via the database-side cascade; status rows are
    /// deliberately untouched (retention deletes those under stricter rules).
    ///
    /// Locally-originated deletions enqueue a `deleted` pending change in the
    /// same transaction so the remote learns about them; remote-applied
    /// deletions must not echo back.
    pub async fn delete_articles(
        &self,
        ids: &[ArticleId],
        origin: MarkOrigin,
    ) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        delete_article_rows_tx(&mut tx, ids).await?;
        if origin == MarkOrigin::Local {
            enqueue_pending_tx(&mut tx, ids, PendingKind::Deleted, true).await?;
        }
        tx.commit().await?;
        for id in ids {
            self.cache_remove(id);
        }
        Ok(())
    }
}

// ============================================================================
// Query Construction
// ============================================================================

fn select_articles_builder(
    selector: &ArticleSelector,
) -> Result<QueryBuilder<'static, sqlx::Sqlite>, StoreError> {
    let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
        "SELECT a.article_id, a.feed_id, a.title, a.content_html, a.content_text, a.summary, \
         a.date_published, a.date_modified, a.date_arrived, \
         s.read AS read, s.starred AS starred, s.date_arrived AS status_date_arrived \
         FROM articles a \
         LEFT JOIN statuses s ON s.article_id = a.article_id",
    );

    match selector {
        ArticleSelector::Feeds(feed_ids) => {
            push_feed_scope(&mut builder, " WHERE ", feed_ids);
        }
        ArticleSelector::Articles(ids) => {
            builder.push(" WHERE a.article_id IN (");
            let mut separated = builder.separated(", ");
            for id in ids {
                separated.push_bind(id.clone());
            }
            separated.push_unseparated(")");
        }
        ArticleSelector::Range {
            feed_ids,
            after,
            before,
        } => {
            builder.push(" WHERE 1 = 1");
            if let Some(after) = after {
                builder.push(
                    " AND coalesce(a.date_published, a.date_modified, a.date_arrived) >= ",
                );
                builder.push_bind(*after);
            }
            if let Some(before) = before {
                builder
                    .push(" AND coalesce(a.date_published, a.date_modified, a.date_arrived) < ");
                builder.push_bind(*before);
            }
            push_feed_scope(&mut builder, " AND ", feed_ids);
        }
        ArticleSelector::Unread(feed_ids) => {
            builder.push(" WHERE s.read = 0");
            push_feed_scope(&mut builder, " AND ", feed_ids);
        }
        ArticleSelector::Starred(feed_ids) => {
            builder.push(" WHERE s.starred = 1");
            push_feed_scope(&mut builder, " AND ", feed_ids);
        }
        ArticleSelector::Search { query, feed_ids } => {
            validate_search_query(query)?;
            let expression = build_match_expression(query);
            builder.push(" JOIN search ON search.rowid = a.search_row_id WHERE search MATCH ");
            builder.push_bind(expression);
            push_feed_scope(&mut builder, " AND ", feed_ids);
        }
    }

    Ok(builder)
}

fn push_feed_scope(
    builder: &mut QueryBuilder<'static, sqlx::Sqlite>,
    prefix: &str,
    feed_ids: &[FeedId],
) {
    if feed_ids.is_empty() {
        return;
    }
    builder.push(prefix);
    builder.push("a.feed_id IN (");
    let mut separated = builder.separated(", ");
    for id in feed_ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
}

fn push_order_and_limit(builder: &mut QueryBuilder<'static, sqlx::Sqlite>, limit: i64) {
    builder
        .push(" ORDER BY coalesce(a.date_published, a.date_modified, a.date_arrived) DESC LIMIT ");
    builder.push_bind(limit);
}

// ============================================================================
// Transaction-Scoped Helpers
// ============================================================================

/// Ensure statuses for incoming items and pair each item with its status.
/// Items whose status cannot be found after ensuring are malformed; they are
/// skipped with a warning rather than aborting the update.
async fn build_incoming_tx(
    conn: &mut SqliteConnection,
    feed_id: &FeedId,
    items: &[ParsedItem],
    now: i64,
    read_on_create: bool,
) -> Result<Vec<Article>, StoreError> {
    let ids: Vec<ArticleId> = items
        .iter()
        .map(|item| super::types::derive_article_id(feed_id, &item.guid))
        .collect();
    ensure_statuses_tx(conn, &ids, now, read_on_create).await?;
    let statuses = fetch_statuses_tx(conn, &ids).await?;

    let mut incoming = Vec::with_capacity(items.len());
    for (item, id) in items.iter().zip(&ids) {
        match statuses.get(id) {
            Some(status) => incoming.push(Article::from_parsed(feed_id, item, status.clone())),
            None => {
                tracing::warn!(article_id = %id, "status missing after ensure; skipping item");
            }
        }
    }
    Ok(incoming)
}

/// Current stored snapshot for one feed, authors included, keyed by id.
async fn fetch_feed_articles_tx(
    conn: &mut SqliteConnection,
    feed_id: &FeedId,
) -> Result<HashMap<ArticleId, Article>, StoreError> {
    let rows: Vec<ArticleDbRow> = sqlx::query_as(
        "SELECT a.article_id, a.feed_id, a.title, a.content_html, a.content_text, a.summary, \
         a.date_published, a.date_modified, a.date_arrived, \
         s.read AS read, s.starred AS starred, s.date_arrived AS status_date_arrived \
         FROM articles a \
         LEFT JOIN statuses s ON s.article_id = a.article_id \
         WHERE a.feed_id = ?",
    )
    .bind(feed_id)
    .fetch_all(&mut *conn)
    .await?;

    let articles = attach_authors(conn, rows).await?;
    Ok(articles
        .into_iter()
        .map(|a| (a.article_id.clone(), a))
        .collect())
}

/// Join the authors relation onto fetched rows, skipping malformed rows.
async fn attach_authors(
    conn: &mut SqliteConnection,
    rows: Vec<ArticleDbRow>,
) -> Result<Vec<Article>, StoreError> {
    let ids: Vec<ArticleId> = rows.iter().map(|r| r.article_id.clone()).collect();
    let mut authors_by_article: HashMap<ArticleId, Vec<Author>> = HashMap::new();

    for chunk in ids.chunks(BATCH_SIZE * 10) {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "SELECT l.article_id, au.author_id, au.name, au.url, au.email \
             FROM authors_lookup l \
             JOIN authors au ON au.author_id = l.author_id \
             WHERE l.article_id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in chunk {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");

        let author_rows: Vec<(String, String, String, Option<String>, Option<String>)> =
            builder.build_query_as().fetch_all(&mut *conn).await?;
        for (article_id, author_id, name, url, email) in author_rows {
            authors_by_article.entry(article_id).or_default().push(Author {
                author_id,
                name,
                url,
                email,
            });
        }
    }

    let mut articles = Vec::with_capacity(rows.len());
    for row in rows {
        let article_id = row.article_id.clone();
        let authors = authors_by_article.remove(&article_id).unwrap_or_default();
        match row.into_article(authors) {
            Some(article) => articles.push(article),
            None => {
                tracing::warn!(article_id = %article_id, "article row has no status; skipping");
            }
        }
    }
    Ok(articles)
}

/// Persist the three merge sets: insert new rows, apply field-level diffs to
/// updated rows, delete the aged-out rows.
async fn commit_article_sets_tx(
    conn: &mut SqliteConnection,
    stored: &HashMap<ArticleId, Article>,
    new: &[Article],
    updated: &[Article],
    deleted: &[Article],
) -> Result<(), StoreError> {
    insert_articles_tx(conn, new).await?;

    for incoming in updated {
        // Partition guarantees a stored counterpart for every updated id.
        let Some(existing) = stored.get(&incoming.article_id) else {
            tracing::warn!(article_id = %incoming.article_id, "updated article missing from snapshot; skipping");
            continue;
        };
        let changes = merge::diff_fields(existing, incoming);
        if !changes.is_empty() {
            apply_field_changes_tx(conn, &incoming.article_id, &changes).await?;
        }
        if merge::authors_changed(existing, incoming) {
            replace_authors_tx(conn, &incoming.article_id, &incoming.authors).await?;
        }
    }

    if !deleted.is_empty() {
        let ids: Vec<ArticleId> = deleted.iter().map(|a| a.article_id.clone()).collect();
        delete_article_rows_tx(conn, &ids).await?;
    }
    Ok(())
}

async fn insert_articles_tx(
    conn: &mut SqliteConnection,
    articles: &[Article],
) -> Result<(), StoreError> {
    for chunk in articles.chunks(BATCH_SIZE) {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT INTO articles (article_id, feed_id, title, content_html, content_text, \
             summary, date_published, date_modified, date_arrived) ",
        );
        builder.push_values(chunk, |mut b, article| {
            b.push_bind(article.article_id.clone())
                .push_bind(article.feed_id.clone())
                .push_bind(article.title.clone())
                .push_bind(article.content_html.clone())
                .push_bind(article.content_text.clone())
                .push_bind(article.summary.clone())
                .push_bind(article.date_published)
                .push_bind(article.date_modified)
                .push_bind(article.date_arrived);
        });
        builder.push(" ON CONFLICT(article_id) DO NOTHING");
        builder.build().execute(&mut *conn).await?;
    }

    for article in articles {
        if !article.authors.is_empty() {
            save_authors_tx(conn, &article.article_id, &article.authors).await?;
        }
    }
    Ok(())
}

/// Write exactly the changed columns for one article. The change set comes
/// from the merge engine, so an update never rewrites untouched fields.
async fn apply_field_changes_tx(
    conn: &mut SqliteConnection,
    article_id: &ArticleId,
    changes: &[merge::FieldChange],
) -> Result<(), StoreError> {
    let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("UPDATE articles SET ");
    for (i, change) in changes.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push(change.column());
        builder.push(" = ");
        match change {
            merge::FieldChange::Title(v)
            | merge::FieldChange::ContentHtml(v)
            | merge::FieldChange::ContentText(v)
            | merge::FieldChange::Summary(v) => {
                builder.push_bind(v.clone());
            }
            merge::FieldChange::DatePublished(v) | merge::FieldChange::DateModified(v) => {
                builder.push_bind(*v);
            }
        }
    }
    builder.push(" WHERE article_id = ");
    builder.push_bind(article_id.clone());
    builder.build().execute(&mut *conn).await?;
    Ok(())
}

async fn save_authors_tx(
    conn: &mut SqliteConnection,
    article_id: &ArticleId,
    authors: &[Author],
) -> Result<(), StoreError> {
    let mut builder: QueryBuilder<sqlx::Sqlite> =
        QueryBuilder::new("INSERT OR IGNORE INTO authors (author_id, name, url, email) ");
    builder.push_values(authors, |mut b, author| {
        b.push_bind(author.author_id.clone())
            .push_bind(author.name.clone())
            .push_bind(author.url.clone())
            .push_bind(author.email.clone());
    });
    builder.build().execute(&mut *conn).await?;

    let mut builder: QueryBuilder<sqlx::Sqlite> =
        QueryBuilder::new("INSERT OR IGNORE INTO authors_lookup (article_id, author_id) ");
    builder.push_values(authors, |mut b, author| {
        b.push_bind(article_id.clone())
            .push_bind(author.author_id.clone());
    });
    builder.build().execute(&mut *conn).await?;
    Ok(())
}

/// Replace an article's author relation with the incoming set. Stale author
/// rows shared with no other article are left behind; they are tiny and
/// harmless.
async fn replace_authors_tx(
    conn: &mut SqliteConnection,
    article_id: &ArticleId,
    authors: &[Author],
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM authors_lookup WHERE article_id = ?")
        .bind(article_id)
        .execute(&mut *conn)
        .await?;
    if !authors.is_empty() {
        save_authors_tx(conn, article_id, authors).await?;
    }
    Ok(())
}

pub(crate) async fn delete_article_rows_tx(
    conn: &mut SqliteConnection,
    ids: &[ArticleId],
) -> Result<(), StoreError> {
    for chunk in ids.chunks(BATCH_SIZE * 10) {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("DELETE FROM articles WHERE article_id IN (");
        let mut separated = builder.separated(", ");
        for id in chunk {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::storage::{
        derive_article_id, ArticleSelector, Author, Database, MarkOrigin, ParsedItem, PendingKind,
        StatusKind,
    };
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn item(guid: &str, title: &str) -> ParsedItem {
        ParsedItem {
            guid: guid.to_string(),
            title: Some(title.to_string()),
            summary: Some("Test summary".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_update_empty_store_all_new() {
        let db = test_db().await;
        let feed = "feed-1".to_string();

        let changes = db
            .update_feed_articles(&feed, &[item("1", "A"), item("2", "B")], true)
            .await
            .unwrap();

        assert_eq!(changes.new.len(), 2);
        assert!(changes.updated.is_empty());
        assert!(changes.deleted.is_empty());
        assert!(changes.new.iter().all(|a| !a.status.read));
    }

    #[tokio::test]
    async fn test_update_empty_input_is_noop() {
        let db = test_db().await;
        let feed = "feed-1".to_string();
        let changes = db.update_feed_articles(&feed, &[], true).await.unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_update_twice_is_idempotent() {
        let db = test_db().await;
        let feed = "feed-1".to_string();
        let items = [item("1", "A"), item("2", "B")];

        let first = db.update_feed_articles(&feed, &items, true).await.unwrap();
        assert_eq!(first.new.len(), 2);

        let second = db.update_feed_articles(&feed, &items, true).await.unwrap();
        assert!(second.is_empty(), "no external change, no diff");
    }

    #[tokio::test]
    async fn test_update_title_change_yields_updated() {
        let db = test_db().await;
        let feed = "feed-1".to_string();

        db.update_feed_articles(&feed, &[item("1", "old")], true)
            .await
            .unwrap();
        let changes = db
            .update_feed_articles(&feed, &[item("1", "new")], true)
            .await
            .unwrap();

        assert!(changes.new.is_empty());
        assert_eq!(changes.updated.len(), 1);
        assert_eq!(changes.updated[0].title.as_deref(), Some("new"));

        // Untouched fields survive the field-level update
        let stored = db
            .fetch_articles(ArticleSelector::Feeds(vec![feed.clone()]), None)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title.as_deref(), Some("new"));
        assert_eq!(stored[0].summary.as_deref(), Some("Test summary"));
    }

    #[tokio::test]
    async fn test_update_preserves_read_state() {
        let db = test_db().await;
        let feed = "feed-1".to_string();
        let id = derive_article_id(&feed, "1");

        db.update_feed_articles(&feed, &[item("1", "old")], true)
            .await
            .unwrap();
        db.mark_statuses(&[id.clone()], StatusKind::Read, true, MarkOrigin::Local)
            .await
            .unwrap();

        db.update_feed_articles(&feed, &[item("1", "new")], true)
            .await
            .unwrap();

        let stored = db
            .fetch_articles(ArticleSelector::Articles(vec![id]), None)
            .await
            .unwrap();
        assert!(stored[0].status.read, "read state must survive updates");
    }

    #[tokio::test]
    async fn test_author_only_change_is_an_update() {
        let db = test_db().await;
        let feed = "feed-1".to_string();

        db.update_feed_articles(&feed, &[item("1", "same")], true)
            .await
            .unwrap();

        let mut with_author = item("1", "same");
        with_author.authors = vec![Author::new("Jo", None, None)];
        let changes = db
            .update_feed_articles(&feed, &[with_author], true)
            .await
            .unwrap();
        assert_eq!(changes.updated.len(), 1);

        let stored = db
            .fetch_articles(ArticleSelector::Feeds(vec![feed]), None)
            .await
            .unwrap();
        assert_eq!(stored[0].authors.len(), 1);
        assert_eq!(stored[0].authors[0].name, "Jo");
    }

    #[tokio::test]
    async fn test_delete_articles_keeps_statuses() {
        let db = test_db().await;
        let feed = "feed-1".to_string();
        let id = derive_article_id(&feed, "1");

        db.update_feed_articles(&feed, &[item("1", "A")], true)
            .await
            .unwrap();
        db.delete_articles(&[id.clone()], MarkOrigin::Local)
            .await
            .unwrap();

        let stored = db
            .fetch_articles(ArticleSelector::Feeds(vec![feed]), None)
            .await
            .unwrap();
        assert!(stored.is_empty());

        let statuses = db.fetch_statuses(&[id]).await.unwrap();
        assert_eq!(statuses.len(), 1, "status outlives content");
    }

    #[tokio::test]
    async fn test_local_delete_enqueues_deleted_change() {
        let db = test_db().await;
        let feed = "feed-1".to_string();
        let id = derive_article_id(&feed, "1");

        db.update_feed_articles(&feed, &[item("1", "A")], true)
            .await
            .unwrap();
        db.clear_pending_changes().await.unwrap();

        db.delete_articles(&[id.clone()], MarkOrigin::Local)
            .await
            .unwrap();
        let pending = db.pending_changes().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].article_id, id);
        assert_eq!(pending[0].kind, PendingKind::Deleted);
        assert!(pending[0].flag);

        // A deletion applied from a remote delta must not echo back
        db.update_feed_articles(&feed, &[item("1", "A")], true)
            .await
            .unwrap();
        db.clear_pending_changes().await.unwrap();
        db.delete_articles(&[id], MarkOrigin::Remote).await.unwrap();
        assert_eq!(db.pending_change_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_unread_and_starred_selectors() {
        let db = test_db().await;
        let feed = "feed-1".to_string();
        let id1 = derive_article_id(&feed, "1");
        let id2 = derive_article_id(&feed, "2");

        db.update_feed_articles(&feed, &[item("1", "A"), item("2", "B")], true)
            .await
            .unwrap();
        db.mark_statuses(&[id1.clone()], StatusKind::Read, true, MarkOrigin::Local)
            .await
            .unwrap();
        db.mark_statuses(&[id2.clone()], StatusKind::Starred, true, MarkOrigin::Local)
            .await
            .unwrap();

        let unread = db
            .fetch_articles(ArticleSelector::Unread(vec![feed.clone()]), None)
            .await
            .unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].article_id, id2);

        let starred = db
            .fetch_articles(ArticleSelector::Starred(vec![]), None)
            .await
            .unwrap();
        assert_eq!(starred.len(), 1);
        assert_eq!(starred[0].article_id, id2);
    }

    #[tokio::test]
    async fn test_fetch_range_bounds() {
        let db = test_db().await;
        let feed = "feed-1".to_string();

        let mut old = item("old", "Old");
        old.date_published = Some(1_000);
        let mut new = item("new", "New");
        new.date_published = Some(2_000);
        db.update_feed_articles(&feed, &[old, new], true)
            .await
            .unwrap();

        let in_range = db
            .fetch_articles(
                ArticleSelector::Range {
                    feed_ids: vec![feed.clone()],
                    after: Some(1_500),
                    before: None,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(in_range.len(), 1);
        assert_eq!(in_range[0].title.as_deref(), Some("New"));

        let before = db
            .fetch_articles(
                ArticleSelector::Range {
                    feed_ids: vec![feed],
                    after: None,
                    before: Some(1_500),
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].title.as_deref(), Some("Old"));
    }

    #[tokio::test]
    async fn test_fetch_limit_and_ordering() {
        let db = test_db().await;
        let feed = "feed-1".to_string();

        let items: Vec<ParsedItem> = (0..10)
            .map(|i| {
                let mut it = item(&format!("g{}", i), &format!("Article {}", i));
                it.date_published = Some(1_000 + i);
                it
            })
            .collect();
        db.update_feed_articles(&feed, &items, true).await.unwrap();

        let top = db
            .fetch_articles(ArticleSelector::Feeds(vec![feed]), Some(3))
            .await
            .unwrap();
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].title.as_deref(), Some("Article 9"));
        assert_eq!(top[2].title.as_deref(), Some("Article 7"));
    }

    #[tokio::test]
    async fn test_cache_reflects_committed_state() {
        let db = test_db().await;
        let feed = "feed-1".to_string();
        let id = derive_article_id(&feed, "1");

        db.update_feed_articles(&feed, &[item("1", "v1")], true)
            .await
            .unwrap();
        assert_eq!(
            db.cache_get(&id).unwrap().title.as_deref(),
            Some("v1"),
            "update populates the cache"
        );

        db.update_feed_articles(&feed, &[item("1", "v2")], true)
            .await
            .unwrap();
        assert_eq!(db.cache_get(&id).unwrap().title.as_deref(), Some("v2"));

        db.delete_articles(&[id.clone()], MarkOrigin::Local)
            .await
            .unwrap();
        assert!(db.cache_get(&id).is_none(), "delete invalidates the cache");
    }

    #[tokio::test]
    async fn test_fetch_never_populates_cache() {
        let db = test_db().await;
        let feed = "feed-1".to_string();
        let id = derive_article_id(&feed, "1");

        db.update_feed_articles(&feed, &[item("1", "A")], true)
            .await
            .unwrap();
        db.cache_clear();

        // A reader holds no writer permit, so a cached snapshot taken here
        // could race a concurrent commit. Both fetch paths must leave the
        // cache alone.
        let by_feed = db
            .fetch_articles(ArticleSelector::Feeds(vec![feed]), None)
            .await
            .unwrap();
        assert_eq!(by_feed.len(), 1);
        assert!(db.cache_get(&id).is_none());

        let by_id = db
            .fetch_articles(ArticleSelector::Articles(vec![id.clone()]), None)
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);
        assert!(db.cache_get(&id).is_none());
    }

    #[tokio::test]
    async fn test_account_update_never_deletes() {
        let db = test_db().await;
        let feed = "feed-1".to_string();

        db.update_feed_articles(&feed, &[item("1", "A"), item("2", "B")], true)
            .await
            .unwrap();

        // Account-wide update mentioning only one article leaves the other alone
        let changes = db
            .update_account_articles(&[(feed.clone(), vec![item("1", "A")])], false)
            .await
            .unwrap();
        assert!(changes.is_empty());

        let stored = db
            .fetch_articles(ArticleSelector::Feeds(vec![feed]), None)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_account_update_mark_read_on_ingest() {
        let db = test_db().await;
        let feed = "feed-1".to_string();

        let changes = db
            .update_account_articles(&[(feed.clone(), vec![item("1", "A")])], true)
            .await
            .unwrap();
        assert_eq!(changes.new.len(), 1);
        assert!(changes.new[0].status.read);
    }

    #[tokio::test]
    async fn test_account_update_drops_ignorable_items() {
        let db = test_db().await;
        let feed = "feed-1".to_string();
        let old_date = chrono::Utc::now().timestamp() - 200 * 86_400;

        // Already read (ingested read), unstarred, and far older than the
        // recency cutoff: the second pull must not resurrect it.
        let mut aged = item("aged", "Aged");
        aged.date_published = Some(old_date);
        db.update_account_articles(&[(feed.clone(), vec![aged.clone()])], true)
            .await
            .unwrap();
        db.delete_articles(&[derive_article_id(&feed, "aged")], MarkOrigin::Remote)
            .await
            .unwrap();

        let changes = db
            .update_account_articles(&[(feed.clone(), vec![aged])], true)
            .await
            .unwrap();
        assert!(changes.is_empty(), "aged read content must stay gone");

        let stored = db
            .fetch_articles(ArticleSelector::Feeds(vec![feed]), None)
            .await
            .unwrap();
        assert!(stored.is_empty());
    }
}
