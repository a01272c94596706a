use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Store-level errors surfaced verbatim to callers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another process has the database locked
    #[error("the article database is locked by another instance")]
    Locked,

    /// Migration failed
    #[error("database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Search query rejected before reaching the FTS engine
    #[error("invalid search query: {0}")]
    InvalidQuery(String),
}

impl StoreError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StoreError::Locked;
        }

        StoreError::Database(err)
    }
}

// ============================================================================
// Identifiers
// ============================================================================

pub type ArticleId = String;
pub type FeedId = String;
pub type AuthorId = String;

/// Derive a stable article ID from the feed and the item's guid.
///
/// The ID must survive refetches: the same feed/item pair always maps to the
/// same ID, so statuses keyed by it outlive any particular content row.
pub fn derive_article_id(feed_id: &str, guid: &str) -> ArticleId {
    let hash = Sha256::digest(format!("{}|{}", feed_id, guid).as_bytes());
    format!("{:x}", hash)[..32].to_string()
}

/// Derive a stable author ID from the author's identity fields.
pub fn derive_author_id(name: &str, url: Option<&str>, email: Option<&str>) -> AuthorId {
    let input = format!("{}|{}|{}", name, url.unwrap_or(""), email.unwrap_or(""));
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)[..32].to_string()
}

// ============================================================================
// Value Types
// ============================================================================

/// Read/starred state for an article, independent of content retention.
///
/// Every article row has exactly one status; a status may exist without a
/// corresponding article row (content purged, or not yet fetched).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleStatus {
    pub article_id: ArticleId,
    pub read: bool,
    pub starred: bool,
    pub date_arrived: i64,
}

/// An author, related many-to-many to articles through `authors_lookup`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Author {
    pub author_id: AuthorId,
    pub name: String,
    pub url: Option<String>,
    pub email: Option<String>,
}

impl Author {
    pub fn new(name: impl Into<String>, url: Option<String>, email: Option<String>) -> Self {
        let name = name.into();
        let author_id = derive_author_id(&name, url.as_deref(), email.as_deref());
        Author {
            author_id,
            name,
            url,
            email,
        }
    }
}

/// A single feed entry's content snapshot plus its status.
///
/// Identity is `article_id`; equality is deep value equality over every field
/// including the authors set, which is what drives the updated/unchanged
/// decision during a merge. Authors are kept sorted and deduped so `Vec`
/// equality behaves as set equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub article_id: ArticleId,
    pub feed_id: FeedId,
    pub title: Option<String>,
    pub content_html: Option<String>,
    pub content_text: Option<String>,
    pub summary: Option<String>,
    pub date_published: Option<i64>,
    pub date_modified: Option<i64>,
    pub date_arrived: i64,
    pub authors: Vec<Author>,
    pub status: ArticleStatus,
}

impl Article {
    /// Build an article from a parsed feed item and its (already ensured) status.
    pub fn from_parsed(feed_id: &str, item: &ParsedItem, status: ArticleStatus) -> Self {
        let mut authors = item.authors.clone();
        normalize_authors(&mut authors);
        Article {
            article_id: status.article_id.clone(),
            feed_id: feed_id.to_string(),
            title: item.title.clone(),
            content_html: item.content_html.clone(),
            content_text: item.content_text.clone(),
            summary: item.summary.clone(),
            date_published: item.date_published,
            date_modified: item.date_modified,
            date_arrived: status.date_arrived,
            authors,
            status,
        }
    }

    /// The date used for ordering and recency cutoffs:
    /// published, else modified, else arrival.
    pub fn sort_date(&self) -> i64 {
        self.date_published
            .or(self.date_modified)
            .unwrap_or(self.date_arrived)
    }
}

/// Sort and dedup so author lists compare as sets.
pub(crate) fn normalize_authors(authors: &mut Vec<Author>) {
    authors.sort();
    authors.dedup_by(|a, b| a.author_id == b.author_id);
}

/// A parsed feed item, produced by the external fetch/parse collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedItem {
    pub guid: String,
    pub title: Option<String>,
    pub content_html: Option<String>,
    pub content_text: Option<String>,
    pub summary: Option<String>,
    pub date_published: Option<i64>,
    pub date_modified: Option<i64>,
    pub authors: Vec<Author>,
}

// ============================================================================
// Status Mutation Types
// ============================================================================

/// Which status flag a mark operation flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Read,
    Starred,
}

impl StatusKind {
    /// The `statuses` column this kind writes. Static strings only; these are
    /// interpolated into SQL.
    pub(crate) fn column(self) -> &'static str {
        match self {
            StatusKind::Read => "read",
            StatusKind::Starred => "starred",
        }
    }
}

/// Where a status mutation originated. Local mutations enqueue pending
/// changes for the remote; remote-applied mutations must not echo back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOrigin {
    Local,
    Remote,
}

/// The kind of a queued local mutation awaiting remote send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingKind {
    Read,
    Starred,
    New,
    Deleted,
}

impl PendingKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            PendingKind::Read => "read",
            PendingKind::Starred => "starred",
            PendingKind::New => "new",
            PendingKind::Deleted => "deleted",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(PendingKind::Read),
            "starred" => Some(PendingKind::Starred),
            "new" => Some(PendingKind::New),
            "deleted" => Some(PendingKind::Deleted),
            _ => None,
        }
    }
}

impl From<StatusKind> for PendingKind {
    fn from(kind: StatusKind) -> Self {
        match kind {
            StatusKind::Read => PendingKind::Read,
            StatusKind::Starred => PendingKind::Starred,
        }
    }
}

/// A queued local status mutation awaiting confirmed remote send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    pub article_id: ArticleId,
    pub kind: PendingKind,
    pub flag: bool,
}

// ============================================================================
// Fetch Selectors
// ============================================================================

/// How aggressively a GC pass ages things out. Sync-style accounts keep
/// statuses much longer than feed-based ones because the remote may still
/// reference them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionStyle {
    FeedBased,
    SyncBased,
}

/// Article fetch selector. An empty feed list means "all feeds".
///
/// Every variant orders by `coalesce(date_published, date_modified,
/// date_arrived)` descending and honors the optional fetch limit.
#[derive(Debug, Clone)]
pub enum ArticleSelector {
    /// All articles belonging to the given feeds
    Feeds(Vec<FeedId>),
    /// Specific articles by id
    Articles(Vec<ArticleId>),
    /// Articles in a coalesced-date range, optionally feed-scoped
    Range {
        feed_ids: Vec<FeedId>,
        after: Option<i64>,
        before: Option<i64>,
    },
    /// Unread articles, optionally feed-scoped
    Unread(Vec<FeedId>),
    /// Starred articles, optionally feed-scoped
    Starred(Vec<FeedId>),
    /// Full-text search match, optionally feed-scoped
    Search { query: String, feed_ids: Vec<FeedId> },
}

// ============================================================================
// Change Sets
// ============================================================================

/// The result of a store update: which articles were created, which had at
/// least one field change persisted, and which were deleted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArticleChanges {
    pub new: Vec<Article>,
    pub updated: Vec<Article>,
    pub deleted: Vec<Article>,
}

impl ArticleChanges {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn new_article_ids(&self) -> Vec<ArticleId> {
        self.new.iter().map(|a| a.article_id.clone()).collect()
    }

    pub fn updated_article_ids(&self) -> Vec<ArticleId> {
        self.updated.iter().map(|a| a.article_id.clone()).collect()
    }
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for article queries (used by sqlx FromRow).
///
/// The status columns come from a LEFT JOIN so a content row whose status is
/// missing (an internal invariant violation) still deserializes instead of
/// erroring; `into_article` returns `None` for it and the caller skips the row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub article_id: String,
    pub feed_id: String,
    pub title: Option<String>,
    pub content_html: Option<String>,
    pub content_text: Option<String>,
    pub summary: Option<String>,
    pub date_published: Option<i64>,
    pub date_modified: Option<i64>,
    pub date_arrived: i64,
    pub read: Option<bool>,
    pub starred: Option<bool>,
    pub status_date_arrived: Option<i64>,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self, authors: Vec<Author>) -> Option<Article> {
        let status = ArticleStatus {
            article_id: self.article_id.clone(),
            read: self.read?,
            starred: self.starred?,
            date_arrived: self.status_date_arrived?,
        };
        let mut authors = authors;
        normalize_authors(&mut authors);
        Some(Article {
            article_id: self.article_id,
            feed_id: self.feed_id,
            title: self.title,
            content_html: self.content_html,
            content_text: self.content_text,
            summary: self.summary,
            date_published: self.date_published,
            date_modified: self.date_modified,
            date_arrived: self.date_arrived,
            authors,
            status,
        })
    }
}
