//! SQLite-backed article store.
//!
//! One [`Database`] handle owns the connection pool, the serialized writer
//! path, and the article cache. The implementation is split by concern:
//! article merge/fetch, the status ledger, full-text search, the pending
//! change queue, and retention.

mod articles;
mod db;
mod pending;
mod retention;
mod search;
mod statuses;
mod types;

pub use db::Database;
pub use retention::{Clock, SystemClock};
pub use types::{
    derive_article_id, derive_author_id, Article, ArticleChanges, ArticleId, ArticleSelector,
    ArticleStatus, Author, AuthorId, FeedId, MarkOrigin, ParsedItem, PendingChange, PendingKind,
    RetentionStyle, StatusKind, StoreError,
};
