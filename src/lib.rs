//! Article persistence and synchronization for feed readers.
//!
//! `feedvault` keeps a local SQLite store of articles with per-article
//! read/starred state tracked independently of content retention, merges
//! incoming feed content with field-level write minimization, maintains an
//! incremental full-text index, garbage-collects under a time budget, and
//! reconciles local status changes with a remote zone backend through
//! cancellable, suspendable operation pipelines.
//!
//! Feed fetching/parsing and the remote transport live behind the
//! [`sync::FeedSource`] and [`sync::RemoteBackend`] traits; this crate owns
//! everything between them and the database file.

pub mod merge;
pub mod storage;
pub mod sync;

pub use storage::{
    Article, ArticleChanges, ArticleSelector, ArticleStatus, Author, Database, ParsedItem,
    RetentionStyle, StatusKind, StoreError,
};
pub use sync::{SyncContext, SyncEngine, SyncError};
