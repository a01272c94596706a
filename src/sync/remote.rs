//! Collaborator interfaces: the remote zone backend and the feed fetcher.
//!
//! Both traits return boxed futures so implementations stay object-safe and
//! the engine can hold them behind generics or `dyn` without pinning the
//! whole crate to one transport.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::storage::{ArticleId, FeedId, ParsedItem, PendingChange};

use super::SyncError;

// ============================================================================
// Wire Types
// ============================================================================

/// Opaque cursor into the remote zone's change feed. The backend mints it,
/// the engine only stores and echoes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeToken(pub String);

/// One remote-side status flip delivered in a zone delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub article_id: ArticleId,
    pub kind: crate::storage::StatusKind,
    pub flag: bool,
}

/// Everything the remote zone reports since a change token: fresh items per
/// feed, status flips, deletions, and the next token to resume from.
#[derive(Debug, Clone, Default)]
pub struct ZoneDelta {
    pub items: Vec<(FeedId, Vec<ParsedItem>)>,
    pub statuses: Vec<StatusUpdate>,
    pub deleted: Vec<ArticleId>,
    pub change_token: Option<ChangeToken>,
}

/// A feed as the remote knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRef {
    pub feed_id: FeedId,
    pub url: String,
    pub name: Option<String>,
    pub folder: Option<String>,
}

// ============================================================================
// Remote Backend
// ============================================================================

/// The remote synchronization backend: a zone of feeds, articles and
/// statuses addressed by change tokens, plus feed/folder management.
///
/// `fetch_changes_in_zone(None)` means "from the beginning"; the backend
/// answers with a delta and the token to pass next time. A backend may
/// invalidate outstanding tokens (zone reset), in which case the engine
/// clears its stored token and pulls from scratch.
pub trait RemoteBackend: Send + Sync {
    /// Cheap reachability probe. A refresh against an unreachable backend is
    /// a silent no-op, not an error.
    fn is_reachable(&self) -> BoxFuture<'_, bool>;

    fn fetch_changes_in_zone(
        &self,
        since: Option<ChangeToken>,
    ) -> BoxFuture<'_, Result<ZoneDelta, SyncError>>;

    /// Push a batch of local status changes. The whole batch either reaches
    /// the remote or fails; partial application is the backend's problem.
    fn send_statuses(&self, batch: Vec<PendingChange>) -> BoxFuture<'_, Result<(), SyncError>>;

    fn subscribe_to_zone_changes(&self) -> BoxFuture<'_, Result<(), SyncError>>;

    /// Drop the server-side cursor after a zone reset.
    fn reset_change_token(&self) -> BoxFuture<'_, Result<(), SyncError>>;

    // Feed and folder management passthroughs

    fn create_feed(&self, url: &str, folder: Option<&str>)
        -> BoxFuture<'_, Result<FeedRef, SyncError>>;

    fn rename_feed(&self, feed: &FeedRef, name: &str) -> BoxFuture<'_, Result<(), SyncError>>;

    fn move_feed(
        &self,
        feed: &FeedRef,
        from_folder: Option<&str>,
        to_folder: Option<&str>,
    ) -> BoxFuture<'_, Result<(), SyncError>>;

    fn remove_feed(&self, feed: &FeedRef) -> BoxFuture<'_, Result<(), SyncError>>;

    fn create_folder(&self, name: &str) -> BoxFuture<'_, Result<(), SyncError>>;

    fn rename_folder(&self, from: &str, to: &str) -> BoxFuture<'_, Result<(), SyncError>>;

    fn remove_folder(&self, name: &str) -> BoxFuture<'_, Result<(), SyncError>>;
}

// ============================================================================
// Feed Source
// ============================================================================

/// Produces parsed items for a feed. Fetching and parsing live outside this
/// crate; the engine only consumes the result.
pub trait FeedSource: Send + Sync {
    fn fetch_feed(&self, feed: &FeedRef) -> BoxFuture<'_, Result<Vec<ParsedItem>, SyncError>>;
}
