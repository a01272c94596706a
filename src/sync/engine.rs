//! The sync engine: orchestrates the refresh protocol over the store, the
//! remote backend, and the feed source.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::storage::{
    ArticleChanges, ArticleId, Database, MarkOrigin, RetentionStyle, StatusKind, SystemClock,
};

use super::pipeline::{Pipeline, PipelineControls};
use super::remote::{ChangeToken, FeedRef, FeedSource, RemoteBackend, ZoneDelta};
use super::SyncError;

/// Queued changes above this trigger an automatic flush on the next mark.
const FLUSH_THRESHOLD: i64 = 100;

/// Changes sent to the remote per batch.
const SEND_BATCH_SIZE: i64 = 100;

/// `sync_state` keys owned by the engine.
const CHANGE_TOKEN_KEY: &str = "change_token";
const LAST_REFRESH_KEY: &str = "last_refreshed";

// ============================================================================
// Context
// ============================================================================

/// Everything the engine operates on, passed in explicitly.
pub struct SyncContext<R, F> {
    pub database: Database,
    pub backend: Arc<R>,
    pub feed_source: Arc<F>,
    pub retention: RetentionStyle,
}

impl<R, F> Clone for SyncContext<R, F> {
    fn clone(&self) -> Self {
        SyncContext {
            database: self.database.clone(),
            backend: self.backend.clone(),
            feed_source: self.feed_source.clone(),
            retention: self.retention,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct SyncEngine<R, F> {
    ctx: SyncContext<R, F>,
    /// Controls for the refresh in flight, if any.
    refresh_controls: Arc<std::sync::Mutex<Option<PipelineControls>>>,
}

impl<R, F> Clone for SyncEngine<R, F> {
    fn clone(&self) -> Self {
        SyncEngine {
            ctx: self.ctx.clone(),
            refresh_controls: self.refresh_controls.clone(),
        }
    }
}

impl<R, F> SyncEngine<R, F>
where
    R: RemoteBackend + 'static,
    F: FeedSource + 'static,
{
    pub fn new(ctx: SyncContext<R, F>) -> Self {
        SyncEngine {
            ctx,
            refresh_controls: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn database(&self) -> &Database {
        &self.ctx.database
    }

    // ========================================================================
    // Status Marks
    // ========================================================================

    /// Mark articles locally and enqueue the change for the remote. Returns
    /// the ids whose flag actually flipped. Once the queue grows past the
    /// flush threshold a flush is attempted; a failed auto-flush is logged,
    /// not surfaced, since the local mark already succeeded.
    pub async fn mark_articles(
        &self,
        ids: &[ArticleId],
        kind: StatusKind,
        flag: bool,
    ) -> Result<Vec<ArticleId>, SyncError> {
        let changed = self
            .ctx
            .database
            .mark_statuses(ids, kind, flag, MarkOrigin::Local)
            .await?;

        if self.ctx.database.pending_change_count().await? > FLUSH_THRESHOLD {
            if let Err(e) = self.flush_pending().await {
                tracing::warn!(error = %e, "auto-flush failed; changes stay queued");
            }
        }
        Ok(changed)
    }

    // ========================================================================
    // Queue Flush
    // ========================================================================

    /// Send queued local changes to the remote in batches. A batch is
    /// removed from the queue only after the remote confirms it; on failure
    /// the in-flight batch returns to the queue and the error surfaces.
    pub async fn flush_pending(&self) -> Result<(), SyncError> {
        loop {
            let batch = self.ctx.database.select_for_sending(SEND_BATCH_SIZE).await?;
            if batch.is_empty() {
                return Ok(());
            }
            match self.ctx.backend.send_statuses(batch.clone()).await {
                Ok(()) => {
                    self.ctx.database.clear_selected(&batch).await?;
                    tracing::debug!(count = batch.len(), "pending batch confirmed");
                }
                Err(e) => {
                    self.ctx.database.reset_selected().await?;
                    return Err(e);
                }
            }
        }
    }

    // ========================================================================
    // Remote Deltas
    // ========================================================================

    /// Apply a zone delta: items re-enter the merge engine through the
    /// account-wide update path, status flips go through the ledger with
    /// remote origin (so they are not echoed back), deletions are applied,
    /// and the new change token is persisted last.
    pub async fn apply_remote_delta(
        &self,
        delta: ZoneDelta,
    ) -> Result<ArticleChanges, SyncError> {
        let db = &self.ctx.database;
        let changes = db.update_account_articles(&delta.items, false).await?;

        for kind in [StatusKind::Read, StatusKind::Starred] {
            for flag in [true, false] {
                let ids: Vec<ArticleId> = delta
                    .statuses
                    .iter()
                    .filter(|s| s.kind == kind && s.flag == flag)
                    .map(|s| s.article_id.clone())
                    .collect();
                if !ids.is_empty() {
                    db.mark_statuses(&ids, kind, flag, MarkOrigin::Remote).await?;
                }
            }
        }

        if !delta.deleted.is_empty() {
            db.delete_articles(&delta.deleted, MarkOrigin::Remote).await?;
        }
        if let Some(token) = &delta.change_token {
            db.set_sync_state(CHANGE_TOKEN_KEY, &token.0).await?;
        }
        Ok(changes)
    }

    /// Forget the zone cursor on both sides; the next refresh pulls from
    /// the beginning.
    pub async fn reset_change_token(&self) -> Result<(), SyncError> {
        self.ctx.backend.reset_change_token().await?;
        self.ctx.database.clear_sync_state(CHANGE_TOKEN_KEY).await?;
        Ok(())
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// The full refresh protocol as an ordered pipeline:
    ///
    /// 1. pull zone changes since the stored token,
    /// 2. apply the remote delta,
    /// 3. fetch and merge each subscribed feed's content,
    /// 4. flush pending local changes,
    /// 5. record the completion timestamp.
    ///
    /// The first failing step aborts the remainder and surfaces its error;
    /// completed steps stay committed. An unreachable backend makes the
    /// whole refresh a silent no-op. While a refresh runs, [`cancel_refresh`]
    /// and [`suspend_refresh`] steer it from other tasks.
    ///
    /// [`cancel_refresh`]: SyncEngine::cancel_refresh
    /// [`suspend_refresh`]: SyncEngine::suspend_refresh
    pub async fn refresh(&self, feeds: Vec<FeedRef>) -> Result<(), SyncError> {
        if !self.ctx.backend.is_reachable().await {
            tracing::debug!("backend unreachable; skipping refresh");
            return Ok(());
        }

        let delta_slot: Arc<AsyncMutex<Option<ZoneDelta>>> = Arc::new(AsyncMutex::new(None));
        let mut pipeline = Pipeline::new();

        {
            let engine = self.clone();
            let slot = delta_slot.clone();
            pipeline.add_unit("pull_zone_changes", &[], async move {
                let token = engine
                    .ctx
                    .database
                    .get_sync_state(CHANGE_TOKEN_KEY)
                    .await?
                    .map(ChangeToken);
                let delta = engine.ctx.backend.fetch_changes_in_zone(token).await?;
                *slot.lock().await = Some(delta);
                Ok(())
            });
        }

        {
            let engine = self.clone();
            let slot = delta_slot.clone();
            pipeline.add_unit("apply_remote_delta", &["pull_zone_changes"], async move {
                let delta = slot.lock().await.take().unwrap_or_default();
                engine.apply_remote_delta(delta).await?;
                Ok(())
            });
        }

        {
            let engine = self.clone();
            // Absence pruning is a feed-based policy; sync-style accounts age
            // content out through retention only.
            let prune_absent = self.ctx.retention == RetentionStyle::FeedBased;
            pipeline.add_unit("merge_feed_content", &["apply_remote_delta"], async move {
                for feed in &feeds {
                    // One broken feed must not starve the rest
                    match engine.ctx.feed_source.fetch_feed(feed).await {
                        Ok(items) => {
                            engine
                                .ctx
                                .database
                                .update_feed_articles(&feed.feed_id, &items, prune_absent)
                                .await?;
                        }
                        Err(e) => {
                            tracing::warn!(feed_id = %feed.feed_id, error = %e, "feed fetch failed");
                        }
                    }
                }
                Ok(())
            });
        }

        {
            let engine = self.clone();
            pipeline.add_unit("flush_pending", &["merge_feed_content"], async move {
                engine.flush_pending().await
            });
        }

        {
            let engine = self.clone();
            pipeline.add_unit("record_completion", &["flush_pending"], async move {
                let now = chrono::Utc::now().timestamp();
                engine
                    .ctx
                    .database
                    .set_sync_state(LAST_REFRESH_KEY, &now.to_string())
                    .await?;
                Ok(())
            });
        }

        let handle = pipeline.spawn();
        if let Ok(mut controls) = self.refresh_controls.lock() {
            *controls = Some(handle.controls());
        }
        let result = handle.wait().await;
        if let Ok(mut controls) = self.refresh_controls.lock() {
            controls.take();
        }

        if result.is_err() {
            // Return any in-flight batch to the queue for the next attempt
            if let Err(e) = self.ctx.database.reset_selected().await {
                tracing::warn!(error = %e, "failed to reset in-flight pending changes");
            }
        }
        result
    }

    /// Cancel the refresh in flight, if any.
    pub fn cancel_refresh(&self) {
        if let Ok(controls) = self.refresh_controls.lock() {
            if let Some(controls) = controls.as_ref() {
                controls.cancel();
            }
        }
    }

    /// Pause the refresh between steps, e.g. when the app backgrounds.
    pub fn suspend_refresh(&self) {
        if let Ok(controls) = self.refresh_controls.lock() {
            if let Some(controls) = controls.as_ref() {
                controls.suspend();
            }
        }
    }

    pub fn resume_refresh(&self) {
        if let Ok(controls) = self.refresh_controls.lock() {
            if let Some(controls) = controls.as_ref() {
                controls.resume();
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Periodic housekeeping: article GC, status GC, index sweep. Failures
    /// are logged and retried on the next run, never surfaced.
    pub async fn run_maintenance(&self) {
        let db = &self.ctx.database;
        if let Err(e) = db.delete_old_articles(&SystemClock::new()).await {
            tracing::warn!(error = %e, "article GC failed");
        }
        if let Err(e) = db.delete_old_statuses(self.ctx.retention).await {
            tracing::warn!(error = %e, "status GC failed");
        }
        db.spawn_index_sweep();
    }
}
