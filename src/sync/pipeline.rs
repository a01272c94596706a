//! Dependent operation pipelines with external cancel/suspend control.
//!
//! A pipeline is an ordered list of labeled units. Units run one at a time;
//! a unit may only depend on units added before it, so ordering alone
//! satisfies dependencies and the first failure aborts everything after it.
//! Control flows in through a watch channel: cancellation interrupts the
//! unit in flight, suspension pauses the pipeline between units.

use std::collections::HashSet;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{oneshot, watch};

use super::SyncError;

// ============================================================================
// Control
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct ControlState {
    suspended: bool,
    canceled: bool,
}

/// Handle for steering a pipeline from outside. Cloneable; all clones steer
/// the same pipeline. Dropping every handle leaves the pipeline running to
/// completion.
#[derive(Clone)]
pub struct PipelineControls {
    tx: watch::Sender<ControlState>,
}

impl PipelineControls {
    /// Stop the pipeline: the unit in flight is interrupted and no further
    /// unit starts. Irreversible.
    pub fn cancel(&self) {
        self.tx.send_modify(|s| s.canceled = true);
    }

    /// Pause between units. The unit in flight finishes first.
    pub fn suspend(&self) {
        self.tx.send_modify(|s| s.suspended = true);
    }

    pub fn resume(&self) {
        self.tx.send_modify(|s| s.suspended = false);
    }
}

// ============================================================================
// Pipeline
// ============================================================================

struct Unit {
    label: &'static str,
    fut: BoxFuture<'static, Result<(), SyncError>>,
}

pub struct Pipeline {
    units: Vec<Unit>,
    labels: HashSet<&'static str>,
    tx: watch::Sender<ControlState>,
    rx: watch::Receiver<ControlState>,
}

impl Pipeline {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ControlState::default());
        Pipeline {
            units: Vec::new(),
            labels: HashSet::new(),
            tx,
            rx,
        }
    }

    pub fn controls(&self) -> PipelineControls {
        PipelineControls {
            tx: self.tx.clone(),
        }
    }

    /// Append a unit. `deps` must name units already added: execution is
    /// strictly in insertion order, so an earlier unit is always finished
    /// (or has aborted the pipeline) before a later one starts.
    ///
    /// # Panics
    ///
    /// Panics if a dependency has not been added or the label is reused.
    pub fn add_unit(
        &mut self,
        label: &'static str,
        deps: &[&'static str],
        fut: impl std::future::Future<Output = Result<(), SyncError>> + Send + 'static,
    ) {
        for dep in deps {
            assert!(
                self.labels.contains(dep),
                "pipeline unit '{}' depends on unknown unit '{}'",
                label,
                dep
            );
        }
        assert!(
            self.labels.insert(label),
            "pipeline unit '{}' added twice",
            label
        );
        self.units.push(Unit {
            label,
            fut: fut.boxed(),
        });
    }

    /// Run every unit in order. Returns the first unit error, or
    /// `SyncError::Canceled` if the pipeline was canceled before finishing.
    pub async fn run(self) -> Result<(), SyncError> {
        // Keep a sender alive for the whole run so watch::changed() cannot
        // fail even after every external handle is dropped.
        let _tx = self.tx;
        let mut rx = self.rx;

        for unit in self.units {
            wait_ready(&mut rx).await?;

            tracing::debug!(unit = unit.label, "pipeline unit starting");
            tokio::select! {
                result = unit.fut => {
                    if let Err(e) = result {
                        tracing::warn!(unit = unit.label, error = %e, "pipeline unit failed");
                        return Err(e);
                    }
                }
                _ = canceled(&mut rx) => {
                    tracing::debug!(unit = unit.label, "pipeline canceled mid-unit");
                    return Err(SyncError::Canceled);
                }
            }
        }
        Ok(())
    }

    /// Run on a background task. The handle owns the controls and receives
    /// the terminal result exactly once.
    pub fn spawn(self) -> PipelineHandle {
        let controls = self.controls();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = self.run().await;
            // Receiver may be gone; the result is then simply unobserved.
            let _ = done_tx.send(result);
        });
        PipelineHandle {
            controls,
            done: done_rx,
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Block between units while suspended; bail out once canceled.
async fn wait_ready(rx: &mut watch::Receiver<ControlState>) -> Result<(), SyncError> {
    loop {
        let state = *rx.borrow();
        if state.canceled {
            return Err(SyncError::Canceled);
        }
        if !state.suspended {
            return Ok(());
        }
        if rx.changed().await.is_err() {
            return Ok(());
        }
    }
}

/// Resolves once cancellation is requested.
async fn canceled(rx: &mut watch::Receiver<ControlState>) {
    loop {
        if rx.borrow().canceled {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

pub struct PipelineHandle {
    controls: PipelineControls,
    done: oneshot::Receiver<Result<(), SyncError>>,
}

impl PipelineHandle {
    pub fn controls(&self) -> PipelineControls {
        self.controls.clone()
    }

    /// Wait for the terminal result. If the pipeline task was torn down
    /// without reporting (runtime shutdown), that counts as cancellation.
    pub async fn wait(self) -> Result<(), SyncError> {
        self.done.await.unwrap_or(Err(SyncError::Canceled))
    }
}
