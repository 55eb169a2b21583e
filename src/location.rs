//! Location acquisition seam
//!
//! The engine never talks to platform geolocation APIs directly. It consumes
//! a [`LocationProvider`]: one-shot fixes for raising an alert, and a
//! continuous [`PositionWatch`] for journey monitoring. A watch is an owned
//! resource; dropping it releases the underlying subscription, so a crashed
//! or stopped consumer can never leave a platform watcher running.
//!
//! [`HostLocationProvider`] is the push-driven implementation: the embedding
//! shell (or a test, or the CLI simulator) feeds fixes in and the provider
//! fans them out to active watches.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::error::CoreError;
use crate::types::PositionFix;

/// Fixes buffered per watch. A full buffer drops the oldest-pending sample;
/// position streams are lossy by nature and only the latest fix matters.
const WATCH_BUFFER: usize = 16;

/// Source of position data for the engine.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// One-shot position fix.
    ///
    /// Fails with [`CoreError::PermissionDenied`] when location access is
    /// refused and [`CoreError::LocationUnavailable`] when no fix can be
    /// produced right now.
    async fn current_position(&self) -> Result<PositionFix, CoreError>;

    /// Continuous position stream. The subscription lives exactly as long as
    /// the returned watch.
    async fn watch_position(&self) -> Result<PositionWatch, CoreError>;
}

/// An owned, scoped position subscription.
///
/// Dropping the watch cancels its release token; providers observe that
/// token to tear down whatever platform resource backs the stream.
pub struct PositionWatch {
    fixes: mpsc::Receiver<PositionFix>,
    _release: DropGuard,
}

impl PositionWatch {
    pub fn new(fixes: mpsc::Receiver<PositionFix>, release: CancellationToken) -> Self {
        Self {
            fixes,
            _release: release.drop_guard(),
        }
    }

    /// Next fix, or `None` once the provider side has shut down.
    pub async fn next(&mut self) -> Option<PositionFix> {
        self.fixes.recv().await
    }
}

struct WatchSlot {
    sender: mpsc::Sender<PositionFix>,
    released: CancellationToken,
}

impl WatchSlot {
    fn is_live(&self) -> bool {
        !self.released.is_cancelled() && !self.sender.is_closed()
    }
}

struct HostLocationState {
    permission_granted: bool,
    current: Option<PositionFix>,
    watchers: Vec<WatchSlot>,
}

/// Push-driven location provider fed by the embedding shell.
///
/// Clones share state, so the side that pushes fixes and the engine that
/// consumes them can hold separate handles to the same provider.
#[derive(Clone)]
pub struct HostLocationProvider {
    state: Arc<Mutex<HostLocationState>>,
}

impl HostLocationProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HostLocationState {
                permission_granted: true,
                current: None,
                watchers: Vec::new(),
            })),
        }
    }

    /// Provider seeded with an initial fix, so `current_position` succeeds
    /// before the first push.
    pub fn with_position(latitude: f64, longitude: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostLocationState {
                permission_granted: true,
                current: Some(PositionFix::new(latitude, longitude)),
                watchers: Vec::new(),
            })),
        }
    }

    /// Record a new fix and fan it out to every live watch.
    pub async fn push_fix(&self, fix: PositionFix) {
        let mut state = self.state.lock().await;
        state.current = Some(fix.clone());
        state.watchers.retain(WatchSlot::is_live);
        for slot in &state.watchers {
            if let Err(e) = slot.sender.try_send(fix.clone()) {
                // The consumer is behind; losing a sample is fine, the next
                // push carries fresher data anyway.
                debug!(error = %e, "dropped position fix for slow watcher");
            }
        }
    }

    pub async fn set_permission(&self, granted: bool) {
        self.state.lock().await.permission_granted = granted;
    }

    /// Simulate the user refusing location access.
    pub async fn deny_permission(&self) {
        self.set_permission(false).await;
    }

    #[cfg(test)]
    pub(crate) async fn watcher_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.watchers.retain(WatchSlot::is_live);
        state.watchers.len()
    }
}

impl Default for HostLocationProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocationProvider for HostLocationProvider {
    async fn current_position(&self) -> Result<PositionFix, CoreError> {
        let state = self.state.lock().await;
        if !state.permission_granted {
            return Err(CoreError::PermissionDenied);
        }
        state
            .current
            .clone()
            .ok_or_else(|| CoreError::LocationUnavailable("no position fix received yet".into()))
    }

    async fn watch_position(&self) -> Result<PositionWatch, CoreError> {
        let mut state = self.state.lock().await;
        if !state.permission_granted {
            return Err(CoreError::PermissionDenied);
        }
        let (sender, receiver) = mpsc::channel(WATCH_BUFFER);
        let released = CancellationToken::new();
        state.watchers.push(WatchSlot {
            sender,
            released: released.clone(),
        });
        Ok(PositionWatch::new(receiver, released))
    }
}
