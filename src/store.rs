//! Observable in-memory alert store
//!
//! Single source of truth for alert records. Every mutation goes through
//! [`AlertStore::create`] or [`AlertStore::update`]; both validate their
//! input, apply the change under the write lock, and publish a change event
//! on the broadcast feed before the lock is released, so subscribers observe
//! mutations in the order they were applied.
//!
//! The store enforces the two invariants the rest of the pipeline relies on:
//! alert status only ever moves forward (active → acknowledged → resolved),
//! and `current_batch` never regresses or exceeds `max_batches`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::error::CoreError;
use crate::types::{Alert, AlertEvent, AlertId, AlertStatus};

/// Events buffered per subscriber before a slow consumer starts lagging
const EVENT_CAPACITY: usize = 64;

/// A field-level partial update applied atomically to one alert.
///
/// Absent fields are left untouched. Built with the `with_*` helpers:
///
/// ```ignore
/// let patch = AlertPatch::new().with_status(AlertStatus::Resolved);
/// ```
#[derive(Debug, Clone, Default)]
pub struct AlertPatch {
    pub status: Option<AlertStatus>,
    pub description: Option<String>,
    pub response_deadline: Option<DateTime<Utc>>,
    pub current_batch: Option<u32>,
    pub total_responders: Option<u32>,
    pub audio_url: Option<String>,
}

impl AlertPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: AlertStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_response_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.response_deadline = Some(deadline);
        self
    }

    pub fn with_current_batch(mut self, batch: u32) -> Self {
        self.current_batch = Some(batch);
        self
    }

    pub fn with_total_responders(mut self, total: u32) -> Self {
        self.total_responders = Some(total);
        self
    }

    pub fn with_audio_url(mut self, url: impl Into<String>) -> Self {
        self.audio_url = Some(url.into());
        self
    }
}

/// In-memory alert store with a broadcast change feed.
pub struct AlertStore {
    alerts: RwLock<HashMap<AlertId, Alert>>,
    events: broadcast::Sender<AlertEvent>,
}

impl AlertStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            alerts: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to the change feed. Slow subscribers that fall more than
    /// the channel capacity behind receive a lag error and keep going; they
    /// can re-sync from [`AlertStore::list`].
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }

    /// Insert a new alert. Rejects duplicates, non-active status, and
    /// out-of-range coordinates.
    pub async fn create(&self, alert: Alert) -> Result<Alert, CoreError> {
        if alert.status != AlertStatus::Active {
            return Err(CoreError::InvalidAlert(format!(
                "new alerts must be active, got {}",
                alert.status
            )));
        }
        if !alert.location.is_valid() {
            return Err(CoreError::InvalidCoordinates {
                latitude: alert.location.latitude,
                longitude: alert.location.longitude,
            });
        }

        let mut alerts = self.alerts.write().await;
        if alerts.contains_key(&alert.id) {
            return Err(CoreError::DuplicateAlert(alert.id));
        }
        alerts.insert(alert.id, alert.clone());
        debug!(alert_id = %alert.id, "alert created");
        let _ = self.events.send(AlertEvent::Created(alert.clone()));
        Ok(alert)
    }

    pub async fn get(&self, id: AlertId) -> Result<Alert, CoreError> {
        self.alerts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CoreError::AlertNotFound(id))
    }

    /// Apply a patch to one alert as a single read-modify-write under the
    /// write lock. All guards run before any field is touched, so a rejected
    /// patch leaves the record exactly as it was.
    pub async fn update(&self, id: AlertId, patch: AlertPatch) -> Result<Alert, CoreError> {
        let mut alerts = self.alerts.write().await;
        let alert = alerts.get_mut(&id).ok_or(CoreError::AlertNotFound(id))?;

        // Status may only move forward; re-asserting the current status is a
        // no-op rather than an error so concurrent acknowledgers don't race.
        if let Some(next) = patch.status {
            if next != alert.status && !alert.status.can_transition_to(next) {
                return Err(CoreError::InvalidTransition {
                    from: alert.status,
                    to: next,
                });
            }
        }
        if let Some(batch) = patch.current_batch {
            if batch < alert.current_batch {
                return Err(CoreError::InvalidAlert(format!(
                    "current_batch may not regress ({} -> {})",
                    alert.current_batch, batch
                )));
            }
            if batch > alert.max_batches {
                return Err(CoreError::InvalidAlert(format!(
                    "current_batch {} exceeds max_batches {}",
                    batch, alert.max_batches
                )));
            }
        }

        if let Some(status) = patch.status {
            alert.status = status;
        }
        if let Some(description) = patch.description {
            alert.description = description;
        }
        if let Some(deadline) = patch.response_deadline {
            alert.response_deadline = deadline;
        }
        if let Some(batch) = patch.current_batch {
            alert.current_batch = batch;
        }
        if let Some(total) = patch.total_responders {
            alert.total_responders = total;
        }
        if let Some(url) = patch.audio_url {
            alert.audio_url = Some(url);
        }
        alert.updated_at = Utc::now();

        let updated = alert.clone();
        let _ = self.events.send(AlertEvent::Updated(updated.clone()));
        Ok(updated)
    }

    /// All alerts, newest first. Alerts are never hard-deleted.
    pub async fn list(&self) -> Vec<Alert> {
        let mut all: Vec<Alert> = self.alerts.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }
}

impl Default for AlertStore {
    fn default() -> Self {
        Self::new()
    }
}
