//! Batched escalation scheduler
//!
//! Each active alert gets its own timer chain: sleep one response window,
//! then re-read the world and decide. If nobody committed, the responder
//! pool widens by one batch and a new window opens; once every batch is
//! exhausted the alert escalates to emergency services and the chain ends.
//!
//! Two rules keep stale timers harmless. Every tick acts only on freshly
//! fetched state, never on values captured when the chain was armed, and a
//! chain whose alert has left the active status simply stops. Cancellation
//! is therefore an optimization; correctness never depends on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::gateway::{CallTarget, NotificationGateway};
use crate::ledger::ResponseLedger;
use crate::store::{AlertPatch, AlertStore};
use crate::types::{Alert, AlertId, AlertStatus, DEFAULT_MAX_BATCHES, DEFAULT_RESPONDERS_PER_BATCH};

/// Appended to an alert's description when escalation exhausts every batch.
pub const EMERGENCY_ESCALATION_MARKER: &str =
    "[auto-escalation] No responder available after the final batch; emergency services notified.";

/// Timing and sizing of the batched escalation.
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    /// How long each responder batch gets before the pool widens
    pub response_window: Duration,
    /// Number of batches before emergency escalation
    pub max_batches: u32,
    /// Responders notified per batch
    pub responders_per_batch: u32,
    /// Delay before re-running a tick whose persist failed
    pub retry_delay: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            response_window: Duration::from_secs(120),
            max_batches: DEFAULT_MAX_BATCHES,
            responders_per_batch: DEFAULT_RESPONDERS_PER_BATCH,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl EscalationPolicy {
    /// Stamp a freshly created alert with first-batch counters and the
    /// first response deadline.
    pub fn arm_first_batch(&self, alert: &mut Alert) {
        alert.current_batch = 1;
        alert.max_batches = self.max_batches;
        alert.responders_per_batch = self.responders_per_batch;
        alert.total_responders = self.responders_per_batch;
        alert.response_deadline = Utc::now() + self.window_chrono();
    }

    fn window_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.response_window.as_secs() as i64)
    }
}

/// Spawns and tracks one escalation chain per watched alert.
pub struct EscalationScheduler {
    store: Arc<AlertStore>,
    ledger: Arc<ResponseLedger>,
    gateway: Arc<dyn NotificationGateway>,
    policy: EscalationPolicy,
    chains: Arc<Mutex<HashMap<AlertId, CancellationToken>>>,
}

impl EscalationScheduler {
    pub fn new(
        store: Arc<AlertStore>,
        ledger: Arc<ResponseLedger>,
        gateway: Arc<dyn NotificationGateway>,
        policy: EscalationPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            gateway,
            policy,
            chains: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arm the escalation chain for an alert. A second watch on the same
    /// alert is refused; one chain per alert lifetime.
    pub async fn watch(&self, alert_id: AlertId) {
        let mut chains = self.chains.lock().await;
        if chains.contains_key(&alert_id) {
            warn!(alert_id = %alert_id, "escalation chain already armed");
            return;
        }
        let cancel = CancellationToken::new();
        chains.insert(alert_id, cancel.clone());
        drop(chains);

        let chain = EscalationChain {
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            gateway: self.gateway.clone(),
            policy: self.policy.clone(),
            chains: self.chains.clone(),
            alert_id,
        };
        tokio::spawn(chain.run(cancel));
        debug!(
            alert_id = %alert_id,
            window_secs = self.policy.response_window.as_secs(),
            "escalation chain armed"
        );
    }

    /// Cancel the in-flight chain for an alert, if one is running.
    pub async fn cancel(&self, alert_id: AlertId) {
        if let Some(token) = self.chains.lock().await.remove(&alert_id) {
            token.cancel();
            debug!(alert_id = %alert_id, "escalation chain cancelled");
        }
    }

    /// Cancel every in-flight chain. Used at engine teardown.
    pub async fn cancel_all(&self) {
        for (_, token) in self.chains.lock().await.drain() {
            token.cancel();
        }
    }
}

struct EscalationChain {
    store: Arc<AlertStore>,
    ledger: Arc<ResponseLedger>,
    gateway: Arc<dyn NotificationGateway>,
    policy: EscalationPolicy,
    chains: Arc<Mutex<HashMap<AlertId, CancellationToken>>>,
    alert_id: AlertId,
}

impl EscalationChain {
    async fn run(self, cancel: CancellationToken) {
        'chain: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(alert_id = %self.alert_id, "escalation chain stopped by cancellation");
                    break 'chain;
                }
                _ = time::sleep(self.policy.response_window) => {}
            }

            'tick: loop {
                // Act only on freshly read state; anything recorded while we
                // slept must win over what we knew a window ago.
                let alert = match self.store.get(self.alert_id).await {
                    Ok(alert) => alert,
                    Err(_) => {
                        debug!(alert_id = %self.alert_id, "alert gone; stopping escalation");
                        break 'chain;
                    }
                };
                if !alert.is_active() {
                    debug!(
                        alert_id = %self.alert_id,
                        status = alert.status.as_str(),
                        "alert no longer active; stopping escalation"
                    );
                    break 'chain;
                }
                if self.ledger.has_committed_response(self.alert_id).await {
                    info!(alert_id = %self.alert_id, "responder committed; halting escalation");
                    break 'chain;
                }

                if alert.current_batch < alert.max_batches {
                    match self.widen_batch(&alert).await {
                        ChainStep::Persisted => continue 'chain,
                        ChainStep::Superseded => break 'chain,
                        ChainStep::Retry => {}
                    }
                } else {
                    match self.escalate_to_emergency(&alert).await {
                        // The emergency step is terminal whether it landed or
                        // was overtaken by a concurrent resolve.
                        ChainStep::Persisted | ChainStep::Superseded => break 'chain,
                        ChainStep::Retry => {}
                    }
                }

                // Losing an escalation tick silently is a safety defect, so a
                // failed persist re-runs the whole tick after a short delay.
                tokio::select! {
                    _ = cancel.cancelled() => break 'chain,
                    _ = time::sleep(self.policy.retry_delay) => continue 'tick,
                }
            }
        }

        self.chains.lock().await.remove(&self.alert_id);
    }

    async fn widen_batch(&self, alert: &Alert) -> ChainStep {
        let next_batch = alert.current_batch + 1;
        let patch = AlertPatch::new()
            .with_current_batch(next_batch)
            .with_total_responders(next_batch * alert.responders_per_batch)
            .with_response_deadline(Utc::now() + self.policy.window_chrono());

        match self.store.update(self.alert_id, patch).await {
            Ok(updated) => {
                info!(
                    alert_id = %self.alert_id,
                    batch = updated.current_batch,
                    notified = updated.total_responders,
                    "no committed response in window; widening responder pool"
                );
                if let Err(e) = self.gateway.batch_widened(&updated).await {
                    warn!(alert_id = %self.alert_id, error = %e, "batch notification failed");
                }
                ChainStep::Persisted
            }
            Err(e) => self.classify_persist_failure(e),
        }
    }

    async fn escalate_to_emergency(&self, alert: &Alert) -> ChainStep {
        let description = format!("{}\n{}", alert.description, EMERGENCY_ESCALATION_MARKER);
        let patch = AlertPatch::new()
            .with_status(AlertStatus::Acknowledged)
            .with_description(description);

        match self.store.update(self.alert_id, patch).await {
            Ok(updated) => {
                warn!(
                    alert_id = %self.alert_id,
                    batches = alert.max_batches,
                    "all responder batches exhausted; escalating to emergency services"
                );
                if let Err(e) = self.gateway.emergency_escalated(&updated).await {
                    warn!(alert_id = %self.alert_id, error = %e, "emergency notification failed");
                }
                if let Err(e) = self
                    .gateway
                    .call_requested(&updated, CallTarget::EmergencyServices)
                    .await
                {
                    warn!(alert_id = %self.alert_id, error = %e, "emergency call prompt failed");
                }
                ChainStep::Persisted
            }
            Err(e) => self.classify_persist_failure(e),
        }
    }

    fn classify_persist_failure(&self, error: CoreError) -> ChainStep {
        match error {
            // The alert changed underneath us in a way that ends the chain.
            CoreError::AlertNotFound(_) | CoreError::InvalidTransition { .. } => {
                debug!(alert_id = %self.alert_id, error = %error, "escalation superseded");
                ChainStep::Superseded
            }
            other => {
                warn!(alert_id = %self.alert_id, error = %other, "failed to persist escalation step");
                ChainStep::Retry
            }
        }
    }
}

/// Outcome of one escalation tick's persist attempt.
enum ChainStep {
    Persisted,
    Superseded,
    Retry,
}
