//! Outbound notification seam
//!
//! The engine decides *what* to announce and *when*; delivery mechanics
//! (push notifications, SMS fan-out, dialing) belong to the embedding shell.
//! Gateway failures are logged by callers and never block alert state: the
//! store remains the source of truth even when a notification is lost.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::types::Alert;

/// Who an outbound call prompt should dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// The region's fixed emergency number; the shell knows which one.
    EmergencyServices,
    /// The seeker's designated primary contact.
    PrimaryContact { number: String },
}

/// Delivery seam for alert notifications and call prompts.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// A new alert was raised; notify the first responder batch.
    async fn alert_raised(&self, alert: &Alert) -> Result<(), CoreError>;

    /// The responder pool widened to `alert.current_batch`.
    async fn batch_widened(&self, alert: &Alert) -> Result<(), CoreError>;

    /// Every batch was exhausted without a committed responder.
    async fn emergency_escalated(&self, alert: &Alert) -> Result<(), CoreError>;

    /// Prompt the shell to place an outbound call.
    async fn call_requested(&self, alert: &Alert, target: CallTarget) -> Result<(), CoreError>;
}

/// Gateway that delivers nothing. Used where the embedder consumes the
/// alert feed directly instead of receiving callbacks.
pub struct NoopGateway;

#[async_trait]
impl NotificationGateway for NoopGateway {
    async fn alert_raised(&self, _alert: &Alert) -> Result<(), CoreError> {
        Ok(())
    }

    async fn batch_widened(&self, _alert: &Alert) -> Result<(), CoreError> {
        Ok(())
    }

    async fn emergency_escalated(&self, _alert: &Alert) -> Result<(), CoreError> {
        Ok(())
    }

    async fn call_requested(&self, _alert: &Alert, _target: CallTarget) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Gateway that logs every delivery decision. The CLI simulator runs with
/// this so escalation timelines are visible on the console.
pub struct LogGateway;

#[async_trait]
impl NotificationGateway for LogGateway {
    async fn alert_raised(&self, alert: &Alert) -> Result<(), CoreError> {
        info!(
            alert_id = %alert.id,
            batch = alert.current_batch,
            responders = alert.total_responders,
            "notifying first responder batch"
        );
        Ok(())
    }

    async fn batch_widened(&self, alert: &Alert) -> Result<(), CoreError> {
        info!(
            alert_id = %alert.id,
            batch = alert.current_batch,
            responders = alert.total_responders,
            "notifying widened responder batch"
        );
        Ok(())
    }

    async fn emergency_escalated(&self, alert: &Alert) -> Result<(), CoreError> {
        warn!(alert_id = %alert.id, "escalating to emergency services");
        Ok(())
    }

    async fn call_requested(&self, alert: &Alert, target: CallTarget) -> Result<(), CoreError> {
        match target {
            CallTarget::EmergencyServices => {
                warn!(alert_id = %alert.id, "call prompt: emergency services")
            }
            CallTarget::PrimaryContact { number } => {
                info!(alert_id = %alert.id, number = %number, "call prompt: primary contact")
            }
        }
        Ok(())
    }
}

/// A recorded gateway invocation, for asserting delivery decisions in tests.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum GatewayCall {
    Raised(crate::types::AlertId),
    Widened {
        alert: crate::types::AlertId,
        batch: u32,
    },
    Emergency(crate::types::AlertId),
    CallPrompt {
        alert: crate::types::AlertId,
        target: CallTarget,
    },
}

/// Gateway that records every invocation.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingGateway {
    calls: std::sync::Mutex<Vec<GatewayCall>>,
}

#[cfg(test)]
impl RecordingGateway {
    pub(crate) fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn alert_raised(&self, alert: &Alert) -> Result<(), CoreError> {
        self.calls.lock().unwrap().push(GatewayCall::Raised(alert.id));
        Ok(())
    }

    async fn batch_widened(&self, alert: &Alert) -> Result<(), CoreError> {
        self.calls.lock().unwrap().push(GatewayCall::Widened {
            alert: alert.id,
            batch: alert.current_batch,
        });
        Ok(())
    }

    async fn emergency_escalated(&self, alert: &Alert) -> Result<(), CoreError> {
        self.calls
            .lock()
            .unwrap()
            .push(GatewayCall::Emergency(alert.id));
        Ok(())
    }

    async fn call_requested(&self, alert: &Alert, target: CallTarget) -> Result<(), CoreError> {
        self.calls.lock().unwrap().push(GatewayCall::CallPrompt {
            alert: alert.id,
            target,
        });
        Ok(())
    }
}
