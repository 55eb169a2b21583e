//! Append-only ledger of responder actions
//!
//! Every acknowledge/respond action lands here as an immutable entry with a
//! ledger-assigned timestamp. Entries are never updated or removed; the
//! escalation scheduler reads the ledger to decide whether a responder has
//! committed to a case.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{AlertId, AlertResponse, ResponseAction, ResponseId, UserId};

/// Per-alert log of responder actions.
pub struct ResponseLedger {
    entries: RwLock<HashMap<AlertId, Vec<AlertResponse>>>,
}

impl ResponseLedger {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record a responder action. The ledger assigns the entry id and
    /// timestamp, so entries within one alert are ordered by arrival.
    pub async fn append(
        &self,
        alert_id: AlertId,
        responder_id: UserId,
        action: ResponseAction,
    ) -> AlertResponse {
        let entry = AlertResponse {
            id: ResponseId::new(),
            alert_id,
            responder_id,
            action,
            timestamp: Utc::now(),
        };
        self.entries
            .write()
            .await
            .entry(alert_id)
            .or_default()
            .push(entry.clone());
        debug!(
            alert_id = %alert_id,
            responder = %entry.responder_id,
            action = action.as_str(),
            "responder action recorded"
        );
        entry
    }

    /// All recorded actions for an alert, oldest first.
    pub async fn list(&self, alert_id: AlertId) -> Vec<AlertResponse> {
        self.entries
            .read()
            .await
            .get(&alert_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any responder has committed to this alert. A bare
    /// acknowledgement does not count.
    pub async fn has_committed_response(&self, alert_id: AlertId) -> bool {
        self.entries
            .read()
            .await
            .get(&alert_id)
            .map(|entries| entries.iter().any(|e| e.action.commits_responder()))
            .unwrap_or(false)
    }
}

impl Default for ResponseLedger {
    fn default() -> Self {
        Self::new()
    }
}
