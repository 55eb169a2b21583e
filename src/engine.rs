//! The engine facade
//!
//! [`SafetyEngine`] is the single entry point the embedding shell talks to.
//! It wires the alert store, response ledger, escalation scheduler, and
//! journey monitor together for one authenticated user, and enforces the
//! role rules: only seekers raise alerts and start journeys.
//!
//! A journey's pre-alarm funnels into the same alert path as the manual
//! trigger, so an automatically raised alert escalates exactly like one the
//! seeker raised by hand.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::error::CoreError;
use crate::escalation::{EscalationPolicy, EscalationScheduler};
use crate::gateway::{CallTarget, NotificationGateway};
use crate::journey::{DistressTrigger, JourneyConfig, JourneyHandle, JourneyMonitor, JourneyStatus};
use crate::ledger::ResponseLedger;
use crate::location::LocationProvider;
use crate::store::{AlertPatch, AlertStore};
use crate::types::{
    Alert, AlertEvent, AlertId, AlertResponse, AlertStatus, Destination, GeoPoint, ResponseAction,
    Role, UserId, UserProfile,
};

/// Title of a manually raised distress alert
pub const MANUAL_ALERT_TITLE: &str = "Distress alert";

/// Title of an alert raised automatically by journey inactivity
pub const INACTIVITY_ALERT_TITLE: &str = "Inactivity alert";

const MANUAL_ALERT_DESCRIPTION: &str = "Raised manually from the safety screen.";

/// Alert lifecycle and journey monitoring engine for one authenticated user.
pub struct SafetyEngine {
    inner: Arc<EngineInner>,
    journey: Mutex<Option<JourneyHandle>>,
}

struct EngineInner {
    user: UserProfile,
    store: Arc<AlertStore>,
    ledger: Arc<ResponseLedger>,
    gateway: Arc<dyn NotificationGateway>,
    location: Arc<dyn LocationProvider>,
    scheduler: EscalationScheduler,
    policy: EscalationPolicy,
    journey_config: JourneyConfig,
}

impl SafetyEngine {
    /// Engine with default escalation and journey timing.
    pub fn new(
        user: UserProfile,
        location: Arc<dyn LocationProvider>,
        gateway: Arc<dyn NotificationGateway>,
    ) -> Self {
        Self::with_config(
            user,
            location,
            gateway,
            EscalationPolicy::default(),
            JourneyConfig::default(),
        )
    }

    pub fn with_config(
        user: UserProfile,
        location: Arc<dyn LocationProvider>,
        gateway: Arc<dyn NotificationGateway>,
        policy: EscalationPolicy,
        journey_config: JourneyConfig,
    ) -> Self {
        let store = Arc::new(AlertStore::new());
        let ledger = Arc::new(ResponseLedger::new());
        let scheduler = EscalationScheduler::new(
            store.clone(),
            ledger.clone(),
            gateway.clone(),
            policy.clone(),
        );
        Self {
            inner: Arc::new(EngineInner {
                user,
                store,
                ledger,
                gateway,
                location,
                scheduler,
                policy,
                journey_config,
            }),
            journey: Mutex::new(None),
        }
    }

    /// Raise a distress alert at the current position.
    ///
    /// Location failures surface here, synchronously: the caller must know
    /// the alert did not go out.
    pub async fn trigger_alert(&self) -> Result<Alert, CoreError> {
        let fix = self.inner.location.current_position().await?;
        self.inner
            .raise_alert(
                fix.point(),
                MANUAL_ALERT_TITLE,
                MANUAL_ALERT_DESCRIPTION.to_string(),
            )
            .await
    }

    /// Raise a distress alert at a caller-supplied position.
    pub async fn trigger_alert_at(&self, location: GeoPoint) -> Result<Alert, CoreError> {
        self.inner
            .raise_alert(
                location,
                MANUAL_ALERT_TITLE,
                MANUAL_ALERT_DESCRIPTION.to_string(),
            )
            .await
    }

    /// Record a responder action against an alert.
    ///
    /// A committed response ([`ResponseAction::Respond`]) moves the alert to
    /// acknowledged and thereby halts escalation; an acknowledgement is
    /// informational only. Actions against resolved alerts are rejected.
    pub async fn respond_to_alert(
        &self,
        alert_id: AlertId,
        responder_id: UserId,
        action: ResponseAction,
    ) -> Result<AlertResponse, CoreError> {
        let alert = self.inner.store.get(alert_id).await?;
        if alert.status.is_terminal() {
            return Err(CoreError::ResponseTargetResolved(alert_id));
        }

        let entry = self.inner.ledger.append(alert_id, responder_id, action).await;

        if action.commits_responder() && alert.status == AlertStatus::Active {
            match self
                .inner
                .store
                .update(
                    alert_id,
                    AlertPatch::new().with_status(AlertStatus::Acknowledged),
                )
                .await
            {
                Ok(_) => info!(alert_id = %alert_id, "alert acknowledged by committed responder"),
                // Resolved while we were appending; the store guard kept the
                // final status and the ledger entry still stands.
                Err(CoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(entry)
    }

    /// Close an alert. Terminal; escalation for it stops.
    pub async fn resolve_alert(&self, alert_id: AlertId) -> Result<Alert, CoreError> {
        let resolved = self
            .inner
            .store
            .update(alert_id, AlertPatch::new().with_status(AlertStatus::Resolved))
            .await?;
        // Resolve first, cancel second: even if cancellation were lost, the
        // next tick's status check would end the chain.
        self.inner.scheduler.cancel(alert_id).await;
        info!(alert_id = %alert_id, "alert resolved");
        Ok(resolved)
    }

    /// Start monitoring a journey. One journey at a time per engine.
    pub async fn start_journey(&self, destination: Destination) -> Result<(), CoreError> {
        if self.inner.user.role != Role::Seeker {
            return Err(CoreError::NotSeeker);
        }
        let target = GeoPoint::new(destination.latitude, destination.longitude);
        if !target.is_valid() {
            return Err(CoreError::InvalidCoordinates {
                latitude: destination.latitude,
                longitude: destination.longitude,
            });
        }

        let mut slot = self.journey.lock().await;
        if let Some(handle) = slot.as_ref() {
            if handle.is_live() {
                return Err(CoreError::JourneyAlreadyActive);
            }
        }

        let trigger: Arc<dyn DistressTrigger> = Arc::new(EngineTrigger {
            inner: self.inner.clone(),
        });
        let handle = JourneyMonitor::start(
            destination,
            self.inner.location.clone(),
            trigger,
            self.inner.journey_config.clone(),
        )
        .await?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stop the active journey.
    pub async fn stop_journey(&self) -> Result<(), CoreError> {
        let handle = self
            .journey
            .lock()
            .await
            .take()
            .ok_or(CoreError::JourneyNotActive)?;
        let final_status = handle.stop().await;
        info!(phase = ?final_status.phase, "journey monitoring stopped");
        Ok(())
    }

    /// Manual movement override for the active journey.
    pub async fn update_movement(&self, has_movement: bool) -> Result<(), CoreError> {
        match self.journey.lock().await.as_ref() {
            Some(handle) => handle.force_movement(has_movement).await,
            None => Err(CoreError::JourneyNotActive),
        }
    }

    /// Status of the monitored journey, or the inactive snapshot.
    pub async fn journey_status(&self) -> JourneyStatus {
        match self.journey.lock().await.as_ref() {
            Some(handle) => handle.status(),
            None => JourneyStatus::inactive(),
        }
    }

    /// All alerts known to this engine, newest first.
    pub async fn alerts(&self) -> Vec<Alert> {
        self.inner.store.list().await
    }

    pub async fn alert(&self, alert_id: AlertId) -> Result<Alert, CoreError> {
        self.inner.store.get(alert_id).await
    }

    /// Responder actions recorded for an alert, oldest first.
    pub async fn responses(&self, alert_id: AlertId) -> Vec<AlertResponse> {
        self.inner.ledger.list(alert_id).await
    }

    /// Subscribe to alert create/update events.
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.inner.store.subscribe()
    }

    /// Stop the journey monitor and all escalation chains. Alert records
    /// survive; only the background work stops.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.journey.lock().await.take() {
            handle.stop().await;
        }
        self.inner.scheduler.cancel_all().await;
        info!("engine shut down");
    }
}

impl EngineInner {
    async fn raise_alert(
        &self,
        location: GeoPoint,
        title: &str,
        description: String,
    ) -> Result<Alert, CoreError> {
        if self.user.role != Role::Seeker {
            return Err(CoreError::NotSeeker);
        }

        let mut alert = Alert::new(self.user.id.clone(), title, description, location);
        self.policy.arm_first_batch(&mut alert);
        let stored = self.store.create(alert).await?;
        info!(
            alert_id = %stored.id,
            batch = stored.current_batch,
            responders = stored.total_responders,
            "distress alert raised"
        );

        if let Err(e) = self.gateway.alert_raised(&stored).await {
            warn!(alert_id = %stored.id, error = %e, "first batch notification failed");
        }
        self.scheduler.watch(stored.id).await;
        Ok(stored)
    }
}

/// Journey-side trigger that funnels a pre-alarm expiry into the alert path.
struct EngineTrigger {
    inner: Arc<EngineInner>,
}

#[async_trait]
impl DistressTrigger for EngineTrigger {
    async fn trigger(
        &self,
        location: Option<GeoPoint>,
        destination: &Destination,
    ) -> Result<(), CoreError> {
        // Best-known position: last watched fix, then a fresh one-shot, and
        // as a last resort the destination itself. The alert must go out
        // even when location data has gone quiet along with the traveller.
        let point = match location {
            Some(point) => point,
            None => match self.inner.location.current_position().await {
                Ok(fix) => fix.point(),
                Err(e) => {
                    warn!(error = %e, "no position for inactivity alert; using destination");
                    GeoPoint::new(destination.latitude, destination.longitude)
                }
            },
        };

        let description = format!(
            "No movement detected on the way to {}; the pre-alarm countdown expired without a response.",
            destination.name
        );
        let alert = self
            .inner
            .raise_alert(point, INACTIVITY_ALERT_TITLE, description)
            .await?;

        if let Some(number) = &self.inner.user.primary_contact {
            if let Err(e) = self
                .inner
                .gateway
                .call_requested(
                    &alert,
                    CallTarget::PrimaryContact {
                        number: number.clone(),
                    },
                )
                .await
            {
                warn!(alert_id = %alert.id, error = %e, "primary contact call prompt failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayCall, RecordingGateway};
    use crate::journey::JourneyPhase;
    use crate::location::HostLocationProvider;
    use crate::types::{PositionFix, TransportMode};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time;

    struct Harness {
        engine: SafetyEngine,
        provider: HostLocationProvider,
        gateway: Arc<RecordingGateway>,
    }

    fn seeker_harness() -> Harness {
        harness_for(UserProfile::seeker("seeker-1").with_primary_contact("+49 151 555 0100"))
    }

    fn harness_for(user: UserProfile) -> Harness {
        let provider = HostLocationProvider::with_position(52.520008, 13.404954);
        let gateway = Arc::new(RecordingGateway::default());
        let engine = SafetyEngine::new(user, Arc::new(provider.clone()), gateway.clone());
        Harness {
            engine,
            provider,
            gateway,
        }
    }

    fn walk_destination() -> Destination {
        Destination::new("Cafe Kotti", 52.4990, 13.4180, TransportMode::Walk)
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_alert_arms_first_batch() {
        let h = seeker_harness();

        let alert = h.engine.trigger_alert().await.unwrap();
        assert_eq!(alert.title, MANUAL_ALERT_TITLE);
        assert_eq!(alert.owner, UserId::new("seeker-1"));
        assert_eq!(alert.status, AlertStatus::Active);
        assert_eq!(alert.current_batch, 1);
        assert_eq!(alert.total_responders, 10);
        assert!((alert.location.latitude - 52.520008).abs() < 1e-9);

        let stored = h.engine.alert(alert.id).await.unwrap();
        assert_eq!(stored, alert);
        assert_eq!(h.gateway.calls(), vec![GatewayCall::Raised(alert.id)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_requires_seeker_role() {
        let h = harness_for(UserProfile::responder("responder-1"));
        assert!(matches!(
            h.engine.trigger_alert().await,
            Err(CoreError::NotSeeker)
        ));
        assert!(matches!(
            h.engine.start_journey(walk_destination()).await,
            Err(CoreError::NotSeeker)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_surfaces_location_failures() {
        let provider = HostLocationProvider::new();
        let engine = SafetyEngine::new(
            UserProfile::seeker("seeker-1"),
            Arc::new(provider.clone()),
            Arc::new(RecordingGateway::default()),
        );

        assert!(matches!(
            engine.trigger_alert().await,
            Err(CoreError::LocationUnavailable(_))
        ));

        provider.deny_permission().await;
        assert!(matches!(
            engine.trigger_alert().await,
            Err(CoreError::PermissionDenied)
        ));
        assert!(matches!(
            engine.start_journey(walk_destination()).await,
            Err(CoreError::PermissionDenied)
        ));
        assert_eq!(engine.journey_status().await.phase, JourneyPhase::Inactive);
        assert!(engine.alerts().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_committed_response_acknowledges_and_halts_escalation() {
        let h = seeker_harness();
        let alert = h.engine.trigger_alert().await.unwrap();

        time::sleep(Duration::from_secs(30)).await;
        h.engine
            .respond_to_alert(alert.id, UserId::new("responder-7"), ResponseAction::Respond)
            .await
            .unwrap();
        assert_eq!(
            h.engine.alert(alert.id).await.unwrap().status,
            AlertStatus::Acknowledged
        );

        // A second commitment is fine; the status patch is a no-op
        h.engine
            .respond_to_alert(alert.id, UserId::new("responder-9"), ResponseAction::Respond)
            .await
            .unwrap();
        assert_eq!(h.engine.responses(alert.id).await.len(), 2);

        // Past the first response deadline: no widening happened
        time::sleep(Duration::from_secs(95)).await;
        assert_eq!(h.engine.alert(alert.id).await.unwrap().current_batch, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledgement_leaves_escalation_running() {
        let h = seeker_harness();
        let alert = h.engine.trigger_alert().await.unwrap();

        time::sleep(Duration::from_secs(30)).await;
        h.engine
            .respond_to_alert(
                alert.id,
                UserId::new("responder-7"),
                ResponseAction::Acknowledge,
            )
            .await
            .unwrap();
        assert_eq!(
            h.engine.alert(alert.id).await.unwrap().status,
            AlertStatus::Active
        );

        time::sleep(Duration::from_secs(95)).await;
        assert_eq!(h.engine.alert(alert.id).await.unwrap().current_batch, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responding_to_resolved_alert_fails() {
        let h = seeker_harness();
        let alert = h.engine.trigger_alert().await.unwrap();
        h.engine.resolve_alert(alert.id).await.unwrap();

        assert!(matches!(
            h.engine
                .respond_to_alert(alert.id, UserId::new("responder-7"), ResponseAction::Respond)
                .await,
            Err(CoreError::ResponseTargetResolved(_))
        ));
        assert!(matches!(
            h.engine
                .respond_to_alert(AlertId::new(), UserId::new("responder-7"), ResponseAction::Respond)
                .await,
            Err(CoreError::AlertNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_stops_escalation() {
        let h = seeker_harness();
        let alert = h.engine.trigger_alert().await.unwrap();

        time::sleep(Duration::from_secs(60)).await;
        let resolved = h.engine.resolve_alert(alert.id).await.unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);

        time::sleep(Duration::from_secs(65)).await;
        let current = h.engine.alert(alert.id).await.unwrap();
        assert_eq!(current.current_batch, 1);
        assert_eq!(current.status, AlertStatus::Resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_journey_pre_alarm_raises_inactivity_alert() {
        let h = seeker_harness();
        h.engine.start_journey(walk_destination()).await.unwrap();

        // 120 s walking threshold + 60 s pre-alarm, no movement at all
        time::sleep(Duration::from_secs(185)).await;

        assert_eq!(h.engine.journey_status().await.phase, JourneyPhase::Escalated);
        let alerts = h.engine.alerts().await;
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.title, INACTIVITY_ALERT_TITLE);
        assert_eq!(alert.owner, UserId::new("seeker-1"));
        assert!(alert.description.contains("Cafe Kotti"));

        // The primary contact call prompt went out alongside the fan-out
        assert!(h.gateway.calls().contains(&GatewayCall::CallPrompt {
            alert: alert.id,
            target: CallTarget::PrimaryContact {
                number: "+49 151 555 0100".into(),
            },
        }));

        // The automatic alert escalates like any other
        time::sleep(Duration::from_secs(125)).await;
        assert_eq!(h.engine.alert(alert.id).await.unwrap().current_batch, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_moving_traveller_never_escalates() {
        let h = seeker_harness();
        h.engine.start_journey(walk_destination()).await.unwrap();

        // Real displacement every 30 s, well past threshold + countdown
        let mut latitude = 52.5000;
        for _ in 0..7 {
            time::sleep(Duration::from_secs(30)).await;
            latitude += 0.0005; // ~55 m
            h.provider.push_fix(PositionFix::new(latitude, 13.4100)).await;
        }

        assert_eq!(h.engine.journey_status().await.phase, JourneyPhase::Moving);
        assert!(h.engine.alerts().await.is_empty());
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_alert_falls_back_to_destination() {
        // Provider grants permission but never produces a fix
        let provider = HostLocationProvider::new();
        let engine = SafetyEngine::new(
            UserProfile::seeker("seeker-1"),
            Arc::new(provider),
            Arc::new(RecordingGateway::default()),
        );
        engine.start_journey(walk_destination()).await.unwrap();

        time::sleep(Duration::from_secs(185)).await;

        let alerts = engine.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert!((alerts[0].location.latitude - 52.4990).abs() < 1e-9);
        assert!((alerts[0].location.longitude - 13.4180).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_journey_at_a_time() {
        let h = seeker_harness();

        assert!(matches!(
            h.engine.stop_journey().await,
            Err(CoreError::JourneyNotActive)
        ));
        assert!(matches!(
            h.engine.update_movement(true).await,
            Err(CoreError::JourneyNotActive)
        ));

        h.engine.start_journey(walk_destination()).await.unwrap();
        assert!(matches!(
            h.engine.start_journey(walk_destination()).await,
            Err(CoreError::JourneyAlreadyActive)
        ));

        h.engine.stop_journey().await.unwrap();
        assert_eq!(h.engine.journey_status().await.phase, JourneyPhase::Inactive);
        h.engine.start_journey(walk_destination()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_movement_defers_pre_alarm() {
        let h = seeker_harness();
        h.engine.start_journey(walk_destination()).await.unwrap();

        time::sleep(Duration::from_secs(121)).await;
        assert_eq!(h.engine.journey_status().await.phase, JourneyPhase::PreAlarm);

        h.engine.update_movement(true).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.engine.journey_status().await.phase, JourneyPhase::Moving);

        // Forcing an evaluation without movement changes nothing mid-window
        h.engine.update_movement(false).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.engine.journey_status().await.phase, JourneyPhase::Moving);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_streams_engine_events() {
        let h = seeker_harness();
        let mut events = h.engine.subscribe();

        let alert = h.engine.trigger_alert().await.unwrap();
        match events.try_recv().unwrap() {
            AlertEvent::Created(created) => assert_eq!(created.id, alert.id),
            other => panic!("expected Created, got {other:?}"),
        }

        time::sleep(Duration::from_secs(125)).await;
        match events.try_recv().unwrap() {
            AlertEvent::Updated(updated) => assert_eq!(updated.current_batch, 2),
            other => panic!("expected Updated, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_background_work() {
        let h = seeker_harness();
        let alert = h.engine.trigger_alert().await.unwrap();
        h.engine.start_journey(walk_destination()).await.unwrap();

        h.engine.shutdown().await;
        assert_eq!(h.engine.journey_status().await.phase, JourneyPhase::Inactive);

        // No escalation ticks run after shutdown
        time::sleep(Duration::from_secs(125)).await;
        let current = h.engine.alert(alert.id).await.unwrap();
        assert_eq!(current.current_batch, 1);

        // Records survive; the store itself is untouched
        assert_eq!(h.engine.alerts().await.len(), 1);
    }
}
