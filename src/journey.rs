//! Journey inactivity monitoring
//!
//! A monitored journey watches the traveller's position stream and keeps a
//! small state machine: moving while samples keep arriving with real
//! displacement, stationary once the per-mode threshold passes without
//! movement, then a pre-alarm countdown, and finally an automatic distress
//! alert if the countdown expires untouched. Any detected movement during
//! the countdown cancels it and re-arms the cycle.
//!
//! The monitor runs as a spawned actor that owns its position watch. It is
//! driven by three inputs: position fixes, a once-per-second inactivity
//! ticker, and a cancellation token held by [`JourneyHandle`]. Dropping the
//! handle cancels the actor, so an abandoned journey can never keep a
//! platform location watcher alive.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::error::CoreError;
use crate::location::{LocationProvider, PositionWatch};
use crate::movement::{MovementClassifier, MINIMAL_MOVEMENT_METERS};
use crate::types::{Destination, GeoPoint, PositionFix};

/// Timing knobs of the journey state machine.
#[derive(Debug, Clone)]
pub struct JourneyConfig {
    /// Countdown between the inactivity warning and the automatic alert
    pub pre_alarm_countdown: Duration,
    /// Cadence of the inactivity checker
    pub check_interval: Duration,
    /// Displacement below this counts as GPS jitter, not travel
    pub min_movement_meters: f64,
    /// Overrides the per-mode stationary threshold (demo and test flows)
    pub stationary_threshold_override: Option<Duration>,
}

impl Default for JourneyConfig {
    fn default() -> Self {
        Self {
            pre_alarm_countdown: Duration::from_secs(60),
            check_interval: Duration::from_secs(1),
            min_movement_meters: MINIMAL_MOVEMENT_METERS,
            stationary_threshold_override: None,
        }
    }
}

/// Where the journey state machine currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyPhase {
    /// No journey is being monitored
    Inactive,
    /// Movement observed within the allowed window
    Moving,
    /// Threshold crossed; the next checker pass arms the pre-alarm
    Stationary,
    /// Pre-alarm countdown running
    PreAlarm,
    /// The countdown expired and a distress alert was raised; terminal
    Escalated,
}

impl JourneyPhase {
    /// True while the monitor is still watching the traveller.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            JourneyPhase::Moving | JourneyPhase::Stationary | JourneyPhase::PreAlarm
        )
    }
}

/// Snapshot of a monitored journey, shaped for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyStatus {
    pub phase: JourneyPhase,
    pub destination: Option<Destination>,
    pub started_at: Option<DateTime<Utc>>,
    /// Milliseconds since the last detected movement
    pub stationary_for_ms: u64,
    /// One-shot flag: the pre-alarm fired for the current stationary episode
    pub pre_alarm_triggered: bool,
    /// Milliseconds left on the running countdown, if one is running
    pub pre_alarm_remaining_ms: Option<u64>,
}

impl JourneyStatus {
    /// Status reported when no journey is monitored.
    pub fn inactive() -> Self {
        Self {
            phase: JourneyPhase::Inactive,
            destination: None,
            started_at: None,
            stationary_for_ms: 0,
            pre_alarm_triggered: false,
            pre_alarm_remaining_ms: None,
        }
    }
}

/// Sink for the automatic distress trigger when a pre-alarm expires.
#[async_trait]
pub trait DistressTrigger: Send + Sync {
    /// Raise the distress alert. `location` is the last watched fix, if the
    /// stream produced any before the traveller went quiet.
    async fn trigger(
        &self,
        location: Option<GeoPoint>,
        destination: &Destination,
    ) -> Result<(), CoreError>;
}

enum MonitorCommand {
    /// `true` injects a movement signal; `false` forces an immediate
    /// inactivity evaluation.
    ForceMovement(bool),
}

/// Owned handle to a running journey monitor.
///
/// Dropping the handle cancels the monitor; [`JourneyHandle::stop`] does the
/// same but waits for the actor to wind down and returns the final status.
pub struct JourneyHandle {
    cancel: CancellationToken,
    _guard: DropGuard,
    task: Option<JoinHandle<()>>,
    status_rx: watch::Receiver<JourneyStatus>,
    commands: mpsc::Sender<MonitorCommand>,
}

impl JourneyHandle {
    /// Latest published status.
    pub fn status(&self) -> JourneyStatus {
        self.status_rx.borrow().clone()
    }

    /// Whether the monitor is still watching (not stopped or escalated).
    pub fn is_live(&self) -> bool {
        self.status().phase.is_live()
    }

    /// Manual movement override from the shell.
    pub async fn force_movement(&self, has_movement: bool) -> Result<(), CoreError> {
        self.commands
            .send(MonitorCommand::ForceMovement(has_movement))
            .await
            .map_err(|_| CoreError::JourneyNotActive)
    }

    /// Stop monitoring and wait for the actor to finish.
    pub async fn stop(mut self) -> JourneyStatus {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.status_rx.borrow().clone()
    }
}

/// The journey monitoring actor. Constructed and spawned via
/// [`JourneyMonitor::start`]; all interaction goes through the handle.
pub struct JourneyMonitor {
    destination: Destination,
    config: JourneyConfig,
    stationary_threshold: Duration,
    classifier: MovementClassifier,
    trigger: Arc<dyn DistressTrigger>,
    status_tx: watch::Sender<JourneyStatus>,
    started_at: DateTime<Utc>,
    last_fix: Option<PositionFix>,
    pre_alarm_triggered: bool,
    pre_alarm_deadline: Option<Instant>,
    escalated: bool,
}

impl JourneyMonitor {
    /// Acquire a position watch and spawn the monitor.
    ///
    /// Acquisition failures (permission, availability) surface here, before
    /// anything is spawned, so a journey never starts half-monitored.
    pub async fn start(
        destination: Destination,
        provider: Arc<dyn LocationProvider>,
        trigger: Arc<dyn DistressTrigger>,
        config: JourneyConfig,
    ) -> Result<JourneyHandle, CoreError> {
        let positions = provider.watch_position().await?;

        let stationary_threshold = config
            .stationary_threshold_override
            .unwrap_or_else(|| destination.mode.stationary_threshold());
        let now = Instant::now();
        let started_at = Utc::now();

        info!(
            destination = %destination.name,
            mode = destination.mode.as_str(),
            threshold_secs = stationary_threshold.as_secs(),
            "journey monitoring started"
        );

        let initial = JourneyStatus {
            phase: JourneyPhase::Moving,
            destination: Some(destination.clone()),
            started_at: Some(started_at),
            stationary_for_ms: 0,
            pre_alarm_triggered: false,
            pre_alarm_remaining_ms: None,
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let monitor = JourneyMonitor {
            classifier: MovementClassifier::new(now).with_min_movement(config.min_movement_meters),
            destination,
            config,
            stationary_threshold,
            trigger,
            status_tx,
            started_at,
            last_fix: None,
            pre_alarm_triggered: false,
            pre_alarm_deadline: None,
            escalated: false,
        };
        let task = tokio::spawn(monitor.run(positions, commands_rx, cancel.clone()));

        Ok(JourneyHandle {
            _guard: cancel.clone().drop_guard(),
            cancel,
            task: Some(task),
            status_rx,
            commands: commands_tx,
        })
    }

    async fn run(
        mut self,
        mut positions: PositionWatch,
        mut commands: mpsc::Receiver<MonitorCommand>,
        cancel: CancellationToken,
    ) {
        let mut ticker = time::interval(self.config.check_interval);
        // After an app suspension we want one fresh evaluation, not a burst
        // of catch-up ticks.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stream_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("journey monitor stopped");
                    self.status_tx.send_replace(JourneyStatus::inactive());
                    break;
                }
                maybe_fix = positions.next(), if stream_open => {
                    match maybe_fix {
                        Some(fix) => self.on_fix(fix),
                        None => {
                            // A starved stream must not mask an emergency:
                            // the ticker keeps evaluating stale state, which
                            // reads as stationary.
                            warn!("position stream closed; evaluating on stale movement state");
                            stream_open = false;
                        }
                    }
                }
                Some(command) = commands.recv() => {
                    if self.on_command(command).await {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.evaluate(Instant::now()).await {
                        break;
                    }
                }
            }
        }
    }

    fn on_fix(&mut self, fix: PositionFix) {
        let now = Instant::now();
        if self.classifier.observe(fix.latitude, fix.longitude, now) {
            self.movement_resumed();
        }
        self.last_fix = Some(fix);
        self.publish(now);
    }

    /// Returns true when the monitor is done (pre-alarm fired).
    async fn on_command(&mut self, command: MonitorCommand) -> bool {
        let now = Instant::now();
        match command {
            MonitorCommand::ForceMovement(true) => {
                self.classifier.mark_movement(now);
                self.movement_resumed();
                self.publish(now);
                false
            }
            MonitorCommand::ForceMovement(false) => self.evaluate(now).await,
        }
    }

    fn movement_resumed(&mut self) {
        if self.pre_alarm_deadline.take().is_some() {
            info!("movement resumed; pre-alarm countdown cancelled");
        }
        self.pre_alarm_triggered = false;
    }

    /// One pass of the inactivity checker. Returns true when the pre-alarm
    /// fired and the monitor is done.
    async fn evaluate(&mut self, now: Instant) -> bool {
        if let Some(deadline) = self.pre_alarm_deadline {
            if now >= deadline {
                return self.fire_pre_alarm(now).await;
            }
        } else if !self.pre_alarm_triggered
            && self.classifier.is_stationary(now, self.stationary_threshold)
        {
            self.pre_alarm_triggered = true;
            self.pre_alarm_deadline = Some(now + self.config.pre_alarm_countdown);
            warn!(
                stationary_secs = self.classifier.stationary_for(now).as_secs(),
                countdown_secs = self.config.pre_alarm_countdown.as_secs(),
                "no movement past threshold; pre-alarm countdown started"
            );
        }
        self.publish(now);
        false
    }

    async fn fire_pre_alarm(&mut self, now: Instant) -> bool {
        self.pre_alarm_deadline = None;
        self.escalated = true;
        warn!(
            destination = %self.destination.name,
            "pre-alarm expired with no movement; raising distress alert"
        );

        let location = self.last_fix.as_ref().map(PositionFix::point);
        if let Err(e) = self.trigger.trigger(location, &self.destination).await {
            // The journey still ends in the escalated phase so the UI shows
            // that something went wrong loudly, not silently.
            error!(error = %e, "automatic distress trigger failed");
        }
        self.publish(now);
        true
    }

    fn phase(&self, now: Instant) -> JourneyPhase {
        if self.escalated {
            JourneyPhase::Escalated
        } else if self.pre_alarm_deadline.is_some() {
            JourneyPhase::PreAlarm
        } else if self.classifier.is_stationary(now, self.stationary_threshold) {
            JourneyPhase::Stationary
        } else {
            JourneyPhase::Moving
        }
    }

    fn publish(&self, now: Instant) {
        self.status_tx.send_replace(JourneyStatus {
            phase: self.phase(now),
            destination: Some(self.destination.clone()),
            started_at: Some(self.started_at),
            stationary_for_ms: self.classifier.stationary_for(now).as_millis() as u64,
            pre_alarm_triggered: self.pre_alarm_triggered,
            pre_alarm_remaining_ms: self
                .pre_alarm_deadline
                .map(|deadline| deadline.duration_since(now).as_millis() as u64),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::HostLocationProvider;
    use crate::types::TransportMode;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingTrigger {
        fired: Mutex<Vec<(Option<GeoPoint>, String)>>,
    }

    impl CountingTrigger {
        fn fired(&self) -> Vec<(Option<GeoPoint>, String)> {
            self.fired.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DistressTrigger for CountingTrigger {
        async fn trigger(
            &self,
            location: Option<GeoPoint>,
            destination: &Destination,
        ) -> Result<(), CoreError> {
            self.fired
                .lock()
                .unwrap()
                .push((location, destination.name.clone()));
            Ok(())
        }
    }

    fn walk_destination() -> Destination {
        Destination::new("Cafe Kotti", 52.4990, 13.4180, TransportMode::Walk)
    }

    struct TestJourney {
        provider: HostLocationProvider,
        trigger: Arc<CountingTrigger>,
        handle: JourneyHandle,
    }

    async fn start_walk_journey(config: JourneyConfig) -> TestJourney {
        let provider = HostLocationProvider::new();
        let trigger = Arc::new(CountingTrigger::default());
        let handle = JourneyMonitor::start(
            walk_destination(),
            Arc::new(provider.clone()),
            trigger.clone(),
            config,
        )
        .await
        .unwrap();
        TestJourney {
            provider,
            trigger,
            handle,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_alarm_arms_at_mode_threshold() {
        let journey = start_walk_journey(JourneyConfig::default()).await;

        // Just under the 120 s walking threshold: still counts as moving
        time::sleep(Duration::from_secs(119)).await;
        let status = journey.handle.status();
        assert_eq!(status.phase, JourneyPhase::Moving);
        assert!(!status.pre_alarm_triggered);

        // Crossing it arms the 60 s countdown
        time::sleep(Duration::from_secs(2)).await;
        let status = journey.handle.status();
        assert_eq!(status.phase, JourneyPhase::PreAlarm);
        assert!(status.pre_alarm_triggered);
        let remaining = status.pre_alarm_remaining_ms.unwrap();
        assert!(remaining <= 60_000, "remaining {remaining}");
        assert!(journey.trigger.fired().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_movement_during_countdown_cancels_pre_alarm() {
        let journey = start_walk_journey(JourneyConfig::default()).await;

        // t=121: countdown running
        time::sleep(Duration::from_secs(121)).await;
        assert_eq!(journey.handle.status().phase, JourneyPhase::PreAlarm);

        // t=150: the traveller moves again
        time::sleep(Duration::from_secs(29)).await;
        journey
            .provider
            .push_fix(PositionFix::new(52.5010, 13.4100))
            .await;
        time::sleep(Duration::from_millis(50)).await;

        let status = journey.handle.status();
        assert_eq!(status.phase, JourneyPhase::Moving);
        assert!(!status.pre_alarm_triggered);
        assert_eq!(status.pre_alarm_remaining_ms, None);

        // The cycle re-arms: quiet again for threshold + countdown fires it
        time::sleep(Duration::from_secs(185)).await;
        assert_eq!(journey.handle.status().phase, JourneyPhase::Escalated);
        assert_eq!(journey.trigger.fired().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_countdown_fires_trigger_with_last_fix() {
        let journey = start_walk_journey(JourneyConfig::default()).await;

        journey
            .provider
            .push_fix(PositionFix::new(52.5005, 13.4120))
            .await;
        time::sleep(Duration::from_millis(50)).await;

        // Threshold at ~120 s after the fix, countdown for another 60 s
        time::sleep(Duration::from_secs(185)).await;

        let status = journey.handle.status();
        assert_eq!(status.phase, JourneyPhase::Escalated);
        assert!(!status.phase.is_live());

        let fired = journey.trigger.fired();
        assert_eq!(fired.len(), 1);
        let (location, destination) = &fired[0];
        assert_eq!(destination, "Cafe Kotti");
        let location = location.as_ref().unwrap();
        assert!((location.latitude - 52.5005).abs() < 1e-9);

        // The actor has exited; the command channel is gone
        assert!(matches!(
            journey.handle.force_movement(true).await,
            Err(CoreError::JourneyNotActive)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_movement_never_arms_pre_alarm() {
        let journey = start_walk_journey(JourneyConfig::default()).await;

        // A fix with real displacement every 30 s for four minutes
        let mut latitude = 52.5000;
        for _ in 0..8 {
            time::sleep(Duration::from_secs(30)).await;
            latitude += 0.0005; // ~55 m
            journey
                .provider
                .push_fix(PositionFix::new(latitude, 13.4100))
                .await;
        }

        let status = journey.handle.status();
        assert_eq!(status.phase, JourneyPhase::Moving);
        assert!(journey.trigger.fired().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_returns_inactive_status() {
        let journey = start_walk_journey(JourneyConfig::default()).await;
        time::sleep(Duration::from_secs(5)).await;

        let final_status = journey.handle.stop().await;
        assert_eq!(final_status.phase, JourneyPhase::Inactive);
        assert!(journey.trigger.fired().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_permission_fails_start() {
        let provider = HostLocationProvider::new();
        provider.deny_permission().await;

        let result = JourneyMonitor::start(
            walk_destination(),
            Arc::new(provider),
            Arc::new(CountingTrigger::default()),
            JourneyConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(CoreError::PermissionDenied)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_movement_defers_escalation() {
        // Shortened thresholds exercise the override knob as well
        let config = JourneyConfig {
            pre_alarm_countdown: Duration::from_secs(10),
            stationary_threshold_override: Some(Duration::from_secs(5)),
            ..JourneyConfig::default()
        };
        let journey = start_walk_journey(config).await;

        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(journey.handle.status().phase, JourneyPhase::PreAlarm);

        journey.handle.force_movement(true).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(journey.handle.status().phase, JourneyPhase::Moving);

        // Untouched from here on: threshold (5 s) + countdown (10 s) fire
        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(journey.handle.status().phase, JourneyPhase::Escalated);
        assert_eq!(journey.trigger.fired().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_stream_still_escalates() {
        let provider = HostLocationProvider::new();
        let trigger = Arc::new(CountingTrigger::default());
        let handle = JourneyMonitor::start(
            walk_destination(),
            Arc::new(provider.clone()),
            trigger.clone(),
            JourneyConfig::default(),
        )
        .await
        .unwrap();

        // Tear down the provider side entirely; the ticker must carry on
        drop(provider);
        time::sleep(Duration::from_secs(185)).await;

        assert_eq!(handle.status().phase, JourneyPhase::Escalated);
        assert_eq!(trigger.fired().len(), 1);
    }
}
