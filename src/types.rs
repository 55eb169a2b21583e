//! Core types for the Haven safety engine
//!
//! This module defines the records that flow through the alert pipeline:
//! distress alerts, responder actions, journey destinations/transport modes,
//! and the event stream published by the alert store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Default number of responder batches before emergency escalation
pub const DEFAULT_MAX_BATCHES: u32 = 5;

/// Default number of responders notified per batch
pub const DEFAULT_RESPONDERS_PER_BATCH: u32 = 10;

/// Unique identifier for a distress alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(Uuid);

impl AlertId {
    /// Create a new random alert ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for AlertId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a recorded responder action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(Uuid);

impl ResponseId {
    /// Create a new random response ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResponseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque user identity, assigned by the account system upstream of this crate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// User role as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Can raise alerts and start monitored journeys
    Seeker,
    /// Can acknowledge or commit to respond to alerts
    Responder,
}

/// The authenticated user this engine instance acts for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub role: Role,
    /// Phone number of the designated primary contact, if configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_contact: Option<String>,
}

impl UserProfile {
    pub fn seeker(id: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            role: Role::Seeker,
            primary_contact: None,
        }
    }

    pub fn responder(id: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            role: Role::Responder,
            primary_contact: None,
        }
    }

    pub fn with_primary_contact(mut self, number: impl Into<String>) -> Self {
        self.primary_contact = Some(number.into());
        self
    }
}

/// A geographic point attached to an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Reverse-geocoded address, when the shell resolved one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            address: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// True if both coordinates are finite and within valid ranges
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A single position sample from the location provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius (meters)
    pub accuracy: f64,
    /// Ground speed (m/s), when the provider reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl PositionFix {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: 0.0,
            speed: None,
            timestamp: Utc::now(),
        }
    }

    /// The fix as an alert-attachable point
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Lifecycle status of a distress alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Raised and escalating; no one has taken the case
    Active,
    /// A responder has taken the case, or escalation exhausted all batches
    Acknowledged,
    /// Closed by the seeker or a responder; terminal
    Resolved,
}

impl AlertStatus {
    /// Whether a transition from `self` to `next` moves forward in the
    /// lifecycle. Backward moves are never allowed.
    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (AlertStatus::Active, AlertStatus::Acknowledged)
                | (AlertStatus::Active, AlertStatus::Resolved)
                | (AlertStatus::Acknowledged, AlertStatus::Resolved)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertStatus::Resolved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A responder's recorded action on an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    /// Informational: "I have seen this". Does not halt escalation.
    Acknowledge,
    /// Commitment: "I am taking this case". Halts escalation.
    Respond,
}

impl ResponseAction {
    /// True for the action that commits a responder to the case
    pub fn commits_responder(&self) -> bool {
        matches!(self, ResponseAction::Respond)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseAction::Acknowledge => "acknowledge",
            ResponseAction::Respond => "respond",
        }
    }
}

/// Transport mode of a monitored journey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Walk,
    Bike,
    Car,
    Public,
}

impl TransportMode {
    /// How long the traveller may sit still before the journey counts as
    /// stationary. A stopped car at a light is normal; a stopped pedestrian
    /// for two minutes is not.
    pub fn stationary_threshold(&self) -> Duration {
        match self {
            TransportMode::Walk => Duration::from_millis(120_000),
            TransportMode::Bike => Duration::from_millis(60_000),
            TransportMode::Car => Duration::from_millis(180_000),
            TransportMode::Public => Duration::from_millis(240_000),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Walk => "walk",
            TransportMode::Bike => "bike",
            TransportMode::Car => "car",
            TransportMode::Public => "public",
        }
    }
}

/// Destination of a monitored journey
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub mode: TransportMode,
}

impl Destination {
    pub fn new(
        name: impl Into<String>,
        latitude: f64,
        longitude: f64,
        mode: TransportMode,
    ) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
            mode,
        }
    }
}

/// A distress alert record, the unit the whole pipeline revolves around
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    /// The seeker who raised the alert
    pub owner: UserId,
    pub title: String,
    pub description: String,
    pub location: GeoPoint,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the current responder batch's window closes
    pub response_deadline: DateTime<Utc>,
    /// Batch currently notified, 1-based
    pub current_batch: u32,
    pub max_batches: u32,
    pub responders_per_batch: u32,
    /// Cumulative number of responders notified so far
    pub total_responders: u32,
    /// Recorded audio clip attached by the seeker, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
}

impl Alert {
    /// Create an alert in its initial state. Deadline and responder counters
    /// carry placeholder values until the escalation policy arms them.
    pub fn new(
        owner: UserId,
        title: impl Into<String>,
        description: impl Into<String>,
        location: GeoPoint,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AlertId::new(),
            owner,
            title: title.into(),
            description: description.into(),
            location,
            status: AlertStatus::Active,
            created_at: now,
            updated_at: now,
            response_deadline: now,
            current_batch: 1,
            max_batches: DEFAULT_MAX_BATCHES,
            responders_per_batch: DEFAULT_RESPONDERS_PER_BATCH,
            total_responders: 0,
            audio_url: None,
        }
    }

    pub fn with_audio_url(mut self, url: impl Into<String>) -> Self {
        self.audio_url = Some(url.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }
}

/// An immutable responder action appended to an alert's ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertResponse {
    pub id: ResponseId,
    pub alert_id: AlertId,
    pub responder_id: UserId,
    pub action: ResponseAction,
    /// Assigned by the ledger at append time
    pub timestamp: DateTime<Utc>,
}

/// Change notification published by the alert store
#[derive(Debug, Clone)]
pub enum AlertEvent {
    Created(Alert),
    Updated(Alert),
}

impl AlertEvent {
    /// The alert carried by this event
    pub fn alert(&self) -> &Alert {
        match self {
            AlertEvent::Created(a) | AlertEvent::Updated(a) => a,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_transitions_forward_only() {
        use AlertStatus::*;

        assert!(Active.can_transition_to(Acknowledged));
        assert!(Active.can_transition_to(Resolved));
        assert!(Acknowledged.can_transition_to(Resolved));

        assert!(!Acknowledged.can_transition_to(Active));
        assert!(!Resolved.can_transition_to(Active));
        assert!(!Resolved.can_transition_to(Acknowledged));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_transport_mode_thresholds() {
        assert_eq!(
            TransportMode::Walk.stationary_threshold(),
            Duration::from_millis(120_000)
        );
        assert_eq!(
            TransportMode::Bike.stationary_threshold(),
            Duration::from_millis(60_000)
        );
        assert_eq!(
            TransportMode::Car.stationary_threshold(),
            Duration::from_millis(180_000)
        );
        assert_eq!(
            TransportMode::Public.stationary_threshold(),
            Duration::from_millis(240_000)
        );
    }

    #[test]
    fn test_geo_point_validity() {
        assert!(GeoPoint::new(52.52, 13.405).is_valid());
        assert!(GeoPoint::new(-90.0, 180.0).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -181.0).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_alert_serde_round_trip() {
        let alert = Alert::new(
            UserId::new("seeker-1"),
            "Distress alert",
            "Raised from the Haven app",
            GeoPoint::new(52.520008, 13.404954).with_address("Alexanderplatz, Berlin"),
        )
        .with_audio_url("https://cdn.haven.app/clips/abc.m4a");

        let json = serde_json::to_string(&alert).unwrap();
        let back: Alert = serde_json::from_str(&json).unwrap();

        // Field-for-field fidelity, timestamps and enums included
        assert_eq!(alert, back);
    }

    #[test]
    fn test_alert_id_parse_round_trip() {
        let id = AlertId::new();
        let parsed: AlertId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_only_respond_commits() {
        assert!(ResponseAction::Respond.commits_responder());
        assert!(!ResponseAction::Acknowledge.commits_responder());
    }
}
