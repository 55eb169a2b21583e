//! Error types for the Haven safety engine

use thiserror::Error;

use crate::types::{AlertId, AlertStatus};

/// Errors produced by the alert lifecycle and journey monitoring engine.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Alert not found: {0}")]
    AlertNotFound(AlertId),

    #[error("Alert already exists: {0}")]
    DuplicateAlert(AlertId),

    #[error("Alert {0} is already resolved")]
    ResponseTargetResolved(AlertId),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: AlertStatus, to: AlertStatus },

    #[error("Invalid alert record: {0}")]
    InvalidAlert(String),

    #[error("Operation requires the seeker role")]
    NotSeeker,

    #[error("A monitored journey is already active")]
    JourneyAlreadyActive,

    #[error("No monitored journey is active")]
    JourneyNotActive,

    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("Invalid coordinates: lat={latitude}, lon={longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Notification gateway error: {0}")]
    GatewayError(String),
}
