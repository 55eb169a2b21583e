//! Haven Core - Distress alert and journey monitoring engine
//!
//! Haven Core is the safety engine behind the Haven companion app: raising
//! distress alerts, escalating them through widening responder batches until
//! someone commits (or emergency services are pulled in), and watching
//! monitored journeys for the inactivity pattern that warrants raising an
//! alert automatically.
//!
//! ## Modules
//!
//! - **Alert pipeline**: store, response ledger, and the batched escalation scheduler
//! - **Journey monitoring**: movement classification and the inactivity state machine
//! - **Engine**: [`SafetyEngine`], the single facade the embedding shell drives

pub mod engine;
pub mod error;
pub mod escalation;
pub mod gateway;
pub mod journey;
pub mod ledger;
pub mod location;
pub mod movement;
pub mod store;
pub mod types;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use engine::{SafetyEngine, INACTIVITY_ALERT_TITLE, MANUAL_ALERT_TITLE};
pub use error::CoreError;
pub use escalation::{EscalationPolicy, EscalationScheduler, EMERGENCY_ESCALATION_MARKER};
pub use gateway::{CallTarget, LogGateway, NoopGateway, NotificationGateway};
pub use journey::{
    DistressTrigger, JourneyConfig, JourneyHandle, JourneyMonitor, JourneyPhase, JourneyStatus,
};
pub use ledger::ResponseLedger;
pub use location::{HostLocationProvider, LocationProvider, PositionWatch};
pub use store::{AlertPatch, AlertStore};

// Record type exports
pub use types::{
    Alert, AlertEvent, AlertId, AlertResponse, AlertStatus, Destination, GeoPoint, PositionFix,
    ResponseAction, ResponseId, Role, TransportMode, UserId, UserProfile,
};

/// Haven Core version reported over FFI
pub const HAVEN_VERSION: &str = env!("CARGO_PKG_VERSION");
