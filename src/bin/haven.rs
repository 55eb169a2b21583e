//! Haven CLI - Terminal driver for the Haven safety engine
//!
//! Commands:
//! - escalate: Raise a distress alert and watch the batched escalation run
//! - journey: Simulate a monitored journey where the traveller goes quiet
//!
//! Both commands run against compressed timing so a full escalation arc fits
//! in a terminal session instead of real-world minutes.

use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::{info, warn};

use haven_core::{
    Destination, EscalationPolicy, HostLocationProvider, JourneyConfig, JourneyPhase, LogGateway,
    PositionFix, ResponseAction, SafetyEngine, TransportMode, UserId, UserProfile, HAVEN_VERSION,
};

/// Haven - distress alert and journey monitoring engine
#[derive(Parser)]
#[command(name = "haven")]
#[command(version = HAVEN_VERSION)]
#[command(about = "Drive the Haven safety engine from the terminal", long_about = None)]
struct Cli {
    /// Log filter (tracing env-filter syntax)
    #[arg(long, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Raise a distress alert and watch the batched escalation run
    Escalate {
        /// Response window per batch (seconds)
        #[arg(long, default_value = "5")]
        window_secs: u64,

        /// Batches before emergency escalation
        #[arg(long, default_value = "5")]
        max_batches: u32,

        /// Responders notified per batch
        #[arg(long, default_value = "10")]
        responders_per_batch: u32,

        /// Simulate a committed responder after this many seconds
        #[arg(long)]
        respond_after: Option<u64>,
    },

    /// Simulate a monitored journey where the traveller goes quiet
    Journey {
        /// Transport mode
        #[arg(long, value_enum, default_value = "walk")]
        mode: ModeArg,

        /// Stationary threshold override (seconds)
        #[arg(long, default_value = "8")]
        stationary_secs: u64,

        /// Pre-alarm countdown (seconds)
        #[arg(long, default_value = "5")]
        pre_alarm_secs: u64,

        /// How long the simulated traveller walks before stopping (seconds)
        #[arg(long, default_value = "6")]
        walk_secs: u64,

        /// Resume movement this many seconds after going quiet
        #[arg(long)]
        resume_after: Option<u64>,
    },
}

#[derive(Clone, ValueEnum)]
enum ModeArg {
    Walk,
    Bike,
    Car,
    Public,
}

impl From<ModeArg> for TransportMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Walk => TransportMode::Walk,
            ModeArg::Bike => TransportMode::Bike,
            ModeArg::Car => TransportMode::Car,
            ModeArg::Public => TransportMode::Public,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_env_filter(&cli.log).init();

    match cli.command {
        Commands::Escalate {
            window_secs,
            max_batches,
            responders_per_batch,
            respond_after,
        } => cmd_escalate(window_secs, max_batches, responders_per_batch, respond_after).await,

        Commands::Journey {
            mode,
            stationary_secs,
            pre_alarm_secs,
            walk_secs,
            resume_after,
        } => {
            cmd_journey(
                mode.into(),
                stationary_secs,
                pre_alarm_secs,
                walk_secs,
                resume_after,
            )
            .await
        }
    }
}

fn demo_engine(policy: EscalationPolicy, journey_config: JourneyConfig) -> (Arc<SafetyEngine>, HostLocationProvider) {
    let provider = HostLocationProvider::with_position(52.520008, 13.404954);
    let engine = SafetyEngine::with_config(
        UserProfile::seeker("demo-seeker").with_primary_contact("+49 151 555 0100"),
        Arc::new(provider.clone()),
        Arc::new(LogGateway),
        policy,
        journey_config,
    );
    (Arc::new(engine), provider)
}

async fn cmd_escalate(
    window_secs: u64,
    max_batches: u32,
    responders_per_batch: u32,
    respond_after: Option<u64>,
) -> anyhow::Result<()> {
    let policy = EscalationPolicy {
        response_window: Duration::from_secs(window_secs),
        max_batches,
        responders_per_batch,
        ..EscalationPolicy::default()
    };
    let (engine, _provider) = demo_engine(policy, JourneyConfig::default());

    let mut events = engine.subscribe();
    let alert = engine.trigger_alert().await?;
    println!("alert {} raised; watching escalation", alert.id);

    if let Some(secs) = respond_after {
        let responder_engine = engine.clone();
        let alert_id = alert.id;
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(secs)).await;
            info!("simulated responder commits to the case");
            if let Err(e) = responder_engine
                .respond_to_alert(alert_id, UserId::new("demo-responder"), ResponseAction::Respond)
                .await
            {
                warn!(error = %e, "simulated response failed");
            }
        });
    }

    // Follow the store feed until the alert leaves the active status
    loop {
        let event = events.recv().await?;
        let current = event.alert();
        println!(
            "[{}] status={} batch {}/{} notified={}",
            current.updated_at.format("%H:%M:%S"),
            current.status,
            current.current_batch,
            current.max_batches,
            current.total_responders,
        );
        if !current.is_active() {
            break;
        }
    }

    let final_alert = engine.alert(alert.id).await?;
    println!("{}", serde_json::to_string_pretty(&final_alert)?);
    for entry in engine.responses(alert.id).await {
        println!(
            "response: {} {} at {}",
            entry.responder_id,
            entry.action.as_str(),
            entry.timestamp.format("%H:%M:%S"),
        );
    }
    Ok(())
}

async fn cmd_journey(
    mode: TransportMode,
    stationary_secs: u64,
    pre_alarm_secs: u64,
    walk_secs: u64,
    resume_after: Option<u64>,
) -> anyhow::Result<()> {
    let policy = EscalationPolicy {
        response_window: Duration::from_secs(10),
        ..EscalationPolicy::default()
    };
    let journey_config = JourneyConfig {
        pre_alarm_countdown: Duration::from_secs(pre_alarm_secs),
        stationary_threshold_override: Some(Duration::from_secs(stationary_secs)),
        ..JourneyConfig::default()
    };
    let (engine, provider) = demo_engine(policy, journey_config);

    engine
        .start_journey(Destination::new("Cafe Kotti", 52.4990, 13.4180, mode))
        .await?;
    println!("journey started; walking for {walk_secs}s, then going quiet");

    // Simulated walk: a fix with real displacement every second
    let mut latitude = 52.5200;
    for _ in 0..walk_secs {
        time::sleep(Duration::from_secs(1)).await;
        latitude -= 0.0003; // ~33 m toward the destination
        provider.push_fix(PositionFix::new(latitude, 13.4050)).await;
    }

    let resume_at = resume_after.map(|secs| walk_secs + secs);
    let mut elapsed = walk_secs;
    let mut last_phase = JourneyPhase::Moving;
    loop {
        time::sleep(Duration::from_secs(1)).await;
        elapsed += 1;

        // A brief burst of movement during the countdown defers it once
        if let Some(at) = resume_at {
            if (at..at + 3).contains(&elapsed) {
                latitude -= 0.0003;
                provider.push_fix(PositionFix::new(latitude, 13.4050)).await;
                if elapsed == at {
                    println!("[{elapsed:>4}s] traveller moves again");
                }
            }
        }

        let status = engine.journey_status().await;
        if status.phase != last_phase {
            println!(
                "[{elapsed:>4}s] {:?} -> {:?} (stationary for {}s)",
                last_phase,
                status.phase,
                status.stationary_for_ms / 1000,
            );
            last_phase = status.phase;
        }
        if status.phase == JourneyPhase::Escalated {
            break;
        }
        if elapsed > 600 {
            anyhow::bail!("journey demo timed out without escalating");
        }
    }

    // Let the automatic alert's first escalation window pass, then close it
    time::sleep(Duration::from_secs(12)).await;
    if let Some(alert) = engine.alerts().await.first() {
        engine.resolve_alert(alert.id).await?;
    }
    println!("{}", serde_json::to_string_pretty(&engine.alerts().await)?);
    Ok(())
}
