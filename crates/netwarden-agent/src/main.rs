//! Netwarden Agent
//!
//! Host daemon keeping an uplink alive on unattended field devices.
//!
//! - Rotates the interface hardware address from a persisted circular pool
//! - Probes reachability and throughput after every change
//! - Power-cycles the upstream modem through a relay on a GPIO pin
//! - Appends every probe to `connection_log.csv` and mails a per-cycle report
//! - Repeats on a fixed cooldown, or once with `--once`

mod config;
mod gpio;
mod mailer;
mod pidfile;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use netwarden_core::address::AddressResolver;
use netwarden_core::applier::IdentityApplier;
use netwarden_core::command::SystemRunner;
use netwarden_core::cycle::{Collaborators, CycleOrchestrator};
use netwarden_core::cycle_log::{CycleLog, LOG_FILE};
use netwarden_core::identity::IdentitySource;
use netwarden_core::probe::PingProbe;
use netwarden_core::relay::{RelayCapability, RelayController};
use netwarden_core::speedtest::{SpeedTestRunner, BANDWIDTH_CACHE_FILE};

use crate::config::{AgentConfig, Cli, DOTENV_FILE};
use crate::mailer::{CurlMailer, MailSettings};
use crate::pidfile::{PidFile, PID_FILE};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Before parsing, so `.env` values act as environment fallbacks.
    match config::load_dotenv(Path::new(DOTENV_FILE)) {
        Ok(0) => {}
        Ok(n) => tracing::debug!(exported = n, "loaded {DOTENV_FILE}"),
        Err(e) => tracing::warn!(error = %e, "failed to read {DOTENV_FILE}"),
    }

    let config = AgentConfig::from_cli(Cli::parse());

    tracing::info!(
        interface = %config.cycle.interface,
        relay = config.cycle.use_relay,
        relay_pin = config.relay.pin,
        cooldown_s = config.cycle.cooldown.as_secs(),
        once = config.cycle.single_shot,
        state_dir = %config.state_dir.display(),
        "netwarden starting"
    );

    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } != 0 {
        tracing::warn!("not running as root; address changes and GPIO access will likely fail");
    }

    let _pid = PidFile::create(config.state_dir.join(PID_FILE))
        .with_context(|| format!("writing {PID_FILE} in {}", config.state_dir.display()))?;

    let mut orchestrator = build(config);

    // ── Shutdown handling ───────────────────────────────────────
    tokio::select! {
        _ = orchestrator.run() => {
            tracing::info!("single cycle finished");
        }
        _ = shutdown_signal() => {
            tracing::info!("received termination signal, shutting down");
        }
    }

    orchestrator.shutdown();
    tracing::info!("netwarden stopped");
    Ok(())
}

type Engine = CycleOrchestrator<SystemRunner, PingProbe<SystemRunner>, CurlMailer<SystemRunner>>;

/// Wire the engine against the real host.
fn build(config: AgentConfig) -> Engine {
    let runner = Arc::new(SystemRunner);
    let probe = Arc::new(PingProbe::new(runner.clone()));

    let capability = if config.cycle.use_relay {
        RelayCapability::from_probe(gpio::probe_capability(
            config.relay.pin,
            config.relay.polarity,
        ))
    } else {
        RelayCapability::Unavailable
    };

    let mail = match MailSettings::from_env() {
        Ok(settings) => Some(settings),
        Err(e) => {
            tracing::warn!(error = %e, "reports will not be mailed");
            None
        }
    };

    let state_dir = &config.state_dir;
    let parts = Collaborators {
        identities: IdentitySource::resolve(
            state_dir,
            config.mac_region.as_deref(),
            config.mac_prefix.as_deref(),
        ),
        applier: IdentityApplier::new(runner.clone(), probe.clone()),
        probe,
        addresses: AddressResolver::new(runner.clone(), config.cycle.interface.clone()),
        speed: SpeedTestRunner::new(
            runner.clone(),
            state_dir.join(BANDWIDTH_CACHE_FILE),
            config.script,
            config.script_result,
        ),
        relay: RelayController::new(capability, config.relay),
        log: CycleLog::new(state_dir.join(LOG_FILE)),
        notifier: CurlMailer::new(runner, mail),
    };
    CycleOrchestrator::new(config.cycle, parts)
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
