//! # Cycle orchestration
//!
//! One cycle walks the phases
//!
//! ```text
//! Idle → Rotating → Applying → Probing → ResettingRelay
//!      → AwaitingPostResetConnectivity → Logging → Cooling → Idle
//! ```
//!
//! Phases run strictly in sequence. `Applying` is skipped when no identity
//! was drawn, the relay phases are skipped when relay use is disabled, and a
//! single-shot run stops after `Logging`. No phase failure aborts the cycle:
//! each one becomes a [`CycleFault`] in the outcome and the next scheduled
//! cycle is the retry.
//!
//! Per-cycle state lives in a [`CycleContext`] threaded through the phases;
//! the only state kept across cycles is the cycle counter, the rotation
//! cursor (on disk) and the append-only log (on disk).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::address::AddressResolver;
use crate::applier::{ApplyOutcome, IdentityApplier};
use crate::command::CommandRunner;
use crate::cycle_log::{CycleLog, CycleLogRow};
use crate::error::CycleFault;
use crate::identity::{Identity, IdentitySource};
use crate::notify::{self, Notifier};
use crate::probe::{wait_until_reachable, Reachability};
use crate::relay::RelayController;
use crate::report::{timestamp_now, CycleReport, PhaseObservation};
use crate::speedtest::{self, SpeedTestRunner};

/// Lower bound on the post-reset connectivity wait; a modem reboot takes
/// longer than the relay hold.
pub const POST_RESET_WAIT_FLOOR: Duration = Duration::from_secs(90);
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3 * 60 * 60);
pub const DEFAULT_RELAY_HOLD: Duration = Duration::from_secs(30);
/// Idle period after relaxing the relay at the start of a cycle, letting the
/// modem finish its power-on self-test before anything else touches the link.
pub const DEFAULT_BOOT_SETTLE: Duration = Duration::from_secs(180);

pub const INITIAL_PROBE_LABEL: &str = "initial probe";
pub const POST_RESET_PROBE_LABEL: &str = "post-reset probe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Rotating,
    Applying,
    Probing,
    ResettingRelay,
    AwaitingPostResetConnectivity,
    Logging,
    Cooling,
}

impl CyclePhase {
    /// The phase that follows `self`, or `None` when a single-shot run ends.
    pub fn next(self, ctx: &CycleContext, options: &CycleOptions) -> Option<CyclePhase> {
        use CyclePhase::*;
        Some(match self {
            Idle => Rotating,
            Rotating if ctx.identity.is_some() => Applying,
            Rotating => Probing,
            Applying => Probing,
            Probing if options.use_relay => ResettingRelay,
            Probing => Logging,
            ResettingRelay => AwaitingPostResetConnectivity,
            AwaitingPostResetConnectivity => Logging,
            Logging if options.single_shot => return None,
            Logging => Cooling,
            Cooling => Idle,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub interface: String,
    pub use_relay: bool,
    pub relay_hold: Duration,
    pub post_reset_floor: Duration,
    pub boot_settle: Duration,
    pub cooldown: Duration,
    pub single_shot: bool,
    /// Files attached to the notification (when present) besides the probe
    /// results and the cycle log.
    pub extra_attachments: Vec<PathBuf>,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            use_relay: true,
            relay_hold: DEFAULT_RELAY_HOLD,
            post_reset_floor: POST_RESET_WAIT_FLOOR,
            boot_settle: DEFAULT_BOOT_SETTLE,
            cooldown: DEFAULT_COOLDOWN,
            single_shot: false,
            extra_attachments: Vec::new(),
        }
    }
}

impl CycleOptions {
    pub fn post_reset_wait(&self) -> Duration {
        self.relay_hold.max(self.post_reset_floor)
    }
}

/// State accumulated over one cycle.
#[derive(Debug, Default)]
pub struct CycleContext {
    pub identity: Option<Identity>,
    pub apply: Option<ApplyOutcome>,
    pub reports: Vec<CycleReport>,
    pub faults: Vec<CycleFault>,
    pub relay_pulsed: bool,
    pub notified: bool,
}

impl CycleContext {
    fn fault(&mut self, fault: CycleFault) {
        fault.log();
        self.faults.push(fault);
    }
}

/// What one completed cycle produced.
#[derive(Debug)]
pub struct CycleOutcome {
    pub cycle: u64,
    pub identity: Option<Identity>,
    pub apply: Option<ApplyOutcome>,
    pub reports: Vec<CycleReport>,
    pub faults: Vec<CycleFault>,
    pub relay_pulsed: bool,
    pub notified: bool,
}

impl CycleOutcome {
    pub fn has_fault(&self, marker: &str) -> bool {
        self.faults.iter().any(|f| f.marker() == marker)
    }
}

/// Everything the orchestrator drives, injected at construction.
pub struct Collaborators<R, P, N> {
    pub identities: IdentitySource,
    pub applier: IdentityApplier<R, P>,
    pub probe: Arc<P>,
    pub addresses: AddressResolver<R>,
    pub speed: SpeedTestRunner<R>,
    pub relay: RelayController,
    pub log: CycleLog,
    pub notifier: N,
}

pub struct CycleOrchestrator<R, P, N> {
    options: CycleOptions,
    parts: Collaborators<R, P, N>,
    cycles: u64,
}

impl<R, P, N> CycleOrchestrator<R, P, N>
where
    R: CommandRunner,
    P: Reachability,
    N: Notifier,
{
    pub fn new(options: CycleOptions, parts: Collaborators<R, P, N>) -> Self {
        Self {
            options,
            parts,
            cycles: 0,
        }
    }

    pub fn options(&self) -> &CycleOptions {
        &self.options
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn notifier(&self) -> &N {
        &self.parts.notifier
    }

    pub fn log(&self) -> &CycleLog {
        &self.parts.log
    }

    /// Run cycles until a single-shot cycle completes. Loops forever otherwise;
    /// the caller stops it by dropping the future.
    pub async fn run(&mut self) {
        loop {
            let outcome = self.run_cycle().await;
            tracing::info!(
                cycle = outcome.cycle,
                reports = outcome.reports.len(),
                faults = outcome.faults.len(),
                "cycle complete"
            );
            if self.options.single_shot {
                return;
            }
            self.cool_down().await;
        }
    }

    /// Run one cycle from `Idle` through `Logging`.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.cycles += 1;
        let cycle = self.cycles;
        let mut ctx = CycleContext::default();
        let mut phase = CyclePhase::Idle;

        loop {
            tracing::debug!(cycle, ?phase, "entering phase");
            match phase {
                CyclePhase::Idle => self.settle().await,
                CyclePhase::Rotating => self.rotate(&mut ctx),
                CyclePhase::Applying => self.apply(&mut ctx).await,
                CyclePhase::Probing => {
                    let report = self.observe(INITIAL_PROBE_LABEL, &mut ctx).await;
                    ctx.reports.push(report);
                }
                CyclePhase::ResettingRelay => self.reset_modem(&mut ctx).await,
                CyclePhase::AwaitingPostResetConnectivity => self.await_post_reset(&mut ctx).await,
                CyclePhase::Logging => self.record(&mut ctx).await,
                CyclePhase::Cooling => break,
            }
            match phase.next(&ctx, &self.options) {
                Some(CyclePhase::Cooling) | None => break,
                Some(next) => phase = next,
            }
        }

        CycleOutcome {
            cycle,
            identity: ctx.identity,
            apply: ctx.apply,
            reports: ctx.reports,
            faults: ctx.faults,
            relay_pulsed: ctx.relay_pulsed,
            notified: ctx.notified,
        }
    }

    /// Relax the relay and let the modem settle before touching the link.
    async fn settle(&mut self) {
        if !self.options.use_relay {
            return;
        }
        self.parts.relay.relax();
        if !self.options.boot_settle.is_zero() {
            tracing::info!(
                settle_s = self.options.boot_settle.as_secs(),
                "waiting for modem to settle"
            );
            tokio::time::sleep(self.options.boot_settle).await;
        }
    }

    fn rotate(&mut self, ctx: &mut CycleContext) {
        ctx.identity = self.parts.identities.next();
        if ctx.identity.is_none() {
            ctx.fault(CycleFault::SourceExhausted);
        }
    }

    async fn apply(&mut self, ctx: &mut CycleContext) {
        let Some(identity) = ctx.identity.clone() else {
            return;
        };
        let outcome = self
            .parts
            .applier
            .apply(&self.options.interface, &identity)
            .await;
        if !outcome.is_success() {
            let identity = identity.to_string();
            ctx.fault(match outcome {
                ApplyOutcome::Failed => CycleFault::ApplyFailed { identity },
                _ => CycleFault::ApplyDegraded { identity },
            });
        }
        ctx.apply = Some(outcome);
    }

    /// Probe phase: reachability, then both speed probes if the link is up.
    async fn observe(&self, label: &str, ctx: &mut CycleContext) -> CycleReport {
        let timestamp = timestamp_now();
        let address = self.parts.addresses.local_ipv4().await;
        tracing::info!(label, "checking connectivity");
        let reachable = self.parts.probe.is_reachable().await;

        let mut obs = PhaseObservation {
            label: label.to_string(),
            timestamp,
            interface: self.options.interface.clone(),
            identity: ctx.identity.as_ref().map(Identity::to_string),
            address,
            reachable,
            ..Default::default()
        };

        if reachable {
            obs.public_address = self.parts.addresses.public_address().await;

            tracing::info!(label, "running bandwidth probe");
            let bandwidth = self.parts.speed.run_bandwidth().await;
            if speedtest::is_error(&bandwidth) {
                ctx.fault(CycleFault::SpeedProbeFailed {
                    probe: "bandwidth",
                    label: label.to_string(),
                });
            }

            tracing::info!(label, "running speed script");
            let script = self.parts.speed.run_script().await;
            if speedtest::ScriptResult::from_value(&script).is_none() {
                ctx.fault(CycleFault::SpeedProbeFailed {
                    probe: "script",
                    label: label.to_string(),
                });
            }

            obs.bandwidth = Some(bandwidth);
            obs.script = Some(script);
        } else {
            ctx.fault(CycleFault::ProbeUnreachable {
                label: label.to_string(),
            });
        }

        CycleReport::from_observation(obs)
    }

    async fn reset_modem(&mut self, ctx: &mut CycleContext) {
        tracing::info!("resetting modem through relay");
        if self.parts.relay.pulse(self.options.relay_hold).await {
            ctx.relay_pulsed = true;
        } else {
            ctx.fault(CycleFault::RelayUnavailable);
        }
    }

    /// Wait for the link after a reset, then probe it again. Never retried.
    async fn await_post_reset(&mut self, ctx: &mut CycleContext) {
        let wait = self.options.post_reset_wait();
        tracing::info!(timeout_s = wait.as_secs(), "waiting for connectivity after reset");
        if wait_until_reachable(&*self.parts.probe, wait).await {
            tracing::info!("connectivity restored after reset");
        } else {
            ctx.fault(CycleFault::ResetNotRecovered);
        }
        let report = self.observe(POST_RESET_PROBE_LABEL, ctx).await;
        ctx.reports.push(report);
    }

    /// Append every report to the log and send the cycle notification.
    async fn record(&mut self, ctx: &mut CycleContext) {
        for report in &ctx.reports {
            if let Err(e) = self.parts.log.append(&CycleLogRow::from(report)) {
                tracing::warn!(
                    path = %self.parts.log.path().display(),
                    error = %e,
                    "failed to append cycle log"
                );
            }
        }

        let mut candidates = vec![
            self.parts.speed.bandwidth_cache().to_path_buf(),
            self.parts.speed.script_result().to_path_buf(),
        ];
        candidates.extend(self.options.extra_attachments.iter().cloned());
        candidates.push(self.parts.log.path().to_path_buf());

        let notification = notify::compose(&ctx.reports, &candidates);
        match self.parts.notifier.send(&notification).await {
            Ok(()) => {
                tracing::info!(attachments = notification.attachments.len(), "report sent");
                ctx.notified = true;
            }
            Err(e) => ctx.fault(CycleFault::NotificationFailed {
                reason: e.to_string(),
            }),
        }
    }

    async fn cool_down(&mut self) {
        let cooldown = self.options.cooldown;
        tracing::info!(
            cooldown_s = cooldown.as_secs(),
            hours = cooldown.as_secs() / 3600,
            "waiting before next cycle"
        );
        tokio::time::sleep(cooldown).await;
    }

    /// Release the relay output. Call once the run loop has been stopped.
    pub fn shutdown(&mut self) {
        self.parts.relay.release();
    }
}
