//! Whole-cycle scenarios for the recovery engine.
//!
//! Every collaborator is scripted: commands answer from a [`ScriptedRunner`],
//! reachability from a fixed sequence, and the relay records levels instead of
//! driving a pin. Time is paused, so multi-minute waits resolve instantly and
//! elapsed durations are exact.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use netwarden_core::applier::{ApplyOutcome, IdentityApplier, Mechanism};
use netwarden_core::address::AddressResolver;
use netwarden_core::cycle::{
    Collaborators, CycleOptions, CycleOrchestrator, INITIAL_PROBE_LABEL, POST_RESET_PROBE_LABEL,
};
use netwarden_core::cycle_log::{CycleLog, LOG_FILE};
use netwarden_core::identity::{Identity, IdentitySource, STATIC_POOL_FILE};
use netwarden_core::relay::{
    Level, Polarity, RelayCapability, RelayController, RelayPulseSpec,
};
use netwarden_core::report::UNKNOWN;
use netwarden_core::speedtest::{
    SpeedTestRunner, BANDWIDTH_CACHE_FILE, DEFAULT_SCRIPT, DEFAULT_SCRIPT_RESULT,
};
use netwarden_core::test_util::{
    fail, ok, OutputLog, RecordingNotifier, RecordingOutput, ScriptedReachability, ScriptedRunner,
};

type Orchestrator = CycleOrchestrator<ScriptedRunner, ScriptedReachability, RecordingNotifier>;

// ─── Helpers ────────────────────────────────────────────────────────────────

const MAC_1: &str = "AA:BB:CC:DD:EE:01";
const MAC_2: &str = "AA:BB:CC:DD:EE:02";

const OOKLA: &str = r#"{"ping":{"latency":11.0},"download":{"bandwidth":25000000},
    "upload":{"bandwidth":4000000},"server":{"host":"speed.example.net"}}"#;

/// Route engine logs through the test harness; `RUST_LOG=debug` shows phases.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn write_pool(dir: &Path, macs: &[&str]) {
    std::fs::write(dir.join(STATIC_POOL_FILE), macs.join("\n")).unwrap();
}

/// Runner where NetworkManager is absent and every probe command answers.
fn host_without_nmcli() -> Arc<ScriptedRunner> {
    let runner = Arc::new(ScriptedRunner::new());
    runner.unavailable("nmcli");
    runner.on(
        "ip -4 addr show",
        ok("2: eth0: <UP>\n    inet 192.168.1.23/24 brd 192.168.1.255 scope global eth0\n"),
    );
    runner.on("speedtest", ok(OOKLA));
    runner.on("curl", ok("203.0.113.7\n"));
    runner
}

fn quiet_options(use_relay: bool) -> CycleOptions {
    CycleOptions {
        use_relay,
        relay_hold: Duration::from_secs(5),
        boot_settle: Duration::ZERO,
        single_shot: true,
        ..Default::default()
    }
}

fn recording_relay() -> (RelayController, Arc<Mutex<OutputLog>>) {
    let (output, log) = RecordingOutput::new();
    let relay = RelayController::new(
        RelayCapability::Available(Box::new(output)),
        RelayPulseSpec::new(17, Polarity::ActiveHigh),
    );
    (relay, log)
}

fn unavailable_relay() -> RelayController {
    RelayController::new(
        RelayCapability::Unavailable,
        RelayPulseSpec::new(17, Polarity::ActiveHigh),
    )
}

fn orchestrator(
    dir: &Path,
    runner: Arc<ScriptedRunner>,
    probe: Arc<ScriptedReachability>,
    relay: RelayController,
    notifier: RecordingNotifier,
    options: CycleOptions,
) -> Orchestrator {
    init_tracing();
    let parts = Collaborators {
        identities: IdentitySource::resolve(dir, None, None),
        applier: IdentityApplier::new(runner.clone(), probe.clone()),
        probe,
        addresses: AddressResolver::new(runner.clone(), options.interface.clone()),
        speed: SpeedTestRunner::new(
            runner,
            dir.join(BANDWIDTH_CACHE_FILE),
            dir.join(DEFAULT_SCRIPT),
            dir.join(DEFAULT_SCRIPT_RESULT),
        ),
        relay,
        log: CycleLog::new(dir.join(LOG_FILE)),
        notifier,
    };
    CycleOrchestrator::new(options, parts)
}

// ─── Rotation ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn consecutive_cycles_walk_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    write_pool(dir.path(), &[MAC_1, MAC_2]);
    let mut engine = orchestrator(
        dir.path(),
        host_without_nmcli(),
        Arc::new(ScriptedReachability::new([true])),
        unavailable_relay(),
        RecordingNotifier::new(),
        quiet_options(false),
    );

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(engine.run_cycle().await.identity.unwrap());
    }

    let expected: Vec<_> = [MAC_1, MAC_2, MAC_1]
        .iter()
        .map(|m| Identity::new(m).unwrap())
        .collect();
    assert_eq!(seen, expected);
    assert_eq!(engine.cycles(), 3);
}

#[tokio::test(start_paused = true)]
async fn missing_pool_still_probes_and_logs_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let runner = host_without_nmcli();
    let mut engine = orchestrator(
        dir.path(),
        runner.clone(),
        Arc::new(ScriptedReachability::new([true])),
        unavailable_relay(),
        RecordingNotifier::new(),
        quiet_options(false),
    );

    let outcome = engine.run_cycle().await;

    assert!(outcome.identity.is_none());
    assert!(outcome.apply.is_none());
    assert!(outcome.has_fault("source_exhausted"));
    assert_eq!(runner.count("ip link"), 0);
    assert_eq!(outcome.reports.len(), 1);
    assert_eq!(outcome.reports[0].identity, UNKNOWN);

    let rows = engine.log().read_rows().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].identity, UNKNOWN);
    assert_eq!(rows[0].address, "192.168.1.23");
}

// ─── Application ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn fallback_applies_then_waits_for_connectivity() {
    let runner = host_without_nmcli();
    let probe = Arc::new(ScriptedReachability::new([false, false, true]));
    let applier = IdentityApplier::new(runner.clone(), probe.clone());
    let started = Instant::now();

    let outcome = applier
        .apply("eth0", &Identity::new(MAC_1).unwrap())
        .await;

    assert_eq!(
        outcome,
        ApplyOutcome::Applied {
            via: Mechanism::IpLink
        }
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(6), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(9), "elapsed {elapsed:?}");
    assert_eq!(probe.polls(), 3);
    assert_eq!(
        runner.calls()[1],
        format!("ip link set dev eth0 address {MAC_1}")
    );
}

#[tokio::test(start_paused = true)]
async fn network_manager_success_skips_fallback() {
    let dir = tempfile::tempdir().unwrap();
    write_pool(dir.path(), &[MAC_1]);
    let runner = Arc::new(ScriptedRunner::new());
    runner.on("nmcli -t -f NAME,DEVICE", ok("Wired connection 1:eth0\n"));
    runner.on("nmcli -t -f GENERAL.TYPE", ok("GENERAL.TYPE:ethernet\n"));
    let mut engine = orchestrator(
        dir.path(),
        runner.clone(),
        Arc::new(ScriptedReachability::new([true])),
        unavailable_relay(),
        RecordingNotifier::new(),
        quiet_options(false),
    );

    let outcome = engine.run_cycle().await;

    assert_eq!(
        outcome.apply,
        Some(ApplyOutcome::Applied {
            via: Mechanism::NetworkManager
        })
    );
    assert_eq!(runner.count("ip link"), 0);
    assert_eq!(
        runner.count(&format!(
            "nmcli connection modify Wired connection 1 802-ethernet.cloned-mac-address {MAC_1}"
        )),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_address_change_is_a_fault() {
    let dir = tempfile::tempdir().unwrap();
    write_pool(dir.path(), &[MAC_1]);
    let runner = host_without_nmcli();
    runner.on("ip link set dev", fail(2, "RTNETLINK answers: Operation not permitted"));
    let mut engine = orchestrator(
        dir.path(),
        runner.clone(),
        Arc::new(ScriptedReachability::new([true])),
        unavailable_relay(),
        RecordingNotifier::new(),
        quiet_options(false),
    );

    let outcome = engine.run_cycle().await;

    assert_eq!(outcome.apply, Some(ApplyOutcome::Failed));
    assert!(outcome.has_fault("apply_failed"));
    assert!(!outcome.has_fault("apply_degraded"));
    assert_eq!(runner.count("ip link set eth0 up"), 1);
}

#[tokio::test(start_paused = true)]
async fn applied_identity_without_connectivity_is_degraded() {
    let dir = tempfile::tempdir().unwrap();
    write_pool(dir.path(), &[MAC_1]);
    let mut engine = orchestrator(
        dir.path(),
        host_without_nmcli(),
        Arc::new(ScriptedReachability::new([false])),
        unavailable_relay(),
        RecordingNotifier::new(),
        quiet_options(false),
    );

    let outcome = engine.run_cycle().await;

    assert_eq!(
        outcome.apply,
        Some(ApplyOutcome::Degraded {
            via: Mechanism::IpLink
        })
    );
    assert!(outcome.has_fault("apply_degraded"));
    assert!(!outcome.has_fault("apply_failed"));
}

// ─── Probing ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unreachable_phase_skips_speed_probes() {
    let dir = tempfile::tempdir().unwrap();
    let runner = host_without_nmcli();
    let mut engine = orchestrator(
        dir.path(),
        runner.clone(),
        Arc::new(ScriptedReachability::new([false])),
        unavailable_relay(),
        RecordingNotifier::new(),
        quiet_options(false),
    );

    let outcome = engine.run_cycle().await;

    assert_eq!(runner.count("speedtest"), 0);
    assert_eq!(runner.count("node"), 0);
    assert_eq!(runner.count("curl"), 0);
    assert!(outcome.has_fault("probe_unreachable"));
    let report = &outcome.reports[0];
    assert_eq!(report.log_line, format!("{INITIAL_PROBE_LABEL} | Ping failed"));
    assert!(report.bandwidth.is_none());
    assert!(report.public_address.is_none());
}

#[tokio::test(start_paused = true)]
async fn reachable_phase_records_both_probes() {
    let dir = tempfile::tempdir().unwrap();
    write_pool(dir.path(), &[MAC_1]);
    std::fs::write(
        dir.path().join(DEFAULT_SCRIPT_RESULT),
        r#"{"download_mbps": 90.5, "upload_mbps": 12.25}"#,
    )
    .unwrap();
    let mut engine = orchestrator(
        dir.path(),
        host_without_nmcli(),
        Arc::new(ScriptedReachability::new([true])),
        unavailable_relay(),
        RecordingNotifier::new(),
        quiet_options(false),
    );

    let outcome = engine.run_cycle().await;

    assert!(outcome.faults.is_empty(), "faults: {:?}", outcome.faults);
    let report = &outcome.reports[0];
    assert_eq!(
        report.log_line,
        format!("{INITIAL_PROBE_LABEL} | Ping OK | Ookla DL 25.00 UL 4.00 | Script DL 90.50 UL 12.25")
    );
    assert_eq!(report.public_address.as_deref(), Some("203.0.113.7"));
    assert!(dir.path().join(BANDWIDTH_CACHE_FILE).exists());
}

// ─── Relay ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unavailable_relay_pulse_returns_immediately() {
    let mut relay = unavailable_relay();
    let started = Instant::now();

    assert!(!relay.pulse(Duration::from_secs(5)).await);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn unavailable_relay_cycle_still_reprobes() {
    let dir = tempfile::tempdir().unwrap();
    write_pool(dir.path(), &[MAC_1]);
    let mut engine = orchestrator(
        dir.path(),
        host_without_nmcli(),
        Arc::new(ScriptedReachability::new([true])),
        unavailable_relay(),
        RecordingNotifier::new(),
        quiet_options(true),
    );

    let outcome = engine.run_cycle().await;

    assert!(outcome.has_fault("relay_unavailable"));
    assert!(!outcome.relay_pulsed);
    let labels: Vec<_> = outcome.reports.iter().map(|r| r.label.as_str()).collect();
    assert_eq!(labels, vec![INITIAL_PROBE_LABEL, POST_RESET_PROBE_LABEL]);
}

#[tokio::test(start_paused = true)]
async fn relay_cycle_settles_pulses_and_releases() {
    let dir = tempfile::tempdir().unwrap();
    write_pool(dir.path(), &[MAC_1]);
    let (relay, levels) = recording_relay();
    let options = CycleOptions {
        boot_settle: Duration::from_secs(180),
        ..quiet_options(true)
    };
    let mut engine = orchestrator(
        dir.path(),
        host_without_nmcli(),
        Arc::new(ScriptedReachability::new([true])),
        relay,
        RecordingNotifier::new(),
        options,
    );
    let started = Instant::now();

    let outcome = engine.run_cycle().await;

    assert!(outcome.relay_pulsed);
    assert!(started.elapsed() >= Duration::from_secs(185));
    assert_eq!(
        levels.lock().unwrap().levels,
        vec![Level::Low, Level::Low, Level::High, Level::Low]
    );

    engine.shutdown();
    engine.shutdown();
    assert_eq!(levels.lock().unwrap().cleanups, 1);
}

#[tokio::test(start_paused = true)]
async fn rotation_waits_for_the_boot_settle() {
    let dir = tempfile::tempdir().unwrap();
    write_pool(dir.path(), &[MAC_1]);
    let runner = host_without_nmcli();
    let (relay, output) = recording_relay();
    let options = CycleOptions {
        boot_settle: Duration::from_secs(180),
        ..quiet_options(true)
    };
    let mut engine = orchestrator(
        dir.path(),
        runner.clone(),
        Arc::new(ScriptedReachability::new([true])),
        relay,
        RecordingNotifier::new(),
        options,
    );
    let started = Instant::now();

    engine.run_cycle().await;

    let first_link_change = runner.first_call_at("ip link").unwrap();
    let output = output.lock().unwrap();
    // [0] is the off level on acquisition, [1] the relax at cycle start.
    assert_eq!(output.levels[1], Level::Low);
    let relaxed_at = output.set_at[1];
    assert!(relaxed_at < first_link_change);
    assert!(first_link_change - started >= Duration::from_secs(180));
    assert!(first_link_change - relaxed_at >= Duration::from_secs(180));
}

#[tokio::test(start_paused = true)]
async fn unrecovered_reset_is_reported_after_the_floor() {
    let dir = tempfile::tempdir().unwrap();
    let (relay, _levels) = recording_relay();
    let mut engine = orchestrator(
        dir.path(),
        host_without_nmcli(),
        Arc::new(ScriptedReachability::new([false])),
        relay,
        RecordingNotifier::new(),
        quiet_options(true),
    );
    let started = Instant::now();

    let outcome = engine.run_cycle().await;

    assert!(outcome.has_fault("reset_not_recovered"));
    assert!(started.elapsed() >= Duration::from_secs(5 + 90));
    assert_eq!(outcome.reports.len(), 2);
}

// ─── Logging and notification ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn every_report_becomes_one_log_row() {
    let dir = tempfile::tempdir().unwrap();
    write_pool(dir.path(), &[MAC_1, MAC_2]);
    let (relay, _levels) = recording_relay();
    let mut engine = orchestrator(
        dir.path(),
        host_without_nmcli(),
        Arc::new(ScriptedReachability::new([true])),
        relay,
        RecordingNotifier::new(),
        quiet_options(true),
    );

    let mut reports = 0;
    for _ in 0..3 {
        reports += engine.run_cycle().await.reports.len();
    }

    let rows = engine.log().read_rows().unwrap();
    assert_eq!(reports, 6);
    assert_eq!(rows.len(), reports);
    assert_eq!(rows[0].identity, MAC_1);
    assert_eq!(rows[2].identity, MAC_2);
}

#[tokio::test(start_paused = true)]
async fn notification_carries_reports_and_log() {
    let dir = tempfile::tempdir().unwrap();
    write_pool(dir.path(), &[MAC_1]);
    let mut engine = orchestrator(
        dir.path(),
        host_without_nmcli(),
        Arc::new(ScriptedReachability::new([true])),
        unavailable_relay(),
        RecordingNotifier::new(),
        quiet_options(false),
    );

    let outcome = engine.run_cycle().await;

    assert!(outcome.notified);
    let sent = engine.notifier().sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].body.contains(&format!("== {INITIAL_PROBE_LABEL}")));
    assert!(sent[0].attachments.contains(&dir.path().join(LOG_FILE)));
    assert!(sent[0].attachments.contains(&dir.path().join(BANDWIDTH_CACHE_FILE)));
}

#[tokio::test(start_paused = true)]
async fn failed_notification_does_not_stop_the_cycle() {
    let dir = tempfile::tempdir().unwrap();
    write_pool(dir.path(), &[MAC_1]);
    let mut engine = orchestrator(
        dir.path(),
        host_without_nmcli(),
        Arc::new(ScriptedReachability::new([true])),
        unavailable_relay(),
        RecordingNotifier::failing("smtp down"),
        quiet_options(false),
    );

    let outcome = engine.run_cycle().await;

    assert!(!outcome.notified);
    assert!(outcome.has_fault("notification_failed"));
    assert_eq!(engine.log().read_rows().unwrap().len(), 1);
}

// ─── Run loop ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn single_shot_run_stops_after_one_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = orchestrator(
        dir.path(),
        host_without_nmcli(),
        Arc::new(ScriptedReachability::new([true])),
        unavailable_relay(),
        RecordingNotifier::new(),
        quiet_options(false),
    );

    engine.run().await;

    assert_eq!(engine.cycles(), 1);
}

#[tokio::test(start_paused = true)]
async fn continuous_run_cools_down_between_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let options = CycleOptions {
        single_shot: false,
        cooldown: Duration::from_secs(3 * 60 * 60),
        ..quiet_options(false)
    };
    let mut engine = orchestrator(
        dir.path(),
        host_without_nmcli(),
        Arc::new(ScriptedReachability::new([true])),
        unavailable_relay(),
        RecordingNotifier::new(),
        options,
    );

    let stopped = tokio::time::timeout(Duration::from_secs(7 * 60 * 60), engine.run()).await;

    assert!(stopped.is_err());
    assert_eq!(engine.cycles(), 3);
}
