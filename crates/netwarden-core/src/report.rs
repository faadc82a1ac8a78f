//! Per-phase cycle reports and their text renderings.

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::Value;

use crate::speedtest::{BandwidthResult, ScriptResult};

/// Placeholder for identity or address fields that could not be determined.
pub const UNKNOWN: &str = "unknown";

/// Cap on the raw script JSON embedded in a summary.
const SCRIPT_EXCERPT_CHARS: usize = 6000;

/// Local wall-clock timestamp in the log's format.
pub fn timestamp_now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// What one probe phase observed. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub label: String,
    pub timestamp: String,
    pub interface: String,
    /// Applied identity, or [`UNKNOWN`].
    pub identity: String,
    /// Local IPv4 of the interface, or [`UNKNOWN`].
    pub address: String,
    pub public_address: Option<String>,
    pub reachable: bool,
    /// Raw bandwidth result; `None` when the phase had no connectivity.
    pub bandwidth: Option<Value>,
    /// Raw script result; `None` when the phase had no connectivity.
    pub script: Option<Value>,
    /// Multi-line human-readable summary.
    pub summary: String,
    /// Single-line result for the cycle log.
    pub log_line: String,
}

/// Inputs gathered during a probe phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseObservation {
    pub label: String,
    pub timestamp: String,
    pub interface: String,
    pub identity: Option<String>,
    pub address: Option<String>,
    pub public_address: Option<String>,
    pub reachable: bool,
    pub bandwidth: Option<Value>,
    pub script: Option<Value>,
}

impl CycleReport {
    pub fn from_observation(obs: PhaseObservation) -> Self {
        let identity = obs.identity.unwrap_or_else(|| UNKNOWN.to_string());
        let address = obs.address.unwrap_or_else(|| UNKNOWN.to_string());

        let mut summary = String::new();
        let _ = writeln!(summary, "== {}", obs.label);
        let _ = writeln!(summary, "Time: {}", obs.timestamp);
        let _ = writeln!(summary, "Interface: {}", obs.interface);
        let _ = writeln!(summary, "MAC: {identity}");
        let _ = writeln!(summary, "IP: {address}");
        if let Some(public) = &obs.public_address {
            let _ = writeln!(summary, "Public IP: {public}");
        }

        let mut fragments = vec![
            obs.label.clone(),
            if obs.reachable { "Ping OK" } else { "Ping failed" }.to_string(),
        ];

        if obs.reachable {
            if let Some(bandwidth) = &obs.bandwidth {
                let _ = write!(summary, "\nOokla CLI:\n{}\n", summarize_bandwidth(bandwidth));
                fragments.push(bandwidth_fragment(bandwidth));
            }
            if let Some(script) = &obs.script {
                let raw = serde_json::to_string_pretty(script).unwrap_or_default();
                let excerpt: String = raw.chars().take(SCRIPT_EXCERPT_CHARS).collect();
                let _ = write!(summary, "\nSpeed script (raw JSON):\n{excerpt}\n");
                fragments.push(script_fragment(script));
            }
        } else {
            summary.push_str("\nNo connectivity (ping failed).\n");
        }

        CycleReport {
            label: obs.label,
            timestamp: obs.timestamp,
            interface: obs.interface,
            identity,
            address,
            public_address: obs.public_address,
            reachable: obs.reachable,
            bandwidth: obs.bandwidth,
            script: obs.script,
            summary,
            log_line: fragments.join(" | "),
        }
    }
}

/// Multi-line summary of a bandwidth result or its error.
pub fn summarize_bandwidth(result: &Value) -> String {
    match BandwidthResult::from_value(result) {
        Some(r) => format!(
            "Server: {}\nPing: {} ms\nDownload (bandwidth): {:.2} Mbps\nUpload (bandwidth): {:.2} Mbps",
            r.server.host.as_deref().unwrap_or(UNKNOWN),
            r.ping
                .latency
                .map(|l| l.to_string())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            r.download_mbps(),
            r.upload_mbps(),
        ),
        None => match result.get("error") {
            Some(Value::Object(err)) if err.contains_key("stderr") => {
                format!("Ookla error: {}", err["stderr"])
            }
            Some(Value::String(msg)) => format!("Ookla error: {msg}"),
            _ => "Ookla error".to_string(),
        },
    }
}

fn bandwidth_fragment(result: &Value) -> String {
    match BandwidthResult::from_value(result) {
        Some(r) => format!("Ookla DL {:.2} UL {:.2}", r.download_mbps(), r.upload_mbps()),
        None => "Ookla error".to_string(),
    }
}

fn script_fragment(result: &Value) -> String {
    match ScriptResult::from_value(result) {
        Some(r) => format!("Script DL {:.2} UL {:.2}", r.download_mbps, r.upload_mbps),
        None => "Script error/incomplete data".to_string(),
    }
}
