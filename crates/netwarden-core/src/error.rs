//! Per-cycle fault taxonomy.
//!
//! Every fault is recovered where it happens: logged with its marker and
//! folded into the cycle outcome. None of them stops the orchestrator.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CycleFault {
    /// No identity could be drawn; informational.
    #[error("no identity available for rotation")]
    SourceExhausted,
    #[error("could not apply identity {identity}")]
    ApplyFailed { identity: String },
    #[error("identity {identity} applied but connectivity did not return")]
    ApplyDegraded { identity: String },
    #[error("no connectivity during {label}")]
    ProbeUnreachable { label: String },
    #[error("{probe} probe failed during {label}")]
    SpeedProbeFailed { probe: &'static str, label: String },
    #[error("relay output unavailable, modem not reset")]
    RelayUnavailable,
    #[error("connectivity did not return after modem reset")]
    ResetNotRecovered,
    #[error("report notification failed: {reason}")]
    NotificationFailed { reason: String },
}

impl CycleFault {
    /// Short stable tag written to logs next to the message.
    pub fn marker(&self) -> &'static str {
        match self {
            CycleFault::SourceExhausted => "source_exhausted",
            CycleFault::ApplyFailed { .. } => "apply_failed",
            CycleFault::ApplyDegraded { .. } => "apply_degraded",
            CycleFault::ProbeUnreachable { .. } => "probe_unreachable",
            CycleFault::SpeedProbeFailed { .. } => "speed_probe_failed",
            CycleFault::RelayUnavailable => "relay_unavailable",
            CycleFault::ResetNotRecovered => "reset_not_recovered",
            CycleFault::NotificationFailed { .. } => "notification_failed",
        }
    }

    /// Log the fault at the level its kind deserves.
    pub fn log(&self) {
        match self {
            CycleFault::SourceExhausted => {
                tracing::info!(fault = self.marker(), "{self}");
            }
            _ => tracing::warn!(fault = self.marker(), "{self}"),
        }
    }
}
