//! Cycle report notification.
//!
//! The engine composes one [`Notification`] per cycle; delivery is up to a
//! [`Notifier`] implementation (the agent sends it as email). Delivery is
//! best-effort and never retried.

use std::fmt::Write as _;
use std::future::Future;
use std::path::PathBuf;

use thiserror::Error;

use crate::cycle_log::LOG_FILE;
use crate::report::CycleReport;

pub const SUBJECT: &str = "Connection test report (netwarden)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub attachments: Vec<PathBuf>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("missing mail settings: {0}")]
    NotConfigured(String),
    #[error("mail transport failed: {0}")]
    Transport(String),
}

pub trait Notifier: Send + Sync {
    fn send(&self, notification: &Notification)
        -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Build the cycle notification: every report summary, then the log lines
/// appended this cycle. Only attachment candidates that exist are kept.
pub fn compose(reports: &[CycleReport], candidates: &[PathBuf]) -> Notification {
    let mut body = String::new();
    for report in reports {
        body.push_str(&report.summary);
        body.push_str("\n\n");
    }
    let _ = writeln!(body, "Entries appended to {LOG_FILE}:");
    for report in reports {
        let _ = writeln!(body, "- {} | {}", report.timestamp, report.log_line);
    }

    Notification {
        subject: SUBJECT.to_string(),
        body,
        attachments: candidates.iter().filter(|p| p.exists()).cloned().collect(),
    }
}
