//! Recovery engine for the Netwarden host agent.
//!
//! This crate contains:
//! - **Identity rotation**: circular MAC pool (static list or region-synthesized)
//! - **Identity application**: NetworkManager first, `ip link` fallback
//! - **Connectivity probing**: ping-based reachability and the poll-wait primitive
//! - **Relay control**: modem power-cycle pulses over an optional digital output
//! - **Cycle orchestration**: the rotate → apply → probe → reset → log state machine
//! - **Cycle log**: append-only `;`-delimited history
//!
//! Every external action goes through [`command::CommandRunner`], so the whole
//! engine can be driven by scripted command output in tests.

pub mod address;
pub mod applier;
pub mod command;
pub mod cycle;
pub mod cycle_log;
pub mod error;
pub mod identity;
pub mod notify;
pub mod probe;
pub mod relay;
pub mod report;
pub mod speedtest;
pub mod test_util;
