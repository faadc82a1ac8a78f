//! Agent configuration: CLI flags, environment and the optional `.env` file.
//!
//! Precedence for every option is command line, then environment (including
//! values loaded from `.env`), then the built-in default.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use netwarden_core::cycle::{CycleOptions, POST_RESET_WAIT_FLOOR};
use netwarden_core::relay::{Polarity, RelayPulseSpec};
use netwarden_core::speedtest::{DEFAULT_SCRIPT, DEFAULT_SCRIPT_RESULT, SCRIPT_CSV};

pub const DOTENV_FILE: &str = ".env";

/// Netwarden connectivity recovery agent.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "netwarden",
    about = "Rotates the link identity, probes connectivity and power-cycles the modem"
)]
pub struct Cli {
    /// Run a single cycle and exit.
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Never drive the modem relay.
    #[arg(long, default_value_t = false)]
    pub no_relay: bool,

    /// BCM pin wired to the relay.
    #[arg(long, env = "RELAY_PIN", default_value_t = 17)]
    pub relay_pin: u32,

    /// Drive the pin low to energize the relay.
    #[arg(long, default_value_t = false)]
    pub relay_active_low: bool,

    /// How long the relay is held during a modem reset.
    #[arg(long, default_value_t = 30, allow_negative_numbers = true)]
    pub relay_delay_seconds: i64,

    /// Pause between cycles.
    #[arg(long, default_value_t = 3 * 60 * 60, allow_negative_numbers = true)]
    pub cooldown_seconds: i64,

    /// Wait after relaxing the relay at the start of each cycle.
    #[arg(long, default_value_t = 180)]
    pub boot_settle_seconds: u64,

    /// Speed test script run with `node`.
    #[arg(long, default_value = DEFAULT_SCRIPT)]
    pub js: PathBuf,

    /// Result file written by the speed test script.
    #[arg(long, default_value = DEFAULT_SCRIPT_RESULT)]
    pub json: PathBuf,

    /// Network interface whose identity is rotated.
    #[arg(long, env = "NET_IFACE", default_value = "eth0")]
    pub interface: String,

    /// Federative unit whose synthesized identity pool is used instead of `mac.txt`.
    #[arg(long, env = "MAC_REGION")]
    pub mac_region: Option<String>,

    /// First four octets of synthesized identities.
    #[arg(long, env = "MAC_PREFIX")]
    pub mac_prefix: Option<String>,

    /// Directory holding the identity pool, cursors, results and the cycle log.
    #[arg(long, default_value = ".")]
    pub state_dir: PathBuf,
}

/// Everything the agent needs to assemble the engine.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub state_dir: PathBuf,
    pub cycle: CycleOptions,
    pub relay: RelayPulseSpec,
    pub script: PathBuf,
    pub script_result: PathBuf,
    pub mac_region: Option<String>,
    pub mac_prefix: Option<String>,
}

impl AgentConfig {
    pub fn from_cli(cli: Cli) -> Self {
        let polarity = if cli.relay_active_low {
            Polarity::ActiveLow
        } else {
            Polarity::ActiveHigh
        };
        let relay = RelayPulseSpec::new(cli.relay_pin, polarity);

        let cycle = CycleOptions {
            interface: cli.interface,
            use_relay: !cli.no_relay,
            relay_hold: Duration::from_secs(cli.relay_delay_seconds.max(0) as u64),
            post_reset_floor: POST_RESET_WAIT_FLOOR,
            boot_settle: Duration::from_secs(cli.boot_settle_seconds),
            cooldown: Duration::from_secs(cli.cooldown_seconds.max(0) as u64),
            single_shot: cli.once,
            extra_attachments: vec![cli.state_dir.join(SCRIPT_CSV)],
        };

        Self {
            script: resolve(&cli.state_dir, cli.js),
            script_result: resolve(&cli.state_dir, cli.json),
            state_dir: cli.state_dir,
            cycle,
            relay,
            mac_region: cli.mac_region,
            mac_prefix: cli.mac_prefix,
        }
    }
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

// ── .env ───────────────────────────────────────────────────────────────

/// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped, and a
/// value wrapped in matching single or double quotes is unwrapped.
pub fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Export the variables in `path` that are not already set in the process
/// environment.
///
/// A missing file is not an error; returns how many variables were exported.
/// Must run before any other thread is spawned.
pub fn load_dotenv(path: &Path) -> io::Result<usize> {
    load_dotenv_with(
        path,
        |key| std::env::var_os(key).is_some(),
        |key, value| std::env::set_var(key, value),
    )
}

/// [`load_dotenv`] against an arbitrary variable store.
pub fn load_dotenv_with(
    path: &Path,
    is_set: impl Fn(&str) -> bool,
    mut set: impl FnMut(&str, &str),
) -> io::Result<usize> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut exported = 0;
    for (key, value) in parse_dotenv(&contents) {
        if !is_set(&key) {
            set(&key, &value);
            exported += 1;
        }
    }
    Ok(exported)
}
