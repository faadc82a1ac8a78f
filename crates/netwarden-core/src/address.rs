//! Address lookup for reports: the interface's local IPv4 and, when the link
//! is up, the public address as seen from the internet.

use std::net::IpAddr;
use std::sync::Arc;

use crate::command::CommandRunner;

/// Public-address echo services, tried in order.
pub const PUBLIC_ADDRESS_ENDPOINTS: [&str; 3] = [
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
    "https://icanhazip.com",
];

pub struct AddressResolver<R> {
    runner: Arc<R>,
    interface: String,
}

impl<R: CommandRunner> AddressResolver<R> {
    pub fn new(runner: Arc<R>, interface: impl Into<String>) -> Self {
        Self {
            runner,
            interface: interface.into(),
        }
    }

    /// First IPv4 address configured on the interface.
    pub async fn local_ipv4(&self) -> Option<String> {
        let out = self
            .runner
            .run("ip", &["-4", "addr", "show", "dev", &self.interface])
            .await
            .ok()?;
        if !out.success() {
            return None;
        }
        parse_inet(&out.stdout)
    }

    /// Public address from the first endpoint that answers with a valid IP.
    pub async fn public_address(&self) -> Option<String> {
        for endpoint in PUBLIC_ADDRESS_ENDPOINTS {
            match self
                .runner
                .run("curl", &["-fsS", "--max-time", "5", endpoint])
                .await
            {
                Ok(out) if out.success() => {
                    let candidate = out.stdout.trim();
                    if candidate.parse::<IpAddr>().is_ok() {
                        return Some(candidate.to_string());
                    }
                    tracing::debug!(endpoint, "public address endpoint returned garbage");
                }
                Ok(out) => tracing::debug!(endpoint, code = out.code(), "public address lookup failed"),
                Err(e) => tracing::debug!(endpoint, error = %e, "public address lookup failed"),
            }
        }
        None
    }
}

/// Extract the address from the first `inet a.b.c.d/nn` line of `ip addr`.
fn parse_inet(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.trim_start().strip_prefix("inet ")?;
        let cidr = rest.split_whitespace().next()?;
        let (addr, _) = cidr.split_once('/')?;
        Some(addr.to_string())
    })
}
