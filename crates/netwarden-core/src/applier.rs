//! Identity application: sets a new hardware address on the interface.
//!
//! NetworkManager is tried first (cloned MAC on the active connection, then a
//! connection bounce). If it is absent or refuses, the address is set directly
//! with `ip link`. A successful change is followed by a connectivity wait; an
//! identity change is never rolled back.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::command::{succeeded, CommandRunner};
use crate::identity::Identity;
use crate::probe::{wait_until_reachable, Reachability, DEFAULT_WAIT_TIMEOUT};

/// Pause between `nmcli connection down` and `up`.
const BOUNCE_PAUSE: Duration = Duration::from_secs(2);

const WIRED_PROPERTY: &str = "802-ethernet.cloned-mac-address";
const WIRELESS_PROPERTY: &str = "802-11-wireless.cloned-mac-address";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    NetworkManager,
    IpLink,
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mechanism::NetworkManager => write!(f, "nmcli"),
            Mechanism::IpLink => write!(f, "ip link"),
        }
    }
}

/// Result of [`IdentityApplier::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Address changed and connectivity came back within the window.
    Applied { via: Mechanism },
    /// Address changed but connectivity did not return in time.
    Degraded { via: Mechanism },
    /// Both mechanisms rejected the change.
    Failed,
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

pub struct IdentityApplier<R, P> {
    runner: Arc<R>,
    probe: Arc<P>,
    wait_timeout: Duration,
}

impl<R: CommandRunner, P: Reachability> IdentityApplier<R, P> {
    pub fn new(runner: Arc<R>, probe: Arc<P>) -> Self {
        Self {
            runner,
            probe,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Apply `identity` to `interface`, then wait for connectivity.
    pub async fn apply(&self, interface: &str, identity: &Identity) -> ApplyOutcome {
        tracing::info!(interface, %identity, "changing hardware address");

        let via = if self.apply_via_network_manager(interface, identity).await {
            Mechanism::NetworkManager
        } else if self.apply_via_ip_link(interface, identity).await {
            Mechanism::IpLink
        } else {
            tracing::error!(interface, %identity, "no mechanism could apply the address");
            return ApplyOutcome::Failed;
        };

        if wait_until_reachable(&*self.probe, self.wait_timeout).await {
            tracing::info!(interface, %identity, %via, "network back after address change");
            ApplyOutcome::Applied { via }
        } else {
            tracing::warn!(
                interface,
                %identity,
                %via,
                timeout_s = self.wait_timeout.as_secs(),
                "network did not come back after address change"
            );
            ApplyOutcome::Degraded { via }
        }
    }

    /// Set the cloned MAC on the interface's active NetworkManager connection.
    ///
    /// Returns `false` without side effects if `nmcli` is missing or no active
    /// connection is bound to the interface.
    async fn apply_via_network_manager(&self, interface: &str, identity: &Identity) -> bool {
        if !self.runner.is_available("nmcli") {
            tracing::debug!("nmcli not installed");
            return false;
        }

        let active = match self
            .runner
            .run("nmcli", &["-t", "-f", "NAME,DEVICE", "connection", "show", "--active"])
            .await
        {
            Ok(out) if out.success() => out.stdout,
            Ok(out) => {
                tracing::debug!(code = out.code(), "nmcli connection query failed");
                return false;
            }
            Err(e) => {
                tracing::debug!(error = %e, "nmcli connection query failed");
                return false;
            }
        };

        let Some(connection) = find_connection(&active, interface) else {
            tracing::debug!(interface, "no active NetworkManager connection on interface");
            return false;
        };

        let property = match self
            .runner
            .run("nmcli", &["-t", "-f", "GENERAL.TYPE", "device", "show", interface])
            .await
        {
            Ok(out) if out.success() && out.stdout.contains("wifi") => WIRELESS_PROPERTY,
            _ => WIRED_PROPERTY,
        };

        let mac = identity.as_str();
        if !succeeded(
            &*self.runner,
            "nmcli",
            &["connection", "modify", &connection, property, mac],
        )
        .await
        {
            tracing::warn!(connection = %connection, property, "nmcli refused the cloned address");
            return false;
        }

        succeeded(&*self.runner, "nmcli", &["connection", "down", &connection]).await;
        tokio::time::sleep(BOUNCE_PAUSE).await;
        if !succeeded(&*self.runner, "nmcli", &["connection", "up", &connection]).await {
            tracing::warn!(connection = %connection, "nmcli could not bring the connection back up");
        }
        true
    }

    /// Down, set address, up. The interface is always brought back up.
    async fn apply_via_ip_link(&self, interface: &str, identity: &Identity) -> bool {
        let down = succeeded(&*self.runner, "ip", &["link", "set", interface, "down"]).await;

        let set = match self
            .runner
            .run(
                "ip",
                &["link", "set", "dev", interface, "address", identity.as_str()],
            )
            .await
        {
            Ok(out) if out.success() => true,
            Ok(out) => {
                tracing::warn!(
                    interface,
                    %identity,
                    code = out.code(),
                    stderr = %out.stderr.trim(),
                    "ip link address change failed"
                );
                false
            }
            Err(e) => {
                tracing::warn!(interface, error = %e, "ip link address change failed");
                false
            }
        };

        let up = succeeded(&*self.runner, "ip", &["link", "set", interface, "up"]).await;
        down && set && up
    }
}

/// Find the active connection bound to `interface` in `nmcli -t` output.
///
/// Terse output escapes `:` inside names as `\:`, so the device is whatever
/// follows the last unescaped separator.
fn find_connection(terse: &str, interface: &str) -> Option<String> {
    terse.lines().find_map(|line| {
        let (name, device) = line.trim().rsplit_once(':')?;
        (device == interface && !name.is_empty()).then(|| name.replace("\\:", ":"))
    })
}
