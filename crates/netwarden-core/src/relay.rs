//! Relay control: power-cycles the upstream modem through a digital output.
//!
//! The output line is probed once at startup. When it is unavailable every
//! relay action is a no-op that reports `false`. When available, the pin is
//! driven off on acquisition, at every cycle boundary, and on release; release
//! tears the output down exactly once, including when the controller is dropped.

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Which level energizes the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    #[default]
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    pub fn on(self) -> Level {
        match self {
            Polarity::ActiveHigh => Level::High,
            Polarity::ActiveLow => Level::Low,
        }
    }

    pub fn off(self) -> Level {
        match self {
            Polarity::ActiveHigh => Level::Low,
            Polarity::ActiveLow => Level::High,
        }
    }
}

/// A single output pin.
pub trait DigitalOutput: Send {
    fn set(&mut self, level: Level) -> io::Result<()>;

    /// Return the pin to the platform and free it.
    fn cleanup(&mut self) -> io::Result<()>;
}

/// Acquisition failure: the platform has no usable output for the relay.
#[derive(Debug, Error)]
#[error("relay output unavailable: {reason}")]
pub struct Unsupported {
    pub reason: String,
}

impl Unsupported {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The relay output as resolved once at startup.
pub enum RelayCapability {
    Available(Box<dyn DigitalOutput>),
    Unavailable,
}

impl RelayCapability {
    /// Fold a startup probe into a capability, logging why it is missing.
    pub fn from_probe(probe: Result<Box<dyn DigitalOutput>, Unsupported>) -> Self {
        match probe {
            Ok(output) => RelayCapability::Available(output),
            Err(e) => {
                tracing::warn!(error = %e, "continuing without relay");
                RelayCapability::Unavailable
            }
        }
    }
}

/// Pin and polarity of the relay output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPulseSpec {
    pub pin: u32,
    pub polarity: Polarity,
}

impl RelayPulseSpec {
    pub fn new(pin: u32, polarity: Polarity) -> Self {
        Self { pin, polarity }
    }
}

/// Exclusive owner of the relay output for the process lifetime.
pub struct RelayController {
    capability: RelayCapability,
    spec: RelayPulseSpec,
}

impl RelayController {
    pub fn new(capability: RelayCapability, spec: RelayPulseSpec) -> Self {
        let mut controller = Self { capability, spec };
        if controller.is_available() {
            controller.drive_off();
            tracing::info!(pin = spec.pin, polarity = ?spec.polarity, "relay output acquired");
        }
        controller
    }

    pub fn is_available(&self) -> bool {
        matches!(self.capability, RelayCapability::Available(_))
    }

    /// Energize the relay for `hold`, then de-energize it.
    ///
    /// Returns `false` immediately when no output was acquired.
    pub async fn pulse(&mut self, hold: Duration) -> bool {
        let polarity = self.spec.polarity;
        let RelayCapability::Available(output) = &mut self.capability else {
            tracing::warn!("relay unavailable, skipping modem reset");
            return false;
        };

        if let Err(e) = output.set(polarity.on()) {
            tracing::warn!(pin = self.spec.pin, error = %e, "failed to energize relay");
            return false;
        }
        tracing::info!(pin = self.spec.pin, hold_s = hold.as_secs(), "relay energized");
        tokio::time::sleep(hold).await;

        if let Err(e) = output.set(polarity.off()) {
            tracing::warn!(pin = self.spec.pin, error = %e, "failed to de-energize relay");
        }
        tracing::info!(pin = self.spec.pin, "relay released");
        true
    }

    /// Drive the pin to its off level without giving it up.
    pub fn relax(&mut self) {
        if self.is_available() {
            self.drive_off();
        }
    }

    /// Drive the pin off and hand it back to the platform. Idempotent.
    pub fn release(&mut self) {
        let capability = std::mem::replace(&mut self.capability, RelayCapability::Unavailable);
        if let RelayCapability::Available(mut output) = capability {
            if let Err(e) = output.set(self.spec.polarity.off()) {
                tracing::warn!(pin = self.spec.pin, error = %e, "failed to drive relay off on release");
            }
            if let Err(e) = output.cleanup() {
                tracing::warn!(pin = self.spec.pin, error = %e, "relay cleanup failed");
            }
            tracing::info!(pin = self.spec.pin, "relay output released");
        }
    }

    fn drive_off(&mut self) {
        let off = self.spec.polarity.off();
        if let RelayCapability::Available(output) = &mut self.capability {
            if let Err(e) = output.set(off) {
                tracing::warn!(pin = self.spec.pin, error = %e, "failed to drive relay off");
            }
        }
    }
}

impl Drop for RelayController {
    fn drop(&mut self) {
        self.release();
    }
}
