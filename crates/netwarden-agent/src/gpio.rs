//! Relay output over the sysfs GPIO interface (`/sys/class/gpio`).
//!
//! Pins are BCM numbers. Newer kernels register the SoC controller at a
//! non-zero base, so the BCM number is offset by the base of the first
//! controller large enough to hold it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use netwarden_core::relay::{DigitalOutput, Level, Polarity, Unsupported};

pub const GPIO_ROOT: &str = "/sys/class/gpio";

/// udev may still be adjusting permissions right after export.
const EXPORT_SETTLE_ATTEMPTS: u32 = 10;
const EXPORT_SETTLE_PAUSE: Duration = Duration::from_millis(50);

pub struct SysfsOutput {
    root: PathBuf,
    line: u32,
    dir: PathBuf,
}

impl SysfsOutput {
    /// Export `pin` and configure it as an output already driven to `idle`.
    ///
    /// Direction and initial level are set in one write, so the line never
    /// passes through the other level.
    pub fn open(root: &Path, pin: u32, idle: Level) -> Result<Self, Unsupported> {
        if !root.join("export").exists() {
            return Err(Unsupported::new(format!(
                "no sysfs GPIO interface at {}",
                root.display()
            )));
        }
        let line = resolve_line(root, pin)?;
        let dir = root.join(format!("gpio{line}"));

        if !dir.exists() {
            fs::write(root.join("export"), line.to_string())
                .map_err(|e| Unsupported::new(format!("export gpio{line}: {e}")))?;
        }

        let direction = match idle {
            Level::High => "high",
            Level::Low => "low",
        };
        let mut attempt = 0;
        loop {
            match fs::write(dir.join("direction"), direction) {
                Ok(()) => break,
                Err(e) if attempt + 1 < EXPORT_SETTLE_ATTEMPTS => {
                    tracing::debug!(line, attempt, error = %e, "gpio not ready yet");
                    attempt += 1;
                    std::thread::sleep(EXPORT_SETTLE_PAUSE);
                }
                Err(e) => {
                    return Err(Unsupported::new(format!("configure gpio{line} as output: {e}")))
                }
            }
        }

        tracing::debug!(pin, line, "gpio exported");
        Ok(Self {
            root: root.to_path_buf(),
            line,
            dir,
        })
    }
}

impl DigitalOutput for SysfsOutput {
    fn set(&mut self, level: Level) -> io::Result<()> {
        let value = match level {
            Level::High => "1",
            Level::Low => "0",
        };
        fs::write(self.dir.join("value"), value)
    }

    fn cleanup(&mut self) -> io::Result<()> {
        fs::write(self.root.join("unexport"), self.line.to_string())
    }
}

/// Map a BCM pin onto a global sysfs line number.
fn resolve_line(root: &Path, pin: u32) -> Result<u32, Unsupported> {
    let entries = fs::read_dir(root)
        .map_err(|e| Unsupported::new(format!("read {}: {e}", root.display())))?;

    let mut chips: Vec<(u32, u32)> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("gpiochip"))
        .filter_map(|e| {
            let base = read_number(&e.path().join("base"))?;
            let ngpio = read_number(&e.path().join("ngpio"))?;
            Some((base, ngpio))
        })
        .collect();
    chips.sort_unstable();

    if chips.is_empty() {
        // No controller metadata; assume the legacy flat numbering.
        return Ok(pin);
    }
    chips
        .iter()
        .find(|(_, ngpio)| pin < *ngpio)
        .map(|(base, _)| base + pin)
        .ok_or_else(|| Unsupported::new(format!("no GPIO controller exposes pin {pin}")))
}

fn read_number(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Acquire the relay pin on this host, idling at the off level for `polarity`.
pub fn probe_capability(
    pin: u32,
    polarity: Polarity,
) -> Result<Box<dyn DigitalOutput>, Unsupported> {
    SysfsOutput::open(Path::new(GPIO_ROOT), pin, polarity.off())
        .map(|o| Box::new(o) as Box<dyn DigitalOutput>)
}
