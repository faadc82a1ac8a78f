//! Identity rotation over a circular pool of locally administered MAC addresses.
//!
//! The pool is either a curated list (`mac.txt`, one address per line) or,
//! when a region code is configured, ten addresses synthesized from a base
//! prefix and the region's byte. Each pool variant keeps its own persisted
//! cursor, advanced on every successful read.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

/// Curated identity list, relative to the state directory.
pub const STATIC_POOL_FILE: &str = "mac.txt";
/// Cursor for the curated list.
pub const STATIC_CURSOR_FILE: &str = "mac_index.txt";
/// Base prefix used for synthesized pools when none is configured.
pub const DEFAULT_PREFIX: &str = "02:4E:57:00";
/// Number of identities in a synthesized pool.
pub const REGION_POOL_SIZE: u8 = 10;

/// A network hardware identity, upper-cased for canonical comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Canonicalize `raw`; returns `None` for blank input.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Identity(trimmed.to_ascii_uppercase()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Regions ─────────────────────────────────────────────────────────

/// Brazilian federative unit selecting a synthesized pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Ro,
    Ac,
    Am,
    Rr,
    Pa,
    Ap,
    To,
    Ma,
    Pi,
    Ce,
    Rn,
    Pb,
    Pe,
    Al,
    Se,
    Ba,
    Mg,
    Es,
    Rj,
    Sp,
    Pr,
    Sc,
    Rs,
    Ms,
    Mt,
    Go,
    Df,
}

/// Region code → identity byte, indexed by `Region as usize`. The byte spells
/// the IBGE state code in hex digits, so `SP` (IBGE 35) yields `0x35`.
const REGION_TABLE: [(Region, &str, u8); 27] = [
    (Region::Ro, "RO", 0x11),
    (Region::Ac, "AC", 0x12),
    (Region::Am, "AM", 0x13),
    (Region::Rr, "RR", 0x14),
    (Region::Pa, "PA", 0x15),
    (Region::Ap, "AP", 0x16),
    (Region::To, "TO", 0x17),
    (Region::Ma, "MA", 0x21),
    (Region::Pi, "PI", 0x22),
    (Region::Ce, "CE", 0x23),
    (Region::Rn, "RN", 0x24),
    (Region::Pb, "PB", 0x25),
    (Region::Pe, "PE", 0x26),
    (Region::Al, "AL", 0x27),
    (Region::Se, "SE", 0x28),
    (Region::Ba, "BA", 0x29),
    (Region::Mg, "MG", 0x31),
    (Region::Es, "ES", 0x32),
    (Region::Rj, "RJ", 0x33),
    (Region::Sp, "SP", 0x35),
    (Region::Pr, "PR", 0x41),
    (Region::Sc, "SC", 0x42),
    (Region::Rs, "RS", 0x43),
    (Region::Ms, "MS", 0x50),
    (Region::Mt, "MT", 0x51),
    (Region::Go, "GO", 0x52),
    (Region::Df, "DF", 0x53),
];

impl Region {
    fn entry(self) -> &'static (Region, &'static str, u8) {
        &REGION_TABLE[self as usize]
    }

    pub fn code(self) -> &'static str {
        self.entry().1
    }

    pub fn byte(self) -> u8 {
        self.entry().2
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityConfigError {
    #[error("unrecognized region code: {0:?}")]
    UnknownRegion(String),
    #[error("invalid identity prefix {0:?}: expected four hex octets like 02:4E:57:00")]
    InvalidPrefix(String),
}

impl FromStr for Region {
    type Err = IdentityConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        REGION_TABLE
            .iter()
            .find(|(_, code, _)| *code == wanted)
            .map(|(r, _, _)| *r)
            .ok_or_else(|| IdentityConfigError::UnknownRegion(s.to_string()))
    }
}

/// Four-octet base prefix for synthesized identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPrefix([u8; 4]);

impl FromStr for IdentityPrefix {
    type Err = IdentityConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdentityConfigError::InvalidPrefix(s.to_string());
        let octets = s
            .trim()
            .split([':', '-'])
            .map(|part| {
                if part.len() == 2 {
                    u8::from_str_radix(part, 16).map_err(|_| invalid())
                } else {
                    Err(invalid())
                }
            })
            .collect::<Result<Vec<u8>, _>>()?;
        let octets: [u8; 4] = octets.try_into().map_err(|_| invalid())?;
        Ok(IdentityPrefix(octets))
    }
}

impl Default for IdentityPrefix {
    fn default() -> Self {
        IdentityPrefix([0x02, 0x4E, 0x57, 0x00])
    }
}

/// The ten synthesized identities `prefix:region:01` .. `prefix:region:0A`.
pub fn region_pool(prefix: &IdentityPrefix, region: Region) -> Vec<Identity> {
    let [a, b, c, d] = prefix.0;
    (1..=REGION_POOL_SIZE)
        .map(|seq| {
            Identity(format!(
                "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{:02X}:{seq:02X}",
                region.byte()
            ))
        })
        .collect()
}

// ── Cursor persistence ──────────────────────────────────────────────

/// Read a persisted cursor. Missing or unparseable content reads as 0.
pub fn read_cursor(path: &Path) -> usize {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(0)
}

/// Replace the cursor file through a temp file + rename.
pub fn write_cursor(path: &Path, value: usize) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, value.to_string())?;
    fs::rename(&tmp, path)
}

// ── Source ──────────────────────────────────────────────────────────

/// Where the active pool comes from, resolved once at configuration time.
#[derive(Debug, Clone)]
pub enum PoolSource {
    /// Curated list with its own cursor.
    Static { list: PathBuf, cursor: PathBuf },
    /// Synthesized from a region code, one cursor per region.
    Region {
        region: Region,
        prefix: IdentityPrefix,
        cursor: PathBuf,
    },
    /// Region or prefix configuration was rejected; rotation never happens.
    Rejected(IdentityConfigError),
}

/// Produces the next identity from a persisted circular pool.
#[derive(Debug, Clone)]
pub struct IdentitySource {
    source: PoolSource,
}

impl IdentitySource {
    /// Resolve the pool variant for `state_dir`.
    ///
    /// A configured region selects the synthesized pool; a region or prefix
    /// that fails validation yields a source whose `next()` is always `None`.
    pub fn resolve(state_dir: &Path, region: Option<&str>, prefix: Option<&str>) -> Self {
        let region = region.map(str::trim).filter(|r| !r.is_empty());
        let source = match region {
            None => PoolSource::Static {
                list: state_dir.join(STATIC_POOL_FILE),
                cursor: state_dir.join(STATIC_CURSOR_FILE),
            },
            Some(code) => {
                let parsed = code.parse::<Region>().and_then(|region| {
                    let prefix = match prefix.map(str::trim).filter(|p| !p.is_empty()) {
                        Some(p) => p.parse::<IdentityPrefix>()?,
                        None => IdentityPrefix::default(),
                    };
                    Ok((region, prefix))
                });
                match parsed {
                    Ok((region, prefix)) => PoolSource::Region {
                        region,
                        prefix,
                        cursor: state_dir.join(format!("mac_index_{}.txt", region.code())),
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "identity rotation disabled");
                        PoolSource::Rejected(e)
                    }
                }
            }
        };
        Self { source }
    }

    pub fn source(&self) -> &PoolSource {
        &self.source
    }

    /// The active pool, or `None` if none can be constructed.
    pub fn pool(&self) -> Option<Vec<Identity>> {
        let pool = match &self.source {
            PoolSource::Static { list, .. } => load_list(list)?,
            PoolSource::Region { region, prefix, .. } => region_pool(prefix, *region),
            PoolSource::Rejected(_) => return None,
        };
        (!pool.is_empty()).then_some(pool)
    }

    fn cursor_path(&self) -> Option<&Path> {
        match &self.source {
            PoolSource::Static { cursor, .. } | PoolSource::Region { cursor, .. } => Some(cursor),
            PoolSource::Rejected(_) => None,
        }
    }

    /// Take the identity under the cursor and persist the advanced cursor.
    ///
    /// `None` is a normal outcome (no list, empty list, rejected config).
    pub fn next(&self) -> Option<Identity> {
        let pool = self.pool()?;
        let cursor_path = self.cursor_path()?;

        let idx = read_cursor(cursor_path) % pool.len();
        let identity = pool[idx].clone();
        let advanced = (idx + 1) % pool.len();
        if let Err(e) = write_cursor(cursor_path, advanced) {
            tracing::warn!(
                path = %cursor_path.display(),
                error = %e,
                "failed to persist rotation cursor"
            );
        }
        tracing::debug!(%identity, idx, pool_len = pool.len(), "identity selected");
        Some(identity)
    }
}

fn load_list(path: &Path) -> Option<Vec<Identity>> {
    let raw = fs::read_to_string(path).ok()?;
    Some(raw.lines().filter_map(Identity::new).collect())
}
