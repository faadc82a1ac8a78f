//! Append-only cycle history (`connection_log.csv`).
//!
//! `;`-delimited, one physical line per row, with a fixed header written when
//! the file is created. The file is never rewritten.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::report::CycleReport;

pub const LOG_FILE: &str = "connection_log.csv";
pub const HEADER: &str = "timestamp;mac;ip;result";

const SEPARATOR: char = ';';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleLogRow {
    pub timestamp: String,
    pub identity: String,
    pub address: String,
    pub result: String,
}

impl From<&CycleReport> for CycleLogRow {
    fn from(report: &CycleReport) -> Self {
        CycleLogRow {
            timestamp: report.timestamp.clone(),
            identity: report.identity.clone(),
            address: report.address.clone(),
            result: report.log_line.clone(),
        }
    }
}

/// Neutralize characters that would break the row format.
pub fn sanitize(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            '\n' | '\r' => ' ',
            SEPARATOR => ',',
            other => other,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CycleLog {
    path: PathBuf,
}

impl CycleLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, creating the file with its header if needed.
    ///
    /// Header and row go out in a single write to an `O_APPEND` handle.
    pub fn append(&self, row: &CycleLogRow) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut buf = String::new();
        if file.metadata()?.len() == 0 {
            buf.push_str(HEADER);
            buf.push('\n');
        }
        buf.push_str(&format!(
            "{};{};{};{}\n",
            sanitize(&row.timestamp),
            sanitize(&row.identity),
            sanitize(&row.address),
            sanitize(&row.result)
        ));
        file.write_all(buf.as_bytes())
    }

    /// Read every row back, skipping the header.
    pub fn read_rows(&self) -> io::Result<Vec<CycleLogRow>> {
        let raw = fs::read_to_string(&self.path)?;
        Ok(raw
            .lines()
            .filter(|line| *line != HEADER && !line.is_empty())
            .filter_map(|line| {
                let mut parts = line.splitn(4, SEPARATOR);
                Some(CycleLogRow {
                    timestamp: parts.next()?.to_string(),
                    identity: parts.next()?.to_string(),
                    address: parts.next()?.to_string(),
                    result: parts.next()?.to_string(),
                })
            })
            .collect())
    }
}
