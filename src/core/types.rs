//! Core data types shared by drivers and the orchestrator.
//!
//! Key types for driver implementers:
//! - [`Status`]: The `{ok, message}` pair returned across the orchestrator boundary
//! - [`Report`]: Text sink a command writes its human readable output into
//! - [`RegisterGroup`]: Static register map documentation, printed by `map`
//! - [`Confirm`]: Injected operator confirmation for risky writes

use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Outcome of a driver command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub ok: bool,
    pub message: String,
}

impl Status {
    /// Successful status with message
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    /// Failed status with message
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        Status::failure(err.to_string())
    }
}

impl From<Result<String>> for Status {
    fn from(result: Result<String>) -> Self {
        match result {
            Ok(message) => Status::success(message),
            Err(e) => e.into(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ok={} message={}", self.ok, self.message)
    }
}

/// Line-oriented text produced by a command
#[derive(Debug, Default, Clone)]
pub struct Report {
    text: String,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line
    pub fn line(&mut self, line: impl AsRef<str>) {
        self.text.push_str(line.as_ref());
        self.text.push('\n');
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

/// Register access mode as documented by the device vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    /// Some registers in the range are writable
    Mixed,
    /// Writable, and writing can actuate hardware or change persistent config
    HighRisk,
    /// Coils written with function code 0x05
    CoilWrite,
}

impl Access {
    pub fn label(&self) -> &'static str {
        match self {
            Access::ReadOnly => "RO",
            Access::ReadWrite => "RW",
            Access::Mixed => "R/W",
            Access::HighRisk => "RW (high risk)",
            Access::CoilWrite => "coil write",
        }
    }
}

/// One documented block of a device register map
#[derive(Debug, Clone, Copy)]
pub struct RegisterGroup {
    pub start: u16,
    pub end: u16,
    pub access: Access,
    pub description: &'static str,
}

impl RegisterGroup {
    pub const fn new(start: u16, end: u16, access: Access, description: &'static str) -> Self {
        Self {
            start,
            end,
            access,
            description,
        }
    }
}

/// Print a register map into `report`
pub fn write_register_map(report: &mut Report, title: &str, groups: &[RegisterGroup]) {
    report.line(format!("[{}] register map:", title));
    for group in groups {
        report.line(format!(
            "  0x{:04X}-0x{:04X}  {:<15} {}",
            group.start,
            group.end,
            group.access.label(),
            group.description
        ));
    }
}

/// Inclusive address range flagged as risky to write
pub type RiskyRange = (u16, u16);

/// Whether `address` falls inside any of `ranges`
pub fn is_risky(ranges: &[RiskyRange], address: u16) -> bool {
    ranges
        .iter()
        .any(|&(start, end)| address >= start && address <= end)
}

/// Operator confirmation callback, invoked with the target address before a risky write
pub type Confirm = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Confirmation that declines every risky write
pub fn deny_all() -> Confirm {
    Arc::new(|_| false)
}

/// Confirmation that approves every risky write
pub fn allow_all() -> Confirm {
    Arc::new(|_| true)
}

/// Ask for confirmation when `address` is risky
///
/// Returns [`Error::WriteCancelled`] if the operator declines.
pub fn confirm_write(confirm: &Confirm, ranges: &[RiskyRange], address: u16) -> Result<()> {
    if !is_risky(ranges, address) {
        return Ok(());
    }
    log::warn!("Risky write requested at {:#06x}", address);
    if confirm(address) {
        Ok(())
    } else {
        Err(Error::WriteCancelled { address })
    }
}

/// Parse an integer argument, decimal or `0x` hex, with at most one leading `-`
pub fn parse_int(text: &str) -> Result<i64> {
    let invalid = || Error::Format(format!("invalid integer: {}", text));
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let (radix, body) = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => (16, hex),
        None => (10, digits),
    };
    // from_str_radix would otherwise take a second sign
    if !body.starts_with(|c: char| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let value = i64::from_str_radix(body, radix).map_err(|_| invalid())?;
    Ok(if negative { -value } else { value })
}

/// Parse an integer argument and check it fits `[min, max]`
pub fn parse_in_range(text: &str, what: &str, min: i64, max: i64) -> Result<i64> {
    let value = parse_int(text).map_err(|_| Error::Format(format!("invalid {}", what)))?;
    if value < min || value > max {
        return Err(Error::Format(format!(
            "{} {} out of range [{}, {}]",
            what, value, min, max
        )));
    }
    Ok(value)
}

/// Optional positional argument parsed as an integer, `default` when absent
pub fn arg_or(args: &[String], index: usize, what: &str, default: i64) -> Result<i64> {
    match args.get(index) {
        Some(text) => parse_int(text).map_err(|_| Error::Format(format!("invalid {}", what))),
        None => Ok(default),
    }
}
