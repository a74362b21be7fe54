//! Memory access log emitted by the instrumentation.
//!
//! One access per line:
//!
//! ```text
//! [W] <ip> <address> <size> <value>
//! [R] <ip> <address> <size> <value>
//! ```
//!
//! All numbers are hexadecimal, `0x` prefix optional, except `size` which is a decimal byte count.
//! Other lines are ignored.

use serde::{Deserialize, Serialize};

use crate::error::TraceFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    Read,
    Write,
}

/// A memory access performed by the traced program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub kind: AccessKind,
    /// Address of the instruction performing the access
    pub ip: u64,
    pub address: u64,
    /// Access size in bytes
    pub size: u8,
    pub value: u64,
}

fn parse_hex(token: &str) -> Option<u64> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u64::from_str_radix(digits, 16).ok()
}

fn parse_event(kind: AccessKind, fields: &str) -> Option<MemoryEvent> {
    let mut fields = fields.split_whitespace();
    let ip = parse_hex(fields.next()?)?;
    let address = parse_hex(fields.next()?)?;
    let size: u8 = fields.next()?.parse().ok()?;
    let value = parse_hex(fields.next()?)?;
    if fields.next().is_some() || size == 0 || size > 8 {
        return None;
    }

    Some(MemoryEvent {
        kind,
        ip,
        address,
        size,
        value,
    })
}

/// Parses a memory access log.
pub fn parse_events(log: &str) -> Result<Vec<MemoryEvent>, TraceFailure> {
    let mut events = Vec::new();
    for (lineno, line) in log.lines().enumerate() {
        let line = line.trim_start();
        let (kind, fields) = if let Some(fields) = line.strip_prefix("[W]") {
            (AccessKind::Write, fields)
        } else if let Some(fields) = line.strip_prefix("[R]") {
            (AccessKind::Read, fields)
        } else {
            continue;
        };

        let event = parse_event(kind, fields).ok_or_else(|| {
            TraceFailure::MalformedTrace(format!("line {}: {line:?}", lineno + 1))
        })?;
        events.push(event);
    }

    Ok(events)
}
