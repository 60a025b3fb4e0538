//! Wire format between `bd` clients and the presence daemon: one JSON
//! request per line, answered by one JSON response per line.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};

use super::PresenceError;
use crate::store::MutationEvent;

/// Bumped whenever requests or responses change shape. A client talking to
/// a daemon with another version treats it as stale.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Publish { event: MutationEvent },
    Poll { since: u64, limit: usize },
    Health,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Pong { version: u32, pid: u32 },
    Published { seq: u64 },
    Events {
        events: Vec<MutationEvent>,
        next_seq: u64,
        /// Set when events after `since` were already evicted from the ring.
        truncated: bool,
    },
    Health(HealthReport),
    Ok,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub version: u32,
    pub pid: u32,
    pub address: String,
    pub uptime_secs: u64,
    pub buffered_events: usize,
    pub last_seq: u64,
    pub flushes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flush_error: Option<String>,
}

pub fn write_message<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
) -> Result<(), PresenceError> {
    let json = serde_json::to_string(message)?;
    writeln!(writer, "{}", json)?;
    writer.flush()?;
    Ok(())
}

/// Reads one line; `Ok(None)` on a clean EOF.
pub fn read_message<R: BufRead, T: for<'de> Deserialize<'de>>(
    reader: &mut R,
) -> Result<Option<T>, PresenceError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}
