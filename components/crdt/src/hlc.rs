/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The Hybrid Logical Clock value type.
//!
//! An HLC combines a wall-clock millisecond timestamp with a 16-bit logical
//! counter and a node identifier, giving a total order over events that stays
//! close to wall time. The canonical textual form is
//!
//! ```text
//! 2021-01-01T00:00:00.123-00AB-node1
//! ```
//!
//! i.e. an ISO-8601 UTC timestamp with exactly three fractional digits, the
//! counter as exactly four uppercase hex digits, and the node id. The textual
//! form is the wire type: change rows carry it, so it must stay byte-stable.
//! Because the parser splits on the `-` delimiters, node ids must not contain
//! `-` themselves; construction rejects such ids so every value that can be
//! formatted can also be parsed back. Note that textual ordering only matches
//! HLC ordering within a single second; always compare parsed values, never
//! strings.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::HlcError;

/// Largest representable logical counter.
pub const MAX_COUNTER: u16 = 0xFFFF;

/// Node ids must be strictly shorter than this.
pub const MAX_NODE_ID_LEN: usize = 64;

/// How far (in milliseconds) a remote clock may run ahead of the local wall
/// clock before a merge is rejected.
pub const MAX_DRIFT_MS: i64 = 60_000;

/// A single HLC reading. Immutable once constructed; all operations return a
/// new value.
///
/// The derived ordering is the HLC total order: `(date_time, counter,
/// node_id)` with the node id compared bytewise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hlc {
    date_time: i64,
    counter: u16,
    node_id: String,
}

/// Node ids are non-empty, shorter than [`MAX_NODE_ID_LEN`] bytes, and free
/// of the `-` delimiter. The installers run the same check on the ids they
/// bake into generated SQL.
pub fn check_node_id(node_id: &str) -> Result<(), HlcError> {
    if node_id.is_empty() || node_id.contains('-') {
        return Err(HlcError::InvalidNodeId(node_id.to_owned()));
    }
    if node_id.len() >= MAX_NODE_ID_LEN {
        return Err(HlcError::NodeIdTooLong(node_id.len()));
    }
    Ok(())
}

impl Hlc {
    pub fn new(date_time: i64, counter: u16, node_id: impl Into<String>) -> Result<Self, HlcError> {
        let node_id = node_id.into();
        check_node_id(&node_id)?;
        Ok(Hlc {
            date_time,
            counter,
            node_id,
        })
    }

    /// An HLC at the current wall time with a zero counter.
    pub fn now(node_id: impl Into<String>) -> Result<Self, HlcError> {
        Self::new(Utc::now().timestamp_millis(), 0, node_id)
    }

    /// An HLC at the UNIX epoch; sorts before every real reading.
    pub fn zero(node_id: impl Into<String>) -> Result<Self, HlcError> {
        Self::new(0, 0, node_id)
    }

    pub fn from_millis(millis: i64, node_id: impl Into<String>) -> Result<Self, HlcError> {
        Self::new(millis, 0, node_id)
    }

    /// UTC milliseconds since the epoch.
    pub fn date_time(&self) -> i64 {
        self.date_time
    }

    pub fn counter(&self) -> u16 {
        self.counter
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The next reading on this node: same wall component, counter + 1.
    ///
    /// The wall component is deliberately not advanced here; this keeps the
    /// operation deterministic so it is safe to call from inside database
    /// triggers.
    pub fn increment(&self) -> Result<Self, HlcError> {
        if self.counter == MAX_COUNTER {
            return Err(HlcError::CounterOverflow);
        }
        Ok(Hlc {
            date_time: self.date_time,
            counter: self.counter + 1,
            node_id: self.node_id.clone(),
        })
    }

    /// Fold a remote reading into this clock, given the local wall time.
    ///
    /// A remote that is not ahead of us leaves the local value untouched.
    /// Otherwise the remote must come from a different node and must not be
    /// more than [`MAX_DRIFT_MS`] ahead of `wall_now`; the result carries the
    /// local node id at `max(wall_now, remote.date_time)`, keeping the remote
    /// counter only when the remote wall component survives.
    pub fn merge(&self, remote: &Hlc, wall_now: i64) -> Result<Self, HlcError> {
        if remote <= self {
            return Ok(self.clone());
        }
        if self.node_id == remote.node_id {
            return Err(HlcError::DuplicateNode(remote.node_id.clone()));
        }
        let ahead = remote.date_time - wall_now;
        if ahead > MAX_DRIFT_MS {
            return Err(HlcError::RemoteDrift(ahead));
        }
        let date_time = wall_now.max(remote.date_time);
        let counter = if date_time == remote.date_time {
            remote.counter
        } else {
            0
        };
        Ok(Hlc {
            date_time,
            counter,
            node_id: self.node_id.clone(),
        })
    }

    /// Sign of `self` relative to `other`: -1, 0 or +1.
    pub fn compare(&self, other: &Hlc) -> i32 {
        match self.cmp(other) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dt = DateTime::from_timestamp_millis(self.date_time).unwrap_or(DateTime::UNIX_EPOCH);
        write!(
            f,
            "{}-{:04X}-{}",
            dt.format("%Y-%m-%dT%H:%M:%S%.3f"),
            self.counter,
            self.node_id
        )
    }
}

impl FromStr for Hlc {
    type Err = HlcError;

    /// Splits on the last two `-` delimiters: everything after the last dash
    /// is the node id, the four hex digits before it the counter, and the
    /// remainder the timestamp. The timestamp may omit fractional seconds
    /// and the trailing `Z`; a missing zone reads as UTC.
    fn from_str(s: &str) -> Result<Self, HlcError> {
        let node_dash = s.rfind('-').ok_or(HlcError::InvalidFormat)?;
        let (rest, node_id) = (&s[..node_dash], &s[node_dash + 1..]);
        let counter_dash = rest.rfind('-').ok_or(HlcError::InvalidFormat)?;
        let (timestamp, counter) = (&rest[..counter_dash], &rest[counter_dash + 1..]);
        if node_id.is_empty() || counter.is_empty() || timestamp.is_empty() {
            return Err(HlcError::InvalidFormat);
        }
        if node_id.len() >= MAX_NODE_ID_LEN {
            return Err(HlcError::NodeIdTooLong(node_id.len()));
        }
        let counter = u32::from_str_radix(counter, 16).map_err(|_| HlcError::InvalidFormat)?;
        if counter > MAX_COUNTER as u32 {
            return Err(HlcError::CounterOutOfRange(counter));
        }
        Ok(Hlc {
            date_time: parse_timestamp_millis(timestamp)?,
            counter: counter as u16,
            node_id: node_id.to_owned(),
        })
    }
}

fn parse_timestamp_millis(s: &str) -> Result<i64, HlcError> {
    // Offset-carrying forms first ("…+00:00"), then naive forms read as UTC.
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    let naive = s.strip_suffix('Z').unwrap_or(s);
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|dt| dt.and_utc().timestamp_millis())
        .map_err(|_| HlcError::InvalidTimestamp(s.to_owned()))
}

impl ToSql for Hlc {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for Hlc {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: HlcError| FromSqlError::Other(Box::new(e)))
    }
}

// On the wire an HLC is its canonical text, nothing more.
impl Serialize for Hlc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hlc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
