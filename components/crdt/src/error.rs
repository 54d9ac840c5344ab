/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Error handling for the component.
//!
//! Everything uses the internal `Error` enum; HLC parse and clock logic
//! failures have their own `HlcError` so that callers (and the SQL function
//! surface) can distinguish the individual failure kinds.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HLC error: {0}")]
    Hlc(#[from] HlcError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Table names are embedded in generated DDL, so names carrying quote
    /// characters are rejected up front.
    #[error("Invalid table name: {name:?}")]
    InvalidTableName { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HlcError {
    #[error("input is not structured as <timestamp>-<counter>-<node_id>")]
    InvalidFormat,

    #[error("timestamp component is not ISO-8601: {0:?}")]
    InvalidTimestamp(String),

    #[error("counter {0:#x} does not fit in 16 bits")]
    CounterOutOfRange(u32),

    #[error("node id is {0} bytes, the limit is 63")]
    NodeIdTooLong(usize),

    #[error("node id {0:?} is empty or contains '-'")]
    InvalidNodeId(String),

    #[error("counter overflow past 0xFFFF")]
    CounterOverflow,

    #[error("remote node id {0:?} matches the local node")]
    DuplicateNode(String),

    #[error("remote clock is {0}ms ahead of the local wall clock")]
    RemoteDrift(i64),
}
