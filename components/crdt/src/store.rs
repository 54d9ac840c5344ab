/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Typed access over the SQL surface.
//!
//! [`Change`] is the insert side: one mutation intent, serializable so hosts
//! can ship change rows between peers and feed them back in with
//! [`insert_change`]; the merge trigger does the rest. [`Record`] is the
//! read side of `crdt_records`.

use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sql_support::ConnExt;

use crate::error::Result;
use crate::hlc::Hlc;

/// Operator codes understood by the merge trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// `jsonb_set` at `path`; same transform as [`Op::Assign`].
    #[serde(rename = "set")]
    Set,
    /// The default. Whole-document assignment when `path` is `$`.
    #[serde(rename = "=")]
    Assign,
    #[serde(rename = "insert")]
    Insert,
    /// RFC 7396 merge-patch; `path` is ignored.
    #[serde(rename = "patch")]
    Patch,
    #[serde(rename = "remove")]
    Remove,
    #[serde(rename = "replace")]
    Replace,
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Subtract,
    #[serde(rename = "*")]
    Multiply,
    #[serde(rename = "/")]
    Divide,
    #[serde(rename = "%")]
    Modulo,
    #[serde(rename = "&")]
    BitAnd,
    #[serde(rename = "|")]
    BitOr,
    #[serde(rename = "||")]
    Concat,
}

impl Op {
    pub fn as_sql(self) -> &'static str {
        match self {
            Op::Set => "set",
            Op::Assign => "=",
            Op::Insert => "insert",
            Op::Patch => "patch",
            Op::Remove => "remove",
            Op::Replace => "replace",
            Op::Add => "+",
            Op::Subtract => "-",
            Op::Multiply => "*",
            Op::Divide => "/",
            Op::Modulo => "%",
            Op::BitAnd => "&",
            Op::BitOr => "|",
            Op::Concat => "||",
        }
    }
}

impl Default for Op {
    fn default() -> Self {
        Op::Assign
    }
}

/// One mutation intent against a logical row. A `None` payload tombstones
/// the record regardless of `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub pk: String,
    pub tbl: String,
    pub data: Option<JsonValue>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub op: Op,
    pub hlc: Hlc,
}

fn default_path() -> String {
    "$".into()
}

impl Change {
    /// A whole-document assignment (or tombstone, for a `None` payload).
    pub fn assign(
        tbl: impl Into<String>,
        pk: impl Into<String>,
        data: Option<JsonValue>,
        hlc: Hlc,
    ) -> Self {
        Change {
            pk: pk.into(),
            tbl: tbl.into(),
            data,
            path: default_path(),
            op: Op::Assign,
            hlc,
        }
    }

    /// A path-scoped operation.
    pub fn at_path(
        tbl: impl Into<String>,
        pk: impl Into<String>,
        op: Op,
        path: impl Into<String>,
        data: JsonValue,
        hlc: Hlc,
    ) -> Self {
        Change {
            pk: pk.into(),
            tbl: tbl.into(),
            data: Some(data),
            path: path.into(),
            op,
            hlc,
        }
    }
}

/// The materialized state of one logical row, as read back from
/// `crdt_records`. `data` of `None` means the record is tombstoned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub id: String,
    pub tbl: String,
    pub data: Option<JsonValue>,
    pub hlc: String,
    pub path: Option<String>,
    pub op: Option<String>,
    pub node_id: String,
    pub deleted: bool,
}

impl Record {
    fn from_row(row: &Row<'_>) -> Result<Self> {
        let data: Option<String> = row.get("data")?;
        Ok(Record {
            id: row.get("id")?,
            tbl: row.get("tbl")?,
            data: match data {
                Some(raw) => Some(serde_json::from_str(&raw)?),
                None => None,
            },
            hlc: row.get("hlc")?,
            path: row.get("path")?,
            op: row.get("op")?,
            node_id: row.get("node_id")?,
            deleted: row.get("deleted")?,
        })
    }
}

/// Append one change to the log. The merge into `crdt_records` happens in
/// the same statement via the global trigger, so a change that cannot be
/// applied (malformed payload, arithmetic on the wrong shape) fails here and
/// leaves no trace.
pub fn insert_change(conn: &Connection, change: &Change) -> Result<()> {
    let data = change.data.as_ref().map(|v| v.to_string());
    conn.execute_cached(
        "INSERT INTO crdt_changes (pk, tbl, data, path, op, hlc)
         VALUES (?, ?, jsonb(?), ?, ?, ?)",
        (
            &change.pk,
            &change.tbl,
            data,
            &change.path,
            change.op.as_sql(),
            &change.hlc,
        ),
    )?;
    Ok(())
}

const RECORD_COLS: &str = "id, tbl, json(data) AS data, hlc, path, op, node_id, deleted";

/// Current state of one logical row, tombstoned or not.
pub fn get_record(conn: &Connection, tbl: &str, id: &str) -> Result<Option<Record>> {
    conn.try_query_row(
        &format!("SELECT {RECORD_COLS} FROM crdt_records WHERE tbl = ? AND id = ?"),
        (tbl, id),
        |row| Record::from_row(row),
    )
}

/// All live (non-tombstoned) records of a logical table.
pub fn get_records(conn: &Connection, tbl: &str) -> Result<Vec<Record>> {
    conn.query_rows_and_then(
        &format!("SELECT {RECORD_COLS} FROM crdt_records WHERE tbl = ? AND NOT deleted ORDER BY id"),
        (tbl,),
        |row| Record::from_row(row),
    )
}
