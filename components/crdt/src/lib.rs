/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A last-writer-wins per-field CRDT layer over SQLite.
//!
//! Applications write to ordinary-looking tables; underneath, every mutation
//! is recorded as an HLC-stamped row in a `crdt_changes` log and folded into
//! a `crdt_records` table by an `AFTER INSERT` trigger, guarded by HLC
//! comparison. Ship the change rows to another replica, insert them there,
//! and both sides converge no matter the delivery order.
//!
//! ```no_run
//! use crdt::CrdtDb;
//! use serde_json::json;
//!
//! # fn main() -> crdt::Result<()> {
//! let db = CrdtDb::open("app.db")?;
//! db.install("node1")?;
//! db.create_table("users", "node1")?;
//!
//! db.execute(
//!     "INSERT INTO users (id, data) VALUES ('u1', ?)",
//!     (json!({"name": "Ada"}).to_string(),),
//! )?;
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]

pub mod db;
pub mod error;
pub mod hlc;
pub mod schema;
pub mod store;
pub mod tables;

pub use crate::db::{register, CrdtDb};
pub use crate::error::{Error, HlcError, Result};
pub use crate::hlc::{Hlc, MAX_COUNTER, MAX_DRIFT_MS, MAX_NODE_ID_LEN};
pub use crate::store::{get_record, get_records, insert_change, Change, Op, Record};
