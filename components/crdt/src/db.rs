/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Connection handling.
//!
//! `CrdtDb` owns a single SQLite connection with the HLC function surface
//! registered on it. Generated schema objects (the `crdt_changes` id default,
//! the `node_id` generated columns, the merge trigger) reference these
//! functions, so every connection that touches the tables must come through
//! here; opening the database with a plain `rusqlite::Connection` will fail
//! as soon as SQLite needs to evaluate one of them.

use std::ops::Deref;
use std::path::Path;

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use sql_support::ConnExt;

use crate::error::Result;
use crate::{schema, tables};

pub struct CrdtDb {
    pub db: Connection,
}

impl CrdtDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// Take over an existing connection: apply the pragma block, register the
    /// function surface and verify the engine is capable enough.
    pub fn with_connection(db: Connection) -> Result<Self> {
        let initial_pragmas = "
            -- Keep temp files in memory; there may be no tmp partition on
            -- mobile targets.
            PRAGMA temp_store = 2;

            PRAGMA cache_size = -6144;

            PRAGMA foreign_keys = ON;
        ";
        db.execute_batch(initial_pragmas)?;
        // we unconditionally want write-ahead-logging mode; this pragma
        // reports the resulting mode as a row
        db.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        register(&db)?;
        log::debug!("crdt: connection ready");
        Ok(Self { db })
    }

    /// Create the global schema: the `crdt_changes` and `crdt_records` tables,
    /// the `crdt_kv` scratch table and the merge trigger.
    pub fn install(&self, node_id: &str) -> Result<()> {
        let tx = self.db.unchecked_transaction()?;
        schema::install(&tx, node_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Drop everything `install` created. Per-table views and triggers are
    /// removed separately with [`CrdtDb::remove_table`].
    pub fn uninstall(&self) -> Result<()> {
        let tx = self.db.unchecked_transaction()?;
        schema::uninstall(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Create the user-facing surface for one logical table: a view named
    /// `tbl` plus the three `INSTEAD OF` triggers that turn DML against it
    /// into change rows stamped with `node_id`.
    pub fn create_table(&self, tbl: &str, node_id: &str) -> Result<()> {
        let tx = self.db.unchecked_transaction()?;
        tables::create_table(&tx, tbl, node_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove_table(&self, tbl: &str) -> Result<()> {
        let tx = self.db.unchecked_transaction()?;
        tables::remove_table(&tx, tbl)?;
        tx.commit()?;
        Ok(())
    }
}

impl ConnExt for CrdtDb {
    #[inline]
    fn conn(&self) -> &Connection {
        &self.db
    }
}

impl Deref for CrdtDb {
    type Target = Connection;
    #[inline]
    fn deref(&self) -> &Connection {
        &self.db
    }
}

/// Register the scalar-function surface on `conn` and probe the capabilities
/// the generated SQL relies on. Exposed for hosts that manage their own
/// connections; `CrdtDb` calls this on open.
pub fn register(conn: &Connection) -> Result<()> {
    define_functions(conn)?;
    // The merge trigger needs the JSONB primitives (SQLite 3.45+).
    conn.query_row("SELECT jsonb('{}')", [], |_| Ok(()))?;
    Ok(())
}

fn define_functions(c: &Connection) -> rusqlite::Result<()> {
    // No DIRECTONLY here: hlc_now seeds a column default, hlc_node_id feeds
    // generated columns and hlc_compare guards the merge trigger, all of
    // which require the functions to be callable from schema objects.
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_INNOCUOUS;
    let det = flags | FunctionFlags::SQLITE_DETERMINISTIC;
    c.create_scalar_function("hlc_now", 1, flags, sql_fns::hlc_now)?;
    c.create_scalar_function("hlc_parse", 1, det, sql_fns::hlc_parse)?;
    c.create_scalar_function("hlc_increment", 1, flags, sql_fns::hlc_increment)?;
    c.create_scalar_function("hlc_merge", 2, flags, sql_fns::hlc_merge)?;
    c.create_scalar_function("hlc_compare", 2, det, sql_fns::hlc_compare)?;
    c.create_scalar_function("hlc_node_id", 1, det, sql_fns::hlc_node_id)?;
    c.create_scalar_function("hlc_counter", 1, det, sql_fns::hlc_counter)?;
    c.create_scalar_function("hlc_date_time", 1, det, sql_fns::hlc_date_time)?;
    c.create_scalar_function("hlc_str", 1, det, sql_fns::hlc_str)?;
    c.create_scalar_function("uuid", 0, flags, sql_fns::uuid_v4)?;
    Ok(())
}

mod sql_fns {
    use chrono::Utc;
    use rusqlite::{functions::Context, Error, Result};
    use uuid::Uuid;

    use crate::error::HlcError;
    use crate::hlc::Hlc;

    // Helpers for define_functions
    fn get_raw_str<'a>(ctx: &'a Context<'_>, fname: &'static str, idx: usize) -> Result<&'a str> {
        ctx.get_raw(idx).as_str().map_err(|e| {
            Error::UserFunctionError(format!("Bad arg {} to '{}': {}", idx, fname, e).into())
        })
    }

    fn get_hlc(ctx: &Context<'_>, fname: &'static str, idx: usize) -> Result<Hlc> {
        get_raw_str(ctx, fname, idx)?
            .parse()
            .map_err(|e: HlcError| fn_error(fname, e))
    }

    fn fn_error(fname: &'static str, e: HlcError) -> Error {
        Error::UserFunctionError(format!("'{}': {}", fname, e).into())
    }

    // Note: The compiler can't meaningfully inline these, but if we don't put
    // #[inline(never)] on them they get "inlined" into a temporary Box<FnMut>,
    // which doesn't have a name (and itself doesn't get inlined). Adding
    // #[inline(never)] ensures they show up in profiles.

    #[inline(never)]
    pub fn hlc_now(ctx: &Context<'_>) -> Result<String> {
        let node_id = get_raw_str(ctx, "hlc_now", 0)?;
        Hlc::now(node_id)
            .map(|h| h.to_string())
            .map_err(|e| fn_error("hlc_now", e))
    }

    #[inline(never)]
    pub fn hlc_parse(ctx: &Context<'_>) -> Result<String> {
        Ok(get_hlc(ctx, "hlc_parse", 0)?.to_string())
    }

    #[inline(never)]
    pub fn hlc_increment(ctx: &Context<'_>) -> Result<String> {
        get_hlc(ctx, "hlc_increment", 0)?
            .increment()
            .map(|h| h.to_string())
            .map_err(|e| fn_error("hlc_increment", e))
    }

    #[inline(never)]
    pub fn hlc_merge(ctx: &Context<'_>) -> Result<String> {
        let local = get_hlc(ctx, "hlc_merge", 0)?;
        let remote = get_hlc(ctx, "hlc_merge", 1)?;
        local
            .merge(&remote, Utc::now().timestamp_millis())
            .map(|h| h.to_string())
            .map_err(|e| fn_error("hlc_merge", e))
    }

    #[inline(never)]
    pub fn hlc_compare(ctx: &Context<'_>) -> Result<i32> {
        let a = get_hlc(ctx, "hlc_compare", 0)?;
        let b = get_hlc(ctx, "hlc_compare", 1)?;
        Ok(a.compare(&b))
    }

    #[inline(never)]
    pub fn hlc_node_id(ctx: &Context<'_>) -> Result<String> {
        Ok(get_hlc(ctx, "hlc_node_id", 0)?.node_id().to_owned())
    }

    #[inline(never)]
    pub fn hlc_counter(ctx: &Context<'_>) -> Result<i64> {
        Ok(get_hlc(ctx, "hlc_counter", 0)?.counter() as i64)
    }

    #[inline(never)]
    pub fn hlc_date_time(ctx: &Context<'_>) -> Result<i64> {
        Ok(get_hlc(ctx, "hlc_date_time", 0)?.date_time())
    }

    #[inline(never)]
    pub fn hlc_str(ctx: &Context<'_>) -> Result<String> {
        // Identity, but only for well-formed input.
        let raw = get_raw_str(ctx, "hlc_str", 0)?;
        raw.parse::<Hlc>().map_err(|e| fn_error("hlc_str", e))?;
        Ok(raw.to_owned())
    }

    #[inline(never)]
    pub fn uuid_v4(_ctx: &Context<'_>) -> Result<String> {
        // Hyphenless form: the result seeds hlc_now() as a node id, and node
        // ids cannot contain '-'.
        Ok(Uuid::new_v4().simple().to_string())
    }
}
