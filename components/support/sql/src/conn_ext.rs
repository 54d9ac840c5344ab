/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::{
    types::FromSql,
    Connection, Params, Result as SqlResult, Row, Savepoint, Transaction, TransactionBehavior,
};
use std::ops::Deref;
use std::time::Instant;

/// This trait exists so that we can use these helpers on `rusqlite::{Transaction, Connection}`.
/// Note that you must import ConnExt in order to call these methods on anything.
pub trait ConnExt {
    /// The method you need to implement to opt in to all of this.
    fn conn(&self) -> &Connection;

    /// Equivalent to `Connection::execute` but caches the statement so that subsequent
    /// calls to `execute_cached` will have improved performance.
    fn execute_cached<P: Params>(&self, sql: &str, params: P) -> SqlResult<usize> {
        let mut stmt = self.conn().prepare_cached(sql)?;
        stmt.execute(params)
    }

    /// Execute a query that returns a single result column, and return that result.
    fn query_one<T: FromSql>(&self, sql: &str) -> SqlResult<T> {
        self.conn().query_row_and_then(sql, [], |row| row.get(0))
    }

    /// Like `Connection::query_row_and_then` but returns None instead of erroring
    /// if no such row exists.
    fn try_query_row<T, E, P, F>(&self, sql: &str, params: P, mapper: F) -> Result<Option<T>, E>
    where
        Self: Sized,
        P: Params,
        E: From<rusqlite::Error>,
        F: FnOnce(&Row<'_>) -> Result<T, E>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params).map_err(E::from)?;
        Ok(match rows.next().map_err(E::from)? {
            None => None,
            Some(row) => Some(mapper(row)?),
        })
    }

    /// Run a query and collect every mapped row.
    fn query_rows_and_then<T, E, P, F>(&self, sql: &str, params: P, mapper: F) -> Result<Vec<T>, E>
    where
        Self: Sized,
        P: Params,
        E: From<rusqlite::Error>,
        F: FnMut(&Row<'_>) -> Result<T, E>,
    {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql).map_err(E::from)?;
        let rows = stmt.query_and_then(params, mapper).map_err(E::from)?;
        rows.collect()
    }

    fn unchecked_transaction(&self) -> SqlResult<UncheckedTransaction<'_>> {
        UncheckedTransaction::new(self.conn(), TransactionBehavior::Deferred)
    }
}

impl ConnExt for Connection {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for Transaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

impl ConnExt for Savepoint<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

/// rusqlite, in an attempt to save us from ourselves, needs a mutable ref to
/// a connection to start a transaction. That is a bit of a PITA in some cases,
/// so we offer this as an alternative - but the responsibility of ensuring
/// there are no concurrent transactions is on our head.
///
/// This is very similar to the rusqlite `Transaction` - it doesn't prevent
/// against nested transactions but does allow you to use an immutable
/// `Connection`.
pub struct UncheckedTransaction<'conn> {
    conn: &'conn Connection,
    started_at: Instant,
    // we could add drop_behavior etc too, but we don't need it yet - we
    // always rollback.
}

impl<'conn> UncheckedTransaction<'conn> {
    /// Begin a new unchecked transaction. Cannot be nested, but this is not
    /// enforced (hence 'unchecked'); use a rusqlite `savepoint` for nested
    /// transactions.
    pub fn new(conn: &'conn Connection, behavior: TransactionBehavior) -> SqlResult<Self> {
        let query = match behavior {
            TransactionBehavior::Immediate => "BEGIN IMMEDIATE",
            TransactionBehavior::Exclusive => "BEGIN EXCLUSIVE",
            _ => "BEGIN DEFERRED",
        };
        conn.execute_batch(query)
            .map(move |_| UncheckedTransaction {
                conn,
                started_at: Instant::now(),
            })
    }

    /// Consumes and commits an unchecked transaction.
    pub fn commit(self) -> SqlResult<()> {
        self.conn.execute_batch("COMMIT")?;
        log::trace!("Transaction committed after {:?}", self.started_at.elapsed());
        Ok(())
    }

    /// Consumes and rolls back an unchecked transaction.
    pub fn rollback(self) -> SqlResult<()> {
        self.rollback_()
    }

    fn rollback_(&self) -> SqlResult<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn finish_(&self) -> SqlResult<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.rollback_()?;
        Ok(())
    }
}

impl Deref for UncheckedTransaction<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl Drop for UncheckedTransaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish_() {
            log::warn!("Error dropping an unchecked transaction: {}", e);
        }
    }
}

impl ConnExt for UncheckedTransaction<'_> {
    #[inline]
    fn conn(&self) -> &Connection {
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_query_one() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(
            ConnExt::query_one::<i64>(&conn, "SELECT 40 + 2").unwrap(),
            42
        );
    }

    #[test]
    fn test_try_query_row() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t(v TEXT); INSERT INTO t(v) VALUES ('x')")
            .unwrap();
        let got: Option<String> = conn
            .try_query_row(
                "SELECT v FROM t WHERE v = ?",
                ("x",),
                |row| -> SqlResult<String> { row.get(0) },
            )
            .unwrap();
        assert_eq!(got.as_deref(), Some("x"));
        let missing: Option<String> = conn
            .try_query_row(
                "SELECT v FROM t WHERE v = ?",
                ("y",),
                |row| -> SqlResult<String> { row.get(0) },
            )
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_unchecked_transaction_rolls_back_on_drop() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t(v TEXT)").unwrap();
        {
            let tx = conn.unchecked_transaction().unwrap();
            tx.execute("INSERT INTO t(v) VALUES ('gone')", []).unwrap();
            // dropped without commit
        }
        assert_eq!(
            ConnExt::query_one::<i64>(&conn, "SELECT COUNT(*) FROM t").unwrap(),
            0
        );

        let tx = conn.unchecked_transaction().unwrap();
        tx.execute("INSERT INTO t(v) VALUES ('kept')", []).unwrap();
        tx.commit().unwrap();
        assert_eq!(
            ConnExt::query_one::<i64>(&conn, "SELECT COUNT(*) FROM t").unwrap(),
            1
        );
    }
}
