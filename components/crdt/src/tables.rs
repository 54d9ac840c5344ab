/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The per-table surface: for each logical user table, a view over
//! `crdt_records` plus three `INSTEAD OF` triggers that turn ordinary DML
//! against the view into `crdt_changes` rows. Merge semantics live entirely
//! in the global trigger; nothing here touches `crdt_records`.

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::hlc::check_node_id;

/// Reject any name we can't safely embed in generated SQL. Accepted names
/// are double-quoted as identifiers and single-quoted as literals below.
fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('"') || name.contains('\'') {
        return Err(Error::InvalidTableName {
            name: name.to_owned(),
        });
    }
    Ok(())
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name)
}

pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Create the view and triggers for `tbl`, dropping any previous incarnation
/// first. `node_id` is baked into the triggers as the source of fresh HLCs
/// for DML that doesn't carry its own.
///
/// For `INSTEAD OF UPDATE` triggers SQLite populates unassigned `NEW.*`
/// columns from the existing view row, so `NEW.hlc`/`NEW.op`/`NEW.path` are
/// compared against `OLD.*` to detect whether the statement actually
/// assigned them; a plain UPDATE gets a fresh clock reading and the `patch`
/// op rather than silently replaying the record's previous ones.
pub fn create_table(conn: &Connection, tbl: &str, node_id: &str) -> Result<()> {
    validate_table_name(tbl)?;
    check_node_id(node_id)?;
    log::debug!("crdt: creating table surface for {:?}", tbl);
    let view = quote_identifier(tbl);
    let tbl_lit = quote_literal(tbl);
    let node_lit = quote_literal(node_id);
    let sql = format!(
        r#"
DROP VIEW IF EXISTS {view};
DROP TRIGGER IF EXISTS "{tbl}_insert";
DROP TRIGGER IF EXISTS "{tbl}_update";
DROP TRIGGER IF EXISTS "{tbl}_delete";

CREATE VIEW {view} AS
SELECT
  id,
  data,
  deleted,
  hlc,
  path,
  op,
  json,
  node_id
FROM crdt_records
WHERE tbl = {tbl_lit}
AND NOT deleted;

CREATE TRIGGER "{tbl}_insert" INSTEAD OF
INSERT ON {view} BEGIN
INSERT INTO crdt_changes (id, pk, tbl, data, op, path, hlc)
VALUES (
        hlc_now(uuid()),
        NEW.id,
        {tbl_lit},
        jsonb(NEW.data),
        IFNULL(NEW.op, '='),
        IFNULL(NEW.path, '$'),
        IFNULL(NEW.hlc, hlc_now({node_lit}))
    );
END;

CREATE TRIGGER "{tbl}_update" INSTEAD OF
UPDATE ON {view} BEGIN
INSERT INTO crdt_changes (id, pk, tbl, data, op, path, hlc)
VALUES (
        hlc_now(uuid()),
        NEW.id,
        {tbl_lit},
        jsonb(NEW.data),
        CASE WHEN NEW.op IS NOT OLD.op THEN NEW.op ELSE 'patch' END,
        CASE WHEN NEW.path IS NOT OLD.path THEN NEW.path ELSE '$' END,
        CASE WHEN NEW.hlc IS NOT OLD.hlc THEN NEW.hlc ELSE hlc_now({node_lit}) END
    );
END;

CREATE TRIGGER "{tbl}_delete" INSTEAD OF DELETE ON {view} BEGIN
INSERT INTO crdt_changes (id, pk, tbl, data, op, path, hlc)
VALUES (
        hlc_now(uuid()),
        OLD.id,
        {tbl_lit},
        NULL,
        '=',
        '$',
        hlc_now({node_lit})
    );
END;
"#
    );
    conn.execute_batch(&sql)?;
    Ok(())
}

/// Drop the view and triggers for `tbl`. The change and record rows for the
/// table stay behind; removing the surface doesn't forget the data.
pub fn remove_table(conn: &Connection, tbl: &str) -> Result<()> {
    validate_table_name(tbl)?;
    log::debug!("crdt: removing table surface for {:?}", tbl);
    let sql = format!(
        r#"
DROP VIEW IF EXISTS "{tbl}";
DROP TRIGGER IF EXISTS "{tbl}_insert";
DROP TRIGGER IF EXISTS "{tbl}_update";
DROP TRIGGER IF EXISTS "{tbl}_delete";
"#
    );
    conn.execute_batch(&sql)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CrdtDb;
    use sql_support::ConnExt;

    fn surface_objects(db: &CrdtDb, tbl: &str) -> i64 {
        db.query_row_and_then(
            "SELECT COUNT(*) FROM sqlite_master WHERE name IN (?, ? || '_insert', ? || '_update', ? || '_delete')",
            (tbl, tbl, tbl, tbl),
            |row| -> rusqlite::Result<i64> { row.get(0) },
        )
        .unwrap()
    }

    #[test]
    fn test_create_and_remove() {
        let db = CrdtDb::open_in_memory().unwrap();
        db.install("n1").unwrap();
        db.create_table("users", "n1").unwrap();
        assert_eq!(surface_objects(&db, "users"), 4);
        // recreating is fine
        db.create_table("users", "n1").unwrap();
        assert_eq!(surface_objects(&db, "users"), 4);
        db.remove_table("users").unwrap();
        assert_eq!(surface_objects(&db, "users"), 0);
    }

    #[test]
    fn test_quoted_names_rejected() {
        let db = CrdtDb::open_in_memory().unwrap();
        db.install("n1").unwrap();
        for bad in ["bad\"name", "bad'name", ""] {
            assert!(matches!(
                db.create_table(bad, "n1"),
                Err(Error::InvalidTableName { .. })
            ));
            assert!(matches!(
                db.remove_table(bad),
                Err(Error::InvalidTableName { .. })
            ));
        }
    }

    #[test]
    fn test_bad_node_id_rejected() {
        let db = CrdtDb::open_in_memory().unwrap();
        db.install("n1").unwrap();
        // a '-' in the node id would make every trigger-minted hlc_now fail
        for bad in ["", "node-1"] {
            assert!(matches!(
                db.create_table("t", bad),
                Err(crate::Error::Hlc(crate::HlcError::InvalidNodeId(_)))
            ));
        }
        assert_eq!(surface_objects(&db, "t"), 0);
    }

    #[test]
    fn test_tricky_but_legal_name() {
        let db = CrdtDb::open_in_memory().unwrap();
        db.install("n1").unwrap();
        db.create_table("user journal", "n1").unwrap();
        db.execute(
            "INSERT INTO \"user journal\" (id, data, hlc)
             VALUES ('e1', '{\"t\":\"hi\"}', '2024-01-01T00:00:00.000-0000-n1')",
            [],
        )
        .unwrap();
        let n: i64 = db
            .query_one("SELECT COUNT(*) FROM \"user journal\"")
            .unwrap();
        assert_eq!(n, 1);
        db.remove_table("user journal").unwrap();
    }

    #[test]
    fn test_node_id_with_quote_is_escaped() {
        let db = CrdtDb::open_in_memory().unwrap();
        db.install("n1").unwrap();
        // a hostile node id must not break the generated trigger SQL
        db.create_table("t", "o'neill").unwrap();
        db.execute("INSERT INTO t (id, data) VALUES ('r1', '{}')", [])
            .unwrap();
        let node: String = db
            .query_one("SELECT node_id FROM crdt_changes WHERE pk = 'r1'")
            .unwrap();
        assert_eq!(node, "o'neill");
    }
}
