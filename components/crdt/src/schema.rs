/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The global schema: the `crdt_changes` log, the `crdt_records`
//! materialization, the `crdt_kv` scratch table and the merge trigger.
//!
//! `crdt_changes` is append-only; nothing here ever updates or deletes a
//! change row. `crdt_records` is written only by `crdt_changes_trigger`,
//! which folds each inserted change into the matching record. The trigger's
//! `hlc_compare(NEW.hlc, crdt_records.hlc) > 0` guard is the whole merge
//! rule: an older or replayed change leaves the record untouched, so inserts
//! commute per record and replicas that see the same change set converge.

use rusqlite::Connection;
use sql_support::ConnExt;

use crate::error::Result;
use crate::hlc::check_node_id;

/// `crdt_kv` key recording the node id this database was installed with.
pub const KV_NODE_ID: &str = "node_id";

const CREATE_TABLES_SQL: &str = "
CREATE TABLE IF NOT EXISTS crdt_changes (
    id TEXT NOT NULL PRIMARY KEY DEFAULT (hlc_now(uuid())),
    pk TEXT NOT NULL,
    tbl TEXT NOT NULL,
    data BLOB,
    path TEXT NOT NULL DEFAULT ('$'),
    op TEXT NOT NULL DEFAULT ('='),
    deleted BOOLEAN GENERATED ALWAYS AS (data IS NULL) VIRTUAL,
    hlc TEXT NOT NULL,
    json GENERATED ALWAYS AS (json_extract(data, '$')) VIRTUAL,
    node_id TEXT NOT NULL GENERATED ALWAYS AS (hlc_node_id(hlc)) VIRTUAL
);

CREATE TABLE IF NOT EXISTS crdt_kv (
    key TEXT NOT NULL PRIMARY KEY ON CONFLICT REPLACE,
    value
);

CREATE TABLE IF NOT EXISTS crdt_records (
    id TEXT NOT NULL,
    tbl TEXT NOT NULL,
    data BLOB,
    deleted BOOLEAN GENERATED ALWAYS AS (data IS NULL) VIRTUAL,
    hlc TEXT NOT NULL,
    path TEXT,
    op TEXT,
    json GENERATED ALWAYS AS (json_extract(data, '$')) VIRTUAL,
    node_id TEXT NOT NULL GENERATED ALWAYS AS (hlc_node_id(hlc)) VIRTUAL,
    PRIMARY KEY (id, tbl)
);
";

// The insert arm materializes a record that doesn't exist yet. A path-scoped
// change can arrive before the change that creates its record, so it is
// applied against an empty document rather than stored raw; otherwise the
// final state would depend on delivery order. Each op gets the same JSONB
// transform as the conflict arm, so 'replace' against the empty document
// stays empty.
//
// In the conflict arm the change composes with the existing document. A NULL
// payload tombstones the record whatever the op says.
const CREATE_TRIGGER_SQL: &str = "
DROP TRIGGER IF EXISTS crdt_changes_trigger;
CREATE TRIGGER crdt_changes_trigger
AFTER INSERT ON crdt_changes
BEGIN
    INSERT INTO crdt_records (id, tbl, data, hlc, op, path)
    VALUES (
            NEW.pk,
            NEW.tbl,
            CASE
                WHEN NEW.data IS NULL THEN NULL
                WHEN IFNULL(NEW.path, '$') = '$' THEN jsonb(NEW.data)
                WHEN IFNULL(NEW.op, '=') = 'remove' THEN jsonb_remove(jsonb('{}'), NEW.path)
                WHEN IFNULL(NEW.op, '=') = 'patch' THEN jsonb_patch(jsonb('{}'), jsonb(NEW.data))
                WHEN IFNULL(NEW.op, '=') = 'insert' THEN jsonb_insert(jsonb('{}'), NEW.path, jsonb(NEW.data))
                WHEN IFNULL(NEW.op, '=') = 'replace' THEN jsonb_replace(jsonb('{}'), NEW.path, jsonb(NEW.data))
                ELSE jsonb_set(jsonb('{}'), NEW.path, jsonb(NEW.data))
            END,
            NEW.hlc,
            IFNULL(NEW.op, '='),
            IFNULL(NEW.path, '$')
        ) ON CONFLICT (id, tbl) DO
    UPDATE
    SET data = (
        CASE
            WHEN NEW.deleted THEN NULL
            WHEN NEW.op = 'set' THEN jsonb_set(data, NEW.path, jsonb(NEW.data))
            WHEN NEW.op = 'insert' THEN jsonb_insert(data, NEW.path, jsonb(NEW.data))
            WHEN NEW.op = 'patch' THEN jsonb_patch(data, jsonb(NEW.data))
            WHEN NEW.op = 'remove' THEN jsonb_remove(data, NEW.path)
            WHEN NEW.op = 'replace' THEN jsonb_replace(data, NEW.path, jsonb(NEW.data))
            WHEN NEW.op = '=' THEN jsonb_set(data, NEW.path, jsonb(NEW.data))
            WHEN NEW.op = '+' THEN jsonb_set(data, NEW.path, jsonb(json_extract(data, NEW.path) + json_extract(NEW.data, '$')))
            WHEN NEW.op = '-' THEN jsonb_set(data, NEW.path, jsonb(json_extract(data, NEW.path) - json_extract(NEW.data, '$')))
            WHEN NEW.op = '*' THEN jsonb_set(data, NEW.path, jsonb(json_extract(data, NEW.path) * json_extract(NEW.data, '$')))
            WHEN NEW.op = '/' THEN jsonb_set(data, NEW.path, jsonb(json_extract(data, NEW.path) / json_extract(NEW.data, '$')))
            WHEN NEW.op = '%' THEN jsonb_set(data, NEW.path, jsonb(json_extract(data, NEW.path) % json_extract(NEW.data, '$')))
            WHEN NEW.op = '&' THEN jsonb_set(data, NEW.path, jsonb(json_extract(data, NEW.path) & json_extract(NEW.data, '$')))
            WHEN NEW.op = '|' THEN jsonb_set(data, NEW.path, jsonb(json_extract(data, NEW.path) | json_extract(NEW.data, '$')))
            WHEN NEW.op = '||' THEN jsonb_set(data, NEW.path, jsonb(json_quote(json_extract(data, NEW.path) || json_extract(NEW.data, '$'))))
            ELSE data
        END
    ),
    hlc = NEW.hlc,
    path = IFNULL(NEW.path, '$'),
    op = IFNULL(NEW.op, '=')
    WHERE hlc_compare(NEW.hlc, crdt_records.hlc) > 0;
END;
";

// Trigger first, then the table it fires on.
const UNINSTALL_SQL: &str = "
DROP TRIGGER IF EXISTS crdt_changes_trigger;
DROP TABLE IF EXISTS crdt_changes;
DROP TABLE IF EXISTS crdt_kv;
DROP TABLE IF EXISTS crdt_records;
";

/// Create the global schema. Idempotent for the tables; the merge trigger is
/// dropped and recreated so its body always matches this build. The caller
/// supplies the transaction.
pub fn install(conn: &Connection, node_id: &str) -> Result<()> {
    check_node_id(node_id)?;
    log::debug!("crdt: installing global schema");
    conn.execute_batch(CREATE_TABLES_SQL)?;
    conn.execute_batch(CREATE_TRIGGER_SQL)?;
    conn.execute_cached(
        "INSERT INTO crdt_kv (key, value) VALUES (?, ?)",
        (KV_NODE_ID, node_id),
    )?;
    Ok(())
}

/// Drop the global schema, data included.
pub fn uninstall(conn: &Connection) -> Result<()> {
    log::debug!("crdt: dropping global schema");
    conn.execute_batch(UNINSTALL_SQL)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CrdtDb;

    fn object_names(db: &CrdtDb) -> Vec<String> {
        db.query_rows_and_then(
            "SELECT name FROM sqlite_master WHERE name LIKE 'crdt_%' ORDER BY name",
            [],
            |row| -> rusqlite::Result<String> { row.get(0) },
        )
        .unwrap()
    }

    #[test]
    fn test_install_creates_objects() {
        let db = CrdtDb::open_in_memory().unwrap();
        db.install("n1").unwrap();
        assert_eq!(
            object_names(&db),
            vec!["crdt_changes", "crdt_changes_trigger", "crdt_kv", "crdt_records"]
        );
        let node: String = db
            .query_one("SELECT value FROM crdt_kv WHERE key = 'node_id'")
            .unwrap();
        assert_eq!(node, "n1");
    }

    #[test]
    fn test_install_is_idempotent() {
        let db = CrdtDb::open_in_memory().unwrap();
        db.install("n1").unwrap();
        db.execute(
            "INSERT INTO crdt_changes (pk, tbl, data, hlc)
             VALUES ('r1', 't', '{}', '2024-01-01T00:00:00.000-0000-n1')",
            [],
        )
        .unwrap();
        // A second install keeps the data and refreshes the node id.
        db.install("n2").unwrap();
        let changes: i64 = db.query_one("SELECT COUNT(*) FROM crdt_changes").unwrap();
        assert_eq!(changes, 1);
        let node: String = db
            .query_one("SELECT value FROM crdt_kv WHERE key = 'node_id'")
            .unwrap();
        assert_eq!(node, "n2");
    }

    #[test]
    fn test_install_rejects_bad_node_id() {
        let db = CrdtDb::open_in_memory().unwrap();
        for bad in ["", "node-1"] {
            assert!(matches!(
                db.install(bad),
                Err(crate::Error::Hlc(crate::HlcError::InvalidNodeId(_)))
            ));
        }
        assert!(object_names(&db).is_empty());
    }

    #[test]
    fn test_uninstall_drops_everything() {
        let db = CrdtDb::open_in_memory().unwrap();
        db.install("n1").unwrap();
        db.uninstall().unwrap();
        assert!(object_names(&db).is_empty());
        // and install works again afterwards
        db.install("n1").unwrap();
        assert_eq!(object_names(&db).len(), 4);
    }

    #[test]
    fn test_changes_row_defaults() {
        let db = CrdtDb::open_in_memory().unwrap();
        db.install("n1").unwrap();
        db.execute(
            "INSERT INTO crdt_changes (pk, tbl, data, hlc)
             VALUES ('r1', 't', '{\"a\":1}', '2024-01-01T00:00:00.000-0000-n1')",
            [],
        )
        .unwrap();
        let (id, path, op, deleted, node_id) = db
            .query_row_and_then(
                "SELECT id, path, op, deleted, node_id FROM crdt_changes",
                [],
                |row| -> rusqlite::Result<(String, String, String, bool, String)> {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .unwrap();
        // the defaulted id is a freshly minted HLC tagged with a uuid node
        assert!(id.len() > 36);
        assert_eq!(path, "$");
        assert_eq!(op, "=");
        assert!(!deleted);
        assert_eq!(node_id, "n1");
    }
}
