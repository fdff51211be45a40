//! The handful of CQL statements the harness issues, run against the
//! simulated database.

use super::world::{Database, Keyspace, Table};
use crate::dataplane::Row;
use crate::schema::replication_class;
use mgmt_common::MgmtError;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use uuid::Uuid;

enum Statement {
    CreateKeyspace,
    CreateTable,
    DropKeyspace,
    Truncate,
    Insert,
    Select,
    SelectTableId,
    SelectKeyspaces,
}

const PATTERNS: &[(Statement, &str)] = &[
    (
        Statement::CreateKeyspace,
        r"(?is)^CREATE\s+KEYSPACE\s+(?:IF\s+NOT\s+EXISTS\s+)?(\w+)\s+WITH\s+.*$",
    ),
    (
        Statement::CreateTable,
        r"(?is)^CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(\w+)\.(\w+)\s*\(.*$",
    ),
    (Statement::DropKeyspace, r"(?i)^DROP\s+KEYSPACE\s+(?:IF\s+EXISTS\s+)?(\w+)$"),
    (Statement::Truncate, r"(?i)^TRUNCATE\s+(?:TABLE\s+)?(\w+)\.(\w+)$"),
    (
        Statement::Insert,
        r"(?i)^INSERT\s+INTO\s+(\w+)\.(\w+)\s*\(\s*key\s*,\s*value\s*\)\s*VALUES\s*\(\s*'([^']*)'\s*,\s*'([^']*)'\s*\)$",
    ),
    (
        Statement::SelectTableId,
        r"(?i)^SELECT\s+id\s+FROM\s+system_schema\.tables\s+WHERE\s+keyspace_name\s*=\s*'(\w+)'\s+AND\s+table_name\s*=\s*'(\w+)'$",
    ),
    (
        Statement::SelectKeyspaces,
        r"(?i)^SELECT\s+keyspace_name\s*,\s*replication\s+FROM\s+system_schema\.keyspaces$",
    ),
    (
        Statement::Select,
        r"(?i)^SELECT\s+(?:\*|key\s*,\s*value)\s+FROM\s+(\w+)\.(\w+)$",
    ),
];

pub(crate) fn execute(db: &mut Database, statement: &str) -> Result<Vec<Row>, MgmtError> {
    let statement = statement.trim().trim_end_matches(';').trim();
    for (kind, pattern) in PATTERNS {
        let re = Regex::new(pattern).map_err(|e| MgmtError::Internal(format!("statement pattern: {e}")))?;
        if let Some(caps) = re.captures(statement) {
            return run(db, kind, statement, &caps);
        }
    }
    Err(MgmtError::InvalidParams(format!("unsupported statement: {statement}")))
}

fn run(db: &mut Database, kind: &Statement, statement: &str, caps: &Captures<'_>) -> Result<Vec<Row>, MgmtError> {
    match kind {
        Statement::CreateKeyspace => {
            let name = caps[1].to_string();
            let class = replication_class(statement)?
                .ok_or_else(|| MgmtError::InvalidParams(format!("keyspace {name} has no replication class")))?;
            db.keyspaces.entry(name).or_insert_with(|| Keyspace {
                statement: statement.to_string(),
                class,
                tables: BTreeMap::new(),
            });
            Ok(Vec::new())
        }
        Statement::CreateTable => {
            let ks = db
                .keyspaces
                .get_mut(&caps[1])
                .ok_or_else(|| MgmtError::not_found(format!("keyspace {}", &caps[1])))?;
            ks.tables.entry(caps[2].to_string()).or_insert_with(|| Table {
                id: Uuid::new_v4(),
                rows: BTreeMap::new(),
            });
            Ok(Vec::new())
        }
        Statement::DropKeyspace => {
            db.keyspaces.remove(&caps[1]);
            Ok(Vec::new())
        }
        Statement::Truncate => {
            db.table(&caps[1], &caps[2])?.rows.clear();
            Ok(Vec::new())
        }
        Statement::Insert => {
            db.table(&caps[1], &caps[2])?
                .rows
                .insert(caps[3].to_string(), caps[4].to_string());
            Ok(Vec::new())
        }
        Statement::Select => {
            let table = db.table(&caps[1], &caps[2])?;
            Ok(table
                .rows
                .iter()
                .map(|(k, v)| row(&[("key", k.clone()), ("value", v.clone())]))
                .collect())
        }
        Statement::SelectTableId => {
            let id = db.table(&caps[1], &caps[2])?.id;
            Ok(vec![row(&[("id", id.to_string())])])
        }
        Statement::SelectKeyspaces => Ok(db
            .keyspaces
            .iter()
            .map(|(name, ks)| row(&[("keyspace_name", name.clone()), ("replication", ks.class.clone())]))
            .collect()),
    }
}

fn row(columns: &[(&str, String)]) -> Row {
    columns.iter().map(|(c, v)| (c.to_string(), v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::seeded(&[])
    }

    #[test]
    fn create_insert_select_truncate() {
        let mut db = db();
        execute(
            &mut db,
            "CREATE KEYSPACE IF NOT EXISTS ks_simple WITH replication = {'class': 'SimpleStrategy', 'replication_factor': '3'};",
        )
        .unwrap();
        execute(&mut db, "CREATE TABLE ks_simple.t (key text PRIMARY KEY, value text)").unwrap();
        execute(&mut db, "INSERT INTO ks_simple.t (key, value) VALUES ('a', '1')").unwrap();

        let rows = execute(&mut db, "SELECT key, value FROM ks_simple.t").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["value"], "1");
        assert_eq!(db.keyspaces["ks_simple"].class, "SimpleStrategy");

        execute(&mut db, "TRUNCATE ks_simple.t").unwrap();
        assert!(execute(&mut db, "SELECT * FROM ks_simple.t").unwrap().is_empty());
    }

    #[test]
    fn table_id_lookup() {
        let mut db = db();
        let rows = execute(
            &mut db,
            "SELECT id FROM system_schema.tables WHERE keyspace_name = 'keyspace1' AND table_name = 'standard1'",
        )
        .unwrap();
        assert_eq!(rows[0]["id"], db.keyspaces["keyspace1"].tables["standard1"].id.to_string());
    }

    #[test]
    fn unknown_table_and_statement_fail() {
        let mut db = db();
        assert!(matches!(
            execute(&mut db, "SELECT * FROM nope.t"),
            Err(MgmtError::NotFound { .. })
        ));
        assert!(matches!(
            execute(&mut db, "ALTER TABLE keyspace1.standard1 WITH gc_grace_seconds = 0"),
            Err(MgmtError::InvalidParams(_))
        ));
    }
}
