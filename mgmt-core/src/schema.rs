//! Schema files stored alongside backups.
//!
//! A backup uploads the cluster schema as a JSON list of entries, one per
//! keyspace, table, type or role, each with the statement that recreates
//! it. Restoring the schema replays the keyspace statements before the
//! table statements.

use crate::storage::ObjectStore;
use mgmt_common::{ClusterId, MgmtError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub keyspace: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub cql_stmt: String,
}

/// Prefix under which backups of `cluster` keep their schema files.
pub fn schema_prefix(cluster: &ClusterId) -> String {
    format!("backup/schema/cluster/{cluster}")
}

pub fn parse_schema(raw: &[u8]) -> Result<Vec<SchemaEntry>, MgmtError> {
    Ok(serde_json::from_slice(raw)?)
}

/// Keyspace and table statements, skipping every `system*` keyspace.
pub fn create_statements(entries: &[SchemaEntry]) -> (Vec<String>, Vec<String>) {
    let mut keyspaces = Vec::new();
    let mut tables = Vec::new();
    for entry in entries.iter().filter(|e| !e.keyspace.starts_with("system")) {
        match entry.kind.as_str() {
            "keyspace" => keyspaces.push(entry.cql_stmt.clone()),
            "table" => tables.push(entry.cql_stmt.clone()),
            _ => {}
        }
    }
    (keyspaces, tables)
}

/// Create statements from the newest schema file of `cluster` in `location`.
pub async fn schema_create_statements(
    store: &dyn ObjectStore,
    location: &str,
    cluster: &ClusterId,
) -> Result<(Vec<String>, Vec<String>), MgmtError> {
    let keys = store.list_keys(location, &schema_prefix(cluster)).await?;
    let newest = keys
        .iter()
        .next_back()
        .ok_or_else(|| MgmtError::not_found(format!("schema file of cluster {cluster} in {location}")))?;
    debug!(location, key = %newest, "reading schema file");
    let entries = parse_schema(&store.download(location, newest).await?)?;
    Ok(create_statements(&entries))
}

fn replication_block(statement: &str) -> Result<Option<String>, MgmtError> {
    let block = Regex::new(r"replication\s*=\s*(\{.*?\})")
        .map_err(|e| MgmtError::Internal(format!("replication pattern: {e}")))?;
    Ok(block
        .captures(statement)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string()))
}

fn replication_entries(statement: &str) -> Result<Vec<(String, String)>, MgmtError> {
    let Some(block) = replication_block(statement)? else {
        return Ok(Vec::new());
    };
    let pair = Regex::new(r"'([^']+)'\s*:\s*'([^']*)'")
        .map_err(|e| MgmtError::Internal(format!("replication entry pattern: {e}")))?;
    Ok(pair
        .captures_iter(&block)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect())
}

/// First datacenter named in a `CREATE KEYSPACE` replication map.
///
/// The datacenter is not necessarily the second key, so every key except
/// `class` is considered.
pub fn datacenter_from_keyspace_statement(statement: &str) -> Result<Option<String>, MgmtError> {
    Ok(replication_entries(statement)?
        .into_iter()
        .map(|(key, _)| key)
        .find(|key| key != "class"))
}

/// Replication strategy class without its Java package.
pub fn replication_class(statement: &str) -> Result<Option<String>, MgmtError> {
    Ok(replication_entries(statement)?
        .into_iter()
        .find(|(key, _)| key == "class")
        .map(|(_, class)| class.rsplit('.').next().unwrap_or_default().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KS_STATEMENT: &str = "CREATE KEYSPACE \"5gb_stcs_quorum_64_16_2024_2_4\" WITH replication = \
        {'class': 'org.apache.cassandra.locator.NetworkTopologyStrategy', 'us-east': '3'} \
        AND durable_writes = true AND tablets = {'enabled': false};";

    #[test]
    fn datacenter_is_first_non_class_key() {
        assert_eq!(
            datacenter_from_keyspace_statement(KS_STATEMENT).unwrap().as_deref(),
            Some("us-east")
        );
        let dc_first = "CREATE KEYSPACE k WITH replication = {'eu-west': '3', 'class': 'NetworkTopologyStrategy'}";
        assert_eq!(
            datacenter_from_keyspace_statement(dc_first).unwrap().as_deref(),
            Some("eu-west")
        );
    }

    #[test]
    fn tablets_map_is_not_mistaken_for_replication() {
        assert_eq!(replication_class(KS_STATEMENT).unwrap().as_deref(), Some("NetworkTopologyStrategy"));
        assert_eq!(replication_class("CREATE TABLE ks.t (key text PRIMARY KEY)").unwrap(), None);
    }

    #[test]
    fn system_keyspaces_are_skipped() {
        let raw = serde_json::json!([
            {"keyspace": "system_auth", "type": "keyspace", "name": "system_auth", "cql_stmt": "CREATE KEYSPACE system_auth"},
            {"keyspace": "ks", "type": "keyspace", "name": "ks", "cql_stmt": "CREATE KEYSPACE ks"},
            {"keyspace": "ks", "type": "table", "name": "t", "cql_stmt": "CREATE TABLE ks.t"},
            {"keyspace": "ks", "type": "role", "name": "r", "cql_stmt": "CREATE ROLE r"},
            {"keyspace": "system_schema", "type": "table", "name": "tables", "cql_stmt": "CREATE TABLE system_schema.tables"}
        ]);
        let entries = parse_schema(raw.to_string().as_bytes()).unwrap();
        let (keyspaces, tables) = create_statements(&entries);
        assert_eq!(keyspaces, vec!["CREATE KEYSPACE ks"]);
        assert_eq!(tables, vec!["CREATE TABLE ks.t"]);
    }

    #[test]
    fn malformed_schema_is_internal_error() {
        assert!(matches!(parse_schema(b"not json"), Err(MgmtError::Internal(_))));
    }
}
