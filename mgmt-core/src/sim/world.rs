//! Simulated database nodes, schema, data and object storage.

use crate::schema::SchemaEntry;
use mgmt_common::config::NodeSettings;
use mgmt_common::{HostHealth, HostRestStatus, HostSsl, HostStatus, MgmtError};
use std::collections::BTreeMap;
use uuid::Uuid;

pub(crate) const LOCAL_STRATEGY: &str = "LocalStrategy";

#[derive(Debug, Clone)]
pub(crate) struct SimHost {
    pub datacenter: String,
    pub up: bool,
    pub disk_full: bool,
    pub client_encryption: bool,
    /// Bumped by compaction; part of every sstable name.
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct Table {
    pub id: Uuid,
    pub rows: BTreeMap<String, String>,
}

impl Table {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            rows: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Keyspace {
    pub statement: String,
    pub class: String,
    pub tables: BTreeMap<String, Table>,
}

/// The database cluster behind every registration.
#[derive(Debug, Default)]
pub(crate) struct Database {
    pub hosts: BTreeMap<String, SimHost>,
    pub keyspaces: BTreeMap<String, Keyspace>,
}

impl Database {
    pub fn seeded(nodes: &[NodeSettings]) -> Self {
        let mut db = Self::default();
        for node in nodes {
            db.hosts.insert(
                node.host.clone(),
                SimHost {
                    datacenter: node.datacenter.clone(),
                    up: true,
                    disk_full: false,
                    client_encryption: false,
                    generation: 1,
                },
            );
        }
        let dc = nodes.first().map_or("dc1", |n| n.datacenter.as_str()).to_string();
        db.add_keyspace("system", LOCAL_STRATEGY, &["local", "peers"]);
        db.add_keyspace("system_schema", LOCAL_STRATEGY, &["keyspaces", "tables"]);
        db.add_keyspace(
            "system_auth",
            "NetworkTopologyStrategy",
            &["roles"],
        );
        db.add_keyspace("keyspace1", "NetworkTopologyStrategy", &["standard1"]);
        if let Some(ks) = db.keyspaces.get_mut("keyspace1") {
            ks.statement = format!(
                "CREATE KEYSPACE keyspace1 WITH replication = {{'class': 'org.apache.cassandra.locator.NetworkTopologyStrategy', '{dc}': '3'}} AND durable_writes = true"
            );
            if let Some(table) = ks.tables.get_mut("standard1") {
                table.rows = (0..100)
                    .map(|i| (format!("key{i:04}"), format!("value{i}")))
                    .collect();
            }
        }
        db
    }

    fn add_keyspace(&mut self, name: &str, class: &str, tables: &[&str]) {
        self.keyspaces.insert(
            name.to_string(),
            Keyspace {
                statement: format!("CREATE KEYSPACE {name} WITH replication = {{'class': '{class}'}}"),
                class: class.to_string(),
                tables: tables.iter().map(|t| (t.to_string(), Table::new())).collect(),
            },
        );
    }

    pub fn host(&mut self, host: &str) -> Result<&mut SimHost, MgmtError> {
        self.hosts
            .get_mut(host)
            .ok_or_else(|| MgmtError::not_found(format!("node {host}")))
    }

    pub fn full_disk_host(&self) -> Option<&str> {
        self.hosts
            .iter()
            .find(|(_, h)| h.disk_full)
            .map(|(name, _)| name.as_str())
    }

    pub fn down_host(&self) -> Option<&str> {
        self.hosts.iter().find(|(_, h)| !h.up).map(|(name, _)| name.as_str())
    }

    /// Non-system keyspaces, optionally filtered by `ks` or `ks.table` patterns.
    pub fn user_keyspaces(&self, filter: &[String]) -> Vec<String> {
        self.keyspaces
            .keys()
            .filter(|name| !name.starts_with("system"))
            .filter(|name| matches_filter(filter, name))
            .cloned()
            .collect()
    }

    pub fn table(&mut self, keyspace: &str, table: &str) -> Result<&mut Table, MgmtError> {
        self.keyspaces
            .get_mut(keyspace)
            .and_then(|ks| ks.tables.get_mut(table))
            .ok_or_else(|| MgmtError::not_found(format!("table {keyspace}.{table}")))
    }

    /// Schema as a backup would store it.
    pub fn schema_entries(&self) -> Vec<SchemaEntry> {
        let mut entries = Vec::new();
        for (name, ks) in &self.keyspaces {
            entries.push(SchemaEntry {
                keyspace: name.clone(),
                kind: "keyspace".into(),
                name: name.clone(),
                cql_stmt: ks.statement.clone(),
            });
            for table in ks.tables.keys() {
                entries.push(SchemaEntry {
                    keyspace: name.clone(),
                    kind: "table".into(),
                    name: table.clone(),
                    cql_stmt: format!("CREATE TABLE {name}.{table} (key text PRIMARY KEY, value text)"),
                });
            }
        }
        entries
    }

    pub fn health(&self, cluster_encryption: bool) -> Vec<HostHealth> {
        self.hosts
            .iter()
            .map(|(name, host)| {
                let reachable = host.up && (!host.client_encryption || cluster_encryption);
                HostHealth {
                    host: name.clone(),
                    status: if reachable { HostStatus::Up } else { HostStatus::Down },
                    rest_status: if host.up { HostRestStatus::Up } else { HostRestStatus::Down },
                    ssl: if host.client_encryption { HostSsl::On } else { HostSsl::Off },
                    latency_ms: reachable.then(|| fastrand::u64(1..10)),
                }
            })
            .collect()
    }
}

pub(crate) fn matches_filter(filter: &[String], keyspace: &str) -> bool {
    filter.is_empty()
        || filter
            .iter()
            .any(|f| f == keyspace || f.split_once('.').is_some_and(|(ks, _)| ks == keyspace))
}

/// Rows of one table captured by a snapshot.
pub(crate) type TableData = BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>;

pub(crate) fn capture(db: &Database, keyspaces: &[String]) -> TableData {
    keyspaces
        .iter()
        .filter_map(|name| db.keyspaces.get(name).map(|ks| (name, ks)))
        .map(|(name, ks)| {
            let tables = ks
                .tables
                .iter()
                .map(|(t, table)| (t.clone(), table.rows.clone()))
                .collect();
            (name.clone(), tables)
        })
        .collect()
}

/// Buckets keyed by `<provider>:<bucket>`.
#[derive(Debug, Default)]
pub(crate) struct Objects {
    buckets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

impl Objects {
    pub fn put(&mut self, location: &str, key: String, body: Vec<u8>) {
        self.buckets.entry(location.to_string()).or_default().insert(key, body);
    }

    pub fn get(&self, location: &str, key: &str) -> Option<&Vec<u8>> {
        self.buckets.get(location).and_then(|b| b.get(key))
    }

    pub fn keys(&self, location: &str, prefix: &str) -> Vec<String> {
        self.buckets
            .get(location)
            .map(|b| b.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, location: &str, key: &str) {
        if let Some(bucket) = self.buckets.get_mut(location) {
            bucket.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<NodeSettings> {
        vec![
            NodeSettings {
                host: "10.0.0.1".into(),
                datacenter: "dc1".into(),
            },
            NodeSettings {
                host: "10.0.0.2".into(),
                datacenter: "dc1".into(),
            },
        ]
    }

    #[test]
    fn seeded_database_has_user_data() {
        let db = Database::seeded(&nodes());
        assert_eq!(db.user_keyspaces(&[]), vec!["keyspace1"]);
        assert_eq!(db.keyspaces["keyspace1"].tables["standard1"].rows.len(), 100);
        assert_eq!(db.keyspaces["system"].class, LOCAL_STRATEGY);
    }

    #[test]
    fn filter_accepts_keyspace_and_table_patterns() {
        assert!(matches_filter(&[], "ks"));
        assert!(matches_filter(&["ks.t".into()], "ks"));
        assert!(!matches_filter(&["other".into()], "ks"));
    }

    #[test]
    fn encrypted_host_is_down_until_cluster_uses_tls() {
        let mut db = Database::seeded(&nodes());
        db.host("10.0.0.1").unwrap().client_encryption = true;
        let health = db.health(false);
        assert_eq!(health[0].status, HostStatus::Down);
        assert_eq!(health[0].rest_status, HostRestStatus::Up);
        assert_eq!(health[0].ssl, HostSsl::On);
        assert_eq!(db.health(true)[0].status, HostStatus::Up);
    }

    #[test]
    fn objects_list_by_prefix() {
        let mut objects = Objects::default();
        objects.put("s3:b", "backup/sst/a".into(), Vec::new());
        objects.put("s3:b", "backup/meta/m".into(), Vec::new());
        assert_eq!(objects.keys("s3:b", "backup/sst"), vec!["backup/sst/a"]);
        objects.remove("s3:b", "backup/sst/a");
        assert!(objects.keys("s3:b", "backup/sst").is_empty());
        assert!(objects.keys("gcs:none", "").is_empty());
    }
}
