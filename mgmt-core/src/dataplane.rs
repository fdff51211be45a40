//! Query access to the database, used to verify restored data.

use async_trait::async_trait;
use mgmt_common::util::shell_quote;
use mgmt_common::{MgmtError, RemoteExecutor};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// One result row, column name to rendered value.
pub type Row = BTreeMap<String, String>;

#[async_trait]
pub trait DataPlane: Send + Sync {
    async fn execute(&self, statement: &str) -> Result<Vec<Row>, MgmtError>;
}

/// Runs statements with `cqlsh -e` on a node and parses the table output.
pub struct CqlshDataPlane {
    executor: Arc<dyn RemoteExecutor>,
    host: String,
    credentials: Option<(String, String)>,
}

impl CqlshDataPlane {
    pub fn new(executor: Arc<dyn RemoteExecutor>, host: impl Into<String>) -> Self {
        Self {
            executor,
            host: host.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    fn command(&self, statement: &str) -> String {
        let mut command = String::from("cqlsh");
        if let Some((user, password)) = &self.credentials {
            command.push_str(&format!(" -u {} -p {}", shell_quote(user), shell_quote(password)));
        }
        command.push_str(&format!(" -e {} {}", shell_quote(statement), shell_quote(&self.host)));
        command
    }
}

#[async_trait]
impl DataPlane for CqlshDataPlane {
    async fn execute(&self, statement: &str) -> Result<Vec<Row>, MgmtError> {
        let output = self.executor.run(&self.command(statement)).await?;
        Ok(parse_cqlsh_table(&output.stdout))
    }
}

/// Parse `cqlsh` tabular output:
///
/// ```text
///  key | value
/// -----+-------
///   k1 |    v1
///
/// (1 rows)
/// ```
pub fn parse_cqlsh_table(stdout: &str) -> Vec<Row> {
    let lines: Vec<&str> = stdout.lines().collect();
    let Some(separator) = lines
        .iter()
        .position(|l| !l.trim().is_empty() && l.trim().chars().all(|c| c == '-' || c == '+'))
    else {
        return Vec::new();
    };
    if separator == 0 {
        return Vec::new();
    }
    let header: Vec<String> = lines[separator - 1]
        .split('|')
        .map(|c| c.trim().to_string())
        .collect();

    lines[separator + 1..]
        .iter()
        .take_while(|l| !l.trim().is_empty())
        .map(|line| {
            header
                .iter()
                .cloned()
                .zip(line.split('|').map(|v| v.trim().to_string()))
                .collect()
        })
        .collect()
}

/// Id of a table from the schema tables, optionally without hyphens (the
/// form used in backup object paths).
pub async fn table_id(
    data: &dyn DataPlane,
    keyspace: &str,
    table: &str,
    remove_hyphen: bool,
) -> Result<String, MgmtError> {
    let rows = data
        .execute(&format!(
            "SELECT id FROM system_schema.tables WHERE keyspace_name = '{keyspace}' AND table_name = '{table}'"
        ))
        .await?;
    let id = rows
        .into_iter()
        .next()
        .and_then(|mut row| row.remove("id"))
        .ok_or_else(|| MgmtError::not_found(format!("table {keyspace}.{table}")))?;
    Ok(if remove_hyphen { id.replace('-', "") } else { id })
}

/// Read `key, value` rows of a table into a map.
pub async fn read_rows(data: &dyn DataPlane, keyspace: &str, table: &str) -> Result<BTreeMap<String, String>, MgmtError> {
    let rows = data
        .execute(&format!("SELECT key, value FROM {keyspace}.{table}"))
        .await?;
    Ok(rows
        .into_iter()
        .filter_map(|mut row| Some((row.remove("key")?, row.remove("value")?)))
        .collect())
}

pub async fn write_rows(
    data: &dyn DataPlane,
    keyspace: &str,
    table: &str,
    rows: &BTreeMap<String, String>,
) -> Result<(), MgmtError> {
    for (key, value) in rows {
        data.execute(&format!(
            "INSERT INTO {keyspace}.{table} (key, value) VALUES ('{key}', '{value}')"
        ))
        .await?;
    }
    debug!(keyspace, table, rows = rows.len(), "rows written");
    Ok(())
}

/// Count rows that are missing, differ, or were not expected.
pub async fn verify_rows(
    data: &dyn DataPlane,
    keyspace: &str,
    table: &str,
    expected: &BTreeMap<String, String>,
) -> Result<usize, MgmtError> {
    let actual = read_rows(data, keyspace, table).await?;
    let mut mismatches = expected
        .iter()
        .filter(|(key, value)| actual.get(*key) != Some(*value))
        .count();
    mismatches += actual.keys().filter(|key| !expected.contains_key(*key)).count();
    if mismatches > 0 {
        warn!(keyspace, table, mismatches, expected = expected.len(), actual = actual.len(), "row mismatches");
    }
    Ok(mismatches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgmt_common::{CommandOutput, MockExecutor};

    const SELECT_OUTPUT: &str = "\n key | value\n-----+-------\n  k1 |    v1\n  k2 |    v2\n\n(2 rows)\n";

    #[test]
    fn parses_table_output() {
        let rows = parse_cqlsh_table(SELECT_OUTPUT);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["key"], "k1");
        assert_eq!(rows[1]["value"], "v2");
    }

    #[test]
    fn empty_result_has_no_rows() {
        assert!(parse_cqlsh_table("\n key | value\n-----+-------\n\n(0 rows)\n").is_empty());
        assert!(parse_cqlsh_table("").is_empty());
    }

    #[tokio::test]
    async fn verify_counts_missing_changed_and_extra() {
        let mock = MockExecutor::new("node1");
        mock.respond_to("SELECT key", CommandOutput::success(SELECT_OUTPUT));
        let data = CqlshDataPlane::new(Arc::new(mock.clone()), "10.0.0.1");

        let mut expected = BTreeMap::new();
        expected.insert("k1".to_string(), "v1".to_string());
        assert_eq!(verify_rows(&data, "ks", "t", &expected).await.unwrap(), 1);

        expected.insert("k2".to_string(), "other".to_string());
        expected.insert("k3".to_string(), "v3".to_string());
        assert_eq!(verify_rows(&data, "ks", "t", &expected).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn table_id_strips_hyphens() {
        let mock = MockExecutor::new("node1");
        mock.respond_to(
            "system_schema.tables",
            CommandOutput::success(" id\n----\n 1b6f-22aa\n\n(1 rows)\n"),
        );
        let data = CqlshDataPlane::new(Arc::new(mock), "10.0.0.1");
        assert_eq!(table_id(&data, "ks", "t", true).await.unwrap(), "1b6f22aa");
        assert_eq!(table_id(&data, "ks", "t", false).await.unwrap(), "1b6f-22aa");
    }

    #[test]
    fn command_quotes_statement() {
        let data = CqlshDataPlane::new(Arc::new(MockExecutor::new("n")), "10.0.0.1").with_credentials("cassandra", "secret");
        let command = data.command("SELECT * FROM ks.t");
        assert!(command.starts_with("cqlsh -u cassandra -p secret -e 'SELECT * FROM ks.t'"));
        assert!(command.ends_with("10.0.0.1"));
    }
}
