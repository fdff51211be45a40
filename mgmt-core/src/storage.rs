//! Object-store listing used to inspect backup locations.

use async_trait::async_trait;
use mgmt_common::config::validate::check_location;
use mgmt_common::util::shell_quote;
use mgmt_common::{ExecError, MgmtError, RemoteExecutor};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Storage provider named by a location prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    S3,
    Gcs,
    Azure,
}

/// A parsed `<provider>:<bucket>` location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub provider: Provider,
    pub bucket: String,
}

impl Location {
    pub fn parse(raw: &str) -> Result<Self, MgmtError> {
        check_location(raw).map_err(MgmtError::InvalidParams)?;
        let (provider, bucket) = raw
            .split_once(':')
            .ok_or_else(|| MgmtError::InvalidParams(format!("location '{raw}' has no provider")))?;
        let provider = match provider {
            "s3" => Provider::S3,
            "gcs" => Provider::Gcs,
            "azure" => Provider::Azure,
            other => return Err(MgmtError::InvalidParams(format!("unknown provider '{other}'"))),
        };
        Ok(Self {
            provider,
            bucket: bucket.to_string(),
        })
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Keys under `prefix` in the bucket named by `location`. No match is
    /// an empty set, not an error.
    async fn list_keys(&self, location: &str, prefix: &str) -> Result<BTreeSet<String>, MgmtError>;

    async fn download(&self, location: &str, key: &str) -> Result<Vec<u8>, MgmtError>;
}

/// Lists objects with the provider CLIs on a remote host.
pub struct CliObjectStore {
    executor: Arc<dyn RemoteExecutor>,
}

impl CliObjectStore {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    fn list_command(location: &Location, prefix: &str) -> String {
        match location.provider {
            Provider::S3 => format!(
                "aws s3 ls {} --recursive",
                shell_quote(&format!("s3://{}/{}", location.bucket, prefix))
            ),
            Provider::Gcs => format!(
                "gsutil ls -r {}",
                shell_quote(&format!("gs://{}/{}**", location.bucket, prefix))
            ),
            Provider::Azure => format!(
                "az storage blob list --container-name {} --prefix {} --query '[].name' --output tsv",
                shell_quote(&location.bucket),
                shell_quote(prefix)
            ),
        }
    }

    fn download_command(location: &Location, key: &str) -> String {
        match location.provider {
            Provider::S3 => format!("aws s3 cp {} -", shell_quote(&format!("s3://{}/{}", location.bucket, key))),
            Provider::Gcs => format!("gsutil cat {}", shell_quote(&format!("gs://{}/{}", location.bucket, key))),
            Provider::Azure => format!(
                "az storage blob download --container-name {} --name {} --file /dev/stdout --output none",
                shell_quote(&location.bucket),
                shell_quote(key)
            ),
        }
    }
}

/// Parse listing output into keys. Directory markers are skipped.
fn parse_listing(location: &Location, stdout: &str) -> BTreeSet<String> {
    let gs_prefix = format!("gs://{}/", location.bucket);
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match location.provider {
            // 2024-01-01 10:00:00       1024 backup/sst/...
            Provider::S3 => {
                let key = line.split_whitespace().skip(3).collect::<Vec<_>>().join(" ");
                Some(key)
            }
            Provider::Gcs => {
                if line.ends_with(':') || line.ends_with('/') {
                    None
                } else {
                    line.strip_prefix(&gs_prefix).map(str::to_string)
                }
            }
            Provider::Azure => Some(line.to_string()),
        })
        .filter(|key| !key.is_empty())
        .collect()
}

/// Listing tools exit non-zero when nothing matches.
fn is_empty_match(output: &mgmt_common::CommandOutput) -> bool {
    output.stdout.trim().is_empty()
        && (output.stderr.trim().is_empty() || output.stderr.contains("matched no objects"))
}

#[async_trait]
impl ObjectStore for CliObjectStore {
    async fn list_keys(&self, location: &str, prefix: &str) -> Result<BTreeSet<String>, MgmtError> {
        let parsed = Location::parse(location)?;
        let command = Self::list_command(&parsed, prefix);
        let output = self.executor.execute(&command).await?;
        if !output.ok() {
            if is_empty_match(&output) {
                debug!(location, prefix, "no objects under prefix");
                return Ok(BTreeSet::new());
            }
            return Err(ExecError::UnexpectedExit {
                command,
                exit_code: output.exit_code,
                stderr: output.stderr,
            }
            .into());
        }
        let keys = parse_listing(&parsed, &output.stdout);
        debug!(location, prefix, count = keys.len(), "listed objects");
        Ok(keys)
    }

    async fn download(&self, location: &str, key: &str) -> Result<Vec<u8>, MgmtError> {
        let parsed = Location::parse(location)?;
        let output = self.executor.run(&Self::download_command(&parsed, key)).await?;
        Ok(output.stdout.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgmt_common::{CommandOutput, MockExecutor};

    fn store(mock: &MockExecutor) -> CliObjectStore {
        CliObjectStore::new(Arc::new(mock.clone()))
    }

    #[test]
    fn location_parse() {
        let loc = Location::parse("gcs:my-bucket").unwrap();
        assert_eq!(loc.provider, Provider::Gcs);
        assert_eq!(loc.bucket, "my-bucket");
        assert!(Location::parse("ftp:bucket").is_err());
    }

    #[tokio::test]
    async fn s3_listing_takes_key_column() {
        let mock = MockExecutor::new("monitor");
        mock.respond_to(
            "aws s3 ls",
            CommandOutput::success(
                "2024-05-01 10:00:00       1024 backup/sst/a-Data.db\n\
                 2024-05-01 10:00:01        512 backup/sst/b-Data.db\n",
            ),
        );
        let keys = store(&mock).list_keys("s3:bucket", "backup/sst").await.unwrap();
        assert_eq!(
            keys.into_iter().collect::<Vec<_>>(),
            vec!["backup/sst/a-Data.db", "backup/sst/b-Data.db"]
        );
        assert_eq!(mock.calls(), vec!["aws s3 ls 's3://bucket/backup/sst' --recursive"]);
    }

    #[tokio::test]
    async fn gcs_listing_skips_directories() {
        let mock = MockExecutor::new("monitor");
        mock.respond_to(
            "gsutil ls",
            CommandOutput::success("gs://b/backup/sst/:\ngs://b/backup/sst/x-Data.db\n"),
        );
        let keys = store(&mock).list_keys("gcs:b", "backup/sst/").await.unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["backup/sst/x-Data.db"]);
    }

    #[tokio::test]
    async fn zero_matches_is_empty_set() {
        let mock = MockExecutor::new("monitor");
        mock.push_result(Ok(CommandOutput::failure(1, "")));
        mock.push_result(Ok(CommandOutput::failure(
            1,
            "CommandException: One or more URLs matched no objects.",
        )));
        let store = store(&mock);
        assert!(store.list_keys("s3:bucket", "none").await.unwrap().is_empty());
        assert!(store.list_keys("gcs:bucket", "none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn access_denied_is_an_error() {
        let mock = MockExecutor::new("monitor");
        mock.push_result(Ok(CommandOutput::failure(1, "An error occurred (AccessDenied)")));
        let err = store(&mock).list_keys("s3:bucket", "x").await.unwrap_err();
        assert!(err.to_string().contains("AccessDenied") || matches!(err, MgmtError::Transport(_)));
    }
}
