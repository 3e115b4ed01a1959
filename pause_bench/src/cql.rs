//! CQL sessions, and the data written before pausing and read back after
//! resuming.
//!
//! Datacenters are reached through the ingress controller. It routes a
//! connection by the TLS server name, so sessions are set up from the
//! connection config Scylla Operator publishes for the datacenter, which names
//! the nodes under the datacenter's DNS domain.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use camino_tempfile::NamedUtf8TempFile;
use scylla::client::execution_profile::ExecutionProfile;
use scylla::client::session::Session;
use scylla::client::session_builder::CloudSessionBuilder;
use scylla::cloud::CloudTlsProvider;
use scylla::statement::Consistency;
use serde_yaml::Value;

/// A `CQLConnectionConfig` document: CA, credentials and node domain per
/// datacenter.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionBundle {
    config: Value,
}

impl ConnectionBundle {
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        let config: Value = serde_yaml::from_slice(data).context("parse CQL connection config")?;
        if !config.get("datacenters").is_some_and(Value::is_mapping) {
            bail!("CQL connection config has no datacenters");
        }
        Ok(Self { config })
    }

    /// Sends connections to `datacenter` to `server` instead of the address
    /// the operator published.
    pub fn route_through(&mut self, datacenter: &str, server: &str) -> anyhow::Result<()> {
        let datacenter_config = self
            .config
            .get_mut("datacenters")
            .and_then(|datacenters| datacenters.get_mut(datacenter))
            .and_then(Value::as_mapping_mut)
            .with_context(|| format!("CQL connection config has no datacenter {datacenter:?}"))?;
        datacenter_config.insert(
            Value::String("server".to_string()),
            Value::String(server.to_string()),
        );
        Ok(())
    }

    pub fn server(&self, datacenter: &str) -> Option<&str> {
        self.datacenter_field(datacenter, "server")
    }

    /// Nodes are addressed as `<host id>.<node domain>` in the server name.
    pub fn node_domain(&self, datacenter: &str) -> Option<&str> {
        self.datacenter_field(datacenter, "nodeDomain")
    }

    fn datacenter_field(&self, datacenter: &str, field: &str) -> Option<&str> {
        self.config
            .get("datacenters")?
            .get(datacenter)?
            .get(field)?
            .as_str()
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        serde_yaml::to_string(&self.config).context("serialize CQL connection config")
    }
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq)]
pub struct CqlEndpoint {
    pub bundle: ConnectionBundle,
    /// Gossip name of the datacenter to connect to.
    pub datacenter: String,
    pub connect_timeout: Duration,
}

impl CqlEndpoint {
    pub fn server(&self) -> &str {
        self.bundle.server(&self.datacenter).unwrap_or_default()
    }
}

/// Rows written to a dedicated keyspace, replicated to every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestData {
    pub keyspace: String,
    pub table: String,
    pub replication_factor: u32,
    pub rows: Vec<(i32, String)>,
}

impl TestData {
    pub fn new(keyspace: &str, replication_factor: u32, row_count: u32) -> Self {
        let rows = (0..row_count as i32).map(|id| (id, format!("row-{id}"))).collect();
        Self {
            keyspace: keyspace.to_string(),
            table: "test".to_string(),
            replication_factor,
            rows,
        }
    }

    /// Compares what was read back against what was written. Order doesn't matter.
    pub fn check(&self, mut actual: Vec<(i32, String)>) -> anyhow::Result<()> {
        actual.sort();
        let mut expected = self.rows.clone();
        expected.sort();
        if actual.len() != expected.len() {
            bail!(
                "expected {} rows in {}.{}, read {}",
                expected.len(),
                self.keyspace,
                self.table,
                actual.len()
            );
        }
        if let Some((want, got)) = expected.iter().zip(&actual).find(|(want, got)| want != got) {
            bail!(
                "row mismatch in {}.{}: expected {want:?}, read {got:?}",
                self.keyspace,
                self.table
            );
        }
        Ok(())
    }
}

#[async_trait]
pub trait CqlSession: Send + Sync {
    /// Creates the keyspace and the table if needed, and writes the rows.
    async fn insert_test_data(&self, data: &TestData) -> anyhow::Result<()>;

    async fn read_test_data(&self, data: &TestData) -> anyhow::Result<Vec<(i32, String)>>;

    async fn verify_test_data(&self, data: &TestData) -> anyhow::Result<()> {
        let rows = self.read_test_data(data).await?;
        data.check(rows)
    }

    fn close(self: Box<Self>) {}
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Returns once the session is established, i.e. once the cluster serves CQL.
    async fn open(&self, endpoint: &CqlEndpoint) -> anyhow::Result<Box<dyn CqlSession>>;
}

/// Sessions of the ScyllaDB driver in cloud mode, at QUORUM consistency.
pub struct ScyllaSessionFactory;

#[async_trait]
impl SessionFactory for ScyllaSessionFactory {
    async fn open(&self, endpoint: &CqlEndpoint) -> anyhow::Result<Box<dyn CqlSession>> {
        // The driver only reads connection configs from files.
        let mut config_file =
            NamedUtf8TempFile::new().context("create CQL connection config file")?;
        let config_path = config_file.path().to_owned();
        config_file
            .write_all(endpoint.bundle.to_yaml()?.as_bytes())
            .and_then(|()| config_file.flush())
            .with_context(|| format!("write CQL connection config to {config_path}"))?;

        let profile = ExecutionProfile::builder()
            .consistency(Consistency::Quorum)
            .request_timeout(Some(endpoint.connect_timeout))
            .build();
        let session = CloudSessionBuilder::new(&config_path, CloudTlsProvider::Rustls023)
            .with_context(|| format!("load CQL connection config {config_path}"))?
            .connection_timeout(endpoint.connect_timeout)
            .default_execution_profile_handle(profile.into_handle())
            .build()
            .await
            .with_context(|| {
                format!(
                    "connect to datacenter {:?} through {}",
                    endpoint.datacenter,
                    endpoint.server()
                )
            })?;
        Ok(Box::new(ScyllaSession { session }))
    }
}

struct ScyllaSession {
    session: Session,
}

#[async_trait]
impl CqlSession for ScyllaSession {
    async fn insert_test_data(&self, data: &TestData) -> anyhow::Result<()> {
        let TestData {
            keyspace,
            table,
            replication_factor,
            rows,
        } = data;
        self.session
            .query_unpaged(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {keyspace} WITH replication = \
                     {{'class': 'NetworkTopologyStrategy', 'replication_factor': {replication_factor}}}"
                ),
                (),
            )
            .await
            .with_context(|| format!("create keyspace {keyspace}"))?;
        self.session
            .query_unpaged(
                format!(
                    "CREATE TABLE IF NOT EXISTS {keyspace}.{table} (id int PRIMARY KEY, name text)"
                ),
                (),
            )
            .await
            .with_context(|| format!("create table {keyspace}.{table}"))?;

        let insert = self
            .session
            .prepare(format!(
                "INSERT INTO {keyspace}.{table} (id, name) VALUES (?, ?)"
            ))
            .await
            .context("prepare insert")?;
        for (id, name) in rows {
            self.session
                .execute_unpaged(&insert, (*id, name.as_str()))
                .await
                .with_context(|| format!("insert row {id} into {keyspace}.{table}"))?;
        }
        Ok(())
    }

    async fn read_test_data(&self, data: &TestData) -> anyhow::Result<Vec<(i32, String)>> {
        let TestData { keyspace, table, .. } = data;
        let result = self
            .session
            .query_unpaged(format!("SELECT id, name FROM {keyspace}.{table}"), ())
            .await
            .with_context(|| format!("select from {keyspace}.{table}"))?;
        let rows = result
            .into_rows_result()
            .context("select returned no rows result")?
            .rows::<(i32, String)>()
            .context("unexpected row type")?
            .collect::<Result<Vec<_>, _>>()
            .context("deserialize row")?;
        Ok(rows)
    }
}
