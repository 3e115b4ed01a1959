//! Benchmark configuration, read from a TOML file.
//!
//! Example:
//!
//! ```toml
//! proxy_storage_class_name = 'proxy'
//! backend_csi_driver = 'pd.csi.storage.gke.io'
//! nodes = 3
//! ingress_class_name = 'haproxy'
//! ingress_controller_address = '10.0.0.17:9142'
//! dest_dir = '/var/lib/benchmarks/results'
//! topology_zone = 'us-east1-b'
//! image_pull_policy = 'Always'
//!
//! [wait]
//! poll_interval = '1s'
//! timeout = '15m'
//! ```

use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use utils::wait::{
    DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT, InvalidWaitOptions, WaitForStateOptions,
};

pub const DEFAULT_SCYLLADB_IMAGE: &str = "docker.io/scylladb/scylla:6.2.3@sha256:a9d904089abe9a4f8b5b893ebb5b5bf8b5a1bd0dc6658921cf05f89d3712289c";
pub const DEFAULT_MANAGER_AGENT_IMAGE: &str = "docker.io/scylladb/scylla-manager-agent:3.4.1@sha256:392ce6d3971ae077cc58b3cd2c7da1e9572f9f76223dfd5e11445c32e7ab0396";
pub const DEFAULT_BUSYBOX_IMAGE: &str = "docker.io/library/busybox:latest@sha256:498a000f370d8c37927118ed80afe8adc38d1edcbfc071627d17b25c88efcab0";
pub const DEFAULT_PROXY_CSI_DRIVER_IMAGE: &str = "docker.io/rzetelskik/proxy-csi-driver:latest@sha256:7f22416a68afc8b16abd88d3cc5f9bfb399e83310946f118e9e7933a060276fa";

/// CSI drivers that can back the datacenters' storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum BackendCsiDriver {
    #[serde(rename = "pd.csi.storage.gke.io")]
    GcePersistentDisk,
    #[serde(rename = "ebs.csi.aws.com")]
    Ebs,
}

impl BackendCsiDriver {
    pub fn name(&self) -> &'static str {
        match self {
            BackendCsiDriver::GcePersistentDisk => "pd.csi.storage.gke.io",
            BackendCsiDriver::Ebs => "ebs.csi.aws.com",
        }
    }
}

/// Pull policy of the containers the proxy volume scenarios run. With `Never`,
/// images have to be pre-pulled on the nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum ImagePullPolicy {
    #[default]
    Always,
    Never,
}

impl ImagePullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImagePullPolicy::Always => "Always",
            ImagePullPolicy::Never => "Never",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BenchmarkConfig {
    /// StorageClass provisioned by the proxy CSI driver.
    pub proxy_storage_class_name: String,
    pub backend_csi_driver: BackendCsiDriver,
    /// Members of the single rack.
    pub nodes: u32,
    /// IngressClass used to expose CQL.
    pub ingress_class_name: String,
    /// `host:port` of the ingress controller; CQL connections go there.
    pub ingress_controller_address: String,
    /// Directory the per-scenario result files are appended to.
    pub dest_dir: Utf8PathBuf,
    /// Restricts members to nodes of this zone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology_zone: Option<String>,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub image_pull_policy: ImagePullPolicy,
    #[serde(default)]
    pub wait: WaitConfig,
    #[serde(default)]
    pub cql: CqlConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ImagesConfig {
    #[serde(default = "default_scylladb_image")]
    pub scylladb: String,
    #[serde(default = "default_manager_agent_image")]
    pub manager_agent: String,
    /// Runs the workload of the proxy volume scenarios.
    #[serde(default = "default_busybox_image")]
    pub busybox: String,
    /// Provides the sidecar that signals when the backend volume is mounted.
    #[serde(default = "default_proxy_csi_driver_image")]
    pub proxy_csi_driver: String,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            scylladb: default_scylladb_image(),
            manager_agent: default_manager_agent_image(),
            busybox: default_busybox_image(),
            proxy_csi_driver: default_proxy_csi_driver_image(),
        }
    }
}

fn default_scylladb_image() -> String {
    DEFAULT_SCYLLADB_IMAGE.to_string()
}

fn default_manager_agent_image() -> String {
    DEFAULT_MANAGER_AGENT_IMAGE.to_string()
}

fn default_busybox_image() -> String {
    DEFAULT_BUSYBOX_IMAGE.to_string()
}

fn default_proxy_csi_driver_image() -> String {
    DEFAULT_PROXY_CSI_DRIVER_IMAGE.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WaitConfig {
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_wait_timeout")]
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl WaitConfig {
    pub fn options(&self) -> Result<WaitForStateOptions, InvalidWaitOptions> {
        WaitForStateOptions::new(self.poll_interval, self.timeout)
    }
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_wait_timeout() -> Duration {
    DEFAULT_WAIT_TIMEOUT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CqlConfig {
    /// Connections go through an extra hop, hence more than the driver's default.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Rows written before pausing and read back after resuming.
    #[serde(default = "default_test_rows")]
    pub test_rows: u32,
}

impl Default for CqlConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            test_rows: default_test_rows(),
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_test_rows() -> u32 {
    10
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("proxy_storage_class_name must not be empty")]
    EmptyProxyStorageClassName,
    #[error("nodes must be greater than zero")]
    NoNodes,
    #[error("ingress_class_name must not be empty")]
    EmptyIngressClassName,
    #[error("ingress_controller_address must not be empty")]
    EmptyIngressControllerAddress,
    #[error("cql.test_rows must be greater than zero")]
    NoTestRows,
    #[error("can't stat dest_dir {path}")]
    DestDirInaccessible {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dest_dir {path} must be a directory")]
    DestDirNotADirectory { path: Utf8PathBuf },
    #[error("invalid wait settings")]
    Wait(#[from] InvalidWaitOptions),
}

impl BenchmarkConfig {
    pub fn load(path: &Utf8Path) -> anyhow::Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("read config file {path}"))?;
        let config: BenchmarkConfig =
            toml::from_str(&contents).with_context(|| format!("parse config file {path}"))?;
        config
            .validate()
            .with_context(|| format!("validate config file {path}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_storage_class_name.is_empty() {
            return Err(ConfigError::EmptyProxyStorageClassName);
        }
        if self.nodes == 0 {
            return Err(ConfigError::NoNodes);
        }
        if self.ingress_class_name.is_empty() {
            return Err(ConfigError::EmptyIngressClassName);
        }
        if self.ingress_controller_address.is_empty() {
            return Err(ConfigError::EmptyIngressControllerAddress);
        }
        if self.cql.test_rows == 0 {
            return Err(ConfigError::NoTestRows);
        }
        self.wait.options()?;
        let metadata =
            std::fs::metadata(&self.dest_dir).map_err(|source| ConfigError::DestDirInaccessible {
                path: self.dest_dir.clone(),
                source,
            })?;
        if !metadata.is_dir() {
            return Err(ConfigError::DestDirNotADirectory {
                path: self.dest_dir.clone(),
            });
        }
        Ok(())
    }
}
