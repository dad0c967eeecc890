//! cdgridd.toml configuration.
//!
//! Every section and field is optional; an empty file yields the defaults.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use cdgrid_api::{AccessConfig, AccessPolicy};
use cdgrid_coordinator::{DEFAULT_SELF_TARGET, PollerConfig};
use cdgrid_executor::DockerConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CdgridConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub poller: PollerConfig,
    pub executor: ExecutorConfig,
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 8000,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Sliding lifetime of a job record after its last write.
    pub retention_secs: u64,
    /// How often expired jobs are purged.
    pub reap_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/cdgrid"),
            retention_secs: cdgrid_state::DEFAULT_RETENTION_SECS,
            reap_interval_secs: 3600,
        }
    }
}

impl StoreConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("cdgrid.redb")
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    #[serde(flatten)]
    pub docker: DockerConfig,
    /// Target whose deploys run the app announcement instead.
    pub self_target: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            docker: DockerConfig::default(),
            self_target: DEFAULT_SELF_TARGET.to_string(),
        }
    }
}

impl CdgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: CdgridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn access_policy(&self) -> anyhow::Result<AccessPolicy> {
        Ok(AccessPolicy::from_config(&self.access)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.access_policy()?;
        anyhow::ensure!(self.poller.interval_secs > 0, "poller.interval_secs must be positive");
        anyhow::ensure!(self.store.retention_secs > 0, "store.retention_secs must be positive");
        anyhow::ensure!(!self.executor.docker.image.is_empty(), "executor.image must not be empty");
        anyhow::ensure!(!self.executor.self_target.is_empty(), "executor.self_target must not be empty");
        Ok(())
    }
}
