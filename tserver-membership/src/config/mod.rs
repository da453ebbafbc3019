use anyhow::bail;
use config::{File, FileFormat, Source};
use config::builder::DefaultState;
use serde::{Deserialize, Serialize};

use crate::config::duration::ConfigDuration;
use crate::MEMBERSHIP_CONFIG;

pub mod duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Coordination path under which every resource group keeps its servers.
    pub namespace_root: String,
    pub reconcile_queue_capacity: usize,
    /// Period of the self-healing full scan.
    pub scan_interval: ConfigDuration,
    /// How long a server path may exist without a lock before it is deleted.
    pub stale_grace_period: ConfigDuration,
    pub watch_retry_delay: ConfigDuration,
    pub pool: PoolConfig,
    pub etcd: EtcdConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_idle_per_address: usize,
    pub idle_timeout: ConfigDuration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
}

impl MembershipConfig {
    pub fn builder() -> MembershipConfigBuilder {
        MembershipConfigBuilder::default()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scan_interval.to_std_duration().is_zero() {
            bail!("scan_interval must be greater than zero");
        }
        Ok(())
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            namespace_root: "/cluster/tservers".to_string(),
            reconcile_queue_capacity: 1024,
            scan_interval: ConfigDuration::from_secs(5),
            stale_grace_period: ConfigDuration::from_mins(10),
            watch_retry_delay: ConfigDuration::from_secs(3),
            pool: PoolConfig::default(),
            etcd: EtcdConfig { endpoints: vec!["127.0.0.1:2379".to_string()] },
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_address: 10,
            idle_timeout: ConfigDuration::from_mins(2),
        }
    }
}

/// Layers user sources over the embedded `reference.toml`; later sources win.
#[derive(Debug)]
pub struct MembershipConfigBuilder {
    builder: config::ConfigBuilder<DefaultState>,
}

impl Default for MembershipConfigBuilder {
    fn default() -> Self {
        let builder = config::Config::builder()
            .add_source(File::from_str(MEMBERSHIP_CONFIG, FileFormat::Toml));
        Self { builder }
    }
}

impl MembershipConfigBuilder {
    pub fn add_source<T>(self, source: T) -> anyhow::Result<Self> where T: Source + Send + Sync + 'static {
        Ok(Self { builder: self.builder.add_source(source) })
    }

    pub fn build(self) -> anyhow::Result<MembershipConfig> {
        let config = self.builder.build()?.try_deserialize::<MembershipConfig>()?;
        config.validate()?;
        Ok(config)
    }
}
