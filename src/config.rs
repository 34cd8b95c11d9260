//! Pipeline Configuration
//!
//! All keys are kebab-case and optional; missing keys take their defaults.
//!
//! ```yaml
//! block-size: 16777216
//! ecc-scheme: "18x18"
//! raid-pool-size: 4
//! supplier-send-concurrency: 4
//! monitor-interval: 10
//! local-purge-policy: when-fully-remote
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backup::BackupJobConfig;
use crate::ec::EccMap;
use crate::error::{Error, Result};
use crate::monitor::MonitorConfig;
use crate::raid::RaidWorkerConfig;
use crate::restore::RestoreConfig;
use crate::sender::SenderConfig;
use crate::supplier::SessionConfig;

/// Default block size (16 MiB)
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// When local fragment copies may be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PurgePolicy {
    /// Keep local copies forever
    #[default]
    Never,
    /// Delete local copies once every fragment of a block is acked by an
    /// alive supplier
    WhenFullyRemote,
}

/// Top-level configuration recognized by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PipelineConfig {
    /// Plaintext bytes per block
    pub block_size: usize,

    /// ECC scheme name (`18x18` or `ecc/18x18`)
    pub ecc_scheme: String,

    /// Raid worker threads; `None` means max(1, ncpus/2)
    pub raid_pool_size: Option<usize>,

    /// Blocks per backup in ENCRYPT or RAID at once; `None` means pool size
    pub max_in_flight_blocks: Option<usize>,

    /// In-flight sends per supplier
    pub supplier_send_concurrency: usize,

    /// Monitor period in seconds
    #[serde(rename = "monitor-interval")]
    pub monitor_interval_secs: u64,

    pub local_purge_policy: PurgePolicy,

    /// Matrix persistence coalescing window
    pub matrix_flush_interval_ms: u64,

    /// Consecutive send failures before a supplier goes offline
    pub supplier_failure_threshold: u32,

    pub probe_backoff_max_secs: u64,

    pub send_timeout_secs: u64,

    pub fetch_timeout_secs: u64,

    /// Written into every block header
    pub creator_id: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            ecc_scheme: "18x18".to_string(),
            raid_pool_size: None,
            max_in_flight_blocks: None,
            supplier_send_concurrency: 4,
            monitor_interval_secs: 10,
            local_purge_policy: PurgePolicy::Never,
            matrix_flush_interval_ms: 1000,
            supplier_failure_threshold: 3,
            probe_backoff_max_secs: 600,
            send_timeout_secs: 60,
            fetch_timeout_secs: 60,
            creator_id: "fragvault".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a YAML config file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        EccMap::by_name(&self.ecc_scheme)
            .map_err(|_| Error::Config(format!("unknown ecc scheme '{}'", self.ecc_scheme)))?;

        let positive = [
            ("block-size", self.block_size as u64),
            ("supplier-send-concurrency", self.supplier_send_concurrency as u64),
            ("monitor-interval", self.monitor_interval_secs),
            ("matrix-flush-interval-ms", self.matrix_flush_interval_ms),
            ("supplier-failure-threshold", self.supplier_failure_threshold as u64),
            ("probe-backoff-max-secs", self.probe_backoff_max_secs),
            ("send-timeout-secs", self.send_timeout_secs),
            ("fetch-timeout-secs", self.fetch_timeout_secs),
            ("raid-pool-size", self.raid_pool_size.unwrap_or(1) as u64),
            ("max-in-flight-blocks", self.max_in_flight_blocks.unwrap_or(1) as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", key)));
            }
        }
        if self.creator_id.is_empty() {
            return Err(Error::Config("creator-id must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn eccmap(&self) -> Result<EccMap> {
        EccMap::by_name(&self.ecc_scheme)
    }

    pub fn matrix_flush_interval(&self) -> Duration {
        Duration::from_millis(self.matrix_flush_interval_ms)
    }

    pub fn raid_worker(&self) -> RaidWorkerConfig {
        match self.raid_pool_size {
            Some(pool_size) => RaidWorkerConfig { pool_size },
            None => RaidWorkerConfig::default(),
        }
    }

    pub fn backup_job(&self) -> Result<BackupJobConfig> {
        let pool_size = self.raid_worker().pool_size;
        Ok(BackupJobConfig {
            block_size: self.block_size,
            ecc: self.eccmap()?,
            max_in_flight_blocks: self.max_in_flight_blocks.unwrap_or(pool_size),
            creator_id: self.creator_id.clone(),
            ..Default::default()
        })
    }

    pub fn sender(&self) -> SenderConfig {
        SenderConfig {
            per_supplier_concurrency: self.supplier_send_concurrency,
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            ..Default::default()
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            failure_threshold: self.supplier_failure_threshold,
            probe_backoff_max: Duration::from_secs(self.probe_backoff_max_secs),
            ..Default::default()
        }
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.monitor_interval_secs),
            purge_policy: self.local_purge_policy,
            max_rebuilds_per_cycle: self.raid_worker().pool_size,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            ..Default::default()
        }
    }

    pub fn restore(&self) -> RestoreConfig {
        RestoreConfig {
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.block_size, 16 * 1024 * 1024);
        assert_eq!(config.eccmap().unwrap().name(), "18x18");
        assert_eq!(config.sender().per_supplier_concurrency, 4);
        assert_eq!(config.monitor().interval, Duration::from_secs(10));
        assert!(config.raid_worker().pool_size >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_kebab_keys() {
        let config = PipelineConfig::from_yaml_str(
            "block-size: 1024\necc-scheme: ecc/4x4\nraid-pool-size: 3\nmonitor-interval: 2\nlocal-purge-policy: when-fully-remote\n",
        )
        .unwrap();
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.eccmap().unwrap().data_count(), 4);
        assert_eq!(config.raid_worker().pool_size, 3);
        assert_eq!(config.backup_job().unwrap().max_in_flight_blocks, 3);
        assert_eq!(config.monitor().interval, Duration::from_secs(2));
        assert_eq!(config.local_purge_policy, PurgePolicy::WhenFullyRemote);
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let result = PipelineConfig::from_yaml_str("ecc-scheme: 5x5\n");
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[test]
    fn test_zero_values_rejected() {
        for yaml in [
            "block-size: 0\n",
            "raid-pool-size: 0\n",
            "supplier-send-concurrency: 0\n",
            "monitor-interval: 0\n",
        ] {
            assert_matches!(PipelineConfig::from_yaml_str(yaml), Err(Error::Config(_)));
        }
    }

    #[test]
    fn test_unknown_purge_policy_rejected() {
        let result = PipelineConfig::from_yaml_str("local-purge-policy: sometimes\n");
        assert_matches!(result, Err(Error::Config(_)));
    }
}
