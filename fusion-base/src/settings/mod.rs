//! Configuration for fusion relayer agents.
//!
//! Settings load in layers: JSON files named by the `CONFIG_FILES`
//! environment variable (comma separated, later files win), then environment
//! variables prefixed `FUSION__` with `__` as the path separator. E.g.
//! `FUSION__STORE__MODE=hybrid` overrides `store.mode` from the files.

mod trace;
pub use trace::*;

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use fusion_store::StoreConfig;

use crate::conn::{EndpointConf, PoolConf};
use crate::throttle::ThrottleConfig;

/// Failure to load or validate configuration. Fatal at boot.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The config crate could not read or deserialize the sources.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    /// The sources parsed but the values are unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Endpoints and pool parameters for one chain's RPC.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConf {
    /// RPC endpoints, primary first by `priority`.
    pub endpoints: Vec<EndpointConf>,
    /// Pool behaviour for this chain.
    #[serde(default)]
    pub pool: PoolConf,
    /// Seconds of headroom before the timelock at which refunds start.
    #[serde(default = "default_refund_buffer_secs")]
    pub refund_buffer_secs: i64,
    /// Run against the in-process simulator instead of a linked client
    /// implementation. Local development only.
    #[serde(default)]
    pub simulated: bool,
}

/// Relay engine knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConf {
    /// Worker tasks driving relays.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Lease TTL in seconds; heartbeats run at a third of this.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    /// Idle sleep between lease polls, milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Retry budget per (relay, action).
    #[serde(default = "default_max_action_retries")]
    pub max_action_retries: u32,
    /// Base back-off delay, milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Back-off growth factor.
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    /// Back-off cap, milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Per-action deadline, seconds.
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            lease_ttl_secs: default_lease_ttl_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_action_retries: default_max_action_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            action_timeout_secs: default_action_timeout_secs(),
        }
    }
}

impl EngineConf {
    /// Lease TTL as a duration.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Per-action deadline as a duration.
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

/// Performance monitor knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConf {
    /// Whether the monitor loop runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Snapshot capture interval, seconds.
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    /// Health score below which a warning is logged.
    #[serde(default = "default_health_warn_threshold")]
    pub health_warn_threshold: f64,
}

impl Default for MonitorConf {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval_secs(),
            health_warn_threshold: default_health_warn_threshold(),
        }
    }
}

/// Archival / retention knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchivalConf {
    /// Whether scheduled archival runs.
    #[serde(default)]
    pub enabled: bool,
    /// Cron expression for archival passes (seconds-resolution, 7 fields).
    #[serde(default = "default_archival_cron")]
    pub cron: String,
    /// Terminal relay retention, seconds.
    #[serde(default = "default_relay_retention_secs")]
    pub relay_retention_secs: u64,
    /// Metrics snapshot retention, seconds.
    #[serde(default = "default_snapshot_retention_secs")]
    pub snapshot_retention_secs: u64,
}

impl Default for ArchivalConf {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: default_archival_cron(),
            relay_retention_secs: default_relay_retention_secs(),
            snapshot_retention_secs: default_snapshot_retention_secs(),
        }
    }
}

/// Settings shared by every agent in this workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Store provider selection and backends.
    pub store: StoreConfig,
    /// Chains this agent relays between, keyed by chain id.
    pub chains: HashMap<String, ChainConf>,
    /// Relay engine knobs.
    #[serde(default)]
    pub engine: EngineConf,
    /// Throttled executor fronting chain RPC calls.
    #[serde(default)]
    pub throttle: ThrottleConfig,
    /// Performance monitor.
    #[serde(default)]
    pub monitor: MonitorConf,
    /// Archival and retention.
    #[serde(default)]
    pub archival: ArchivalConf,
    /// Port for prometheus exposition.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Tracing output configuration.
    #[serde(default)]
    pub tracing: TracingConfig,
}

impl Settings {
    /// Load from the layered sources described at module level.
    pub fn load() -> Result<Self, SettingsError> {
        let mut builder = config::Config::builder();
        if let Ok(files) = std::env::var("CONFIG_FILES") {
            for path in files.split(',').filter(|p| !p.is_empty()) {
                builder = builder.add_source(config::File::with_name(path));
            }
        }
        let loaded = builder
            .add_source(
                config::Environment::with_prefix("FUSION")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        let settings: Settings = loaded.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations an agent cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.store
            .validate()
            .map_err(SettingsError::Invalid)?;
        if self.chains.is_empty() {
            return Err(SettingsError::Invalid("no chains configured".into()));
        }
        for (chain_id, chain) in &self.chains {
            if chain.endpoints.is_empty() {
                return Err(SettingsError::Invalid(format!(
                    "chain `{chain_id}` has no endpoints"
                )));
            }
            for endpoint in &chain.endpoints {
                if endpoint.port == 0 {
                    return Err(SettingsError::Invalid(format!(
                        "chain `{chain_id}` endpoint `{}` has port 0",
                        endpoint.host
                    )));
                }
            }
            if chain.refund_buffer_secs < 0 {
                return Err(SettingsError::Invalid(format!(
                    "chain `{chain_id}` has a negative refund buffer"
                )));
            }
            chain
                .pool
                .validate()
                .map_err(|msg| SettingsError::Invalid(format!("chain `{chain_id}`: {msg}")))?;
        }
        if self.engine.workers == 0 {
            return Err(SettingsError::Invalid("engine.workers must be positive".into()));
        }
        if self.engine.retry_multiplier < 1.0 {
            return Err(SettingsError::Invalid(
                "engine.retry_multiplier must be >= 1".into(),
            ));
        }
        self.throttle
            .validate()
            .map_err(SettingsError::Invalid)?;
        if !(0.0..=1.0).contains(&self.monitor.health_warn_threshold) {
            return Err(SettingsError::Invalid(
                "monitor.health_warn_threshold must be within [0, 1]".into(),
            ));
        }
        if self.archival.enabled {
            fusion_store::archive::parse_schedule(&self.archival.cron)
                .map_err(|err| SettingsError::Invalid(err.to_string()))?;
        }
        Ok(())
    }
}

/// Agent-specific settings wrap the shared [`Settings`] and know how to load
/// themselves.
pub trait LoadableFromSettings: AsRef<Settings> + Sized {
    /// Read the layered configuration sources.
    fn load() -> Result<Self, SettingsError>;
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_lease_ttl_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_action_retries() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_action_timeout_secs() -> u64 {
    120
}

fn default_refund_buffer_secs() -> i64 {
    300
}

fn default_monitor_interval_secs() -> u64 {
    60
}

fn default_health_warn_threshold() -> f64 {
    0.5
}

fn default_archival_cron() -> String {
    // 03:17 UTC daily; off the top of the hour on purpose.
    "0 17 3 * * * *".into()
}

fn default_relay_retention_secs() -> u64 {
    7 * 86_400
}

fn default_snapshot_retention_secs() -> u64 {
    30 * 86_400
}

fn default_metrics_port() -> u16 {
    9_090
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conn::EndpointConf;

    fn minimal() -> Settings {
        let mut chains = HashMap::new();
        chains.insert(
            "ethereum".to_string(),
            ChainConf {
                endpoints: vec![EndpointConf {
                    host: "rpc.example.org".into(),
                    port: 8545,
                    username: None,
                    password: None,
                    priority: 1,
                    weight: None,
                    readonly: false,
                }],
                pool: PoolConf::default(),
                refund_buffer_secs: 300,
                simulated: false,
            },
        );
        Settings {
            store: serde_json::from_value(serde_json::json!({
                "mode": "postgres",
                "postgres": { "url": "postgres://localhost/fusion" },
            }))
            .unwrap(),
            chains,
            engine: EngineConf::default(),
            throttle: ThrottleConfig::default(),
            monitor: MonitorConf::default(),
            archival: ArchivalConf::default(),
            metrics_port: 9090,
            tracing: TracingConfig::default(),
        }
    }

    #[test]
    fn minimal_settings_validate() {
        minimal().validate().unwrap();
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut settings = minimal();
        settings
            .chains
            .get_mut("ethereum")
            .unwrap()
            .endpoints[0]
            .port = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut settings = minimal();
        settings.engine.workers = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn bad_archival_cron_is_rejected_only_when_enabled() {
        let mut settings = minimal();
        settings.archival.cron = "whenever".into();
        settings.validate().unwrap();
        settings.archival.enabled = true;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn missing_backend_block_is_rejected() {
        let mut settings = minimal();
        settings.store = serde_json::from_value(serde_json::json!({ "mode": "hybrid" })).unwrap();
        assert!(settings.validate().is_err());
    }
}
