//! Runtime configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/var/lib/fleet-configurator";
/// The default path where the local daemon's rendered config is written.
pub const DEFAULT_DAEMON_CONFIG_PATH: &str = "/etc/fleet/cluster.json";

/// The kind of agent this process runs as.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    /// A cluster controller replica.
    Controller,
    /// A compute-node agent.
    Compute,
    /// The accounting backend.
    Accounting,
}

impl std::fmt::Display for RoleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Controller => write!(f, "controller"),
            Self::Compute => write!(f, "compute"),
            Self::Accounting => write!(f, "accounting"),
        }
    }
}

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for health, status, metrics and administrative actions.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The kind of agent this instance runs as.
    pub role_kind: RoleKind,
    /// The name of the role (group) this instance belongs to.
    pub role_name: String,
    /// The unique identity of this instance, e.g. `controller/0`.
    pub instance_name: String,
    /// The hostname published in this instance's facts.
    pub hostname: String,
    /// The externally reachable address published in this instance's facts.
    pub ingress_address: String,
    /// The port of the local daemon.
    #[serde(default = "Config::default_daemon_port")]
    pub daemon_port: u16,
    /// The roles this role is linked to through the exchange.
    #[serde(default, deserialize_with = "Config::parse_list")]
    pub links: Vec<String>,

    /// The partition this compute group publishes, defaults to the role name.
    #[serde(default)]
    pub partition_name: Option<String>,
    /// Free-form partition configuration published by a compute group.
    #[serde(default)]
    pub partition_config: String,
    /// The administrator-pinned default partition.
    #[serde(default)]
    pub default_partition: Option<String>,
    /// Free-form cluster options, given as `key=value,key=value`.
    #[serde(default, deserialize_with = "Config::parse_options")]
    pub cluster_options: BTreeMap<String, String>,

    /// The path to the database on disk.
    #[serde(default = "Config::default_data_path")]
    pub storage_data_path: String,

    /// The URL of the registry's JSON gateway, e.g. `http://127.0.0.1:2379`.
    pub registry_endpoint: String,
    /// An optional path to a PEM encoded CA bundle used to verify the registry.
    #[serde(default)]
    pub registry_ca_cert: Option<String>,
    /// An optional registry username.
    #[serde(default)]
    pub registry_username: Option<String>,
    /// An optional registry password.
    #[serde(default)]
    pub registry_password: Option<String>,

    /// The duration in seconds for which a writer lease is considered held.
    #[serde(default = "Config::default_lease_duration")]
    pub lease_duration_seconds: u32,
    /// The duration that a lease holder will retry refreshing its lease.
    #[serde(default = "Config::default_lease_renew")]
    pub lease_renew_seconds: u32,
    /// The change-detection interval of the exchange in milliseconds.
    #[serde(default = "Config::default_exchange_poll")]
    pub exchange_poll_millis: u64,
    /// The heartbeat age after which an instance is considered departed.
    #[serde(default = "Config::default_member_ttl")]
    pub member_ttl_seconds: u64,

    /// The interval between admission polls of a compute agent.
    #[serde(default = "Config::default_admission_poll")]
    pub admission_poll_seconds: u64,
    /// The number of admission polls before a compute agent reports itself as blocked.
    #[serde(default = "Config::default_admission_retries")]
    pub admission_max_retries: u32,

    /// The path where the rendered snapshot is written for the local daemon.
    #[serde(default = "Config::default_daemon_config_path")]
    pub daemon_config_path: String,
    /// The systemd unit of the local daemon.
    #[serde(default)]
    pub daemon_service: Option<String>,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints which serde can not express.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.role_name.is_empty(), "ROLE_NAME must not be empty");
        ensure!(!self.instance_name.is_empty(), "INSTANCE_NAME must not be empty");
        ensure!(
            self.lease_duration_seconds > self.lease_renew_seconds,
            "LEASE_DURATION_SECONDS must be greater than LEASE_RENEW_SECONDS"
        );
        ensure!(self.exchange_poll_millis > 0, "EXCHANGE_POLL_MILLIS must be greater than 0");
        ensure!(self.admission_poll_seconds > 0, "ADMISSION_POLL_SECONDS must be greater than 0");
        Ok(())
    }

    /// The partition name published by this compute group.
    pub fn partition_name(&self) -> &str {
        self.partition_name.as_deref().unwrap_or(&self.role_name)
    }

    /// The systemd unit of the local daemon, falling back to a per-role default.
    pub fn daemon_service(&self) -> String {
        match &self.daemon_service {
            Some(service) => service.clone(),
            None => match self.role_kind {
                RoleKind::Controller => "slurmctld.service".into(),
                RoleKind::Compute => "slurmd.service".into(),
                RoleKind::Accounting => "slurmdbd.service".into(),
            },
        }
    }

    fn default_http_port() -> u16 {
        7070
    }

    fn default_daemon_port() -> u16 {
        6817
    }

    fn default_data_path() -> String {
        DEFAULT_DATA_PATH.to_string()
    }

    fn default_lease_duration() -> u32 {
        15
    }

    fn default_lease_renew() -> u32 {
        10
    }

    fn default_exchange_poll() -> u64 {
        2000
    }

    fn default_member_ttl() -> u64 {
        30
    }

    fn default_admission_poll() -> u64 {
        5
    }

    fn default_admission_retries() -> u32 {
        60
    }

    fn default_daemon_config_path() -> String {
        DEFAULT_DAEMON_CONFIG_PATH.to_string()
    }

    /// Parse a comma-separated list, ignoring empty segments.
    fn parse_list<'de, D: Deserializer<'de>>(val: D) -> Result<Vec<String>, D::Error> {
        let raw: String = Deserialize::deserialize(val)?;
        Ok(raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(String::from)
            .collect())
    }

    /// Parse a comma-separated list of `key=value` pairs.
    fn parse_options<'de, D: Deserializer<'de>>(val: D) -> Result<BTreeMap<String, String>, D::Error> {
        let raw: String = Deserialize::deserialize(val)?;
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| match item.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.trim().to_string())),
                _ => Err(DeError::custom(format!("error parsing CLUSTER_OPTIONS, expected key=value, got `{}`", item))),
            })
            .collect()
    }
}

#[cfg(test)]
impl Config {
    /// Create a config for tests, backed by a fresh temporary data directory.
    pub fn new_test(role_kind: RoleKind, role_name: &str, instance_name: &str) -> Result<(Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config = Self {
            rust_log: "error".into(),
            http_port: 7070,
            role_kind,
            role_name: role_name.into(),
            instance_name: instance_name.into(),
            hostname: instance_name.replace('/', "-"),
            ingress_address: format!("10.0.0.{}", instance_name.len()),
            daemon_port: 6817,
            links: vec![],
            partition_name: None,
            partition_config: String::new(),
            default_partition: None,
            cluster_options: BTreeMap::new(),
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            registry_endpoint: "http://127.0.0.1:2379".into(),
            registry_ca_cert: None,
            registry_username: None,
            registry_password: None,
            lease_duration_seconds: 15,
            lease_renew_seconds: 10,
            exchange_poll_millis: 100,
            member_ttl_seconds: 3600,
            admission_poll_seconds: 1,
            admission_max_retries: 3,
            daemon_config_path: tmpdir.path().join("cluster.json").to_string_lossy().to_string(),
            daemon_service: None,
        };
        Ok((Arc::new(config), tmpdir))
    }
}
