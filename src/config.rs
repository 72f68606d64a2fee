//! Connection configuration: precedence, persistence and change publication
//!
//! The effective configuration comes from one of two sources:
//!
//! 1. the persisted record `config.json` in the data directory, layered
//!    over the hard-coded defaults,
//! 2. without a usable record, environment variables (`INVERTER_IP`,
//!    `MODBUS_PORT`, `SLAVE_ID`, `POLL_INTERVAL`) over the same defaults.
//!
//! Once a record exists the environment has no effect.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::constants::{
    CONFIG_FILE_NAME, DEFAULT_HOST, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_PORT, DEFAULT_SLAVE_ID,
    MAX_SLAVE_ID, MIN_POLL_INTERVAL_SECS,
};
use crate::error::{MonitorError, MonitorResult};

/// Environment variable naming the directory that holds the record.
pub const ENV_DATA_DIR: &str = "DATA_DIR";
pub const ENV_INVERTER_IP: &str = "INVERTER_IP";
pub const ENV_MODBUS_PORT: &str = "MODBUS_PORT";
pub const ENV_SLAVE_ID: &str = "SLAVE_ID";
pub const ENV_POLL_INTERVAL: &str = "POLL_INTERVAL";

/// Active connection parameters. Serialized as the persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(rename = "inverter_ip")]
    pub host: String,
    #[serde(rename = "modbus_port")]
    pub port: u16,
    pub slave_id: u8,
    #[serde(rename = "poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            slave_id: DEFAULT_SLAVE_ID,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16, slave_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            slave_id,
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Check every field against its accepted range.
    pub fn validate(&self) -> MonitorResult<()> {
        if self.host.trim().is_empty() {
            return Err(MonitorError::invalid_config("inverter IP cannot be empty"));
        }
        if self.port == 0 {
            return Err(MonitorError::invalid_config("port must be 1-65535"));
        }
        if self.slave_id == 0 || self.slave_id > MAX_SLAVE_ID {
            return Err(MonitorError::invalid_config(format!(
                "slave id must be 1-{}",
                MAX_SLAVE_ID
            )));
        }
        if self.poll_interval_secs < MIN_POLL_INTERVAL_SECS {
            return Err(MonitorError::invalid_config(format!(
                "poll interval minimum is {}s",
                MIN_POLL_INTERVAL_SECS
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether switching from `self` to `other` requires a new connection.
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.slave_id == other.slave_id
    }

    /// Fallback tier read from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Fallback tier read through `lookup`; unset or unusable values fall
    /// back to the hard default with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = match lookup(ENV_INVERTER_IP) {
            Some(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => defaults.host,
        };
        let port = parse_var(&lookup, ENV_MODBUS_PORT, defaults.port, |p: &u16| *p > 0);
        let slave_id = parse_var(&lookup, ENV_SLAVE_ID, defaults.slave_id, |id: &u8| {
            (1..=MAX_SLAVE_ID).contains(id)
        });
        let poll_interval_secs =
            parse_var(&lookup, ENV_POLL_INTERVAL, defaults.poll_interval_secs, |_| true)
                .max(MIN_POLL_INTERVAL_SECS);

        Self {
            host,
            port,
            slave_id,
            poll_interval_secs,
        }
    }

    /// Apply the fields present in `record` on top of `self`.
    fn overlay(mut self, record: PersistedRecord) -> Self {
        if let Some(host) = record.inverter_ip {
            if host.trim().is_empty() {
                warn!("Ignoring empty inverter_ip in persisted record");
            } else {
                self.host = host.trim().to_string();
            }
        }
        if let Some(port) = record.modbus_port {
            if port == 0 {
                warn!("Ignoring modbus_port 0 in persisted record");
            } else {
                self.port = port;
            }
        }
        if let Some(slave_id) = record.slave_id {
            if (1..=MAX_SLAVE_ID).contains(&slave_id) {
                self.slave_id = slave_id;
            } else {
                warn!(slave_id, "Ignoring out-of-range slave_id in persisted record");
            }
        }
        if let Some(secs) = record.poll_interval {
            self.poll_interval_secs = secs.max(MIN_POLL_INTERVAL_SECS);
        }
        self
    }
}

fn parse_var<T, F, V>(lookup: &F, key: &str, default: T, valid: V) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
    F: Fn(&str) -> Option<String>,
    V: Fn(&T) -> bool,
{
    let Some(raw) = lookup(key) else {
        return default;
    };

    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            warn!(key, value = %raw, default = %default, "Invalid environment value, using default");
            default
        }
    }
}

/// On-disk shape of the record; every key optional, unknown keys ignored.
#[derive(Debug, Default, Deserialize)]
struct PersistedRecord {
    inverter_ip: Option<String>,
    modbus_port: Option<u16>,
    slave_id: Option<u8>,
    poll_interval: Option<u64>,
}

// ============================================================================
// ConfigStore
// ============================================================================

/// Owner of the process-wide [`ConnectionConfig`].
///
/// Reads are lock-free snapshots. Updates are serialized, persisted before
/// they take effect, and published to every subscriber.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    update_lock: Mutex<()>,
    tx: watch::Sender<ConnectionConfig>,
}

impl ConfigStore {
    /// Resolve the effective configuration. A record in `data_dir` is layered
    /// over the built-in defaults; `fallback` applies only when no usable
    /// record exists.
    pub async fn load(data_dir: impl AsRef<Path>, fallback: ConnectionConfig) -> Self {
        let path = data_dir.as_ref().join(CONFIG_FILE_NAME);

        let config = match read_record(&path).await {
            Some(record) => {
                info!(path = %path.display(), "Loaded persisted configuration, environment ignored");
                ConnectionConfig::default().overlay(record)
            }
            None => {
                info!(path = %path.display(), "No persisted configuration, using defaults");
                fallback
            }
        };

        debug!(?config, "Effective configuration");
        let (tx, _) = watch::channel(config);
        Self {
            path,
            update_lock: Mutex::new(()),
            tx,
        }
    }

    /// Resolve from `DATA_DIR` (default `.`) and the environment tier.
    pub async fn from_env() -> Self {
        let data_dir = std::env::var(ENV_DATA_DIR).unwrap_or_else(|_| ".".to_string());
        Self::load(data_dir, ConnectionConfig::from_env()).await
    }

    /// The configuration currently in effect.
    pub fn effective_config(&self) -> ConnectionConfig {
        self.tx.borrow().clone()
    }

    /// Receive every configuration that takes effect from now on.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionConfig> {
        self.tx.subscribe()
    }

    /// Location of the persisted record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate, persist, then apply and publish `new`.
    ///
    /// Nothing changes in memory unless the record was written; concurrent
    /// updates are applied one at a time, last writer wins.
    pub async fn update(&self, mut new: ConnectionConfig) -> MonitorResult<ConnectionConfig> {
        new.host = new.host.trim().to_string();
        new.validate()?;

        let _guard = self.update_lock.lock().await;
        write_record(&self.path, &new).await?;

        let changed = self.tx.send_if_modified(|current| {
            if *current == new {
                false
            } else {
                *current = new.clone();
                true
            }
        });

        if changed {
            info!(
                endpoint = %new.endpoint(),
                slave_id = new.slave_id,
                poll_interval = new.poll_interval_secs,
                "Configuration updated"
            );
        } else {
            debug!("Configuration unchanged");
        }

        Ok(new)
    }
}

async fn read_record(path: &Path) -> Option<PersistedRecord> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable configuration record, ignoring");
            return None;
        }
    };

    match serde_json::from_slice::<PersistedRecord>(&contents) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt configuration record, ignoring");
            None
        }
    }
}

async fn write_record(path: &Path, config: &ConnectionConfig) -> MonitorResult<()> {
    let persist_err =
        |e: std::io::Error| MonitorError::persistence(format!("{}: {}", path.display(), e));

    let json = serde_json::to_vec_pretty(config)
        .map_err(|e| MonitorError::persistence(format!("serialize: {}", e)))?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await.map_err(persist_err)?;
    }

    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await.map_err(persist_err)?;
    file.write_all(&json).await.map_err(persist_err)?;
    file.sync_all().await.map_err(persist_err)?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(persist_err(e));
    }

    debug!(path = %path.display(), "Persisted configuration record");
    Ok(())
}
