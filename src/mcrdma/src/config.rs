use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TransportConfig {
    /// Address to listen on. Listens on all interfaces when unset.
    pub interface: Option<String>,
    pub port: u16,
    pub backlog: i32,
    pub dispatcher_poll_timeout_ms: u64,
    /// Size of each of the send and receive buffers, also the per-message ceiling.
    pub buffer_size: usize,
    pub cq_capacity: i32,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    /// Every this many empty completion polls the event channel is checked for a disconnect.
    pub disconnect_check_interval: usize,
    pub resolve_timeout_ms: i32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            interface: None,
            port: 11211,
            backlog: 16,
            dispatcher_poll_timeout_ms: 1000,
            buffer_size: 16 * 1024,
            cq_capacity: 16,
            max_send_wr: 16,
            max_recv_wr: 16,
            max_send_sge: 8,
            max_recv_sge: 8,
            disconnect_check_interval: 1024,
            resolve_timeout_ms: 2000,
        }
    }
}

impl TransportConfig {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        let config = toml::from_str(config.unwrap_or(""))?;
        Ok(config)
    }

    /// Rejects values no connection could be provisioned with.
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: &str| Err(crate::Error::Config(msg.to_owned()));
        if self.buffer_size == 0 {
            return invalid("buffer_size must be positive");
        }
        if self.cq_capacity <= 0 {
            return invalid("cq_capacity must be positive");
        }
        if self.max_send_wr == 0 || self.max_recv_wr == 0 {
            return invalid("max_send_wr and max_recv_wr must be positive");
        }
        if self.backlog <= 0 {
            return invalid("backlog must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub item_size_max: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            item_size_max: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub log_file: Option<String>,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: String::from("info"),
            log_file: None,
            transport: TransportConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        match config {
            Some(content) => Ok(toml::from_str(content)?),
            None => Ok(Config::default()),
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_transport_table() {
        let config: Config = toml::from_str(
            r#"
            log_level = "debug"
            [transport]
            port = 5000
            buffer_size = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.transport.port, 5000);
        assert_eq!(config.transport.buffer_size, 4096);
        assert_eq!(config.transport.backlog, 16);
        assert_eq!(config.cache.item_size_max, 1024 * 1024);
    }

    #[test]
    fn zero_sized_buffers_are_invalid() {
        let config = TransportConfig {
            buffer_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert!(TransportConfig::new(Some("bogus = 1")).is_err());
        assert_eq!(TransportConfig::new(None).unwrap().cq_capacity, 16);
    }
}
