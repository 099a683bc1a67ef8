//! Runtime configuration: client, server, and producer tuning sections,
//! loadable from a TOML file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::SendOptions;
use crate::wire::ProtocolVersion;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub producer: ProducerConfig,
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

/// Wire protocol revision selection for the client signal path.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolRevision {
    V1,
    V2,
}

impl From<ProtocolRevision> for ProtocolVersion {
    fn from(value: ProtocolRevision) -> Self {
        match value {
            ProtocolRevision::V1 => ProtocolVersion::V1,
            ProtocolRevision::V2 => ProtocolVersion::V2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub destination_name: String,
    pub protocol: ProtocolRevision,
    /// Payloads above this size use the channel-upload path (V2 only).
    pub max_message_size: usize,
    pub reaper_interval_millis: u64,
    pub failback_interval_millis: u64,
    pub max_reconnect_millis: u64,
    pub transacted: bool,
    pub send_options: SendOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            destination_name: String::new(),
            protocol: ProtocolRevision::V2,
            max_message_size: 65_536,
            reaper_interval_millis: 1_000,
            failback_interval_millis: 0,
            max_reconnect_millis: 30_000,
            transacted: false,
            send_options: SendOptions::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub destination_name: String,
    pub worker_threads: usize,
    /// Watchdog cadence for extend-wait emission while a sink runs.
    pub keep_alive_interval_millis: u64,
    /// Partial channel uploads are discarded after this long without traffic.
    pub channel_inactivity_timeout_millis: u64,
    pub max_message_size: usize,
    pub failback_interval_millis: u64,
    pub max_reconnect_millis: u64,
    pub transacted: bool,
    pub send_options: SendOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            destination_name: String::new(),
            worker_threads: 4,
            keep_alive_interval_millis: 10_000,
            channel_inactivity_timeout_millis: 30_000,
            max_message_size: 65_536,
            failback_interval_millis: 0,
            max_reconnect_millis: 30_000,
            transacted: false,
            send_options: SendOptions::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Acknowledgement {
    None,
    Leader,
    All,
}

impl Acknowledgement {
    /// Value expected by log-based broker producer properties.
    pub fn as_str(self) -> &'static str {
        match self {
            Acknowledgement::None => "0",
            Acknowledgement::Leader => "1",
            Acknowledgement::All => "all",
        }
    }
}

/// Tuning handed to a concrete log-based broker producer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub hosts: String,
    pub port: u16,
    pub retries: u32,
    pub batch_size: u32,
    pub linger_millis: u32,
    pub max_request_size: u32,
    pub request_timeout_millis: u32,
    pub max_block_millis: u32,
    pub send_buffer: u32,
    pub compression: Compression,
    pub acknowledgements: Acknowledgement,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            hosts: String::new(),
            port: 0,
            retries: 5,
            batch_size: 2_000,
            linger_millis: 1_000,
            max_request_size: 1_048_576,
            request_timeout_millis: 30_000,
            max_block_millis: 10_000,
            send_buffer: 131_072,
            compression: Compression::None,
            acknowledgements: Acknowledgement::Leader,
        }
    }
}

impl ProducerConfig {
    /// Broker endpoints as host:port pairs.
    pub fn bootstrap_servers(&self) -> Vec<String> {
        self.hosts
            .split(',')
            .filter(|h| !h.is_empty())
            .map(|h| format!("{h}:{port}", port = self.port))
            .collect()
    }
}
