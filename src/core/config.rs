/*!
 * Transport Configuration
 * Runtime configuration for SMBs, admission control and transfer backends
 */

use super::errors::{DataplaneError, DataplaneResult};
use super::limits::{
    DEFAULT_MAILBOX_SPIN_LIMIT, DEFAULT_MAX_OUTSTANDING_TRANSFERS, DEFAULT_SMB_SIZE,
    MIN_SMB_SIZE, OFED_MAX_CQ_DEPTH, OFED_MAX_TX_DEPTH, SOCKET_ACCEPT_POLL,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Size of every locally created SMB in bytes
    pub smb_size: u64,
    /// Embed event range ids in flag words
    pub use_events: bool,
    /// In-flight transfer requests per circuit before new sends are queued
    pub max_outstanding_transfers: usize,
    /// Yields spent waiting for a mailbox request to complete
    pub mailbox_spin_limit: u32,
    pub ofed: OfedConfig,
    pub socket: SocketConfig,
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Small SMBs and a shallow transfer window
    pub fn low_latency() -> Self {
        Self {
            smb_size: 1024 * 1024,
            max_outstanding_transfers: 8,
            ..Default::default()
        }
    }

    /// Large SMBs and a deep transfer window
    pub fn high_throughput() -> Self {
        Self {
            smb_size: 64 * 1024 * 1024,
            max_outstanding_transfers: 512,
            ..Default::default()
        }
    }

    pub fn with_smb_size(mut self, smb_size: u64) -> Self {
        self.smb_size = smb_size;
        self
    }

    pub fn with_events(mut self, use_events: bool) -> Self {
        self.use_events = use_events;
        self
    }

    pub fn with_max_outstanding(mut self, max: usize) -> Self {
        self.max_outstanding_transfers = max;
        self
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> DataplaneResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| DataplaneError::Config {
            detail: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `DATAPLANE_*` environment variables
    pub fn from_env() -> DataplaneResult<Self> {
        let mut config = Self::default();

        if let Some(size) = env_parse::<u64>("DATAPLANE_SMB_SIZE")? {
            config.smb_size = size;
        }
        if let Some(events) = env_parse::<bool>("DATAPLANE_USE_EVENTS")? {
            config.use_events = events;
        }
        if let Ok(ip) = std::env::var("DATAPLANE_TRANSFER_IP_ADDRESS") {
            config.socket.ip_address = ip;
        }
        if let Some(port) = env_parse::<u16>("DATAPLANE_TRANSFER_PORT")? {
            config.socket.port = port;
        }
        if let Ok(device) = std::env::var("DATAPLANE_OFED_DEVICE") {
            config.ofed.device = Some(device);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DataplaneResult<()> {
        if self.smb_size < MIN_SMB_SIZE {
            return Err(DataplaneError::Config {
                detail: format!("smb_size {} is below minimum {}", self.smb_size, MIN_SMB_SIZE),
            });
        }
        if self.max_outstanding_transfers == 0 {
            return Err(DataplaneError::Config {
                detail: "max_outstanding_transfers must be at least 1".to_string(),
            });
        }
        self.ofed.validate()
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            smb_size: DEFAULT_SMB_SIZE,
            use_events: false,
            max_outstanding_transfers: DEFAULT_MAX_OUTSTANDING_TRANSFERS,
            mailbox_spin_limit: DEFAULT_MAILBOX_SPIN_LIMIT,
            ofed: OfedConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> DataplaneResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| DataplaneError::Config {
            detail: format!("{} has invalid value '{}'", name, raw),
        }),
        Err(_) => Ok(None),
    }
}

/// Reliable-connection parameters for the OFED backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfedConfig {
    /// Device to open; the first listed device when unset
    pub device: Option<String>,
    pub port: u8,
    pub gid_index: u8,
    pub hop_limit: u8,
    pub qp_timeout: u8,
    pub retry_count: u8,
    pub rnr_retry: u8,
    pub rnr_timer: u8,
    pub max_tx_depth: u32,
    pub max_cq_depth: u32,
}

impl OfedConfig {
    fn validate(&self) -> DataplaneResult<()> {
        if self.port == 0 {
            return Err(DataplaneError::Config {
                detail: "ofed.port numbering starts at 1".to_string(),
            });
        }
        if self.max_tx_depth == 0 || self.max_cq_depth == 0 {
            return Err(DataplaneError::Config {
                detail: "ofed queue depths must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for OfedConfig {
    fn default() -> Self {
        Self {
            device: None,
            port: 1,
            gid_index: 0,
            hop_limit: 3,
            qp_timeout: 14,
            retry_count: 12,
            rnr_retry: 1,
            rnr_timer: 14,
            max_tx_depth: OFED_MAX_TX_DEPTH,
            max_cq_depth: OFED_MAX_CQ_DEPTH,
        }
    }
}

/// Listener parameters for the socket backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Address advertised in locally allocated endpoints
    pub ip_address: String,
    /// Listen port; 0 picks an ephemeral port per SMB
    pub port: u16,
    /// Accept poll interval of the listener thread
    #[serde(with = "duration_millis")]
    pub accept_poll: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            ip_address: "127.0.0.1".to_string(),
            port: 0,
            accept_poll: SOCKET_ACCEPT_POLL,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
