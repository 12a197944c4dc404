use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default size of the tx and rx exchange rings.
pub const DEFAULT_RING_SIZE: usize = 256;

/// Maximum number of packets moved per hardware burst.
pub const DEFAULT_BURST: usize = 32;

/// Interval between I/O loop iterations. Close to the interrupt
/// coalescing period of a real NIC.
pub const DEFAULT_POLL_INTERVAL_US: u64 = 20;

/// Number of packet buffers in the pool.
pub const DEFAULT_POOL_SIZE: usize = 8192;

/// Data room of a single packet buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Default number of hardware rx/tx descriptors.
pub const DEFAULT_DESCRIPTORS: u16 = 1024;

/// 14 bytes Ethernet header plus up to 8 bytes LLC/SNAP.
pub const FRAME_OVERHEAD: usize = 22;

/// Largest accepted MTU (IPv4 total length limit).
pub const MAX_MTU: usize = 65535;

/// Largest accepted exchange ring capacity.
pub const MAX_RING_SIZE: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables of a bridged device. All of them are consumed by `Device::start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name of the port, e.g. the TAP interface to open
    pub device_name: String,
    pub port_id: u16,
    /// Slots per exchange ring
    pub ring_size: usize,
    pub tx_burst: usize,
    pub rx_burst: usize,
    pub poll_interval_us: u64,
    pub mtu: usize,
    /// Number of packet buffers
    pub pool_size: usize,
    /// Bytes per packet buffer
    pub buffer_size: usize,
    pub rx_descriptors: u16,
    pub tx_descriptors: u16,
    pub link_check_interval_ms: u64,
    pub link_check_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_name: "nicbr0".to_string(),
            port_id: 0,
            ring_size: DEFAULT_RING_SIZE,
            tx_burst: DEFAULT_BURST,
            rx_burst: DEFAULT_BURST,
            poll_interval_us: DEFAULT_POLL_INTERVAL_US,
            mtu: 1500,
            pool_size: DEFAULT_POOL_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            rx_descriptors: DEFAULT_DESCRIPTORS,
            tx_descriptors: DEFAULT_DESCRIPTORS,
            link_check_interval_ms: 100,
            link_check_attempts: 90,
        }
    }
}

impl BridgeConfig {
    /// Load a configuration from a JSON file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: BridgeConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn with_port_id(mut self, port_id: u16) -> Self {
        self.port_id = port_id;
        self
    }

    pub fn with_ring_size(mut self, ring_size: usize) -> Self {
        self.ring_size = ring_size;
        self
    }

    pub fn with_bursts(mut self, tx_burst: usize, rx_burst: usize) -> Self {
        self.tx_burst = tx_burst;
        self.rx_burst = rx_burst;
        self
    }

    pub fn with_pool(mut self, pool_size: usize, buffer_size: usize) -> Self {
        self.pool_size = pool_size;
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_us = interval.as_micros() as u64;
        self
    }

    pub fn with_link_check(mut self, interval_ms: u64, attempts: u32) -> Self {
        self.link_check_interval_ms = interval_ms;
        self.link_check_attempts = attempts;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_size == 0 || self.ring_size > MAX_RING_SIZE {
            return Err(ConfigError::Invalid(format!(
                "ring_size must be 1..={MAX_RING_SIZE}, got {}",
                self.ring_size
            )));
        }
        if self.mtu > MAX_MTU {
            return Err(ConfigError::Invalid(format!(
                "mtu {} exceeds {MAX_MTU}",
                self.mtu
            )));
        }
        if self.tx_burst == 0 || self.rx_burst == 0 {
            return Err(ConfigError::Invalid("burst sizes must be non-zero".into()));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be non-zero".into()));
        }
        if self.pool_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "pool_size {} exceeds {}",
                self.pool_size,
                u32::MAX
            )));
        }
        if self.buffer_size < self.mtu_frame_size() {
            return Err(ConfigError::Invalid(format!(
                "buffer_size {} cannot hold an MTU {} frame ({} bytes)",
                self.buffer_size,
                self.mtu,
                self.mtu_frame_size()
            )));
        }
        if self.poll_interval_us == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_us must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Largest frame for the configured MTU, headers included.
    pub fn mtu_frame_size(&self) -> usize {
        self.mtu.saturating_add(FRAME_OVERHEAD)
    }

    /// Size of the copy-out buffer used by the reader task.
    ///
    /// Matches the packet buffer size, the largest frame any stage can
    /// hold, so delivered frames are never cut short.
    pub fn reader_buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn link_check_interval(&self) -> Duration {
        Duration::from_millis(self.link_check_interval_ms)
    }
}
