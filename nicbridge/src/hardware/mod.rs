//! NIC capability boundary
//!
//! The bridge never talks to a driver directly. It consumes a port through
//! the `NicPort` trait, which mirrors what a poll-mode driver offers:
//! configure, start, link status, and rx/tx bursts on a single queue pair.

pub mod loopback;
pub mod tap;

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::pool::{BufferPool, PacketBuffer};

pub use loopback::LoopbackPort;
pub use tap::TapPort;

/// The queue used for both directions. Only one queue pair is supported.
pub const QUEUE_ID: u16 = 0;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("Cannot open port {name}: {source}")]
    Open { name: String, source: io::Error },

    #[error("Cannot configure port {port_id}: {reason}")]
    Configure { port_id: u16, reason: String },

    #[error("Queue setup failed on port {port_id}: {reason}")]
    QueueSetup { port_id: u16, reason: String },

    #[error("Cannot start port {port_id}: {reason}")]
    Start { port_id: u16, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Link state as reported by the port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
}

impl LinkStatus {
    pub fn is_up(self) -> bool {
        self == LinkStatus::Up
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Up => write!(f, "up"),
            LinkStatus::Down => write!(f, "down"),
        }
    }
}

/// Port-level configuration handed to `NicPort::configure`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub port_id: u16,
    pub rx_queues: u16,
    pub tx_queues: u16,
    pub rx_descriptors: u16,
    pub tx_descriptors: u16,
}

impl PortConfig {
    /// Single rx/tx queue pair with the given descriptor counts
    pub fn single_queue(port_id: u16, rx_descriptors: u16, tx_descriptors: u16) -> Self {
        Self {
            port_id,
            rx_queues: 1,
            tx_queues: 1,
            rx_descriptors,
            tx_descriptors,
        }
    }

    /// Reject anything other than one queue pair with non-empty descriptor rings.
    pub fn check_single_queue(&self) -> Result<(), HardwareError> {
        if self.rx_queues != 1 || self.tx_queues != 1 {
            return Err(HardwareError::Configure {
                port_id: self.port_id,
                reason: format!(
                    "{} rx / {} tx queues requested, only 1/1 is supported",
                    self.rx_queues, self.tx_queues
                ),
            });
        }
        if self.rx_descriptors == 0 || self.tx_descriptors == 0 {
            return Err(HardwareError::QueueSetup {
                port_id: self.port_id,
                reason: "descriptor count must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// A network port driven by polling
///
/// All methods take `&self`: the I/O loop owns the hot path (`rx_burst`,
/// `tx_burst`) while the facade may query `link_status` concurrently.
pub trait NicPort: Send + Sync + 'static {
    /// Set up the port and its queues. Receive buffers are taken from `pool`.
    fn configure(&self, config: &PortConfig, pool: &Arc<BufferPool>) -> Result<(), HardwareError>;

    /// Start the port after a successful `configure`.
    fn start(&self) -> Result<(), HardwareError>;

    /// Stop the port and drop every buffer and pool reference it holds.
    fn stop(&self);

    /// Current link state, queried live.
    fn link_status(&self) -> LinkStatus;

    /// Poll for up to `max` received frames, appended to `out`.
    /// Returns the number appended.
    fn rx_burst(&self, queue_id: u16, out: &mut Vec<PacketBuffer>, max: usize) -> usize;

    /// Submit frames for transmission.
    ///
    /// The port takes the accepted frames from the front of `pkts` and
    /// returns how many it took; the rest stay in `pkts` in order.
    fn tx_burst(&self, queue_id: u16, pkts: &mut Vec<PacketBuffer>) -> usize;
}
