//! In-process software port
//!
//! Behaves like a NIC with a cable plugged into itself (reflecting mode) or
//! into a capture sink (capture mode). Frames can be injected as if they
//! arrived from the wire, and the transmit side can be throttled to
//! reproduce partial or stalled hardware transmission.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};

use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, Sender};
use crossbeam_queue::ArrayQueue;
use tracing::debug;

use super::{HardwareError, LinkStatus, NicPort, PortConfig};
use crate::pool::{BufferPool, PacketBuffer};

/// Default depth of the simulated receive descriptor ring
pub const DEFAULT_WIRE_CAPACITY: usize = 1024;

pub struct LoopbackPort {
    name: String,
    /// Transmitted frames come back on the receive side
    reflect: bool,
    pool: ArcSwapOption<BufferPool>,
    /// Frames waiting to be picked up by rx_burst
    wire: ArrayQueue<PacketBuffer>,
    captured_tx: Sender<Vec<u8>>,
    captured_rx: Receiver<Vec<u8>>,
    port_id: AtomicU16,
    started: AtomicBool,
    /// Cable state. The link is up while started and plugged.
    plugged: AtomicBool,
    tx_budget: AtomicUsize,
    fail_configure: AtomicBool,
    fail_start: AtomicBool,
    starts: AtomicU64,
    wire_drops: AtomicU64,
}

impl LoopbackPort {
    /// Port whose transmitted frames are captured for inspection
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), false, DEFAULT_WIRE_CAPACITY)
    }

    /// Port whose transmitted frames are received back
    pub fn reflecting(name: impl Into<String>) -> Self {
        Self::build(name.into(), true, DEFAULT_WIRE_CAPACITY)
    }

    /// Change the receive-side depth. Frames beyond it are lost on the wire.
    pub fn with_wire_capacity(self, capacity: usize) -> Self {
        Self::build(self.name, self.reflect, capacity.max(1))
    }

    fn build(name: String, reflect: bool, capacity: usize) -> Self {
        let (captured_tx, captured_rx) = crossbeam_channel::unbounded();
        Self {
            name,
            reflect,
            pool: ArcSwapOption::empty(),
            wire: ArrayQueue::new(capacity),
            captured_tx,
            captured_rx,
            port_id: AtomicU16::new(0),
            started: AtomicBool::new(false),
            plugged: AtomicBool::new(true),
            tx_budget: AtomicUsize::new(usize::MAX),
            fail_configure: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            starts: AtomicU64::new(0),
            wire_drops: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Simulate a frame arriving from the wire.
    ///
    /// Returns false if the port is not configured, the pool is exhausted,
    /// the frame does not fit a buffer, or the receive side is full.
    pub fn inject(&self, frame: &[u8]) -> bool {
        let guard = self.pool.load();
        let Some(pool) = guard.as_ref() else {
            return false;
        };
        let Some(mut buf) = pool.alloc() else {
            return false;
        };
        if !buf.copy_from(frame) {
            return false;
        }
        self.wire.push(buf).is_ok()
    }

    /// Frames accepted by `tx_burst` in capture mode, in transmit order
    pub fn transmitted(&self) -> &Receiver<Vec<u8>> {
        &self.captured_rx
    }

    /// Maximum number of frames accepted per `tx_burst` call.
    /// Zero stalls the transmit side entirely.
    pub fn set_tx_budget(&self, budget: usize) {
        self.tx_budget.store(budget, Ordering::Relaxed);
    }

    /// Plug or unplug the simulated cable.
    pub fn set_link(&self, status: LinkStatus) {
        self.plugged.store(status.is_up(), Ordering::Release);
    }

    pub fn fail_configure(&self, fail: bool) {
        self.fail_configure.store(fail, Ordering::Relaxed);
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Relaxed);
    }

    /// Number of successful `start` calls
    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Frames waiting on the receive side
    pub fn pending_rx(&self) -> usize {
        self.wire.len()
    }

    /// Reflected frames lost because the receive side was full
    pub fn wire_drops(&self) -> u64 {
        self.wire_drops.load(Ordering::Relaxed)
    }

    fn port_id(&self) -> u16 {
        self.port_id.load(Ordering::Relaxed)
    }
}

impl NicPort for LoopbackPort {
    fn configure(&self, config: &PortConfig, pool: &Arc<BufferPool>) -> Result<(), HardwareError> {
        self.port_id.store(config.port_id, Ordering::Relaxed);
        if self.fail_configure.load(Ordering::Relaxed) {
            return Err(HardwareError::Configure {
                port_id: config.port_id,
                reason: "injected configure failure".to_string(),
            });
        }
        config.check_single_queue()?;
        self.pool.store(Some(Arc::clone(pool)));
        debug!(name = %self.name, port_id = config.port_id, "Loopback port configured");
        Ok(())
    }

    fn start(&self) -> Result<(), HardwareError> {
        let port_id = self.port_id();
        if self.pool.load().is_none() {
            return Err(HardwareError::Start {
                port_id,
                reason: "port not configured".to_string(),
            });
        }
        if self.fail_start.load(Ordering::Relaxed) {
            return Err(HardwareError::Start {
                port_id,
                reason: "injected start failure".to_string(),
            });
        }
        self.started.store(true, Ordering::Release);
        self.starts.fetch_add(1, Ordering::Relaxed);
        debug!(name = %self.name, port_id, "Loopback port started");
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::Release);
        while self.wire.pop().is_some() {}
        self.pool.store(None);
        debug!(name = %self.name, "Loopback port stopped");
    }

    fn link_status(&self) -> LinkStatus {
        if self.is_started() && self.plugged.load(Ordering::Acquire) {
            LinkStatus::Up
        } else {
            LinkStatus::Down
        }
    }

    fn rx_burst(&self, _queue_id: u16, out: &mut Vec<PacketBuffer>, max: usize) -> usize {
        if !self.is_started() {
            return 0;
        }
        let mut count = 0;
        while count < max {
            match self.wire.pop() {
                Some(buf) => {
                    out.push(buf);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    fn tx_burst(&self, _queue_id: u16, pkts: &mut Vec<PacketBuffer>) -> usize {
        if !self.is_started() {
            return 0;
        }
        let accepted = pkts.len().min(self.tx_budget.load(Ordering::Relaxed));
        for buf in pkts.drain(..accepted) {
            if self.reflect {
                if self.wire.push(buf).is_err() {
                    self.wire_drops.fetch_add(1, Ordering::Relaxed);
                }
            } else {
                // The receiver lives in self, so the channel never disconnects
                let _ = self.captured_tx.send(buf.data().to_vec());
            }
        }
        accepted
    }
}
