//! Hardware I/O loop
//!
//! Runs on its own thread and shuttles bursts between the port and the two
//! exchange rings. It never waits on the simulation side: a full inbound
//! ring costs a dropped frame, not a stall.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_BURST, DEFAULT_POLL_INTERVAL_US};
use crate::hardware::{NicPort, QUEUE_ID};
use crate::pool::PacketBuffer;
use crate::ring::{RingConsumer, RingProducer};

/// Lifecycle of the I/O loop thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    NotStarted = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            3 => LoopState::Stopped,
            _ => LoopState::NotStarted,
        }
    }
}

/// Counters maintained by the I/O loop
#[derive(Debug, Default)]
pub struct PortStats {
    /// Frames accepted by the hardware
    pub tx_packets: AtomicU64,
    /// Transmit submissions that left frames unaccepted
    pub tx_retries: AtomicU64,
    /// Frames freed unsent at shutdown, whether mid-retry or still queued
    pub tx_dropped: AtomicU64,
    /// Received frames handed to the inbound ring
    pub rx_packets: AtomicU64,
    /// Received frames dropped on a full inbound ring
    pub rx_dropped: AtomicU64,
}

impl PortStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_retries: self.tx_retries.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn add(counter: &AtomicU64, n: usize) {
        if n > 0 {
            counter.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of `PortStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub tx_packets: u64,
    pub tx_retries: u64,
    pub tx_dropped: u64,
    pub rx_packets: u64,
    pub rx_dropped: u64,
}

pub struct IoLoop<P: NicPort> {
    port: Arc<P>,
    /// Outbound ring, filled by the device facade
    tx_ring: RingConsumer,
    /// Inbound ring, drained by the device facade
    rx_ring: RingProducer,
    shutdown: Arc<AtomicBool>,
    stats: Arc<PortStats>,
    state: Arc<AtomicU8>,
    tx_burst: usize,
    rx_burst: usize,
    poll_interval: Duration,
    /// Dequeued frames the hardware has not accepted yet
    tx_pending: Vec<PacketBuffer>,
    rx_scratch: Vec<PacketBuffer>,
}

impl<P: NicPort> IoLoop<P> {
    pub fn new(
        port: Arc<P>,
        tx_ring: RingConsumer,
        rx_ring: RingProducer,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            port,
            tx_ring,
            rx_ring,
            shutdown,
            stats: Arc::new(PortStats::default()),
            state: Arc::new(AtomicU8::new(LoopState::NotStarted as u8)),
            tx_burst: DEFAULT_BURST,
            rx_burst: DEFAULT_BURST,
            poll_interval: Duration::from_micros(DEFAULT_POLL_INTERVAL_US),
            tx_pending: Vec::with_capacity(DEFAULT_BURST),
            rx_scratch: Vec::with_capacity(DEFAULT_BURST),
        }
    }

    pub fn with_bursts(mut self, tx_burst: usize, rx_burst: usize) -> Self {
        self.tx_burst = tx_burst.max(1);
        self.rx_burst = rx_burst.max(1);
        self.tx_pending = Vec::with_capacity(self.tx_burst);
        self.rx_scratch = Vec::with_capacity(self.rx_burst);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Counters shared with the caller
    pub fn stats(&self) -> Arc<PortStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self, name: impl Into<String>) -> std::io::Result<IoLoopHandle> {
        let state = Arc::clone(&self.state);
        let thread = thread::Builder::new()
            .name(name.into())
            .spawn(move || self.run())?;
        Ok(IoLoopHandle { thread, state })
    }

    /// Poll until the shutdown flag is observed.
    pub fn run(mut self) {
        self.set_state(LoopState::Running);
        info!(
            tx_burst = self.tx_burst,
            rx_burst = self.rx_burst,
            poll_interval_us = self.poll_interval.as_micros() as u64,
            "I/O loop started"
        );

        while !self.shutdown.load(Ordering::Acquire) {
            self.poll_once();
            thread::sleep(self.poll_interval);
        }

        self.set_state(LoopState::Stopping);
        let mut unsent = self.tx_pending.len();
        self.tx_pending.clear();
        while self.tx_ring.try_dequeue().is_some() {
            unsent += 1;
        }
        if unsent > 0 {
            PortStats::add(&self.stats.tx_dropped, unsent);
            warn!(unsent, "Outbound frames discarded at shutdown");
        }
        self.rx_scratch.clear();

        let stats = self.stats.snapshot();
        info!(
            tx_packets = stats.tx_packets,
            tx_dropped = stats.tx_dropped,
            rx_packets = stats.rx_packets,
            rx_dropped = stats.rx_dropped,
            "I/O loop stopped"
        );
        self.set_state(LoopState::Stopped);
    }

    /// One transmit phase followed by one receive phase.
    pub fn poll_once(&mut self) {
        self.handle_tx();
        self.handle_rx();
    }

    fn handle_tx(&mut self) {
        if self.tx_ring.try_dequeue_burst(self.tx_burst, &mut self.tx_pending) == 0 {
            return;
        }

        loop {
            let sent = self.port.tx_burst(QUEUE_ID, &mut self.tx_pending);
            PortStats::add(&self.stats.tx_packets, sent);
            if self.tx_pending.is_empty() {
                return;
            }

            self.stats.tx_retries.fetch_add(1, Ordering::Relaxed);
            if self.shutdown.load(Ordering::Acquire) {
                let dropped = self.tx_pending.len();
                self.tx_pending.clear();
                PortStats::add(&self.stats.tx_dropped, dropped);
                warn!(dropped, "Shutdown during transmit, unsent frames freed");
                return;
            }
            std::hint::spin_loop();
        }
    }

    fn handle_rx(&mut self) {
        let received = self.port.rx_burst(QUEUE_ID, &mut self.rx_scratch, self.rx_burst);
        if received == 0 {
            return;
        }

        let mut dropped = 0;
        for buf in self.rx_scratch.drain(..) {
            if let Err(buf) = self.rx_ring.try_enqueue(buf) {
                drop(buf);
                dropped += 1;
            }
        }

        PortStats::add(&self.stats.rx_packets, received - dropped);
        if dropped > 0 {
            PortStats::add(&self.stats.rx_dropped, dropped);
            debug!(received, dropped, "Inbound ring full, frames dropped");
        }
    }

    fn set_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Handle to a spawned I/O loop
pub struct IoLoopHandle {
    thread: JoinHandle<()>,
    state: Arc<AtomicU8>,
}

impl IoLoopHandle {
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the loop to exit. The shutdown flag must already be set.
    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}
