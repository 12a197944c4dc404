//! Device facade
//!
//! The object the simulation attaches to. It owns the buffer pool, both
//! exchange rings, the I/O loop and the reader task, and brings them up
//! and down in a fixed order.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, ConfigError};
use crate::hardware::{HardwareError, LinkStatus, NicPort, PortConfig};
use crate::io_loop::{IoLoop, IoLoopHandle, PortStats, StatsSnapshot};
use crate::pool::BufferPool;
use crate::reader::{DeliveryCallback, FrameSource, Reader, RecvResult};
use crate::ring::{RingConsumer, RingProducer, exchange_ring};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to create buffer pool: {0}")]
    PoolInit(#[source] io::Error),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("Device is already running")]
    AlreadyRunning,

    #[error("Failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),

    #[error("Start interrupted by shutdown request")]
    Interrupted,
}

/// Why a frame could not be queued for transmission
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("Device is not running")]
    NotRunning,

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame of {len} bytes exceeds buffer capacity {capacity}")]
    TooLarge { len: usize, capacity: usize },

    #[error("Buffer pool exhausted")]
    PoolExhausted,

    #[error("Outbound ring full")]
    RingFull,
}

impl WriteError {
    /// Transient shortage; the caller may retry later.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, WriteError::PoolExhausted | WriteError::RingFull)
    }
}

/// State shared between the facade and the reader thread while running
struct DeviceCore {
    pool: Arc<BufferPool>,
    tx_ring: RingProducer,
    rx_ring: RingConsumer,
    shutdown: Arc<AtomicBool>,
}

impl DeviceCore {
    fn write(&self, frame: &[u8]) -> Result<usize, WriteError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(WriteError::NotRunning);
        }
        if frame.is_empty() {
            return Err(WriteError::EmptyFrame);
        }
        let capacity = self.pool.buffer_size();
        if frame.len() > capacity {
            return Err(WriteError::TooLarge {
                len: frame.len(),
                capacity,
            });
        }

        let mut buf = self.pool.alloc().ok_or(WriteError::PoolExhausted)?;
        buf.copy_from(frame);
        // A rejected buffer goes straight back to the pool
        self.tx_ring
            .try_enqueue(buf)
            .map_err(|_| WriteError::RingFull)?;
        Ok(frame.len())
    }
}

impl FrameSource for DeviceCore {
    fn read(&self, dst: &mut [u8]) -> RecvResult {
        match self.rx_ring.try_dequeue() {
            Some(buf) => {
                let len = buf.len().min(dst.len());
                dst[..len].copy_from_slice(&buf.data()[..len]);
                RecvResult::Packet(len)
            }
            None if self.shutdown.load(Ordering::Acquire) => RecvResult::Done,
            None => RecvResult::WouldBlock,
        }
    }
}

/// A simulated network device backed by a polled NIC port
pub struct Device<P: NicPort> {
    config: BridgeConfig,
    port: Arc<P>,
    callback: Option<DeliveryCallback>,
    /// Force-quit flag observed by the I/O loop and link wait
    shutdown: Arc<AtomicBool>,
    core: Option<Arc<DeviceCore>>,
    io_loop: Option<IoLoopHandle>,
    reader: Reader,
    /// Counters of the current or most recent run
    stats: Option<Arc<PortStats>>,
}

impl<P: NicPort> Device<P> {
    pub fn new(config: BridgeConfig, port: P) -> Self {
        let reader = Reader::new(config.reader_buffer_size());
        Self {
            config,
            port: Arc::new(port),
            callback: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            core: None,
            io_loop: None,
            reader,
            stats: None,
        }
    }

    /// Capacity of both exchange rings, applied on the next `start`
    pub fn set_ring_size(&mut self, ring_size: usize) {
        self.config.ring_size = ring_size;
    }

    pub fn set_device_name(&mut self, name: impl Into<String>) {
        self.config.device_name = name.into();
    }

    /// Register the function that receives inbound frames.
    ///
    /// On a running device the reader task is restarted with the new
    /// callback.
    pub fn set_receive_callback<F>(&mut self, callback: F) -> Result<(), DeviceError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let callback: DeliveryCallback = Arc::new(callback);
        self.callback = Some(Arc::clone(&callback));
        if let Some(core) = &self.core {
            self.reader
                .start(Arc::clone(core), callback)
                .map_err(DeviceError::Spawn)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn port(&self) -> &Arc<P> {
        &self.port
    }

    /// Pool of the running device
    pub fn pool(&self) -> Option<&Arc<BufferPool>> {
        self.core.as_ref().map(|core| &core.pool)
    }

    pub fn is_running(&self) -> bool {
        self.core.is_some()
    }

    /// Current link state as reported by the port
    pub fn is_link_up(&self) -> bool {
        self.port.link_status().is_up()
    }

    /// Force-quit flag. Setting it aborts a `start` blocked waiting for
    /// link, or makes a running device's I/O loop wind down.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats
            .as_ref()
            .map(|stats| stats.snapshot())
            .unwrap_or_default()
    }

    /// Bring the device up.
    ///
    /// On failure everything created so far is torn down again and the
    /// device stays stopped.
    pub fn start(&mut self) -> Result<(), DeviceError> {
        if self.is_running() {
            return Err(DeviceError::AlreadyRunning);
        }
        if self.shutdown.swap(false, Ordering::AcqRel) {
            return Err(DeviceError::Interrupted);
        }
        self.config.validate()?;

        let config = &self.config;
        let pool = Arc::new(
            BufferPool::new(config.pool_size, config.buffer_size).map_err(DeviceError::PoolInit)?,
        );
        if pool.capacity() < config.ring_size.saturating_mul(2) {
            warn!(
                pool_size = pool.capacity(),
                ring_size = config.ring_size,
                "Buffer pool smaller than both rings, writes may see PoolExhausted"
            );
        }

        let port_config =
            PortConfig::single_queue(config.port_id, config.rx_descriptors, config.tx_descriptors);
        if let Err(e) = self
            .port
            .configure(&port_config, &pool)
            .and_then(|()| self.port.start())
        {
            self.port.stop();
            return Err(e.into());
        }

        self.wait_for_link();
        if self.shutdown.swap(false, Ordering::AcqRel) {
            self.port.stop();
            info!(device = %self.config.device_name, "Device start interrupted");
            return Err(DeviceError::Interrupted);
        }

        let (tx_producer, tx_consumer) = exchange_ring(self.config.ring_size);
        let (rx_producer, rx_consumer) = exchange_ring(self.config.ring_size);

        let io_loop = IoLoop::new(
            Arc::clone(&self.port),
            tx_consumer,
            rx_producer,
            Arc::clone(&self.shutdown),
        )
        .with_bursts(self.config.tx_burst, self.config.rx_burst)
        .with_poll_interval(self.config.poll_interval());
        let stats = io_loop.stats();

        let handle = match io_loop.spawn(io_thread_name(&self.config.device_name)) {
            Ok(handle) => handle,
            Err(e) => {
                self.port.stop();
                return Err(DeviceError::Spawn(e));
            }
        };

        let core = Arc::new(DeviceCore {
            pool,
            tx_ring: tx_producer,
            rx_ring: rx_consumer,
            shutdown: Arc::clone(&self.shutdown),
        });
        self.core = Some(Arc::clone(&core));
        self.io_loop = Some(handle);
        self.stats = Some(stats);

        if let Some(callback) = self.callback.clone() {
            self.reader.set_buffer_size(self.config.reader_buffer_size());
            if let Err(e) = self.reader.start(core, callback) {
                let _ = self.stop();
                return Err(DeviceError::Spawn(e));
            }
        }

        info!(
            device = %self.config.device_name,
            port_id = self.config.port_id,
            ring_size = self.config.ring_size,
            link = %self.port.link_status(),
            "Device started"
        );
        Ok(())
    }

    fn wait_for_link(&self) -> LinkStatus {
        let attempts = self.config.link_check_attempts;
        for attempt in 0..attempts {
            if self.shutdown.load(Ordering::Acquire) {
                debug!("Link wait abandoned on shutdown");
                break;
            }
            if self.port.link_status().is_up() {
                debug!(attempt, "Link up");
                return LinkStatus::Up;
            }
            thread::sleep(self.config.link_check_interval());
        }

        let status = self.port.link_status();
        if !status.is_up() {
            warn!(port_id = self.config.port_id, attempts, "Link still down after wait");
        }
        status
    }

    /// Queue a frame for transmission. Returns the number of bytes accepted.
    pub fn write(&self, frame: &[u8]) -> Result<usize, WriteError> {
        self.core
            .as_ref()
            .ok_or(WriteError::NotRunning)?
            .write(frame)
    }

    /// Take the oldest inbound frame, truncated to `dst`.
    pub fn read(&self, dst: &mut [u8]) -> RecvResult {
        match &self.core {
            Some(core) => core.read(dst),
            None => RecvResult::Done,
        }
    }

    /// Shut the device down: force-quit, reader, I/O loop, port, rings.
    ///
    /// Every stage is torn down even if a thread panicked; the panic is
    /// reported afterwards. Stopping a stopped device does nothing.
    pub fn stop(&mut self) -> Result<(), DeviceError> {
        if self.core.is_none() && self.io_loop.is_none() {
            return Ok(());
        }

        self.shutdown.store(true, Ordering::Release);
        self.reader.stop();

        let mut result = Ok(());
        if let Some(handle) = self.io_loop.take()
            && handle.join().is_err()
        {
            error!(device = %self.config.device_name, "I/O loop thread panicked");
            result = Err(DeviceError::ThreadPanicked("I/O loop"));
        }

        self.port.stop();
        self.core = None;
        self.shutdown.store(false, Ordering::Release);
        info!(device = %self.config.device_name, "Device stopped");
        result
    }
}

impl<P: NicPort> Drop for Device<P> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Linux truncates thread names to 15 bytes
fn io_thread_name(device_name: &str) -> String {
    let mut name: String = device_name.chars().take(12).collect();
    name.push_str("-io");
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::LoopbackPort;
    use std::time::{Duration, Instant};

    fn config() -> BridgeConfig {
        BridgeConfig::default()
            .with_ring_size(4)
            .with_pool(16, 256)
            .with_mtu(200)
            .with_link_check(1, 3)
    }

    /// Core without a running I/O loop, for deterministic ring checks
    fn idle_core(ring_size: usize, pool_size: usize) -> (DeviceCore, RingConsumer, RingProducer) {
        let pool = Arc::new(BufferPool::new(pool_size, 128).unwrap());
        let (tx_producer, tx_consumer) = exchange_ring(ring_size);
        let (rx_producer, rx_consumer) = exchange_ring(ring_size);
        let core = DeviceCore {
            pool,
            tx_ring: tx_producer,
            rx_ring: rx_consumer,
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        (core, tx_consumer, rx_producer)
    }

    #[test]
    fn test_write_until_ring_full() {
        let (core, tx_consumer, _rx) = idle_core(4, 16);
        for len in [10, 20, 30, 40] {
            assert_eq!(core.write(&vec![0xab; len]), Ok(len));
        }
        let err = core.write(&[0u8; 50]).unwrap_err();
        assert_eq!(err, WriteError::RingFull);
        assert!(err.is_resource_exhausted());
        // The rejected frame did not leak a buffer
        assert_eq!(core.pool.available(), 12);

        let mut drained = Vec::new();
        tx_consumer.try_dequeue_burst(2, &mut drained);
        drop(drained);
        assert_eq!(core.write(&[1u8; 50]), Ok(50));
        assert_eq!(core.write(&[2u8; 60]), Ok(60));
        assert_eq!(core.write(&[3u8; 70]), Err(WriteError::RingFull));
    }

    #[test]
    fn test_write_rejections() {
        let (core, _tx, _rx) = idle_core(4, 1);
        assert_eq!(core.write(&[]), Err(WriteError::EmptyFrame));
        assert_eq!(
            core.write(&[0u8; 129]),
            Err(WriteError::TooLarge {
                len: 129,
                capacity: 128
            })
        );

        assert_eq!(core.write(&[1u8; 8]), Ok(8));
        let err = core.write(&[1u8; 8]).unwrap_err();
        assert_eq!(err, WriteError::PoolExhausted);
        assert!(err.is_resource_exhausted());
        assert!(!WriteError::EmptyFrame.is_resource_exhausted());
    }

    #[test]
    fn test_read_copies_and_truncates() {
        let (core, _tx, rx_producer) = idle_core(4, 4);
        for frame in [&b"abcdef"[..], &b"xyz"[..]] {
            let mut buf = core.pool.alloc().unwrap();
            buf.copy_from(frame);
            rx_producer.try_enqueue(buf).unwrap();
        }

        let mut small = [0u8; 4];
        assert_eq!(core.read(&mut small), RecvResult::Packet(4));
        assert_eq!(&small, b"abcd");

        let mut big = [0u8; 64];
        assert_eq!(core.read(&mut big), RecvResult::Packet(3));
        assert_eq!(&big[..3], b"xyz");

        assert_eq!(core.read(&mut big), RecvResult::WouldBlock);
        assert_eq!(core.pool.available(), 4);

        core.shutdown.store(true, Ordering::Release);
        assert_eq!(core.read(&mut big), RecvResult::Done);
        assert_eq!(core.write(b"late"), Err(WriteError::NotRunning));
    }

    #[test]
    fn test_not_running() {
        let device = Device::new(config(), LoopbackPort::new("lo0"));
        assert!(!device.is_running());
        assert!(!device.is_link_up());
        assert!(!device.shutdown_handle().load(Ordering::Acquire));
        assert!(device.pool().is_none());
        assert_eq!(device.write(b"frame"), Err(WriteError::NotRunning));
        assert_eq!(device.read(&mut [0u8; 16]), RecvResult::Done);
        assert_eq!(device.stats(), StatsSnapshot::default());
    }

    #[test]
    fn test_start_twice() {
        let mut device = Device::new(config(), LoopbackPort::new("lo0"));
        device.start().unwrap();
        assert!(matches!(device.start(), Err(DeviceError::AlreadyRunning)));
        device.stop().unwrap();
        device.stop().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut device = Device::new(config(), LoopbackPort::new("lo0"));
        device.set_ring_size(0);
        assert!(matches!(device.start(), Err(DeviceError::Config(_))));
        assert!(!device.is_running());
        assert!(!device.port().is_started());
    }

    #[test]
    fn test_start_failure_stops_port() {
        let port = LoopbackPort::new("lo0");
        port.fail_start(true);
        let mut device = Device::new(config(), port);

        assert!(matches!(
            device.start(),
            Err(DeviceError::Hardware(HardwareError::Start { .. }))
        ));
        assert!(!device.is_running());
        assert!(!device.port().is_started());
        assert!(!device.port().inject(b"x"));
    }

    #[test]
    fn test_link_down_is_not_fatal() {
        let port = LoopbackPort::new("lo0");
        port.set_link(LinkStatus::Down);
        let mut device = Device::new(config(), port);

        device.start().unwrap();
        assert!(device.is_running());
        assert!(!device.is_link_up());

        device.port().set_link(LinkStatus::Up);
        assert!(device.is_link_up());
    }

    #[test]
    fn test_shutdown_interrupts_link_wait() {
        let port = LoopbackPort::new("lo0");
        port.set_link(LinkStatus::Down);
        let mut device = Device::new(config().with_link_check(10, 1000), port);

        let shutdown = device.shutdown_handle();
        let quitter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            shutdown.store(true, Ordering::Release);
        });

        let begun = Instant::now();
        assert!(matches!(device.start(), Err(DeviceError::Interrupted)));
        assert!(begun.elapsed() < Duration::from_secs(2));
        quitter.join().unwrap();

        assert!(!device.is_running());
        assert!(!device.port().is_started());
        assert!(!device.shutdown_handle().load(Ordering::Acquire));

        device.port().set_link(LinkStatus::Up);
        device.start().unwrap();
        assert!(device.is_link_up());
    }

    #[test]
    fn test_shutdown_requested_before_start() {
        let mut device = Device::new(config(), LoopbackPort::new("lo0"));
        device.shutdown_handle().store(true, Ordering::Release);

        assert!(matches!(device.start(), Err(DeviceError::Interrupted)));
        assert!(!device.port().is_started());
        assert_eq!(device.port().start_count(), 0);

        // The request is consumed
        device.start().unwrap();
        assert!(device.is_running());
    }

    #[test]
    fn test_stop_clears_shutdown_request() {
        let mut device = Device::new(config(), LoopbackPort::new("lo0"));
        device.start().unwrap();
        device.shutdown_handle().store(true, Ordering::Release);
        device.stop().unwrap();
        assert!(!device.shutdown_handle().load(Ordering::Acquire));

        device.start().unwrap();
        assert!(device.is_running());
    }

    #[test]
    fn test_link_state_read_from_port_while_stopped() {
        let device = Device::new(config(), LoopbackPort::new("lo0"));
        // Port brought up behind the facade's back
        let pool = Arc::new(BufferPool::new(4, 256).unwrap());
        let port = device.port();
        port.configure(&PortConfig::single_queue(0, 64, 64), &pool).unwrap();
        port.start().unwrap();

        assert!(!device.is_running());
        assert!(device.is_link_up());

        port.set_link(LinkStatus::Down);
        assert!(!device.is_link_up());
        port.stop();
    }

    #[test]
    fn test_io_thread_name() {
        assert_eq!(io_thread_name("nicbr0"), "nicbr0-io");
        assert_eq!(io_thread_name("a-rather-long-name").len(), 15);
    }
}
