//! Test harness for device integration tests
//!
//! Builds devices on top of the loopback port and collects frames
//! delivered to the receive callback.

#![allow(dead_code)]

pub mod packets;

use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use nicbridge::{BridgeConfig, Device, LoopbackPort};

/// How long a test waits for a frame before giving up
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Small configuration with fast link checks
pub fn test_config(ring_size: usize, pool_size: usize) -> BridgeConfig {
    BridgeConfig::default()
        .with_device_name("nictest0")
        .with_ring_size(ring_size)
        .with_pool(pool_size, 2048)
        .with_link_check(1, 10)
}

/// Device whose transmitted frames are captured
pub fn capture_device(ring_size: usize, pool_size: usize) -> Device<LoopbackPort> {
    Device::new(test_config(ring_size, pool_size), LoopbackPort::new("lo-capture"))
}

/// Device that receives everything it transmits
pub fn reflecting_device(ring_size: usize, pool_size: usize) -> Device<LoopbackPort> {
    Device::new(test_config(ring_size, pool_size), LoopbackPort::reflecting("lo-reflect"))
}

/// Register a callback that forwards every delivered frame to the returned receiver.
pub fn collect_frames(device: &mut Device<LoopbackPort>) -> Receiver<Vec<u8>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    device
        .set_receive_callback(move |frame: &[u8]| {
            let _ = tx.send(frame.to_vec());
        })
        .expect("Failed to register callback");
    rx
}

/// Receive exactly `count` frames or panic
pub fn recv_frames(rx: &Receiver<Vec<u8>>, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            rx.recv_timeout(RECV_TIMEOUT)
                .unwrap_or_else(|_| panic!("timed out waiting for frame {i} of {count}"))
        })
        .collect()
}

/// Poll `cond` until it holds or the timeout expires
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + RECV_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
