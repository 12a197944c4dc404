//! Reader task
//!
//! Drains the inbound side of a device and hands each frame to the
//! simulation through a registered callback, on a thread of its own.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

/// Outcome of a single non-blocking read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvResult {
    /// A frame of the given length was copied out
    Packet(usize),
    /// Nothing queued right now
    WouldBlock,
    /// The source will not produce any more frames
    Done,
}

/// Something the reader can pull frames from
pub trait FrameSource: Send + Sync + 'static {
    fn read(&self, buf: &mut [u8]) -> RecvResult;
}

/// Receives every delivered frame, in arrival order
pub type DeliveryCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

const SPIN_ROUNDS: u32 = 64;
const YIELD_ROUNDS: u32 = 64;
const MAX_IDLE_SLEEP: Duration = Duration::from_micros(200);

/// Idle strategy: spin, then yield, then sleep with a doubling, capped delay.
struct IdleBackoff {
    idle_rounds: u32,
    sleep: Duration,
}

impl IdleBackoff {
    fn new() -> Self {
        Self {
            idle_rounds: 0,
            sleep: Duration::from_micros(1),
        }
    }

    fn reset(&mut self) {
        self.idle_rounds = 0;
        self.sleep = Duration::from_micros(1);
    }

    fn idle(&mut self) {
        if self.idle_rounds < SPIN_ROUNDS {
            std::hint::spin_loop();
        } else if self.idle_rounds < SPIN_ROUNDS + YIELD_ROUNDS {
            thread::yield_now();
        } else {
            thread::sleep(self.sleep);
            self.sleep = (self.sleep * 2).min(MAX_IDLE_SLEEP);
        }
        self.idle_rounds = self.idle_rounds.saturating_add(1);
    }
}

pub struct Reader {
    buffer_size: usize,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    callback: Option<DeliveryCallback>,
}

impl Reader {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
            callback: None,
        }
    }

    /// Size of the copy-out buffer used by the next `start`
    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        self.buffer_size = buffer_size;
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the reader thread. A running reader is stopped first.
    pub fn start<S: FrameSource>(
        &mut self,
        source: Arc<S>,
        callback: DeliveryCallback,
    ) -> std::io::Result<()> {
        self.stop();

        let stop = Arc::clone(&self.stop);
        let deliver = Arc::clone(&callback);
        let buffer_size = self.buffer_size;

        let thread = thread::Builder::new()
            .name("nic-reader".to_string())
            .spawn(move || read_loop(source.as_ref(), deliver, &stop, buffer_size))?;

        self.thread = Some(thread);
        self.callback = Some(callback);
        info!(buffer_size, "Reader started");
        Ok(())
    }

    /// Stop the thread, wait for it and forget the callback.
    ///
    /// Safe to call when the reader never started.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            self.callback = None;
            return;
        };

        self.stop.store(true, Ordering::Release);
        if thread.join().is_err() {
            error!("Reader thread panicked");
        }
        self.stop.store(false, Ordering::Release);
        self.callback = None;
        debug!("Reader stopped");
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop<S: FrameSource + ?Sized>(
    source: &S,
    deliver: DeliveryCallback,
    stop: &AtomicBool,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    let mut backoff = IdleBackoff::new();
    let mut delivered: u64 = 0;

    while !stop.load(Ordering::Acquire) {
        match source.read(&mut buf) {
            RecvResult::Packet(len) => {
                deliver(&buf[..len]);
                delivered += 1;
                backoff.reset();
            }
            RecvResult::WouldBlock => backoff.idle(),
            RecvResult::Done => {
                debug!("Frame source finished");
                break;
            }
        }
    }

    debug!(delivered, "Reader loop exited");
}
