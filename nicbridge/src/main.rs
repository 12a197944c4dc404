use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use crossbeam_channel::Receiver;
use nicbridge::{BridgeConfig, Device, DeviceError, LoopbackPort, NicPort, TapPort};
use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr};
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Interval;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Frames queued between the reader callback and the simulation thread
const SIM_QUEUE_DEPTH: usize = 1024;

/// IEEE local experimental ethertype, used for heartbeat frames
const HEARTBEAT_ETHERTYPE: u16 = 0x88b5;

const HEARTBEAT_SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

/// Minimum Ethernet payload
const MIN_PAYLOAD: usize = 46;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Linux TAP interface
    Tap,
    /// In-process port that receives everything it transmits
    Loopback,
}

#[derive(Parser)]
#[command(name = "nicbridge")]
#[command(about = "Bridge a simulated network device to a polled NIC port")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device (interface) name, overrides the configuration file
    #[arg(short, long)]
    device: Option<String>,

    /// Exchange ring capacity, overrides the configuration file
    #[arg(long)]
    ring_size: Option<usize>,

    /// Port backend
    #[arg(short, long, value_enum, default_value_t = Backend::Tap)]
    backend: Backend,

    /// Write a heartbeat frame every N milliseconds
    #[arg(long)]
    inject_interval_ms: Option<u64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("nicbridge=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    if let Some(device) = &args.device {
        config.device_name = device.clone();
    }
    if let Some(ring_size) = args.ring_size {
        config.ring_size = ring_size;
    }

    let inject_interval = args.inject_interval_ms.map(Duration::from_millis);
    info!(device = %config.device_name, backend = ?args.backend, "Initializing nicbridge");

    match args.backend {
        Backend::Tap => {
            let port = TapPort::open(&config.device_name).context(
                "Failed to open TAP device. Do you have root privileges? Try running with 'sudo'.",
            )?;
            run(Device::new(config, port), inject_interval).await
        }
        Backend::Loopback => {
            let port = LoopbackPort::reflecting(config.device_name.clone());
            run(Device::new(config, port), inject_interval).await
        }
    }
}

async fn run<P: NicPort>(
    mut device: Device<P>,
    inject_interval: Option<Duration>,
) -> anyhow::Result<()> {
    let (frames_tx, frames_rx) = crossbeam_channel::bounded::<Vec<u8>>(SIM_QUEUE_DEPTH);
    device.set_receive_callback(move |frame: &[u8]| {
        if frames_tx.try_send(frame.to_vec()).is_err() {
            debug!(len = frame.len(), "Simulation queue full, frame dropped");
        }
    })?;

    let sim = thread::Builder::new()
        .name("sim".to_string())
        .spawn(move || simulation_side(frames_rx))
        .context("Failed to spawn simulation thread")?;

    // Registered before start so a signal can abort the link wait
    let shutdown = device.shutdown_handle();
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let mut signal_task = tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
        shutdown.store(true, Ordering::Release);
    });

    let started = tokio::task::spawn_blocking(move || device.start().map(|()| device))
        .await
        .context("Device start task panicked")?;
    let mut device = match started {
        Ok(device) => device,
        Err(DeviceError::Interrupted) => {
            info!("Shutdown requested before the device came up");
            join_simulation(sim)?;
            return Ok(());
        }
        Err(e) => {
            signal_task.abort();
            return Err(e).context("Failed to start device");
        }
    };

    let mut ticker = inject_interval.map(tokio::time::interval);
    let mut seq = 0u32;

    loop {
        tokio::select! {
            _ = &mut signal_task => break,
            _ = tick(&mut ticker) => {
                match device.write(&heartbeat_frame(seq)) {
                    Ok(len) => debug!(seq, len, "Heartbeat frame queued"),
                    Err(e) => warn!(seq, error = %e, "Heartbeat frame not queued"),
                }
                seq = seq.wrapping_add(1);
            }
        }
    }

    device.stop().context("Device did not stop cleanly")?;
    let stats = device.stats();
    // Releases the callback and with it the simulation queue sender
    drop(device);

    join_simulation(sim)?;
    info!(heartbeats = seq, "Heartbeat injection finished");

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Wait for the simulation side. Its queue closes once the device is dropped.
fn join_simulation(sim: thread::JoinHandle<u64>) -> anyhow::Result<()> {
    let delivered = sim
        .join()
        .map_err(|_| anyhow::anyhow!("Simulation thread panicked"))?;
    info!(delivered, "Simulation side finished");
    Ok(())
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Stand-in for the simulation engine: consumes delivered frames in order.
fn simulation_side(frames: Receiver<Vec<u8>>) -> u64 {
    let mut delivered = 0;
    for frame in frames {
        delivered += 1;
        debug!(seq = delivered, frame = %summarize(&frame), "Frame delivered");
    }
    delivered
}

fn summarize(frame: &[u8]) -> String {
    match EthernetFrame::new_checked(frame) {
        Ok(eth) => format!(
            "{} -> {} {} ({} bytes)",
            eth.src_addr(),
            eth.dst_addr(),
            eth.ethertype(),
            frame.len()
        ),
        Err(_) => format!("runt ({} bytes)", frame.len()),
    }
}

fn heartbeat_frame(seq: u32) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: EthernetAddress(HEARTBEAT_SRC_MAC),
        dst_addr: EthernetAddress::BROADCAST,
        ethertype: EthernetProtocol::from(HEARTBEAT_ETHERTYPE),
    };

    let mut buffer = vec![0u8; repr.buffer_len() + MIN_PAYLOAD];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    repr.emit(&mut frame);
    frame.payload_mut()[..4].copy_from_slice(&seq.to_be_bytes());
    buffer
}
