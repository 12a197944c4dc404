//! Bridge between a discrete-event network simulation and a polled NIC.
//!
//! Frames written by the simulation travel through a bounded outbound ring
//! to a dedicated I/O loop that hands them to the hardware in bursts.
//! Received bursts take the reverse path through an inbound ring, from
//! which a reader task delivers them to a registered callback.

pub mod config;
pub mod device;
pub mod hardware;
pub mod io_loop;
pub mod pool;
pub mod reader;
pub mod ring;

pub use config::BridgeConfig;
pub use device::{Device, DeviceError, WriteError};
pub use hardware::{LinkStatus, LoopbackPort, NicPort, TapPort};
pub use io_loop::StatsSnapshot;
pub use reader::RecvResult;
