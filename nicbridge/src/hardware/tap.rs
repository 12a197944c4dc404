//! TAP interface port
//!
//! Opens a Layer 2 TAP device through `/dev/net/tun` in non-blocking mode.
//! Each read or write moves exactly one Ethernet frame, so bursts are
//! built by repeating the syscall until the kernel reports `EAGAIN`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use arc_swap::ArcSwapOption;
use nix::libc::{self, IFNAMSIZ, c_char, c_short};
use tracing::{debug, info};

use super::{HardwareError, LinkStatus, NicPort, PortConfig};
use crate::pool::{BufferPool, PacketBuffer};

const TUNSETIFF: libc::Ioctl = 0x400454ca as libc::Ioctl;

/// ifreq structure for TUNSETIFF and interface flag ioctls
#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: c_short) -> io::Result<Self> {
        if name.is_empty() || name.len() >= IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name must be 1..{} bytes", IFNAMSIZ - 1),
            ));
        }
        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: flags,
            _padding: [0; 22],
        };
        for (i, byte) in name.bytes().enumerate() {
            ifr.ifr_name[i] = byte as c_char;
        }
        Ok(ifr)
    }
}

/// Port backed by a Linux TAP interface
pub struct TapPort {
    name: String,
    file: File,
    /// Recorded at configure time, for log context
    port_id: AtomicU16,
    pool: ArcSwapOption<BufferPool>,
    started: AtomicBool,
}

impl TapPort {
    /// Create (or attach to) the TAP interface `name`.
    pub fn open(name: &str) -> Result<Self, HardwareError> {
        let open_err = |source: io::Error| HardwareError::Open {
            name: name.to_string(),
            source,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")
            .map_err(open_err)?;

        let ifr = IfReq::new(name, (libc::IFF_TAP | libc::IFF_NO_PI) as c_short).map_err(open_err)?;

        // SAFETY: ifr is a valid, initialized ifreq and outlives the call
        let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) };
        if result < 0 {
            return Err(open_err(io::Error::last_os_error()));
        }

        info!(name, "TAP device opened");

        Ok(TapPort {
            name: name.to_string(),
            file,
            port_id: AtomicU16::new(0),
            pool: ArcSwapOption::empty(),
            started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn interface_flags(&self) -> io::Result<c_short> {
        let sock = control_socket()?;
        let mut ifr = IfReq::new(&self.name, 0)?;
        // SAFETY: ifr is a valid ifreq, the kernel fills ifr_flags
        let result = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut ifr) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ifr.ifr_flags)
    }

    fn set_interface_flags(&self, flags: c_short) -> io::Result<()> {
        let sock = control_socket()?;
        let ifr = IfReq::new(&self.name, flags)?;
        // SAFETY: ifr is a valid, initialized ifreq
        let result = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &ifr) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Datagram socket used only as an ioctl handle
fn control_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call, the fd is owned immediately below
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly created, valid descriptor
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl NicPort for TapPort {
    fn configure(&self, config: &PortConfig, pool: &Arc<BufferPool>) -> Result<(), HardwareError> {
        config.check_single_queue()?;
        self.port_id.store(config.port_id, Ordering::Relaxed);
        self.pool.store(Some(Arc::clone(pool)));
        debug!(name = %self.name, port_id = config.port_id, "TAP port configured");
        Ok(())
    }

    fn start(&self) -> Result<(), HardwareError> {
        let port_id = self.port_id.load(Ordering::Relaxed);
        if self.pool.load().is_none() {
            return Err(HardwareError::Start {
                port_id,
                reason: "port not configured".to_string(),
            });
        }

        let flags = self.interface_flags().map_err(|e| HardwareError::Start {
            port_id,
            reason: format!("SIOCGIFFLAGS: {e}"),
        })?;
        self.set_interface_flags(flags | libc::IFF_UP as c_short)
            .map_err(|e| HardwareError::Start {
                port_id,
                reason: format!("SIOCSIFFLAGS: {e}"),
            })?;

        self.started.store(true, Ordering::Release);
        info!(name = %self.name, port_id, "TAP interface set UP");
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.pool.store(None);
        debug!(name = %self.name, "TAP port stopped");
    }

    fn link_status(&self) -> LinkStatus {
        match self.interface_flags() {
            Ok(flags) => {
                let up = flags & libc::IFF_UP as c_short != 0;
                let running = flags & libc::IFF_RUNNING as c_short != 0;
                if up && running {
                    LinkStatus::Up
                } else {
                    LinkStatus::Down
                }
            }
            Err(_) => LinkStatus::Down,
        }
    }

    fn rx_burst(&self, _queue_id: u16, out: &mut Vec<PacketBuffer>, max: usize) -> usize {
        if !self.started.load(Ordering::Acquire) {
            return 0;
        }
        let guard = self.pool.load();
        let Some(pool) = guard.as_ref() else {
            return 0;
        };

        let mut count = 0;
        while count < max {
            let Some(mut buf) = pool.alloc() else {
                debug!(name = %self.name, "rx_burst: buffer pool exhausted");
                break;
            };
            match (&self.file).read(buf.write_area()) {
                Ok(0) => break,
                Ok(n) => {
                    buf.set_len(n);
                    out.push(buf);
                    count += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(name = %self.name, error = %e, "TAP read failed");
                    break;
                }
            }
        }
        count
    }

    fn tx_burst(&self, _queue_id: u16, pkts: &mut Vec<PacketBuffer>) -> usize {
        if !self.started.load(Ordering::Acquire) {
            return 0;
        }

        let mut accepted = 0;
        for buf in pkts.iter() {
            match (&self.file).write(buf.data()) {
                Ok(_) => accepted += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // The kernel refused this frame for good; retrying cannot help
                    debug!(name = %self.name, error = %e, len = buf.len(), "TAP write failed, frame dropped");
                    accepted += 1;
                }
            }
        }

        // Transmitted buffers go back to the pool here
        pkts.drain(..accepted);
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_name() {
        let ifr = IfReq::new("tap0", 0x1002).unwrap();
        assert_eq!(ifr.ifr_name[0], b't' as c_char);
        assert_eq!(ifr.ifr_name[3], b'0' as c_char);
        assert_eq!(ifr.ifr_name[4], 0);
        assert_eq!(ifr.ifr_flags, 0x1002);
    }

    #[test]
    fn test_ifreq_name_too_long() {
        assert!(IfReq::new("a-very-long-interface-name", 0).is_err());
        assert!(IfReq::new("", 0).is_err());
    }

    #[test]
    fn test_ifreq_layout() {
        // Matches the kernel's struct ifreq
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
    }
}
