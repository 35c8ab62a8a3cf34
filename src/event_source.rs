//! Opens the kernel's connector-style process event multicast channel and
//! yields raw datagrams to a dedicated reader task, which must not block on
//! per-process work — decoding and hand-off happen immediately, the
//! blocking part is the `recv` itself.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::EventSourceError;
use crate::frame::{build_subscription_message, ProcCnMcastOp};

const AF_NETLINK: i32 = libc::AF_NETLINK;
const NETLINK_CONNECTOR: i32 = 11;
/// Multicast group bit index 1 selects process events.
const CN_IDX_PROC_GROUP_BIT: u32 = 1;

/// Matches `struct sockaddr_nl`.
#[repr(C)]
#[derive(Clone, Copy)]
struct SockAddrNl {
    nl_family: libc::sa_family_t,
    nl_pad: u16,
    nl_pid: u32,
    nl_groups: u32,
}

pub struct EventSource {
    fd: OwnedFd,
}

impl EventSource {
    /// Opens, binds, and subscribes to the process-event multicast group.
    pub fn open() -> Result<Self, EventSourceError> {
        let raw = unsafe { libc::socket(AF_NETLINK, libc::SOCK_DGRAM, NETLINK_CONNECTOR) };
        if raw < 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.kind() {
                std::io::ErrorKind::PermissionDenied => EventSourceError::PermissionDenied(err),
                _ => EventSourceError::Bind(err),
            });
        }
        // SAFETY: `raw` is a freshly-created, valid, owned fd.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let self_pid = std::process::id();
        let addr = SockAddrNl {
            nl_family: AF_NETLINK as libc::sa_family_t,
            nl_pad: 0,
            nl_pid: self_pid,
            nl_groups: 1 << CN_IDX_PROC_GROUP_BIT,
        };
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const SockAddrNl as *const libc::sockaddr,
                std::mem::size_of::<SockAddrNl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(EventSourceError::Bind(std::io::Error::last_os_error()));
        }

        let source = EventSource { fd };
        source.subscribe(ProcCnMcastOp::Listen)?;
        Ok(source)
    }

    fn subscribe(&self, op: ProcCnMcastOp) -> Result<(), EventSourceError> {
        let msg = build_subscription_message(op, std::process::id(), 1);
        // Destination pid 0 addresses the kernel.
        let dest = SockAddrNl {
            nl_family: AF_NETLINK as libc::sa_family_t,
            nl_pad: 0,
            nl_pid: 0,
            nl_groups: 0,
        };
        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
                &dest as *const SockAddrNl as *const libc::sockaddr,
                std::mem::size_of::<SockAddrNl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(EventSourceError::Send(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Gives `recv` a periodic wakeup so the reader loop can observe
    /// shutdown without needing to close the fd out from under a blocked
    /// syscall. Closing a socket that another OS thread is blocked in
    /// `recv` on would be the cleaner cancellation, but is not portable —
    /// a bounded poll interval approximates it instead.
    fn set_recv_timeout(&self, timeout: std::time::Duration) -> std::io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Blocking receive of one datagram. Runs inside `spawn_blocking` on the
    /// dedicated reader task; this is the blocking recv on the kernel
    /// channel, kept off the async runtime.
    fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Runs the dedicated reader loop, sending raw datagrams on `tx` until
/// `shutdown` is set or the channel is closed. Recv failures that are not
/// `Interrupted` are logged and the loop continues; send/bind failures are
/// fatal and surfaced by `EventSource::open` before this runs.
pub fn run_reader_loop(
    source: EventSource,
    tx: mpsc::Sender<Vec<u8>>,
    shutdown: std::sync::Arc<std::sync::atomic::AtomicBool>,
) {
    const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);
    if let Err(e) = source.set_recv_timeout(POLL_INTERVAL) {
        warn!(error = %e, "failed to set recv timeout on kernel event channel");
    }

    let mut buf = vec![0u8; 4096];
    while !shutdown.load(std::sync::atomic::Ordering::Relaxed) {
        match source.recv(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    // Receiver dropped: shutdown in progress.
                    break;
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue; // periodic wakeup, re-check `shutdown`
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "kernel event channel recv failed");
                continue;
            }
        }
    }
}
