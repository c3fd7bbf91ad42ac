//! Generic-netlink transport for taskstats queries.
//!
//! This is not a general netlink library: it carries exactly the blocking
//! request/response exchange the accounting codec needs. The [`Transport`]
//! trait is the seam the tests substitute with scripted byte streams.

pub mod codec;

use anyhow::{Context, Result};
use thiserror::Error;

pub use codec::{CodecError, QueryCodec};

/// Receive buffer size. Control-family replies with per-family op/group
/// listings are the largest messages we see; 8 KiB covers them comfortably.
const RECV_BUF_SIZE: usize = 8192;

/// Errors raised by the transport layer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("netlink socket: {0}")]
    Socket(#[from] std::io::Error),

    #[error("netlink transport is only supported on Linux")]
    Unsupported,
}

/// One blocking request/response channel to the kernel.
///
/// A single exchange must not interleave with another on the same channel;
/// each query worker therefore owns its own transport.
pub trait Transport: Send {
    /// Submit one fully framed request message.
    fn send(&self, message: &[u8]) -> Result<(), TransportError>;

    /// Block until the next response message arrives and return its bytes.
    fn recv(&self) -> Result<Vec<u8>, TransportError>;
}

/// A raw `AF_NETLINK`/`NETLINK_GENERIC` socket.
///
/// Bound with an auto-assigned port id, so the kernel unicasts each reply to
/// the socket that sent the matching request.
pub struct NetlinkSocket {
    #[cfg(target_os = "linux")]
    fd: std::os::fd::OwnedFd,
}

#[cfg(target_os = "linux")]
impl NetlinkSocket {
    /// Open and bind a generic-netlink socket.
    pub fn connect() -> Result<Self, TransportError> {
        use std::os::fd::{FromRawFd, OwnedFd};

        // Safety: plain socket(2) call; the fd is owned immediately below.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        if raw < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // Safety: `raw` is a freshly created, unowned descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // nl_pid 0 asks the kernel to assign a unique port id per socket.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        // Safety: addr is a valid sockaddr_nl for the lifetime of the call.
        let rc = unsafe {
            libc::bind(
                raw,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(Self { fd })
    }
}

#[cfg(not(target_os = "linux"))]
impl NetlinkSocket {
    /// Taskstats is a Linux-only facility.
    pub fn connect() -> Result<Self, TransportError> {
        Err(TransportError::Unsupported)
    }
}

#[cfg(target_os = "linux")]
impl Transport for NetlinkSocket {
    fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        use std::os::fd::AsRawFd;

        // Destination port id 0 addresses the kernel.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        // Safety: buffer and sockaddr are valid for the duration of the call.
        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                message.as_ptr() as *const libc::c_void,
                message.len(),
                0,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(())
    }

    fn recv(&self) -> Result<Vec<u8>, TransportError> {
        use std::os::fd::AsRawFd;

        let mut buf = vec![0u8; RECV_BUF_SIZE];

        // Safety: buf is valid and writable for RECV_BUF_SIZE bytes.
        let rc = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        buf.truncate(rc as usize);
        Ok(buf)
    }
}

#[cfg(not(target_os = "linux"))]
impl Transport for NetlinkSocket {
    fn send(&self, _message: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    fn recv(&self) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unsupported)
    }
}

/// Resolve an accounting family name to its runtime family id.
///
/// One-time startup handshake with the generic-netlink controller. Failure is
/// fatal: the kernel either lacks the facility or denies access.
pub fn resolve_family_id(transport: &dyn Transport, name: &str) -> Result<u16> {
    let request = codec::encode_family_request(name);

    transport
        .send(&request)
        .with_context(|| format!("requesting {name} family id"))?;

    let reply = transport
        .recv()
        .with_context(|| format!("receiving {name} family id reply"))?;

    let family_id = codec::decode_family_reply(&reply)
        .with_context(|| format!("kernel did not report a {name} family id"))?;

    tracing::debug!(family = name, family_id, "resolved accounting family");
    Ok(family_id)
}
