//! Netlink uevent monitor.
//!
//! udev re-broadcasts every processed kernel uevent on the `udev` multicast
//! group of `NETLINK_KOBJECT_UEVENT`, prefixed by a small `libudev` header and
//! carrying the full property set of the device (including the `ID_*`
//! properties udev rules added). The kernel group carries the raw
//! `action@devpath` messages without udev properties.

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;

use error_stack::Report;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use super::DeviceError;

const LIBUDEV_PREFIX: &[u8] = b"libudev\0";
const LIBUDEV_MAGIC: u32 = 0xfeed_cafe;
/// prefix + magic + header size + properties offset + properties length + 4 filter words
const LIBUDEV_HEADER_LEN: usize = 40;
const RECEIVE_BUFFER_BYTES: libc::c_int = 1024 * 1024;

/// Netlink multicast group udev re-broadcasts processed events on.
const UDEV_MONITOR_GROUP: u32 = 2;

/// A uevent decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UeventMessage {
    pub action: String,
    /// Kernel object path relative to the sysfs mount, e.g. `/devices/pci0000:00/...`
    pub devpath: String,
    pub properties: BTreeMap<String, String>,
}

/// Decode one datagram received from the uevent socket.
pub fn parse_message(buf: &[u8]) -> Result<UeventMessage, Report<DeviceError>> {
    let properties = if buf.starts_with(LIBUDEV_PREFIX) {
        parse_properties(udev_properties_block(buf)?)
    } else {
        parse_kernel_message(buf)?
    };

    let action = properties
        .get("ACTION")
        .cloned()
        .ok_or_else(|| malformed("missing ACTION"))?;
    let devpath = properties
        .get("DEVPATH")
        .cloned()
        .ok_or_else(|| malformed("missing DEVPATH"))?;

    Ok(UeventMessage {
        action,
        devpath,
        properties,
    })
}

fn malformed(message: impl Into<String>) -> Report<DeviceError> {
    Report::new(DeviceError::MalformedEvent {
        message: message.into(),
    })
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(word)
}

fn udev_properties_block(buf: &[u8]) -> Result<&[u8], Report<DeviceError>> {
    if buf.len() < LIBUDEV_HEADER_LEN {
        return Err(malformed(format!(
            "libudev message too short: {} bytes",
            buf.len()
        )));
    }
    let magic = u32::from_be(read_u32(buf, 8));
    if magic != LIBUDEV_MAGIC {
        return Err(malformed(format!("unexpected libudev magic {magic:#x}")));
    }
    let offset = read_u32(buf, 16) as usize;
    let len = read_u32(buf, 20) as usize;
    buf.get(offset..offset.saturating_add(len)).ok_or_else(|| {
        malformed(format!(
            "properties block {offset}+{len} exceeds message of {} bytes",
            buf.len()
        ))
    })
}

fn parse_kernel_message(buf: &[u8]) -> Result<BTreeMap<String, String>, Report<DeviceError>> {
    let mut fields = buf.splitn(2, |b| *b == 0);
    let summary = fields.next().unwrap_or_default();
    let summary = String::from_utf8_lossy(summary);
    if !summary.contains('@') {
        return Err(malformed(format!("unrecognised message header {summary:?}")));
    }
    Ok(parse_properties(fields.next().unwrap_or_default()))
}

fn parse_properties(block: &[u8]) -> BTreeMap<String, String> {
    block
        .split(|b| *b == 0)
        .filter(|field| !field.is_empty())
        .filter_map(|field| {
            let field = String::from_utf8_lossy(field);
            field
                .split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Non-blocking `NETLINK_KOBJECT_UEVENT` socket registered with the tokio reactor.
pub struct UeventSocket {
    fd: AsyncFd<OwnedFd>,
}

impl UeventSocket {
    /// Open a socket subscribed to udev's processed events. Must be called within a tokio runtime.
    pub fn bind() -> io::Result<Self> {
        // SAFETY: plain socket(2) call, the result is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        grow_receive_buffer(&fd);

        // SAFETY: sockaddr_nl is plain old data, all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = UDEV_MONITOR_GROUP;
        // SAFETY: `addr` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&addr as *const libc::sockaddr_nl).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `fd` is owned by the AsyncFd and stays open until it is dropped.
        let fd = unsafe { AsyncFd::register_with_interest(fd, Interest::READABLE) }?;
        Ok(Self { fd })
    }

    /// Receive one datagram into `buf`, returning its length.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
                let n = unsafe {
                    libc::recv(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr().cast::<libc::c_void>(),
                        buf.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Bursts of hotplug events overflow the default socket buffer, so ask for a
/// larger one. `SO_RCVBUFFORCE` needs CAP_NET_ADMIN, `SO_RCVBUF` is capped by
/// `rmem_max`; either failing is harmless.
fn grow_receive_buffer(fd: &OwnedFd) {
    let size = RECEIVE_BUFFER_BYTES;
    for option in [libc::SO_RCVBUFFORCE, libc::SO_RCVBUF] {
        // SAFETY: `size` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                option,
                (&size as *const libc::c_int).cast::<libc::c_void>(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            return;
        }
    }
    tracing::debug!(
        "could not enlarge uevent receive buffer: {}",
        io::Error::last_os_error()
    );
}
