//! Kernel hotplug subscription.
//!
//! The kernel multicasts one datagram per uevent on the
//! `NETLINK_KOBJECT_UEVENT` socket family:
//!
//! ```text
//! add@/devices/pci0000:00/.../domain0/0-0/0-1\0ACTION=add\0DEVPATH=...\0SUBSYSTEM=thunderbolt\0...
//! ```
//!
//! Only thunderbolt `add`, `change` and `remove` events are surfaced.

use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use model::{Error, Result};
use nix::errno::Errno;
use nix::sys::socket::{
    bind, recv, setsockopt, socket, sockopt, AddressFamily, MsgFlags, NetlinkAddr, SockFlag,
    SockProtocol, SockType,
};
use tokio::io::unix::AsyncFd;
use tracing::{debug, trace, warn};

use super::node::HardwareNode;
use super::{Sysfs, SUBSYSTEM};

/// Kernel uevent multicast group.
const KERNEL_GROUP: u32 = 1;

/// Receive buffer size; uevents are limited to a few KiB.
const UEVENT_BUFFER_SIZE: usize = 8 * 1024;

/// Socket receive queue size. Docking a hub emits dozens of uevents at once.
const SOCKET_RCVBUF_SIZE: usize = 1024 * 1024;

/// Hotplug action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Change,
    Remove,
}

impl Action {
    /// Maps a kernel action token; other actions (bind, unbind, ...) are `None`.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "add" => Some(Action::Add),
            "change" => Some(Action::Change),
            "remove" => Some(Action::Remove),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Change => "change",
            Action::Remove => "remove",
        }
    }
}

/// One hotplug notification referencing one hardware node.
#[derive(Debug, Clone)]
pub struct HotplugEvent {
    pub action: Action,
    pub node: HardwareNode,
}

impl HotplugEvent {
    pub fn new(action: Action, node: HardwareNode) -> Self {
        Self { action, node }
    }
}

/// A parsed kernel uevent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uevent {
    pub action: String,
    pub devpath: String,
    pub vars: BTreeMap<String, String>,
}

impl Uevent {
    pub fn subsystem(&self) -> Option<&str> {
        self.vars.get("SUBSYSTEM").map(String::as_str)
    }
}

/// Whether `err` means the kernel dropped uevents because the socket's
/// receive queue overflowed. The registry must be rebuilt from sysfs.
pub fn is_overflow(err: &Error) -> bool {
    err.raw_os_error() == Some(Errno::ENOBUFS as i32)
}

/// Parses a raw kernel uevent datagram.
///
/// Returns `None` for messages without the `action@devpath` header, such
/// as those sent by udev on its own multicast group.
pub fn parse_uevent(buf: &[u8]) -> Option<Uevent> {
    let mut fields = buf
        .split(|b| *b == 0)
        .filter(|f| !f.is_empty())
        .map(String::from_utf8_lossy);

    let header = fields.next()?;
    let (action, devpath) = header.split_once('@')?;

    let vars: BTreeMap<String, String> = fields
        .filter_map(|field| {
            field
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();

    Some(Uevent {
        action: vars
            .get("ACTION")
            .cloned()
            .unwrap_or_else(|| action.to_string()),
        devpath: vars
            .get("DEVPATH")
            .cloned()
            .unwrap_or_else(|| devpath.to_string()),
        vars,
    })
}

/// Live subscription to kernel uevents.
pub struct UeventMonitor {
    fd: AsyncFd<OwnedFd>,
    sysfs: Sysfs,
    buffer: Vec<u8>,
}

impl UeventMonitor {
    /// Binds the netlink socket. Must be called within a tokio runtime.
    ///
    /// Events are queued by the kernel from this point on, so binding
    /// before the initial enumeration guarantees nothing is missed.
    pub fn bind(sysfs: Sysfs) -> Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(|e| Error::io("creating uevent socket", io::Error::from(e)))?;

        // The forced variant ignores rmem_max but needs CAP_NET_ADMIN.
        if let Err(e) = setsockopt(&fd, sockopt::RcvBufForce, &SOCKET_RCVBUF_SIZE)
            .or_else(|_| setsockopt(&fd, sockopt::RcvBuf, &SOCKET_RCVBUF_SIZE))
        {
            warn!("Could not enlarge uevent receive buffer: {}", e);
        }

        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, KERNEL_GROUP))
            .map_err(|e| Error::io("binding uevent socket", io::Error::from(e)))?;

        let fd = AsyncFd::new(fd).map_err(|e| Error::io("registering uevent socket", e))?;

        debug!("Listening for {} uevents", SUBSYSTEM);
        Ok(Self {
            fd,
            sysfs,
            buffer: vec![0u8; UEVENT_BUFFER_SIZE],
        })
    }

    /// Waits for the next thunderbolt add/change/remove event.
    ///
    /// An error for which [`is_overflow`] holds is recoverable: the socket
    /// stays usable but some events were lost.
    pub async fn next_event(&mut self) -> Result<HotplugEvent> {
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(|e| Error::io("polling uevent socket", e))?;

            let received = guard.try_io(|inner| {
                recv(inner.as_raw_fd(), &mut self.buffer, MsgFlags::empty())
                    .map_err(io::Error::from)
            });

            let len = match received {
                Ok(Ok(len)) => len,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(Error::io("receiving uevent", e)),
                Err(_would_block) => continue,
            };

            if let Some(event) = self.to_event(&self.buffer[..len]) {
                return Ok(event);
            }
        }
    }

    fn to_event(&self, datagram: &[u8]) -> Option<HotplugEvent> {
        let uevent = parse_uevent(datagram)?;
        if uevent.subsystem() != Some(SUBSYSTEM) {
            trace!("Ignoring uevent for {}", uevent.devpath);
            return None;
        }

        debug!("uevent [KERNEL]: {} {}", uevent.action, uevent.devpath);

        let action = Action::from_token(&uevent.action)?;
        let node = self.sysfs.node_at_devpath(&uevent.devpath);
        Some(HotplugEvent::new(action, node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(parts: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        for part in parts {
            buf.extend_from_slice(part.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn test_parse_uevent() {
        let buf = datagram(&[
            "add@/devices/domain0/0-0/0-1",
            "ACTION=add",
            "DEVPATH=/devices/domain0/0-0/0-1",
            "SUBSYSTEM=thunderbolt",
            "DEVTYPE=thunderbolt_device",
            "SEQNUM=4242",
        ]);

        let uevent = parse_uevent(&buf).unwrap();
        assert_eq!(uevent.action, "add");
        assert_eq!(uevent.devpath, "/devices/domain0/0-0/0-1");
        assert_eq!(uevent.subsystem(), Some("thunderbolt"));
        assert_eq!(uevent.vars.get("SEQNUM").map(String::as_str), Some("4242"));
    }

    #[test]
    fn test_parse_uevent_header_only() {
        let buf = datagram(&["remove@/devices/domain0/0-0/0-1"]);
        let uevent = parse_uevent(&buf).unwrap();
        assert_eq!(uevent.action, "remove");
        assert_eq!(uevent.devpath, "/devices/domain0/0-0/0-1");
        assert!(uevent.subsystem().is_none());
    }

    #[test]
    fn test_parse_uevent_rejects_udev_messages() {
        let mut buf = b"libudev\0".to_vec();
        buf.extend_from_slice(&datagram(&["ACTION=add"]));
        assert!(parse_uevent(&buf).is_none());
    }

    #[test]
    fn test_parse_empty_datagram() {
        assert!(parse_uevent(&[]).is_none());
    }

    #[test]
    fn test_overflow_is_recognized() {
        let lost = Error::io(
            "receiving uevent",
            io::Error::from_raw_os_error(Errno::ENOBUFS as i32),
        );
        assert!(is_overflow(&lost));

        let broken = Error::io(
            "receiving uevent",
            io::Error::from_raw_os_error(Errno::EBADF as i32),
        );
        assert!(!is_overflow(&broken));
        assert!(!is_overflow(&Error::not_found("attached device A")));
    }

    #[test]
    fn test_action_tokens() {
        assert_eq!(Action::from_token("add"), Some(Action::Add));
        assert_eq!(Action::from_token("change"), Some(Action::Change));
        assert_eq!(Action::from_token("remove"), Some(Action::Remove));
        assert_eq!(Action::from_token("bind"), None);
        assert_eq!(Action::Remove.as_str(), "remove");
    }
}
