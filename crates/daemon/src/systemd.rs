//! Service manager integration for `tbauth monitor`.
//!
//! Implements the `sd_notify` datagram protocol (no libsystemd) and the
//! shutdown signals the monitor stops on.
//!
//! ```rust,no_run
//! use daemon::systemd::{is_systemd, notify_ready, notify_stopping};
//!
//! if is_systemd() {
//!     notify_ready();
//!     // ...
//!     notify_stopping();
//! }
//! ```

use std::env;
use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixDatagram};

use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

/// Environment variable naming the notification socket.
const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

/// Returns true if the service manager expects notifications.
pub fn is_systemd() -> bool {
    env::var_os(NOTIFY_SOCKET_ENV).is_some()
}

/// Resolves `NOTIFY_SOCKET` to a socket address.
///
/// Paths starting with `@` live in the abstract namespace.
fn notify_socket_addr() -> io::Result<Option<SocketAddr>> {
    let Ok(value) = env::var(NOTIFY_SOCKET_ENV) else {
        return Ok(None);
    };

    if let Some(name) = value.strip_prefix('@') {
        SocketAddr::from_abstract_name(name.as_bytes()).map(Some)
    } else if value.starts_with('/') {
        SocketAddr::from_pathname(&value).map(Some)
    } else {
        warn!("Invalid {} value: {}", NOTIFY_SOCKET_ENV, value);
        Ok(None)
    }
}

/// Sends one `KEY=VALUE` notification. A no-op outside systemd.
fn notify(message: &str) -> io::Result<()> {
    let Some(addr) = notify_socket_addr()? else {
        debug!("Not running under systemd, skipping notification");
        return Ok(());
    };

    let socket = UnixDatagram::unbound()?;
    socket.send_to_addr(message.as_bytes(), &addr)?;

    debug!("Sent systemd notification: {}", message.trim());
    Ok(())
}

/// Reports that the initial sync is done and events are being handled.
pub fn notify_ready() {
    if let Err(e) = notify("READY=1\n") {
        error!("Failed to notify systemd of ready state: {}", e);
    } else if is_systemd() {
        info!("Notified systemd: service ready");
    }
}

/// Updates the status line shown by `systemctl status`.
pub fn notify_status(message: &str) {
    let notification = format!("STATUS={}\n", message);
    if let Err(e) = notify(&notification) {
        error!("Failed to notify systemd of status: {}", e);
    }
}

pub fn notify_stopping() {
    if let Err(e) = notify("STOPPING=1\n") {
        error!("Failed to notify systemd of stopping state: {}", e);
    }
}

/// Waits for SIGTERM or SIGINT and returns the signal name.
pub async fn wait_for_shutdown_signal() -> io::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };

    info!("Received {}, shutting down", name);
    Ok(name)
}
