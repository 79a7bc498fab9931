//! Kernel device tree access.
//!
//! This module covers everything that touches sysfs: snapshotting device
//! directories, enumerating the thunderbolt bus, the authorization write,
//! and the kernel hotplug subscription.

pub mod authorize;
pub mod monitor;
pub mod node;

pub use authorize::{authorize, verify_device_uid, verify_uid};
pub use monitor::{is_overflow, parse_uevent, Action, HotplugEvent, Uevent, UeventMonitor};
pub use node::{HardwareNode, ATTRIBUTES};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use model::{Error, Result};
use tracing::{debug, warn};

/// Bus subsystem watched for hotplug events.
pub const SUBSYSTEM: &str = "thunderbolt";

/// A sysfs mount.
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    /// Uses the sysfs mounted at `root` (normally `/sys`).
    ///
    /// The root is canonicalized when possible so that paths built from
    /// uevent `DEVPATH`s compare equal to enumerated paths.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            root: fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf()),
        }
    }

    /// The sysfs mount point.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory listing every device on the bus.
    pub fn bus_devices_dir(&self) -> PathBuf {
        self.root.join("bus").join(SUBSYSTEM).join("devices")
    }

    /// Snapshots every node currently on the bus, in name order.
    ///
    /// A missing bus directory means no hardware and yields an empty list.
    /// Entries that cannot be read are skipped with a warning.
    pub fn enumerate(&self) -> Result<Vec<HardwareNode>> {
        let dir = self.bus_devices_dir();

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No {} bus at {}", SUBSYSTEM, dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(Error::io(format!("listing {}", dir.display()), e)),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.path()),
                Err(e) => {
                    warn!("Could not read entry in {}: {}", dir.display(), e);
                    None
                }
            })
            .collect();
        paths.sort();

        let mut nodes = Vec::with_capacity(paths.len());
        for path in paths {
            let syspath = fs::canonicalize(&path).unwrap_or(path);
            match HardwareNode::from_syspath(&syspath) {
                Ok(node) => nodes.push(node),
                Err(e) => warn!("Skipping {}: {}", syspath.display(), e),
            }
        }

        Ok(nodes)
    }

    /// Snapshots the node at a kernel `DEVPATH` such as `/devices/.../0-1`.
    ///
    /// If the directory no longer exists the node carries only its path.
    pub fn node_at_devpath(&self, devpath: &str) -> HardwareNode {
        let syspath = self.root.join(devpath.trim_start_matches('/'));
        match HardwareNode::from_syspath(&syspath) {
            Ok(node) => node,
            Err(e) => {
                debug!("Node {} not readable: {}", syspath.display(), e);
                HardwareNode::new(syspath)
            }
        }
    }
}
