//! In-memory set of attached devices.

use model::Device;

use crate::sysfs::HardwareNode;

/// Ordered collection of currently attached devices.
///
/// Entries are keyed by uid; hardware without a uid is matched by the
/// sysfs path recorded when it was added.
#[derive(Debug, Default)]
pub struct Registry {
    devices: Vec<Device>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `device`, replacing any entry with the same uid in place.
    ///
    /// Returns the replaced entry.
    pub fn add(&mut self, device: Device) -> Option<Device> {
        match self.index_by_uid(device.uid()) {
            Some(idx) => Some(std::mem::replace(&mut self.devices[idx], device)),
            None => {
                self.devices.push(device);
                None
            }
        }
    }

    /// Removes and returns the entry for `uid`.
    pub fn remove(&mut self, uid: &str) -> Option<Device> {
        self.index_by_uid(uid).map(|idx| self.devices.remove(idx))
    }

    pub fn find_by_uid(&self, uid: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.uid() == uid)
    }

    pub fn find_by_uid_mut(&mut self, uid: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.uid() == uid)
    }

    /// Resolves a hardware node to its registry entry.
    ///
    /// Nodes exposing `unique_id` match on uid only. Others match on the
    /// sysfs path recorded for the entry.
    pub fn find_by_hardware(&self, node: &HardwareNode) -> Option<&Device> {
        self.index_by_hardware(node).map(|idx| &self.devices[idx])
    }

    pub fn find_by_hardware_mut(&mut self, node: &HardwareNode) -> Option<&mut Device> {
        self.index_by_hardware(node)
            .map(move |idx| &mut self.devices[idx])
    }

    fn index_by_uid(&self, uid: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.uid() == uid)
    }

    fn index_by_hardware(&self, node: &HardwareNode) -> Option<usize> {
        match node.unique_id() {
            Some(uid) => self.index_by_uid(uid),
            None => self
                .devices
                .iter()
                .position(|d| d.sysfs_path() == Some(node.syspath())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
