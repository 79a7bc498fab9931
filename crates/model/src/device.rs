//! The runtime device record.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::enums::{AuthLevel, Policy};

/// A hot-pluggable device, either attached or loaded from the store.
///
/// The `uid` is fixed at construction; everything else is split between
/// hardware-sourced fields (refreshed from sysfs) and persistence fields
/// (loaded from or written to the store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    uid: String,
    /// Numeric vendor id.
    pub vendor_id: u32,
    /// Human-readable vendor name.
    pub vendor_name: String,
    /// Numeric device id.
    pub device_id: u32,
    /// Human-readable device name.
    pub device_name: String,
    /// The sysfs directory of the device, only while attached.
    pub sysfs_path: Option<PathBuf>,
    /// Current authorization level.
    pub authorized: AuthLevel,
    /// Whether a persisted record exists for this uid.
    pub known: bool,
    /// Stored authorization policy.
    pub policy: Policy,
    /// Whether the device should be connected without interaction.
    pub autoconnect: bool,
    /// Location of the key material, once created.
    pub key: Option<PathBuf>,
}

impl Device {
    /// Creates an unknown, detached device with the given uid.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            vendor_id: 0,
            vendor_name: String::new(),
            device_id: 0,
            device_name: String::new(),
            sysfs_path: None,
            authorized: AuthLevel::Unknown,
            known: false,
            policy: Policy::Unknown,
            autoconnect: false,
            key: None,
        }
    }

    /// The immutable identity of this device.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// The sysfs directory, if attached.
    pub fn sysfs_path(&self) -> Option<&Path> {
        self.sysfs_path.as_deref()
    }

    /// True while the device has a sysfs directory.
    pub fn is_attached(&self) -> bool {
        self.sysfs_path.is_some()
    }

    /// Copies the hardware-sourced fields from a fresh snapshot.
    ///
    /// Persistence fields (`policy`, `autoconnect`, `known`, `key`) are
    /// left alone. Returns true if anything changed.
    pub fn update_hardware(&mut self, fresh: &Device) -> bool {
        let before = (
            self.authorized,
            self.vendor_id,
            self.device_id,
            self.vendor_name.clone(),
            self.device_name.clone(),
            self.sysfs_path.clone(),
        );

        self.authorized = fresh.authorized;
        self.vendor_id = fresh.vendor_id;
        self.device_id = fresh.device_id;
        self.vendor_name.clone_from(&fresh.vendor_name);
        self.device_name.clone_from(&fresh.device_name);
        self.sysfs_path.clone_from(&fresh.sysfs_path);

        before
            != (
                self.authorized,
                self.vendor_id,
                self.device_id,
                self.vendor_name.clone(),
                self.device_name.clone(),
                self.sysfs_path.clone(),
            )
    }

    /// Marks the device as gone from the bus.
    pub fn detach(&mut self) {
        self.sysfs_path = None;
        self.authorized = AuthLevel::Unknown;
    }
}
