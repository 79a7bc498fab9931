//! Snapshots of sysfs device directories.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use model::{AuthLevel, Device, Error, Result, Security};
use tracing::{debug, warn};

/// The attribute files read from every device directory.
pub const ATTRIBUTES: &[&str] = &[
    "unique_id",
    "device_name",
    "vendor_name",
    "device",
    "vendor",
    "authorized",
    "security",
];

/// A point-in-time view of one hardware node.
///
/// Attributes that are absent (or unreadable) in sysfs are absent here,
/// which is how domain controllers are told apart from devices: they carry
/// `security` but no `unique_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareNode {
    syspath: PathBuf,
    attributes: BTreeMap<String, String>,
}

impl HardwareNode {
    /// Creates a node with no attributes.
    ///
    /// Used for nodes whose directory has already vanished (remove events).
    pub fn new(syspath: impl Into<PathBuf>) -> Self {
        Self {
            syspath: syspath.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute value.
    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Reads the known attributes of the device directory at `syspath`.
    pub fn from_syspath(syspath: impl Into<PathBuf>) -> Result<Self> {
        let syspath = syspath.into();

        let meta = fs::metadata(&syspath).map_err(|e| {
            Error::io_or_not_found(
                format!("hardware node {}", syspath.display()),
                format!("inspecting {}", syspath.display()),
                e,
            )
        })?;
        if !meta.is_dir() {
            return Err(Error::io(
                format!("inspecting {}", syspath.display()),
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let mut node = Self::new(syspath);
        for name in ATTRIBUTES {
            match fs::read_to_string(node.syspath.join(name)) {
                Ok(value) => {
                    node.attributes
                        .insert(name.to_string(), value.trim_end().to_string());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    debug!(
                        "Could not read attribute {} of {}: {}",
                        name,
                        node.syspath.display(),
                        e
                    );
                }
            }
        }

        Ok(node)
    }

    /// The device directory.
    pub fn syspath(&self) -> &Path {
        &self.syspath
    }

    /// A raw attribute value.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// The stable identity, absent for domain controllers.
    pub fn unique_id(&self) -> Option<&str> {
        self.attribute("unique_id").filter(|uid| !uid.is_empty())
    }

    /// An unsigned attribute; missing or unparsable values read as 0.
    pub fn attribute_u32(&self, name: &str) -> u32 {
        self.attribute(name)
            .and_then(parse_integer)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or_else(|| {
                if self.attribute(name).is_some() {
                    warn!(
                        "Attribute {} of {} is not a valid unsigned value",
                        name,
                        self.syspath.display()
                    );
                }
                0
            })
    }

    /// The authorization level; missing or out-of-range values are Unknown.
    pub fn auth_level(&self) -> AuthLevel {
        self.attribute("authorized")
            .and_then(parse_integer)
            .map(AuthLevel::from_sysfs)
            .unwrap_or(AuthLevel::Unknown)
    }

    /// The domain security mode, if this node carries one.
    pub fn security(&self) -> Option<Security> {
        let token = self.attribute("security")?;
        match token.parse() {
            Ok(security) => Some(security),
            Err(_) => {
                warn!("Unknown security: {}", token);
                Some(Security::Unknown)
            }
        }
    }

    /// Builds a fresh Device from the hardware attributes.
    ///
    /// Returns `None` for nodes without a `unique_id`.
    pub fn to_device(&self) -> Option<Device> {
        let uid = self.unique_id()?;

        let mut dev = Device::new(uid);
        dev.device_name = self.attribute("device_name").unwrap_or_default().to_string();
        dev.device_id = self.attribute_u32("device");
        dev.vendor_name = self.attribute("vendor_name").unwrap_or_default().to_string();
        dev.vendor_id = self.attribute_u32("vendor");
        dev.sysfs_path = Some(self.syspath.clone());
        dev.authorized = self.auth_level();
        Some(dev)
    }
}

/// Parses decimal or `0x`-prefixed hexadecimal integers.
fn parse_integer(value: &str) -> Option<i64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}
