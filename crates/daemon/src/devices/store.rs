//! Persistent device records and key material.
//!
//! The store is a directory tree shared by the long-running monitor and
//! one-shot CLI invocations:
//!
//! ```text
//! <root>/devices/<uid>   TOML record: [device] name, vendor-name; [user] autoconnect, policy
//! <root>/keys/<uid>      64 lowercase hex characters, mode 0600
//! ```
//!
//! There is no cross-process lock. Records are replaced atomically (write
//! to a temp file, then rename) and key files are published with a
//! no-clobber link, so readers never observe partial data and two
//! processes can never produce two different keys for one uid.

use std::fs::{self, DirBuilder, File, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use model::{Device, Error, KeyMaterial, Policy, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Mode of record files.
const RECORD_MODE: u32 = 0o644;

/// Mode of the key directory.
const KEY_DIR_MODE: u32 = 0o700;

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    device: DeviceSection,
    #[serde(default)]
    user: UserSection,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeviceSection {
    name: String,
    #[serde(rename = "vendor-name")]
    vendor_name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserSection {
    #[serde(default)]
    autoconnect: bool,
    #[serde(default, skip_serializing_if = "is_unknown")]
    policy: Policy,
}

fn is_unknown(policy: &Policy) -> bool {
    *policy == Policy::Unknown
}

impl Record {
    fn from_device(device: &Device) -> Self {
        Self {
            device: DeviceSection {
                name: device.device_name.clone(),
                vendor_name: device.vendor_name.clone(),
            },
            user: UserSection {
                autoconnect: device.autoconnect,
                policy: device.policy,
            },
        }
    }
}

/// Handle to a key-material file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    path: PathBuf,
    created: bool,
}

impl KeyHandle {
    /// Location of the key file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this call generated the key (false if it already existed).
    pub fn created(&self) -> bool {
        self.created
    }

    /// Opens the key file read-only.
    pub fn open(&self) -> Result<File> {
        File::open(&self.path)
            .map_err(|e| Error::io(format!("opening key {}", self.path.display()), e))
    }

    /// Reads and decodes the key.
    pub fn read(&self) -> Result<KeyMaterial> {
        let mut contents = String::new();
        self.open()?
            .read_to_string(&mut contents)
            .map_err(|e| Error::io(format!("reading key {}", self.path.display()), e))?;
        KeyMaterial::from_hex(&contents)
    }
}

/// Durable uid-keyed store of device records and key material.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    devices: PathBuf,
    keys: PathBuf,
}

impl Store {
    /// Creates a store rooted at `root`. Nothing is touched on disk.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            devices: root.join("devices"),
            keys: root.join("keys"),
            root,
        }
    }

    /// The store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, uid: &str) -> Result<PathBuf> {
        validate_uid(uid)?;
        Ok(self.devices.join(uid))
    }

    fn key_path(&self, uid: &str) -> Result<PathBuf> {
        validate_uid(uid)?;
        Ok(self.keys.join(uid))
    }

    /// Whether a record exists for `uid`.
    pub fn have(&self, uid: &str) -> bool {
        self.record_path(uid).map(|p| p.exists()).unwrap_or(false)
    }

    /// Whether key material exists for `uid`.
    pub fn have_key(&self, uid: &str) -> bool {
        self.key_path(uid).map(|p| p.exists()).unwrap_or(false)
    }

    /// Writes the record for `device`, atomically replacing any previous one.
    pub fn put(&self, device: &Device) -> Result<()> {
        let path = self.record_path(device.uid())?;

        fs::create_dir_all(&self.devices)
            .map_err(|e| Error::io(format!("creating {}", self.devices.display()), e))?;

        let contents = toml::to_string_pretty(&Record::from_device(device)).map_err(|e| {
            Error::io(
                format!("serializing record for {}", device.uid()),
                io::Error::new(io::ErrorKind::InvalidData, e),
            )
        })?;

        let mut temp = NamedTempFile::new_in(&self.devices).map_err(|e| {
            Error::io(format!("creating temp record in {}", self.devices.display()), e)
        })?;
        temp.write_all(contents.as_bytes())
            .and_then(|_| temp.as_file().set_permissions(Permissions::from_mode(RECORD_MODE)))
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| Error::io(format!("writing temp record for {}", device.uid()), e))?;

        temp.persist(&path)
            .map_err(|e| Error::io(format!("replacing {}", path.display()), e.error))?;

        info!(
            "Stored device {} ({}) with policy {}",
            device.uid(),
            device.device_name,
            device.policy
        );
        Ok(())
    }

    fn load_record(&self, uid: &str) -> Result<Record> {
        let path = self.record_path(uid)?;
        let contents = fs::read_to_string(&path).map_err(|e| {
            Error::io_or_not_found(
                format!("record for {}", uid),
                format!("reading {}", path.display()),
                e,
            )
        })?;

        toml::from_str(&contents).map_err(|e| Error::corrupt(uid, e.message().to_string()))
    }

    /// Loads the record for `uid` as a new, detached Device.
    pub fn get(&self, uid: &str) -> Result<Device> {
        let record = self.load_record(uid)?;

        let mut dev = Device::new(uid);
        dev.device_name = record.device.name;
        dev.vendor_name = record.device.vendor_name;
        dev.autoconnect = record.user.autoconnect;
        dev.policy = record.user.policy;
        dev.known = true;
        dev.key = self.existing_key_path(uid);
        Ok(dev)
    }

    /// Copies the persisted `policy` and `autoconnect` onto `device`.
    ///
    /// On success `device.known` becomes true. If no record exists the
    /// device is left untouched and `NotFound` is returned.
    pub fn merge(&self, device: &mut Device) -> Result<()> {
        let record = self.load_record(device.uid())?;

        device.policy = record.user.policy;
        device.autoconnect = record.user.autoconnect;
        device.known = true;
        device.key = self.existing_key_path(device.uid());

        debug!(
            "Merged stored data for {}: policy {}, autoconnect {}",
            device.uid(),
            device.policy,
            device.autoconnect
        );
        Ok(())
    }

    fn existing_key_path(&self, uid: &str) -> Option<PathBuf> {
        self.key_path(uid).ok().filter(|p| p.exists())
    }

    /// Ensures key material exists for `device`.
    ///
    /// An existing key is never regenerated or overwritten. A new key is
    /// written to a private temp file and then linked into place without
    /// clobbering, so if another process wins the race its key is kept.
    pub fn create_key(&self, device: &Device) -> Result<KeyHandle> {
        let uid = device.uid();
        let path = self.key_path(uid)?;

        if path.exists() {
            debug!("Key for {} already exists", uid);
            return Ok(KeyHandle {
                path,
                created: false,
            });
        }

        DirBuilder::new()
            .recursive(true)
            .mode(KEY_DIR_MODE)
            .create(&self.keys)
            .map_err(|e| Error::io(format!("creating {}", self.keys.display()), e))?;

        let key = KeyMaterial::generate()?;

        // NamedTempFile is created with mode 0600.
        let mut temp = NamedTempFile::new_in(&self.keys).map_err(|e| {
            Error::io(format!("creating temp key in {}", self.keys.display()), e)
        })?;
        temp.write_all(key.to_hex().as_bytes())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| Error::io(format!("writing key for {}", uid), e))?;

        match temp.persist_noclobber(&path) {
            Ok(_) => {
                info!("Created key for {}", uid);
                Ok(KeyHandle {
                    path,
                    created: true,
                })
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!("Key for {} was created concurrently", uid);
                Ok(KeyHandle {
                    path,
                    created: false,
                })
            }
            Err(e) => Err(Error::io(format!("publishing {}", path.display()), e.error)),
        }
    }

    /// Opens the key material for `uid` read-only.
    pub fn open_key(&self, uid: &str) -> Result<File> {
        let path = self.key_path(uid)?;
        File::open(&path).map_err(|e| {
            Error::io_or_not_found(
                format!("key for {}", uid),
                format!("opening {}", path.display()),
                e,
            )
        })
    }

    /// Lists the uids of all stored records, sorted.
    ///
    /// Dot-prefixed entries (including in-flight temp files) are skipped.
    /// A store that was never written to is empty.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.devices) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(format!("listing {}", self.devices.display()), e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::io(format!("listing {}", self.devices.display()), e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            ids.push(name);
        }

        ids.sort();
        Ok(ids)
    }

    /// Removes the record and the key material for `uid`.
    ///
    /// Files that are already gone are not an error.
    pub fn delete(&self, uid: &str) -> Result<()> {
        let record = self.record_path(uid)?;
        let key = self.key_path(uid)?;

        let record_result = remove_if_present(&record);
        let key_result = remove_if_present(&key);

        match (record_result, key_result) {
            (Ok(()), Ok(())) => {
                info!("Deleted device {} from store", uid);
                Ok(())
            }
            (Err(data_err), Err(key_err)) => Err(Error::io(
                format!(
                    "removing device data ({}) and key ({})",
                    data_err, key_err
                ),
                data_err,
            )),
            (Err(e), Ok(())) => Err(Error::io(format!("removing {}", record.display()), e)),
            (Ok(()), Err(e)) => Err(Error::io(format!("removing {}", key.display()), e)),
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Rejects uids that cannot safely be used as a file name.
fn validate_uid(uid: &str) -> Result<()> {
    if uid.is_empty() || uid.starts_with('.') || uid.contains('/') || uid.contains('\0') {
        return Err(Error::InvalidToken {
            kind: "uid",
            token: uid.to_string(),
        });
    }
    Ok(())
}
