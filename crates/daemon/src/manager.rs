//! The event reconciler.
//!
//! The [`Manager`] owns the [`Registry`] and keeps it in step with the
//! hardware: an initial enumeration at startup, then one hotplug event at
//! a time in delivery order. It is also the entry point for the one-shot
//! command line operations (authorize, store updates, key creation).
//!
//! ```text
//!   sysfs enumerate ──┐
//!                     ├──> Manager::dispatch ──> Registry
//!   uevent monitor ───┘          │
//!                                ├──> Store (merge / put)
//!                                └──> sysfs authorize
//! ```

use model::{AuthLevel, Device, Error, Policy, Result, Security};
use tracing::{debug, error, info, warn};

use crate::devices::{KeyHandle, Registry, Store};
use crate::sysfs::{self, Action, HardwareNode, HotplugEvent, Sysfs};

/// What a dispatched event did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A device was inserted.
    Added { uid: String },
    /// An existing entry was refreshed from hardware.
    Updated { uid: String, changed: bool },
    /// A device left the bus. The entry is returned detached.
    Removed(Device),
    /// A domain controller reported its security mode.
    Domain(Security),
    /// The device has a corrupt store record and was not inserted.
    Excluded { uid: String },
    /// A remove for hardware the registry does not know.
    Missing,
    /// Nothing to do for this node.
    Ignored,
}

/// Modifiers for [`Manager::authorize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthorizeMode {
    /// Persist the device after authorizing.
    pub store: bool,
    /// Set policy `auto` and autoconnect, then persist.
    pub auto: bool,
}

impl AuthorizeMode {
    pub fn stores(&self) -> bool {
        self.store || self.auto
    }
}

/// Result of a successful authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub uid: String,
    /// Whether the `authorized` attribute was written.
    pub written: bool,
    /// Whether the device was persisted.
    pub stored: bool,
}

/// Why [`Manager::auto_authorize`] did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No store record exists for the device.
    NotStored,
    /// The stored policy is not `auto`.
    NotAuto,
    /// The device already has bus access.
    AlreadyAuthorized,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            SkipReason::NotStored => "device is not stored",
            SkipReason::NotAuto => "policy is not auto",
            SkipReason::AlreadyAuthorized => "device is already authorized",
        };
        f.write_str(reason)
    }
}

/// Result of [`Manager::auto_authorize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoOutcome {
    Authorized(Authorization),
    Skipped(SkipReason),
}

/// Reconciles hardware state, the registry and the store.
pub struct Manager {
    store: Store,
    sysfs: Sysfs,
    registry: Registry,
    security: Security,
    auto_authorize: bool,
}

impl Manager {
    /// Creates a manager with an empty registry.
    ///
    /// Automatic authorization on add is off until enabled with
    /// [`Manager::with_auto_authorize`].
    pub fn new(store: Store, sysfs: Sysfs) -> Self {
        Self {
            store,
            sysfs,
            registry: Registry::new(),
            security: Security::Unknown,
            auto_authorize: false,
        }
    }

    pub fn with_auto_authorize(mut self, enabled: bool) -> Self {
        self.auto_authorize = enabled;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn sysfs(&self) -> &Sysfs {
        &self.sysfs
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The domain security mode recorded from the controller.
    pub fn security(&self) -> Security {
        self.security
    }

    /// Runs the add path for every node currently on the bus.
    ///
    /// Controllers are handled first so the domain security mode is known
    /// before any device is considered for authorization. Returns the
    /// number of registered devices.
    pub fn initial_sync(&mut self) -> Result<usize> {
        let nodes = self.sysfs.enumerate()?;
        self.sync_nodes(nodes);

        info!(
            "Initial sync found {} device(s), domain security {}",
            self.registry.len(),
            self.security
        );
        Ok(self.registry.len())
    }

    /// Rebuilds the registry from sysfs after hotplug events were lost.
    ///
    /// Devices no longer on the bus are dropped. Devices still present are
    /// refreshed in place and new ones go through the add path. Returns the
    /// number of registered devices.
    pub fn resync(&mut self) -> Result<usize> {
        let nodes = self.sysfs.enumerate()?;

        let gone: Vec<String> = self
            .registry
            .iter()
            .filter(|dev| !nodes.iter().any(|node| node.unique_id() == Some(dev.uid())))
            .map(|dev| dev.uid().to_string())
            .collect();
        for uid in gone {
            if let Some(dev) = self.registry.remove(&uid) {
                info!("Device {} ({}) left the bus", uid, dev.device_name);
            }
        }

        self.sync_nodes(nodes);

        info!("Rescan found {} device(s)", self.registry.len());
        Ok(self.registry.len())
    }

    fn sync_nodes(&mut self, mut nodes: Vec<HardwareNode>) {
        nodes.sort_by_key(|node| node.unique_id().is_some());

        for node in nodes {
            self.dispatch(HotplugEvent::new(Action::Add, node));
        }
    }

    /// Applies one hotplug event. Never fails; problems are logged.
    pub fn dispatch(&mut self, event: HotplugEvent) -> DispatchOutcome {
        debug!(
            "Dispatching {} for {}",
            event.action.as_str(),
            event.node.syspath().display()
        );

        match event.action {
            Action::Add => {
                if event.node.unique_id().is_some()
                    && self.registry.find_by_hardware(&event.node).is_some()
                {
                    debug!("Add for registered device, treating as change");
                    return self.handle_changed(&event.node);
                }
                self.handle_added(&event.node)
            }
            Action::Change => self.handle_changed(&event.node),
            Action::Remove => self.handle_removed(&event.node),
        }
    }

    fn handle_added(&mut self, node: &HardwareNode) -> DispatchOutcome {
        let Some(mut dev) = node.to_device() else {
            return self.handle_domain(node);
        };

        match self.store.merge(&mut dev) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("Device {} is not stored", dev.uid());
            }
            Err(e) if e.is_corrupt() => {
                warn!("Ignoring device {}: {}", dev.uid(), e);
                return DispatchOutcome::Excluded {
                    uid: dev.uid().to_string(),
                };
            }
            Err(e) => {
                warn!("Could not load stored data for {}: {}", dev.uid(), e);
            }
        }

        info!(
            "Device added: {} ({}, {}) authorized {}, policy {}",
            dev.uid(),
            dev.device_name,
            dev.vendor_name,
            dev.authorized,
            dev.policy
        );

        let uid = dev.uid().to_string();
        self.registry.add(dev);

        if self.auto_authorize {
            self.try_auto_authorize(&uid);
        }

        DispatchOutcome::Added { uid }
    }

    fn handle_domain(&mut self, node: &HardwareNode) -> DispatchOutcome {
        match node.security() {
            Some(security) => {
                if security != self.security {
                    info!(
                        "Domain {} security mode: {}",
                        node.syspath().display(),
                        security
                    );
                }
                self.security = security;
                DispatchOutcome::Domain(security)
            }
            None => {
                debug!("Ignoring node {}", node.syspath().display());
                DispatchOutcome::Ignored
            }
        }
    }

    fn handle_changed(&mut self, node: &HardwareNode) -> DispatchOutcome {
        let Some(dev) = self.registry.find_by_hardware_mut(node) else {
            if let Some(uid) = node.unique_id() {
                warn!("Device {} changed but is not registered, adding it", uid);
            }
            return self.handle_added(node);
        };

        let changed = match node.to_device() {
            Some(fresh) => dev.update_hardware(&fresh),
            None => false,
        };

        if changed {
            info!(
                "Device changed: {} ({}) authorized {}",
                dev.uid(),
                dev.device_name,
                dev.authorized
            );
        }

        DispatchOutcome::Updated {
            uid: dev.uid().to_string(),
            changed,
        }
    }

    fn handle_removed(&mut self, node: &HardwareNode) -> DispatchOutcome {
        let uid = match self.registry.find_by_hardware(node) {
            Some(dev) => dev.uid().to_string(),
            None => {
                warn!(
                    "Removed node {} is not registered",
                    node.syspath().display()
                );
                return DispatchOutcome::Missing;
            }
        };

        match self.registry.remove(&uid) {
            Some(mut dev) => {
                dev.detach();
                info!("Device removed: {} ({})", dev.uid(), dev.device_name);
                DispatchOutcome::Removed(dev)
            }
            None => DispatchOutcome::Missing,
        }
    }

    fn try_auto_authorize(&mut self, uid: &str) {
        match self.auto_authorize(uid) {
            Ok(AutoOutcome::Authorized(_)) => {
                info!("Automatically authorized {}", uid);
            }
            Ok(AutoOutcome::Skipped(reason)) => {
                debug!("Not authorizing {} automatically: {}", uid, reason);
            }
            Err(e) => {
                error!("Automatic authorization of {} failed: {}", uid, e);
            }
        }
    }

    /// The registered device with the given uid.
    pub fn lookup(&self, uid: &str) -> Option<&Device> {
        self.registry.find_by_uid(uid)
    }

    /// All registered devices, in registration order.
    pub fn list_attached(&self) -> Vec<&Device> {
        self.registry.iter().collect()
    }

    /// Grants bus access to the attached device `uid`.
    ///
    /// When the domain runs without security (or DisplayPort only) the
    /// firmware already connected the device and nothing is written. The
    /// node's `unique_id` must start with `uid` before anything is written
    /// (see [`sysfs::verify_uid`]). Policy and autoconnect on the registry
    /// entry change only after the store write succeeds.
    pub fn authorize(&mut self, uid: &str, mode: AuthorizeMode) -> Result<Authorization> {
        let security = self.security;
        let dev = attached_mut(&mut self.registry, uid)?;

        let written = if !security.requires_authorization() {
            info!(
                "Domain security is {}, {} needs no authorization",
                security,
                dev.uid()
            );
            false
        } else if dev.authorized.is_authorized() {
            info!("Device {} is already authorized", dev.uid());
            false
        } else {
            sysfs::verify_device_uid(dev)?;
            sysfs::authorize(dev)?;
            dev.authorized = AuthLevel::Authorized;
            true
        };

        // Persistence fields only change once the record is on disk.
        let stored = mode.stores();
        if stored {
            let mut record = dev.clone();
            if mode.auto {
                record.policy = Policy::Auto;
                record.autoconnect = true;
            }
            self.store.put(&record)?;
            dev.policy = record.policy;
            dev.autoconnect = record.autoconnect;
            dev.known = true;
        }

        Ok(Authorization {
            uid: uid.to_string(),
            written,
            stored,
        })
    }

    /// Authorizes `uid` if its stored policy says so.
    pub fn auto_authorize(&mut self, uid: &str) -> Result<AutoOutcome> {
        let dev = self
            .lookup(uid)
            .ok_or_else(|| Error::not_found(format!("attached device {}", uid)))?;

        let skip = if !dev.known {
            Some(SkipReason::NotStored)
        } else if dev.policy != Policy::Auto {
            Some(SkipReason::NotAuto)
        } else if dev.authorized.is_authorized() {
            Some(SkipReason::AlreadyAuthorized)
        } else {
            None
        };

        match skip {
            Some(reason) => Ok(AutoOutcome::Skipped(reason)),
            None => self
                .authorize(uid, AuthorizeMode::default())
                .map(AutoOutcome::Authorized),
        }
    }

    /// Persists the attached device `uid`.
    pub fn store_device(&mut self, uid: &str) -> Result<()> {
        let dev = attached_mut(&mut self.registry, uid)?;
        self.store.put(dev)?;
        dev.known = true;
        Ok(())
    }

    /// Updates the stored policy and/or autoconnect flag of `uid`.
    ///
    /// Starts from the stored record, or from the attached device when it
    /// has never been stored. The registry entry, if any, is updated too.
    pub fn set_policy(
        &mut self,
        uid: &str,
        policy: Option<Policy>,
        autoconnect: Option<bool>,
    ) -> Result<Device> {
        let mut dev = self.stored_or_attached(uid)?;

        if let Some(policy) = policy {
            dev.policy = policy;
        }
        if let Some(autoconnect) = autoconnect {
            dev.autoconnect = autoconnect;
        }

        self.store.put(&dev)?;
        dev.known = true;

        if let Some(entry) = self.registry.find_by_uid_mut(uid) {
            entry.policy = dev.policy;
            entry.autoconnect = dev.autoconnect;
            entry.known = true;
        }

        Ok(dev)
    }

    /// Ensures key material exists for `uid`.
    pub fn create_key(&mut self, uid: &str) -> Result<KeyHandle> {
        let dev = self.stored_or_attached(uid)?;
        let handle = self.store.create_key(&dev)?;

        if let Some(entry) = self.registry.find_by_uid_mut(uid) {
            entry.key = Some(handle.path().to_path_buf());
        }

        Ok(handle)
    }

    fn stored_or_attached(&self, uid: &str) -> Result<Device> {
        match self.store.get(uid) {
            Ok(dev) => Ok(dev),
            Err(e) if e.is_not_found() => self
                .lookup(uid)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("device {}", uid))),
            Err(e) => Err(e),
        }
    }
}

fn attached_mut<'a>(registry: &'a mut Registry, uid: &str) -> Result<&'a mut Device> {
    registry
        .find_by_uid_mut(uid)
        .filter(|dev| dev.is_attached())
        .ok_or_else(|| Error::not_found(format!("attached device {}", uid)))
}
