//! # tbauth daemon library
//!
//! Authorizes hot-plugged Thunderbolt devices and remembers, per device,
//! whether future sightings should be authorized without asking.
//!
//! ## Overview
//!
//! - **Persistent Store**: one TOML record and one key file per device uid
//! - **Registry**: the devices currently attached, matched by identity
//! - **Sysfs layer**: hardware snapshots, bus enumeration, the privileged
//!   `authorized` write and the kernel hotplug subscription
//! - **Manager**: reconciles hotplug events with the registry and store
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Manager                            │
//! │                                                           │
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────────┐  │
//! │  │  Registry  │   │   Store    │   │ sysfs authorizer │  │
//! │  └────────────┘   └────────────┘   └──────────────────┘  │
//! └───────────────────────────▲───────────────────────────────┘
//!                             │ HotplugEvent
//!          ┌──────────────────┴──────────────────┐
//!          │  Sysfs::enumerate    UeventMonitor  │
//!          └─────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Manager, Store, Sysfs};
//!
//! fn main() -> model::Result<()> {
//!     let mut manager = Manager::new(Store::new("/var/lib/tbauth"), Sysfs::new("/sys"));
//!     manager.initial_sync()?;
//!
//!     for device in manager.list_attached() {
//!         println!("{} {}", device.uid(), device.authorized);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`devices`]: Store and registry
//! - [`sysfs`]: Kernel device tree access and hotplug events
//! - [`manager`]: Event reconciliation and one-shot operations
//! - [`systemd`]: Readiness notification and shutdown signals

pub mod config;
pub mod devices;
pub mod manager;
pub mod sysfs;
pub mod systemd;

// Re-export model for convenience
pub use model;

pub use config::Config;
pub use devices::{KeyHandle, Registry, Store};
pub use manager::{
    Authorization, AuthorizeMode, AutoOutcome, DispatchOutcome, Manager, SkipReason,
};
pub use sysfs::{Action, HardwareNode, HotplugEvent, Sysfs, UeventMonitor};
