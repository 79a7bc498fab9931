//! # tbauth Model Library
//!
//! Shared types for the tbauth device authorization service.
//!
//! ## Overview
//!
//! This crate holds everything that does not touch sysfs or the store
//! directly:
//!
//! - **Device**: the runtime record of an attached or stored device
//! - **Enumerations**: authorization level, policy and domain security,
//!   each with a single canonical token table
//! - **Key Material**: generation and hex encoding of per-device secrets
//! - **Errors**: the error taxonomy used across the workspace
//!
//! ## Example Usage
//!
//! ```rust
//! use model::{Device, KeyMaterial, Policy};
//!
//! let mut dev = Device::new("d8f2a5c0-0d6e-4c12-9a3b-7f0e1c2d3e4f");
//! dev.device_name = "Dock".to_string();
//! dev.policy = "auto".parse::<Policy>().unwrap();
//!
//! let key = KeyMaterial::generate().unwrap();
//! assert_eq!(key.to_hex().len(), model::KEY_CHARS);
//! ```
//!
//! ## Modules
//!
//! - [`device`]: The `Device` record
//! - [`enums`]: `AuthLevel`, `Policy`, `Security`
//! - [`key`]: Key material
//! - [`error`]: Error types

pub mod device;
pub mod enums;
pub mod error;
pub mod key;

pub use device::Device;
pub use enums::{AuthLevel, Policy, Security};
pub use error::{Error, Result};
pub use key::{KeyMaterial, KEY_BYTES, KEY_CHARS};
