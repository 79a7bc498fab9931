//! Device bookkeeping.
//!
//! The [`Store`] persists user decisions across reboots; the [`Registry`]
//! tracks what is attached right now.

pub mod registry;
pub mod store;

pub use registry::Registry;
pub use store::{KeyHandle, Store};
