//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates. Host applications can depend on `smart-check-workspace`
//! and enable `desktop-shims` to get [`core_service`] wired with the desktop
//! bridges, without listing each crate themselves.

#[cfg(feature = "desktop-shims")]
pub use core_service;
