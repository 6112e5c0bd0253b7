//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the Smart Check session
//! core:
//! - Logging and tracing infrastructure
//! - Configuration management
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that other modules depend on.
//! It establishes the configuration builder, logging conventions and
//! redaction helpers used throughout the system.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{CoreConfig, CoreConfigBuilder, FeatureFlags, SessionSettings};
pub use error::{Error, Result};
