//! Bastion web SSH gateway library
//!
//! This module exposes the core functionality for use in integration tests
//! and the main binary.

// Public modules for integration testing
pub mod config;
pub mod directory;
pub mod error;
pub mod hostkeys;
pub mod monitor;
pub mod registry;
pub mod server;
pub mod ssh;

// Public modules for the binary
pub mod logging;

// Internal modules
pub(crate) mod fs_utils;
pub(crate) mod security_log;
