//! SSH transport layer.
//!
//! Connection, authentication, host key gating, and channel management on
//! top of russh.

pub mod auth;
pub mod client;
pub mod handler;
pub mod shell;
pub mod transport;

pub use client::SshClient;
pub use handler::HostKeyPolicy;
pub use shell::{ShellChannel, ShellEvent};
pub use transport::{CommandOutput, Transport};
