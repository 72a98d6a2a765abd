//! markersync-transport: remote stores for markersync
//!
//! `SshTransport` reaches the remote directory through the system OpenSSH
//! client; `LocalTransport` treats a local directory as the remote one.

pub mod local;
pub mod ssh;

pub use local::LocalTransport;
pub use ssh::{SshOptions, SshTransport};
