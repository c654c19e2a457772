#![doc(html_root_url = "https://docs.rs/peermount/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! peermount: Mount a paired device's filesystem over SFTP
//!
//! A peer announces an SFTP server with a mount offer. peermount turns that
//! offer into a mount and publishes the offered directories as named
//! locations, then keeps the mount alive until the peer goes away.
//!
//! ## Features
//!
//! - Single-path and multi-path offers with common-prefix negotiation
//! - sshfs process backend with fatal-error detection
//! - Native volume fallback when sshfs is not installed
//! - One mount per device, with safe teardown of abandoned attempts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peermount::{MountOffer, Location, resolve};
//! use serde_json::json;
//!
//! # fn main() -> anyhow::Result<()> {
//! let offer = MountOffer::from_body(&json!({
//!     "ip": "10.0.0.2",
//!     "port": 1739,
//!     "user": "kdeconnect",
//!     "password": "secret",
//!     "multiPaths": ["/storage/emulated/0", "/storage/1234-ABCD"],
//!     "pathNames": ["Phone", "SD card"]
//! }))?;
//!
//! let dirs = resolve(&offer, Location::Remote { host: "10.0.0.2", port: 1739 })?;
//! for (name, uri) in dirs.iter() {
//!     println!("{}: {}", name, uri);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - `Sshfs`: Runs `sshfs` in the foreground on a private mount point
//! - `Native`: Mounts `sftp://host:port/` through the desktop volume service

pub mod modules;

pub use modules::backend::{Backend, BackendFactory, BackendKind, SystemBackends};
pub use modules::config::MountConfig;
pub use modules::device::{
    DeviceIdentity, DirectoryPublisher, ErrorReporter, Packet, Transport, TransportClass,
};
pub use modules::error::{MountError, Result};
pub use modules::offer::{resolve, DirectoryMap, Location, MountOffer};
pub use modules::session::{Collaborators, MountSession, MountState};
pub use modules::volume::GioVolumes;
