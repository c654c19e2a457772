//! Core mount modules.
//! 
//! This module provides the main components of a mount session:
//! 
//! - `constants`: Packet types, labels and default values
//! - `offer`: Offer parsing and path negotiation
//! - `session`: The per-device mount state machine
//! - `backend`: Backend selection and the backend contract
//! - `sshfs`: The sshfs process backend
//! - `native`: The native volume backend
//! - `volume`: Desktop volume service access

pub mod backend;
pub mod config;
pub mod constants;
/// Collaborator interfaces: transport, error reporting, publication.
pub mod device;
pub mod error;
pub mod native;
pub mod offer;
pub mod session;
pub mod sshfs;
pub mod volume;
