//! Interfaces to the collaborators around a mount session.
//!
//! Transport, error notification and UI publication are owned by the
//! surrounding application; a session only talks to them through these
//! traits.

use super::error::MountError;
use super::offer::DirectoryMap;
use serde::{Deserialize, Serialize};

/// Class of the link the device is currently connected over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportClass {
    /// TCP/IP on the local network
    Lan,
    /// Bluetooth RFCOMM; mounting is unsupported over it
    Bluetooth,
}

/// Identity and connection facts about the paired device.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Stable device identifier, used to name the mount point
    pub id: String,
    /// Human readable device name, for logs
    pub name: String,
    /// Resolved peer address, when the transport knows it
    pub host: Option<String>,
    /// Active transport class
    pub transport: TransportClass,
}

/// A typed JSON packet exchanged with the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Packet type, e.g. `kdeconnect.sftp`
    #[serde(rename = "type")]
    pub packet_type: String,
    /// Packet body
    pub body: serde_json::Value,
}

impl Packet {
    /// Creates a packet.
    pub fn new(packet_type: &str, body: serde_json::Value) -> Self {
        Self {
            packet_type: packet_type.to_string(),
            body,
        }
    }
}

/// Outbound channel to the peer.
pub trait Transport: Send + Sync {
    /// Queues a packet for delivery.
    fn send_packet(&self, packet: Packet);
}

/// Surfaces fatal errors to the user.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error that ended a mount.
    fn notify_error(&self, device: &DeviceIdentity, error: &MountError);
}

/// Publishes mounted directories as user actions.
pub trait DirectoryPublisher: Send + Sync {
    /// Replaces the "mount" action with one "open path" action per entry plus "unmount".
    fn publish(&self, directories: &DirectoryMap);

    /// Removes published entries and restores the "mount" action.
    fn retract(&self);

    /// Enables or disables the mount and unmount actions.
    fn set_actions_enabled(&self, enabled: bool);
}
