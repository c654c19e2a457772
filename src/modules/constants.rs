use std::time::Duration;

// Packet types
pub const PACKET_TYPE_SFTP: &str = "kdeconnect.sftp";
pub const PACKET_TYPE_SFTP_REQUEST: &str = "kdeconnect.sftp.request";

// Directory labels
pub const LABEL_ALL_FILES: &str = "All files";
pub const LABEL_CAMERA: &str = "Camera pictures";
pub const CAMERA_SUBPATH: &str = "DCIM/Camera";

// External programs
pub const SSHFS_PROGRAM: &str = "sshfs";
pub const FUSERMOUNT_PROGRAM: &str = "fusermount";
pub const UMOUNT_PROGRAM: &str = "umount";
pub const GIO_PROGRAM: &str = "gio";

/// Matches the peer heartbeat cadence (30s x3).
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Time a client gets between SIGTERM and SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Upper bound for one interactive native mount or unmount.
pub const VOLUME_OP_TIMEOUT: Duration = Duration::from_secs(60);

/// Substring of sshfs stderr output that means the ssh channel is gone for good.
pub const FATAL_MARKER: &str = "ssh_dispatch_run_fatal";

// Mount point permissions
pub const MOUNT_POINT_MODE: u32 = 0o700;

pub const PRIVATE_KEY_FILE: &str = "private.pem";
