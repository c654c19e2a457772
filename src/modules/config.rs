//! Runtime configuration.

use super::constants::*;
use super::error::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime environment for mount backends.
///
/// Every field has a default, so a config file only needs to name what it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Writable runtime directory; mount points live below it, one per device
    pub runtime_dir: PathBuf,
    /// Private key handed to sshfs as its identity file
    pub private_key: PathBuf,
    /// sshfs client program
    pub sshfs_program: String,
    /// FUSE-aware unmount program
    pub fusermount_program: String,
    /// Generic unmount program, used when fusermount is missing
    pub umount_program: String,
    /// gio command line tool for native volume mounts
    pub gio_program: String,
    /// ssh keepalive interval in seconds
    pub keepalive_secs: u64,
    /// Grace period between SIGTERM and SIGKILL, in milliseconds
    pub terminate_grace_ms: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            private_key: default_config_dir().join(PRIVATE_KEY_FILE),
            sshfs_program: SSHFS_PROGRAM.to_string(),
            fusermount_program: FUSERMOUNT_PROGRAM.to_string(),
            umount_program: UMOUNT_PROGRAM.to_string(),
            gio_program: GIO_PROGRAM.to_string(),
            keepalive_secs: KEEPALIVE_INTERVAL.as_secs(),
            terminate_grace_ms: TERMINATE_GRACE.as_millis() as u64,
        }
    }
}

impl MountConfig {
    /// Loads a JSON config file, filling unspecified fields with defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Grace period before a client is killed.
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

// /run/user/$UID/peermount, or a per-user directory under the system temp dir
fn default_runtime_dir() -> PathBuf {
    match env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join("peermount"),
        None => env::temp_dir().join(format!("peermount-{}", nix::unistd::getuid())),
    }
}

fn default_config_dir() -> PathBuf {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(dir).join("peermount");
    }
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".config").join("peermount"),
        None => PathBuf::from("/etc/peermount"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_partial_config() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"sshfs_program": "/opt/bin/sshfs", "keepalive_secs": 15}"#,
        )?;

        let config = MountConfig::load(&path)?;
        assert_eq!(config.sshfs_program, "/opt/bin/sshfs");
        assert_eq!(config.keepalive_secs, 15);
        assert_eq!(config.fusermount_program, FUSERMOUNT_PROGRAM);
        assert_eq!(config.terminate_grace(), TERMINATE_GRACE);
        Ok(())
    }

    #[test]
    fn test_default_key_path() {
        let config = MountConfig::default();
        assert!(config.private_key.ends_with(PRIVATE_KEY_FILE));
        assert!(config.runtime_dir.to_string_lossy().contains("peermount"));
    }
}
