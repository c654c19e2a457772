//! Mount offers and path negotiation.
//!
//! A peer advertises what it is willing to share as an offer: connection
//! details plus either a single root `path` or parallel `multiPaths` and
//! `pathNames` lists. This module turns an offer into a [`DirectoryMap`]
//! that points either into a local mount point or at the remote SFTP URI.

use super::constants::{CAMERA_SUBPATH, LABEL_ALL_FILES, LABEL_CAMERA};
use super::error::{MountError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Connection details and path manifest offered by a peer.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountOffer {
    /// Peer address. Usually overridden by the device's resolved host.
    #[serde(default, alias = "ip", skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// SFTP port on the peer
    pub port: u16,
    /// Login user
    pub user: String,
    /// Session password
    pub password: String,
    /// Single remote root, used when `multi_paths` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Remote paths, parallel to `path_names`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_paths: Option<Vec<String>>,
    /// Display names, parallel to `multi_paths`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_names: Option<Vec<String>>,
}

impl fmt::Debug for MountOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountOffer")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("path", &self.path)
            .field("multi_paths", &self.multi_paths)
            .field("path_names", &self.path_names)
            .finish()
    }
}

impl MountOffer {
    /// Parses and validates an offer from a packet body.
    pub fn from_body(body: &serde_json::Value) -> Result<Self> {
        let offer: MountOffer = serde_json::from_value(body.clone())
            .map_err(|e| MountError::InvalidOffer(e.to_string()))?;
        offer.validate()?;
        Ok(offer)
    }

    /// Checks the structural invariants of the offer.
    pub fn validate(&self) -> Result<()> {
        match (&self.multi_paths, &self.path_names) {
            (Some(paths), Some(names)) => {
                if paths.is_empty() {
                    return Err(MountError::InvalidOffer("empty multiPaths".to_string()));
                }
                if paths.len() != names.len() {
                    return Err(MountError::InvalidOffer(format!(
                        "{} paths but {} path names",
                        paths.len(),
                        names.len()
                    )));
                }
                let mut seen = HashSet::new();
                if let Some(dup) = names.iter().find(|name| !seen.insert(name.as_str())) {
                    return Err(MountError::InvalidOffer(format!(
                        "duplicate path name: {}",
                        dup
                    )));
                }
                Ok(())
            }
            (Some(_), None) => Err(MountError::InvalidOffer(
                "multiPaths without pathNames".to_string(),
            )),
            (None, _) if self.path.is_none() => Err(MountError::InvalidOffer(
                "neither path nor multiPaths present".to_string(),
            )),
            (None, _) => Ok(()),
        }
    }

    /// Returns a copy with the host replaced, when one is known.
    pub fn with_host(mut self, host: Option<&str>) -> Self {
        if let Some(host) = host {
            self.host = Some(host.to_string());
        }
        self
    }

    /// Splits the offer into the remote root to mount and the named
    /// sub-paths below it.
    pub fn layout(&self) -> Result<RemoteLayout> {
        self.validate()?;

        match (&self.multi_paths, &self.path_names) {
            (Some(paths), Some(names)) => {
                let split = common_prefix(paths);
                let entries = names
                    .iter()
                    .cloned()
                    .zip(split.residuals)
                    .collect();
                Ok(RemoteLayout {
                    root: split.root,
                    entries,
                })
            }
            _ => {
                let root = self.path.clone().unwrap_or_default();
                Ok(RemoteLayout {
                    root,
                    entries: vec![
                        (LABEL_ALL_FILES.to_string(), String::new()),
                        (LABEL_CAMERA.to_string(), format!("/{}", CAMERA_SUBPATH)),
                    ],
                })
            }
        }
    }
}

/// Remote root plus named residual paths relative to it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteLayout {
    /// Remote directory every entry lives under
    pub root: String,
    /// `(display name, residual path)` in offer order
    pub entries: Vec<(String, String)>,
}

/// Result of common-prefix extraction over a set of remote paths.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSplit {
    /// Longest shared segment prefix
    pub root: String,
    /// Remainder of each input path, always starting with `/`
    pub residuals: Vec<String>,
}

/// Computes the longest common segment-wise prefix of `paths`.
///
/// Comparison stops at the first segment that differs between any two
/// paths, or at the end of the first path.
pub fn common_prefix(paths: &[String]) -> PathSplit {
    let split: Vec<Vec<&str>> = paths.iter().map(|p| p.split('/').collect()).collect();

    let shared = match split.first() {
        Some(first) => first
            .iter()
            .enumerate()
            .take_while(|(i, segment)| split.iter().all(|p| p.get(*i) == Some(*segment)))
            .count(),
        None => 0,
    };

    let root = match split.first() {
        Some(first) => {
            let joined = join_segments(&first[..shared]);
            if shared > 0 && first[0].is_empty() {
                format!("/{}", joined)
            } else {
                joined
            }
        }
        None => String::new(),
    };

    let residuals = split
        .iter()
        .map(|p| format!("/{}", join_segments(&p[shared..])))
        .collect();

    PathSplit { root, residuals }
}

fn join_segments(segments: &[&str]) -> String {
    segments
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// Joins a URI (or path) and a sub-path with exactly one separator.
pub fn join_uri(base: &str, sub: &str) -> String {
    let sub = sub.trim_start_matches('/');
    if sub.is_empty() {
        return base.to_string();
    }
    if base.ends_with('/') {
        format!("{}{}", base, sub)
    } else {
        format!("{}/{}", base, sub)
    }
}

/// Where the entries of a [`DirectoryMap`] should point.
#[derive(Debug, Clone, Copy)]
pub enum Location<'a> {
    /// A local mount point that holds the offer's remote root.
    Local(&'a Path),
    /// The peer's SFTP server.
    Remote {
        /// Peer address
        host: &'a str,
        /// Peer SFTP port
        port: u16,
    },
}

/// Builds the directory map for an offer.
///
/// The same offer yields the same names for both locations, only the URI
/// scheme and base differ.
pub fn resolve(offer: &MountOffer, location: Location<'_>) -> Result<DirectoryMap> {
    let layout = offer.layout()?;

    let base = match location {
        Location::Local(mount_point) => format!("file://{}", mount_point.display()),
        Location::Remote { host, port } => {
            join_uri(&format!("sftp://{}:{}/", host, port), &layout.root)
        }
    };

    let mut directories = DirectoryMap::new();
    for (name, residual) in layout.entries {
        directories.insert(name, join_uri(&base, &residual));
    }
    Ok(directories)
}

/// Display name to URI mapping, in offer order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectoryMap {
    entries: Vec<(String, String)>,
}

impl DirectoryMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the URI for `name`.
    pub fn insert(&mut self, name: impl Into<String>, uri: impl Into<String>) {
        let name = name.into();
        let uri = uri.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = uri,
            None => self.entries.push((name, uri)),
        }
    }

    /// Looks up the URI for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, uri)| uri.as_str())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterates `(name, uri)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, u)| (n.as_str(), u.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn multi_offer(paths: &[&str], names: &[&str]) -> MountOffer {
        MountOffer {
            host: Some("192.168.1.20".to_string()),
            port: 1739,
            user: "kdeconnect".to_string(),
            password: "secret".to_string(),
            path: None,
            multi_paths: Some(paths.iter().map(|s| s.to_string()).collect()),
            path_names: Some(names.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn single_offer(path: &str) -> MountOffer {
        MountOffer {
            host: Some("192.168.1.20".to_string()),
            port: 1739,
            user: "kdeconnect".to_string(),
            password: "secret".to_string(),
            path: Some(path.to_string()),
            multi_paths: None,
            path_names: None,
        }
    }

    #[test]
    fn test_common_prefix() {
        let split = common_prefix(&["/a/b/c".to_string(), "/a/b/d".to_string()]);
        assert_eq!(split.root, "/a/b");
        assert_eq!(split.residuals, vec!["/c", "/d"]);
    }

    #[test]
    fn test_common_prefix_uneven_lengths() {
        let split = common_prefix(&["/a/b".to_string(), "/a/b/c".to_string()]);
        assert_eq!(split.root, "/a/b");
        assert_eq!(split.residuals, vec!["/", "/c"]);

        let split = common_prefix(&["/a/b/c".to_string(), "/a/b".to_string()]);
        assert_eq!(split.root, "/a/b");
        assert_eq!(split.residuals, vec!["/c", "/"]);
    }

    #[test]
    fn test_common_prefix_nothing_shared() {
        let split = common_prefix(&["/sdcard/DCIM".to_string(), "/storage/0000/Music".to_string()]);
        assert_eq!(split.root, "/");
        assert_eq!(split.residuals, vec!["/sdcard/DCIM", "/storage/0000/Music"]);
    }

    #[test]
    fn test_multi_path_entries_keyed_by_names() -> Result<()> {
        let offer = multi_offer(
            &[
                "/storage/emulated/0",
                "/storage/emulated/0/DCIM/Camera",
                "/storage/emulated/0/Music",
            ],
            &["All files", "Camera pictures", "Music"],
        );
        let mount_point = Path::new("/run/user/1000/peermount/phone");

        let dirs = resolve(&offer, Location::Local(mount_point))?;
        assert_eq!(dirs.len(), 3);
        assert_eq!(dirs.get("All files"), Some("file:///run/user/1000/peermount/phone"));
        assert_eq!(
            dirs.get("Camera pictures"),
            Some("file:///run/user/1000/peermount/phone/DCIM/Camera")
        );
        assert_eq!(dirs.get("Music"), Some("file:///run/user/1000/peermount/phone/Music"));
        Ok(())
    }

    #[test]
    fn test_local_and_remote_share_names() -> Result<()> {
        let offer = multi_offer(&["/a/b/c", "/a/b/d"], &["C", "D"]);

        let local = resolve(&offer, Location::Local(Path::new("/mnt/dev")))?;
        let remote = resolve(
            &offer,
            Location::Remote {
                host: "10.0.0.2",
                port: 1739,
            },
        )?;

        let local_names: Vec<_> = local.iter().map(|(n, _)| n).collect();
        let remote_names: Vec<_> = remote.iter().map(|(n, _)| n).collect();
        assert_eq!(local_names, remote_names);
        assert_eq!(local.get("C"), Some("file:///mnt/dev/c"));
        assert_eq!(remote.get("C"), Some("sftp://10.0.0.2:1739/a/b/c"));
        assert_eq!(remote.get("D"), Some("sftp://10.0.0.2:1739/a/b/d"));
        Ok(())
    }

    #[test]
    fn test_single_path_camera_convention() -> Result<()> {
        let offer = single_offer("/storage/emulated/0/");

        let remote = resolve(
            &offer,
            Location::Remote {
                host: "10.0.0.2",
                port: 1739,
            },
        )?;
        assert_eq!(remote.len(), 2);
        let all = remote.get(LABEL_ALL_FILES).unwrap();
        let camera = remote.get(LABEL_CAMERA).unwrap();
        assert_eq!(all, "sftp://10.0.0.2:1739/storage/emulated/0/");
        assert_eq!(camera, format!("{}DCIM/Camera", all));

        let local = resolve(&offer, Location::Local(Path::new("/mnt/dev")))?;
        assert_eq!(local.get(LABEL_ALL_FILES), Some("file:///mnt/dev"));
        assert_eq!(local.get(LABEL_CAMERA), Some("file:///mnt/dev/DCIM/Camera"));
        Ok(())
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let offer = multi_offer(&["/a", "/b"], &["A"]);
        assert!(matches!(
            resolve(&offer, Location::Local(Path::new("/mnt"))),
            Err(MountError::InvalidOffer(_))
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let offer = multi_offer(&["/a", "/b"], &["A", "A"]);
        assert!(matches!(offer.validate(), Err(MountError::InvalidOffer(_))));
    }

    #[test]
    fn test_empty_multi_paths_rejected() {
        let offer = multi_offer(&[], &[]);
        assert!(matches!(offer.validate(), Err(MountError::InvalidOffer(_))));

        let body = json!({
            "port": 1739,
            "user": "kdeconnect",
            "password": "hunter2",
            "multiPaths": [],
            "pathNames": []
        });
        assert!(matches!(
            MountOffer::from_body(&body),
            Err(MountError::InvalidOffer(_))
        ));
    }

    #[test]
    fn test_from_body() -> Result<()> {
        let body = json!({
            "ip": "10.0.0.2",
            "port": 1739,
            "user": "kdeconnect",
            "password": "hunter2",
            "path": "/storage/emulated/0",
            "multiPaths": ["/storage/emulated/0", "/storage/emulated/0/DCIM/Camera"],
            "pathNames": ["All files", "Camera pictures"]
        });

        let offer = MountOffer::from_body(&body)?;
        assert_eq!(offer.host.as_deref(), Some("10.0.0.2"));
        assert_eq!(offer.path_names.as_ref().map(Vec::len), Some(2));
        assert!(!format!("{:?}", offer).contains("hunter2"));

        let missing = json!({"port": 1739, "user": "u", "password": "p"});
        assert!(matches!(
            MountOffer::from_body(&missing),
            Err(MountError::InvalidOffer(_))
        ));
        Ok(())
    }

    #[test]
    fn test_directory_map_insert_replaces() {
        let mut dirs = DirectoryMap::new();
        dirs.insert("A", "file:///a");
        dirs.insert("B", "file:///b");
        dirs.insert("A", "file:///c");
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs.get("A"), Some("file:///c"));
        dirs.clear();
        assert!(dirs.is_empty());
    }
}
