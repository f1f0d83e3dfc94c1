//! Runtime settings and the path conventions shared by all components.
//!
//! Nothing here is read from or written to a configuration file; values come
//! from the command line or the environment and live only for the process.

use shared::{ServerId, DEFAULT_PREFIX, LOCK_FILE_NAME, SESSION_FILE_NAME};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TRANSFERS: u32 = 8;
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MONITOR_MAX_DELAY: Duration = Duration::from_secs(300);

/// Credentials and coordinates of the shared object store.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageTarget {
    pub provider: String,
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for StorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageTarget")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Where worlds live locally and under which prefix they live remotely.
///
/// Local: `<root>/<serverId>/...`
/// Remote: `<prefix>/<serverId>/...` inside the bucket.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    prefix: String,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Layout {
            root: root.into(),
            prefix,
        }
    }

    pub fn local_root(&self) -> &Path {
        &self.root
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn world_dir(&self, id: &ServerId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn lock_file(&self, id: &ServerId) -> PathBuf {
        self.world_dir(id).join(LOCK_FILE_NAME)
    }

    pub fn session_file(&self, id: &ServerId) -> PathBuf {
        self.world_dir(id).join(SESSION_FILE_NAME)
    }

    pub fn remote_world(&self, id: &ServerId) -> String {
        self.remote_key(&[id.as_str()])
    }

    pub fn remote_lock(&self, id: &ServerId) -> String {
        self.remote_key(&[id.as_str(), LOCK_FILE_NAME])
    }

    pub fn remote_session(&self, id: &ServerId) -> String {
        self.remote_key(&[id.as_str(), SESSION_FILE_NAME])
    }

    pub fn remote_key(&self, segments: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for segment in segments {
            let segment = segment.trim_matches('/');
            if segment.is_empty() {
                continue;
            }
            if !key.is_empty() {
                key.push('/');
            }
            key.push_str(segment);
        }
        key
    }
}

impl Default for Layout {
    fn default() -> Self {
        Layout::new(default_data_dir(), DEFAULT_PREFIX)
    }
}

/// Platform data directory, falling back to `./servers` when none exists.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("pass-the-host").join("servers"))
        .unwrap_or_else(|| PathBuf::from("servers"))
}

/// Tuning for transfers and lock polling.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub layout: Layout,
    pub sync_tool: PathBuf,
    pub transfers: u32,
    pub stats_interval: Duration,
    pub monitor_interval: Duration,
    pub monitor_max_delay: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            layout: Layout::default(),
            sync_tool: PathBuf::from("rclone"),
            transfers: DEFAULT_TRANSFERS,
            stats_interval: DEFAULT_STATS_INTERVAL,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            monitor_max_delay: DEFAULT_MONITOR_MAX_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ServerId {
        ServerId::new(s).unwrap()
    }

    #[test]
    fn test_remote_keys() {
        let layout = Layout::new("/data/servers", "pass_the_host");

        assert_eq!(layout.remote_world(&id("alpha")), "pass_the_host/alpha");
        assert_eq!(
            layout.remote_lock(&id("alpha")),
            "pass_the_host/alpha/server.lock"
        );
        assert_eq!(
            layout.remote_session(&id("alpha")),
            "pass_the_host/alpha/session.json"
        );
        assert_eq!(layout.remote_key(&[]), "pass_the_host");
    }

    #[test]
    fn test_prefix_slashes_are_normalized() {
        let layout = Layout::new("/data", "/worlds/shared/");
        assert_eq!(layout.prefix(), "worlds/shared");
        assert_eq!(layout.remote_world(&id("w")), "worlds/shared/w");

        let bare = Layout::new("/data", "");
        assert_eq!(bare.remote_lock(&id("w")), "w/server.lock");
    }

    #[test]
    fn test_local_paths() {
        let layout = Layout::new("/data/servers", "p");
        assert_eq!(
            layout.lock_file(&id("alpha")),
            PathBuf::from("/data/servers/alpha/server.lock")
        );
        assert_eq!(
            layout.session_file(&id("alpha")),
            PathBuf::from("/data/servers/alpha/session.json")
        );
    }

    #[test]
    fn test_storage_target_debug_redacts_secret() {
        let target = StorageTarget {
            provider: "Cloudflare".to_string(),
            endpoint: "https://example.r2.cloudflarestorage.com".to_string(),
            region: "auto".to_string(),
            bucket: "worlds".to_string(),
            access_key: "AKIA".to_string(),
            secret_key: "super-secret".to_string(),
        };

        let debug = format!("{:?}", target);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
