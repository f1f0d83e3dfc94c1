//! Shared object storage as seen by the coordination components.

use crate::error::HostError;
use async_trait::async_trait;
use serde::Deserialize;
use shared::TransferProgress;
use std::fmt;
use std::path::{Path, PathBuf};

/// Callback receiving transfer progress while a mirror runs.
pub type ProgressFn<'a> = &'a (dyn Fn(TransferProgress) + Send + Sync);

/// One end of a mirror operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    /// Key relative to the bucket root, e.g. `pass_the_host/alpha`.
    Remote(String),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Remote(key) => write!(f, "remote:{}", key),
        }
    }
}

/// Aggregate object count and size under a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct StorageSize {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub bytes: u64,
}

/// Operations the coordination layer needs from the shared store.
///
/// Missing objects surface as `Ok(None)` / `Ok(false)` where the operation
/// has a natural "absent" answer and as [`HostError::NotFound`] otherwise.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Reads a whole object as text. `None` when it does not exist.
    async fn cat(&self, key: &str) -> Result<Option<String>, HostError>;

    /// Uploads a single local file to `key`, replacing any existing object.
    async fn copy_file(&self, local: &Path, key: &str) -> Result<(), HostError>;

    /// Deletes one object. Returns whether it existed.
    async fn delete_file(&self, key: &str) -> Result<bool, HostError>;

    /// Entries directly under `key`; directories end with `/`.
    async fn list(&self, key: &str) -> Result<Vec<String>, HostError>;

    /// Names of the directories directly under `key`, without trailing `/`.
    async fn list_dirs(&self, key: &str) -> Result<Vec<String>, HostError>;

    /// Deletes everything under `key`.
    async fn purge(&self, key: &str) -> Result<(), HostError>;

    async fn size(&self, key: &str) -> Result<StorageSize, HostError>;

    /// Verifies credentials and bucket by listing its root.
    async fn check_access(&self) -> Result<(), HostError>;

    /// Makes `to` an exact copy of `from`, deleting files missing from `from`.
    async fn mirror(
        &self,
        from: &Location,
        to: &Location,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<(), HostError>;
}
