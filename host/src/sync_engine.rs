//! Moves whole worlds between the local data directory and shared storage.

use crate::config::Layout;
use crate::error::HostError;
use crate::remote::{Location, ProgressFn, Remote, StorageSize};
use log::{debug, info, warn};
use shared::layout::{FORGE_LIBRARIES_DIR, VERSIONS_DIR};
use shared::{classify, ServerId, ServerInfo, TransferProgress, WorldLayout};
use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const REMOVE_ATTEMPTS: u32 = 3;
const REMOVE_PAUSE: Duration = Duration::from_secs(2);

pub struct SyncEngine {
    layout: Layout,
    remote: Arc<dyn Remote>,
}

impl SyncEngine {
    pub fn new(layout: Layout, remote: Arc<dyn Remote>) -> Self {
        SyncEngine { layout, remote }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub async fn has_local_world(&self, id: &ServerId) -> bool {
        tokio::fs::metadata(self.layout.world_dir(id))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Whether storage holds any object of `id`. Errors are not absence.
    pub async fn has_remote_world(&self, id: &ServerId) -> Result<bool, HostError> {
        let size = self.remote.size(&self.layout.remote_world(id)).await?;
        Ok(size.count > 0)
    }

    /// Replaces the local copy of `id` with the stored one.
    pub async fn pull(&self, id: &ServerId, on_progress: Option<ProgressFn<'_>>) -> Result<(), HostError> {
        if let Some(callback) = on_progress {
            callback(TransferProgress::started());
        }

        let world = self.layout.world_dir(id);
        clear_directory(&world).await?;

        info!("Pulling {} into {}", id, world.display());
        self.remote
            .mirror(
                &Location::Remote(self.layout.remote_world(id)),
                &Location::Local(world),
                on_progress,
            )
            .await
    }

    /// Replaces the stored copy of `id` with the local one.
    pub async fn push(&self, id: &ServerId, on_progress: Option<ProgressFn<'_>>) -> Result<(), HostError> {
        let world = self.layout.world_dir(id);
        if !self.has_local_world(id).await {
            return Err(HostError::not_found("world", world.display()));
        }

        if let Some(callback) = on_progress {
            callback(TransferProgress::started());
        }

        info!("Pushing {} from {}", id, world.display());
        self.remote
            .mirror(
                &Location::Local(world),
                &Location::Remote(self.layout.remote_world(id)),
                on_progress,
            )
            .await
    }

    /// Deletes the stored world entirely. The local copy is left alone.
    pub async fn remove(&self, id: &ServerId) -> Result<(), HostError> {
        let key = self.layout.remote_world(id);
        info!("Deleting stored world {}", key);
        self.remote.purge(&key).await
    }

    /// Every world under the storage prefix with a best-effort guess of its
    /// server flavour.
    pub async fn list_available(&self) -> Result<Vec<ServerInfo>, HostError> {
        let prefix = self.layout.remote_key(&[]);
        let names = match self.remote.list_dirs(&prefix).await {
            Ok(names) => names,
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut servers = Vec::with_capacity(names.len());
        for name in names {
            let id = match ServerId::new(name.as_str()) {
                Ok(id) => id,
                Err(err) => {
                    warn!("Skipping stored entry {:?}: {}", name, err);
                    continue;
                }
            };

            let layout = self.world_layout(&id).await;
            let (kind, version) = classify(&layout);
            servers.push(ServerInfo {
                id: id.to_string(),
                name: id.to_string(),
                version,
                kind,
            });
        }

        Ok(servers)
    }

    /// Aggregate size of one world, or of everything under the prefix.
    pub async fn size_of(&self, id: Option<&ServerId>) -> Result<StorageSize, HostError> {
        let key = match id {
            Some(id) => self.layout.remote_world(id),
            None => self.layout.remote_key(&[]),
        };
        self.remote.size(&key).await
    }

    pub async fn check_access(&self) -> Result<(), HostError> {
        self.remote.check_access().await
    }

    async fn world_layout(&self, id: &ServerId) -> WorldLayout {
        let root = self.listing(&[id.as_str()]).await;

        let forge_versions = if root.iter().any(|e| e == "libraries/") {
            self.listing(&[id.as_str(), FORGE_LIBRARIES_DIR]).await
        } else {
            Vec::new()
        };

        let mut layout = WorldLayout {
            root,
            forge_versions,
            game_versions: Vec::new(),
        };
        if layout.has_dir(VERSIONS_DIR) {
            layout.game_versions = self.listing(&[id.as_str(), VERSIONS_DIR]).await;
        }

        layout
    }

    async fn listing(&self, segments: &[&str]) -> Vec<String> {
        let key = self.layout.remote_key(segments);
        match self.remote.list(&key).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!("Listing {} failed: {}", key, err);
                Vec::new()
            }
        }
    }
}

/// Removes `dir` before a pull. Files held open elsewhere (an antivirus
/// scan, a lingering server process) get a few chances to be released;
/// after that the mirror overwrites in place.
async fn clear_directory(dir: &Path) -> Result<(), HostError> {
    remove_with_retries(dir, || tokio::fs::remove_dir_all(dir)).await
}

async fn remove_with_retries<F, Fut>(dir: &Path, mut remove: F) -> Result<(), HostError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    for attempt in 1..=REMOVE_ATTEMPTS {
        match remove().await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) if is_busy(&e) => {
                warn!(
                    "Could not remove {} (attempt {}/{}): {}",
                    dir.display(),
                    attempt,
                    REMOVE_ATTEMPTS,
                    e
                );
                if attempt < REMOVE_ATTEMPTS {
                    tokio::time::sleep(REMOVE_PAUSE).await;
                }
            }
            Err(e) => return Err(HostError::io(dir, e)),
        }
    }

    warn!("Mirroring over {} in place", dir.display());
    Ok(())
}

fn is_busy(error: &std::io::Error) -> bool {
    matches!(error.kind(), ErrorKind::PermissionDenied | ErrorKind::ResourceBusy)
}
