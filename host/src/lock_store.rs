//! Occupancy locks, local and in shared storage.
//!
//! A lock moves through three states per world: absent, written locally
//! (`create_local`), and visible to other hosts (`upload_local`). Deleting
//! the remote then the local file returns it to absent. Locks never expire;
//! a crashed host leaves its lock visible until [`LockStore::release`] is run.

use crate::config::Layout;
use crate::error::{HostError, Removal};
use crate::remote::Remote;
use chrono::Utc;
use log::{debug, info, warn};
use shared::{Lock, ServerId};
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::fs;

/// Result of reading the remote lock.
#[derive(Debug)]
pub enum LockCheck {
    Found(Lock),
    /// The lock object does not exist.
    NotFound,
    /// The read failed or the object could not be parsed; the world may or
    /// may not be occupied.
    Unknown(HostError),
}

impl LockCheck {
    pub fn is_found(&self) -> bool {
        matches!(self, LockCheck::Found(_))
    }
}

pub struct LockStore {
    layout: Layout,
    remote: Arc<dyn Remote>,
}

impl LockStore {
    pub fn new(layout: Layout, remote: Arc<dyn Remote>) -> Self {
        LockStore { layout, remote }
    }

    /// Writes a lock owned by `username` into the local world directory.
    pub async fn create_local(&self, id: &ServerId, username: &str) -> Result<Lock, HostError> {
        let world = self.layout.world_dir(id);
        if !fs::metadata(&world).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(HostError::not_found("world", world.display()));
        }

        let lock = Lock::new(username, Utc::now());
        let path = self.layout.lock_file(id);
        fs::write(&path, lock.to_json()?)
            .await
            .map_err(|e| HostError::io(&path, e))?;

        debug!("Created local lock for {} owned by {}", id, username);
        Ok(lock)
    }

    pub async fn read_local(&self, id: &ServerId) -> Result<Option<Lock>, HostError> {
        let path = self.layout.lock_file(id);
        match fs::read_to_string(&path).await {
            Ok(content) => Lock::from_json(&content)
                .map(Some)
                .map_err(|source| HostError::Malformed { what: "lock", source }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HostError::io(&path, e)),
        }
    }

    pub async fn read_remote(&self, id: &ServerId) -> LockCheck {
        let key = self.layout.remote_lock(id);
        match self.remote.cat(&key).await {
            Ok(None) => LockCheck::NotFound,
            Ok(Some(content)) => match Lock::from_json(&content) {
                Ok(lock) => LockCheck::Found(lock),
                Err(source) => {
                    warn!("Remote lock {} is unreadable: {}", key, source);
                    LockCheck::Unknown(HostError::Malformed { what: "lock", source })
                }
            },
            Err(err) => LockCheck::Unknown(err),
        }
    }

    /// Publishes the local lock, making occupancy visible to other hosts.
    pub async fn upload_local(&self, id: &ServerId) -> Result<(), HostError> {
        let path = self.layout.lock_file(id);
        if fs::metadata(&path).await.is_err() {
            return Err(HostError::not_found("lock", path.display()));
        }

        self.remote.copy_file(&path, &self.layout.remote_lock(id)).await?;
        info!("Lock for {} is now visible", id);
        Ok(())
    }

    pub async fn delete_remote(&self, id: &ServerId) -> Result<Removal, HostError> {
        let existed = self.remote.delete_file(&self.layout.remote_lock(id)).await?;
        Ok(Removal { existed })
    }

    pub async fn delete_local(&self, id: &ServerId) -> Result<Removal, HostError> {
        let path = self.layout.lock_file(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(Removal { existed: true }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Removal { existed: false }),
            Err(e) => Err(HostError::io(&path, e)),
        }
    }

    /// Operator escape hatch for a lock left behind by a crashed host.
    /// Succeeds when at least one of the two deletions succeeded.
    pub async fn release(&self, id: &ServerId) -> Result<Removal, HostError> {
        let remote = self.delete_remote(id).await;
        let local = self.delete_local(id).await;

        match (remote, local) {
            (Ok(r), Ok(l)) => Ok(Removal {
                existed: r.existed || l.existed,
            }),
            (Ok(r), Err(err)) => {
                warn!("Remote lock released but local lock remains: {}", err);
                Ok(r)
            }
            (Err(err), Ok(l)) => {
                warn!("Local lock released but remote lock remains: {}", err);
                Ok(l)
            }
            (Err(err), Err(local_err)) => {
                warn!("Local lock removal failed as well: {}", local_err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryRemote;
    use tokio_test::{assert_err, assert_ok};

    const REMOTE_LOCK: &str = "pass_the_host/alpha/server.lock";

    fn id() -> ServerId {
        ServerId::new("alpha").unwrap()
    }

    fn store(data: &std::path::Path) -> (LockStore, Arc<MemoryRemote>) {
        let remote = Arc::new(MemoryRemote::default());
        let store = LockStore::new(Layout::new(data, "pass_the_host"), remote.clone());
        (store, remote)
    }

    #[tokio::test]
    async fn test_create_local_requires_world() {
        let data = tempfile::tempdir().unwrap();
        let (store, _) = store(data.path());

        assert!(assert_err!(store.create_local(&id(), "steve").await).is_not_found());
        assert!(store.read_local(&id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_upload_read() {
        let data = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(data.path().join("alpha")).unwrap();
        let (store, remote) = store(data.path());

        let created = store.create_local(&id(), "steve").await.unwrap();
        assert!(matches!(store.read_remote(&id()).await, LockCheck::NotFound));

        store.upload_local(&id()).await.unwrap();
        assert!(remote.get(REMOTE_LOCK).is_some());

        match store.read_remote(&id()).await {
            LockCheck::Found(lock) => {
                assert_eq!(lock.owner, "steve");
                assert_eq!(lock.epoch_millis, created.epoch_millis);
            }
            other => panic!("Unexpected check: {:?}", other),
        }
        assert_eq!(store.read_local(&id()).await.unwrap(), Some(created));
    }

    #[tokio::test]
    async fn test_upload_without_local_lock_fails() {
        let data = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(data.path().join("alpha")).unwrap();
        let (store, remote) = store(data.path());

        assert!(assert_err!(store.upload_local(&id()).await).is_not_found());
        assert!(remote.get(REMOTE_LOCK).is_none());
    }

    #[tokio::test]
    async fn test_malformed_remote_lock_is_unknown() {
        let data = tempfile::tempdir().unwrap();
        let (store, remote) = store(data.path());
        remote.put(REMOTE_LOCK, "{ not json");

        match store.read_remote(&id()).await {
            LockCheck::Unknown(HostError::Malformed { what, .. }) => assert_eq!(what, "lock"),
            other => panic!("Unexpected check: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_remote_lock_is_unknown() {
        let data = tempfile::tempdir().unwrap();
        let (store, remote) = store(data.path());
        remote.put(REMOTE_LOCK, "");

        match store.read_remote(&id()).await {
            LockCheck::Unknown(HostError::Malformed { what, .. }) => assert_eq!(what, "lock"),
            other => panic!("Unexpected check: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_failure_is_unknown() {
        let data = tempfile::tempdir().unwrap();
        let (store, remote) = store(data.path());
        remote.put(
            REMOTE_LOCK,
            r#"{"username":"alex","startedAt":"2024-05-01T10:00:00.000Z","timestamp":1714557600000}"#,
        );
        remote.fail_next(1);

        match store.read_remote(&id()).await {
            LockCheck::Unknown(err) => assert!(err.is_retryable()),
            other => panic!("Unexpected check: {:?}", other),
        }
        assert!(store.read_remote(&id()).await.is_found());
    }

    #[tokio::test]
    async fn test_deletes_are_idempotent() {
        let data = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(data.path().join("alpha")).unwrap();
        let (store, _) = store(data.path());

        assert_ok!(store.create_local(&id(), "steve").await);
        assert_ok!(store.upload_local(&id()).await);

        assert_eq!(assert_ok!(store.delete_remote(&id()).await), Removal { existed: true });
        assert_eq!(assert_ok!(store.delete_remote(&id()).await), Removal { existed: false });
        assert_eq!(assert_ok!(store.delete_local(&id()).await), Removal { existed: true });
        assert_eq!(assert_ok!(store.delete_local(&id()).await), Removal { existed: false });
    }

    #[tokio::test]
    async fn test_release_succeeds_when_remote_fails() {
        let data = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(data.path().join("alpha")).unwrap();
        let (store, remote) = store(data.path());
        store.create_local(&id(), "steve").await.unwrap();
        store.upload_local(&id()).await.unwrap();

        remote.fail_next(1);
        assert_eq!(store.release(&id()).await.unwrap(), Removal { existed: true });
        assert!(store.read_local(&id()).await.unwrap().is_none());
        assert!(remote.get(REMOTE_LOCK).is_some());

        assert_eq!(store.release(&id()).await.unwrap(), Removal { existed: true });
        assert!(remote.get(REMOTE_LOCK).is_none());
    }
}
