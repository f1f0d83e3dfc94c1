//! One hosting cycle: take occupancy of a world, then hand it back.
//!
//! `acquire` refuses to proceed unless the remote lock is known to be
//! absent, fetches the world when the stored copy is newer, and only then
//! publishes a lock. `release` publishes the world before the lock
//! disappears, so nobody can pull an outdated copy.

use crate::config::Layout;
use crate::error::{HostError, Removal};
use crate::lock_store::{LockCheck, LockStore};
use crate::remote::{ProgressFn, Remote};
use crate::session_ledger::SessionTracker;
use crate::sync_engine::SyncEngine;
use log::{info, warn};
use shared::{should_pull, Lock, ServerId, SessionLedger};
use std::sync::Arc;

#[derive(Debug)]
pub struct Acquired {
    pub lock: Lock,
    pub pulled: bool,
    pub ledger: SessionLedger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    /// Length of the session that was closed, if one was open.
    pub session_millis: Option<i64>,
}

pub struct Coordinator {
    locks: Arc<LockStore>,
    sync: SyncEngine,
    sessions: SessionTracker,
}

impl Coordinator {
    pub fn new(layout: Layout, remote: Arc<dyn Remote>) -> Self {
        Coordinator {
            locks: Arc::new(LockStore::new(layout.clone(), remote.clone())),
            sync: SyncEngine::new(layout.clone(), remote.clone()),
            sessions: SessionTracker::new(layout, remote),
        }
    }

    pub fn locks(&self) -> &Arc<LockStore> {
        &self.locks
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    pub async fn acquire(
        &self,
        id: &ServerId,
        username: &str,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<Acquired, HostError> {
        match self.locks.read_remote(id).await {
            LockCheck::NotFound => {}
            LockCheck::Found(lock) => {
                return Err(HostError::Locked {
                    server_id: id.to_string(),
                    owner: lock.owner,
                    started_at: lock.started_at,
                })
            }
            LockCheck::Unknown(err) => {
                return Err(HostError::LockUnknown {
                    server_id: id.to_string(),
                    source: Box::new(err),
                })
            }
        }

        let local = self.sessions.read_local(id).await.unwrap_or_else(|err| {
            warn!("Ignoring local session ledger of {}: {}", id, err);
            None
        });
        let remote = self.sessions.read_remote(id).await.unwrap_or_else(|err| {
            warn!("Could not read stored session ledger of {}: {}", id, err);
            None
        });

        let pulled = if !should_pull(local.as_ref(), remote.as_ref()) {
            info!("Local copy of {} is current", id);
            false
        } else if self.sync.has_local_world(id).await && !self.sync.has_remote_world(id).await? {
            info!("{} has never been published; keeping the local copy", id);
            false
        } else {
            self.sync.pull(id, on_progress).await?;
            true
        };

        let lock = self.locks.create_local(id, username).await?;

        if let Err(err) = self.locks.upload_local(id).await {
            self.discard_lock(id, false).await;
            return Err(err);
        }

        let ledger = match self.sessions.open(id, username).await {
            Ok(ledger) => ledger,
            Err(err) => {
                self.discard_lock(id, true).await;
                return Err(err);
            }
        };

        info!("{} acquired {}", username, id);
        Ok(Acquired { lock, pulled, ledger })
    }

    pub async fn release(
        &self,
        id: &ServerId,
        username: &str,
        on_progress: Option<ProgressFn<'_>>,
    ) -> Result<Released, HostError> {
        let (session_millis, has_ledger) = match self.sessions.close(id, username).await {
            Ok(duration) => (duration, true),
            Err(err) if err.is_not_found() => {
                warn!("{} has no session ledger to close", id);
                (None, false)
            }
            Err(err) => return Err(err),
        };

        self.sync.push(id, on_progress).await?;
        if has_ledger {
            self.sessions.push(id).await?;
        }

        let remote = self.locks.delete_remote(id).await?;
        if !remote.existed {
            warn!("Stored lock of {} was already gone", id);
        }
        self.locks.delete_local(id).await?;

        info!("{} released {}", username, id);
        Ok(Released { session_millis })
    }

    pub async fn status(&self, id: &ServerId) -> LockCheck {
        self.locks.read_remote(id).await
    }

    pub async fn force_release(&self, id: &ServerId) -> Result<Removal, HostError> {
        warn!("Force releasing the lock of {}", id);
        self.locks.release(id).await
    }

    async fn discard_lock(&self, id: &ServerId, uploaded: bool) {
        if uploaded {
            if let Err(err) = self.locks.delete_remote(id).await {
                warn!("Could not withdraw stored lock of {}: {}", id, err);
            }
        }
        if let Err(err) = self.locks.delete_local(id).await {
            warn!("Could not remove local lock of {}: {}", id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_remote::LocalRemote;
    use std::path::Path;
    use tokio_test::{assert_err, assert_ok};

    const REMOTE_LEDGER: &str = r#"{
  "lastPlayed": "1970-01-01T00:00:00.500Z",
  "lastPlayedTimestamp": 500,
  "username": "alex",
  "sessions": []
}"#;

    struct Fixture {
        bucket: tempfile::TempDir,
        data: tempfile::TempDir,
        coordinator: Coordinator,
    }

    impl Fixture {
        fn stored(&self, rel: &str) -> std::path::PathBuf {
            self.bucket.path().join("pass_the_host").join(rel)
        }

        fn local(&self, rel: &str) -> std::path::PathBuf {
            self.data.path().join(rel)
        }
    }

    fn fixture() -> Fixture {
        let bucket = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::new(
            Layout::new(data.path(), "pass_the_host"),
            Arc::new(LocalRemote::new(bucket.path())),
        );
        Fixture { bucket, data, coordinator }
    }

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn id() -> ServerId {
        ServerId::new("alpha").unwrap()
    }

    #[tokio::test]
    async fn test_acquire_refuses_held_lock() {
        let f = fixture();
        write(&f.stored("alpha/level.dat"), "world");
        write(
            &f.stored("alpha/server.lock"),
            r#"{"username":"sam","startedAt":"2024-05-01T10:00:00.000Z","timestamp":1714557600000}"#,
        );

        match f.coordinator.acquire(&id(), "steve", None).await {
            Err(HostError::Locked { owner, .. }) => assert_eq!(owner, "sam"),
            other => panic!("Unexpected result: {:?}", other),
        }
        assert!(!f.local("alpha").exists());
    }

    #[tokio::test]
    async fn test_acquire_refuses_unreadable_lock() {
        let f = fixture();
        write(&f.stored("alpha/level.dat"), "world");
        write(&f.stored("alpha/server.lock"), "garbage");

        let err = assert_err!(f.coordinator.acquire(&id(), "steve", None).await);
        assert!(matches!(err, HostError::LockUnknown { .. }));
        assert!(!f.local("alpha").exists());
    }

    #[tokio::test]
    async fn test_acquire_pulls_newer_world() {
        let f = fixture();
        write(&f.stored("alpha/level.dat"), "remote");
        write(&f.stored("alpha/session.json"), REMOTE_LEDGER);

        let acquired = assert_ok!(f.coordinator.acquire(&id(), "steve", None).await);

        assert!(acquired.pulled);
        assert_eq!(acquired.lock.owner, "steve");
        assert_eq!(acquired.ledger.username, "steve");
        assert_eq!(acquired.ledger.sessions.len(), 1);
        assert_eq!(
            std::fs::read_to_string(f.local("alpha/level.dat")).unwrap(),
            "remote"
        );
        assert!(f.stored("alpha/server.lock").exists());
        assert!(f.coordinator.status(&id()).await.is_found());
    }

    #[tokio::test]
    async fn test_acquire_keeps_unpublished_world() {
        let f = fixture();
        write(&f.local("alpha/level.dat"), "fresh");

        let acquired = assert_ok!(f.coordinator.acquire(&id(), "steve", None).await);

        assert!(!acquired.pulled);
        assert_eq!(std::fs::read_to_string(f.local("alpha/level.dat")).unwrap(), "fresh");
        assert!(f.stored("alpha/server.lock").exists());
    }

    #[tokio::test]
    async fn test_acquire_pulls_stored_world_without_ledger() {
        let f = fixture();
        write(&f.stored("alpha/level.dat"), "newer-remote");
        write(&f.local("alpha/level.dat"), "stale-local");

        let acquired = assert_ok!(f.coordinator.acquire(&id(), "steve", None).await);
        assert!(acquired.pulled);
        assert_eq!(
            std::fs::read_to_string(f.local("alpha/level.dat")).unwrap(),
            "newer-remote"
        );

        assert_ok!(f.coordinator.release(&id(), "steve", None).await);
        assert_eq!(
            std::fs::read_to_string(f.stored("alpha/level.dat")).unwrap(),
            "newer-remote"
        );
    }

    #[tokio::test]
    async fn test_acquire_of_missing_world_leaves_no_lock() {
        let f = fixture();

        let err = assert_err!(f.coordinator.acquire(&id(), "steve", None).await);
        assert!(err.is_not_found());
        assert!(!f.stored("alpha/server.lock").exists());
        assert!(!f.local("alpha/server.lock").exists());
    }

    #[tokio::test]
    async fn test_release_publishes_then_unlocks() {
        let f = fixture();
        write(&f.stored("alpha/level.dat"), "remote");
        write(&f.stored("alpha/session.json"), REMOTE_LEDGER);
        assert_ok!(f.coordinator.acquire(&id(), "steve", None).await);

        write(&f.local("alpha/level.dat"), "played");
        let released = assert_ok!(f.coordinator.release(&id(), "steve", None).await);

        assert!(released.session_millis.is_some());
        assert_eq!(std::fs::read_to_string(f.stored("alpha/level.dat")).unwrap(), "played");
        assert!(!f.stored("alpha/server.lock").exists());
        assert!(!f.local("alpha/server.lock").exists());

        let stored = f.coordinator.sessions().read_remote(&id()).await.unwrap().unwrap();
        assert!(stored.last_played_epoch_millis > 500);
        assert!(stored.open_entry().is_none());
    }

    #[tokio::test]
    async fn test_force_release() {
        let f = fixture();
        write(
            &f.stored("alpha/server.lock"),
            r#"{"username":"sam","startedAt":"2024-05-01T10:00:00.000Z"}"#,
        );

        let removal = assert_ok!(f.coordinator.force_release(&id()).await);
        assert!(removal.existed);
        assert!(matches!(f.coordinator.status(&id()).await, LockCheck::NotFound));
    }
}
