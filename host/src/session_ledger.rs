//! Reads and writes `session.json`, the per-world occupancy history.

use crate::config::Layout;
use crate::error::HostError;
use crate::remote::Remote;
use chrono::{DateTime, SubsecRound, Utc};
use log::{info, warn};
use shared::{format_duration, ServerId, ServerStatistics, SessionLedger};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;

pub struct SessionTracker {
    layout: Layout,
    remote: Arc<dyn Remote>,
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn parse(content: &str) -> Result<SessionLedger, HostError> {
    SessionLedger::from_json(content).map_err(|source| HostError::Malformed {
        what: "session ledger",
        source,
    })
}

impl SessionTracker {
    pub fn new(layout: Layout, remote: Arc<dyn Remote>) -> Self {
        SessionTracker { layout, remote }
    }

    /// Starts a session for `username`. The world must already be present
    /// locally.
    pub async fn open(&self, id: &ServerId, username: &str) -> Result<SessionLedger, HostError> {
        let world = self.layout.world_dir(id);
        if !fs::metadata(&world).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(HostError::not_found("world", world.display()));
        }

        let now = now();
        let mut ledger = match self.read_local(id).await {
            Ok(Some(ledger)) => ledger,
            Ok(None) => SessionLedger::new(username, now),
            Err(HostError::Malformed { source, .. }) => {
                warn!("Starting a fresh session ledger for {}: {}", id, source);
                SessionLedger::new(username, now)
            }
            Err(err) => return Err(err),
        };

        if ledger.open(username, now) {
            warn!("Previous session on {} was never closed; recorded it as 0m 0s", id);
        }

        self.write(id, &ledger).await?;
        info!("Session opened on {} by {}", id, username);
        Ok(ledger)
    }

    /// Ends the open session, returning its duration in milliseconds. With
    /// no open session only the last-played fields are refreshed.
    pub async fn close(&self, id: &ServerId, username: &str) -> Result<Option<i64>, HostError> {
        let mut ledger = self
            .read_local(id)
            .await?
            .ok_or_else(|| HostError::not_found("session ledger", self.layout.session_file(id).display()))?;

        let duration = ledger.close(username, now());
        self.write(id, &ledger).await?;

        match duration {
            Some(millis) => info!(
                "Session on {} by {} closed after {}",
                id,
                username,
                format_duration(millis)
            ),
            None => info!("No open session on {}; last played time refreshed", id),
        }
        Ok(duration)
    }

    pub async fn statistics(&self, id: &ServerId) -> Result<Option<ServerStatistics>, HostError> {
        Ok(self.read_local(id).await?.map(|ledger| ledger.statistics()))
    }

    /// Uploads the local ledger so other hosts can compare timestamps.
    pub async fn push(&self, id: &ServerId) -> Result<(), HostError> {
        let path = self.layout.session_file(id);
        if fs::metadata(&path).await.is_err() {
            return Err(HostError::not_found("session ledger", path.display()));
        }

        self.remote
            .copy_file(&path, &self.layout.remote_session(id))
            .await
    }

    pub async fn read_local(&self, id: &ServerId) -> Result<Option<SessionLedger>, HostError> {
        let path = self.layout.session_file(id);
        match fs::read_to_string(&path).await {
            Ok(content) => parse(&content).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HostError::io(&path, e)),
        }
    }

    pub async fn read_remote(&self, id: &ServerId) -> Result<Option<SessionLedger>, HostError> {
        match self.remote.cat(&self.layout.remote_session(id)).await? {
            Some(content) => parse(&content).map(Some),
            None => Ok(None),
        }
    }

    async fn write(&self, id: &ServerId, ledger: &SessionLedger) -> Result<(), HostError> {
        let path = self.layout.session_file(id);
        write_file(&path, &ledger.to_json()?).await
    }
}

async fn write_file(path: &Path, content: &str) -> Result<(), HostError> {
    fs::write(path, content)
        .await
        .map_err(|e| HostError::io(path, e))
}
