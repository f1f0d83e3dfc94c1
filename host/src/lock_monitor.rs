//! Polls the remote lock of one world and reports occupancy changes.
//!
//! Storage offers no change notifications, so a background task reads the
//! lock on a timer. Only transitions are reported: a lock held across many
//! polls produces a single [`LockEvent::Detected`]. Failed reads back off
//! exponentially and never change the observed state.

use crate::lock_store::{LockCheck, LockStore};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use shared::{Lock, ServerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Detected {
        server_id: ServerId,
        owner: String,
        started_at: DateTime<Utc>,
    },
    Available {
        server_id: ServerId,
    },
    CheckFailed {
        server_id: ServerId,
        error: String,
        retry_delay: Duration,
    },
}

/// Poll delay: `min(base * 2^retries, max)`, back to `base` after a
/// successful check.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    retries: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max: max.max(base),
            retries: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        2u32.checked_pow(self.retries)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Records a failed check and returns the delay before the next one.
    pub fn fail(&mut self) -> Duration {
        self.retries = self.retries.saturating_add(1);
        self.delay()
    }

    pub fn reset(&mut self) -> Duration {
        self.retries = 0;
        self.base
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// Edge detector over successive successful lock reads. Starts out "free".
#[derive(Debug, Default)]
pub struct LockObserver {
    locked: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Transition {
    Locked(Lock),
    Freed,
}

impl LockObserver {
    pub fn observe(&mut self, lock: Option<Lock>) -> Option<Transition> {
        match (self.locked, lock) {
            (false, Some(lock)) => {
                self.locked = true;
                Some(Transition::Locked(lock))
            }
            (true, None) => {
                self.locked = false;
                Some(Transition::Freed)
            }
            _ => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct LockMonitor {
    store: Arc<LockStore>,
    events: UnboundedSender<LockEvent>,
    max_delay: Duration,
    running: Option<Running>,
}

impl LockMonitor {
    pub fn new(store: Arc<LockStore>, events: UnboundedSender<LockEvent>, max_delay: Duration) -> Self {
        LockMonitor {
            store,
            events,
            max_delay,
            running: None,
        }
    }

    /// Begins watching `id`, replacing any watch already running. The first
    /// check happens immediately. Must be called inside a tokio runtime.
    pub fn start(&mut self, id: ServerId, base_interval: Duration) {
        self.stop();

        info!("Watching lock of {} every {:?}", id, base_interval);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll(
            self.store.clone(),
            id,
            self.events.clone(),
            Backoff::new(base_interval, self.max_delay),
            cancel.clone(),
        ));

        self.running = Some(Running { cancel, handle });
    }

    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            running.handle.abort();
            debug!("Lock watch stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for LockMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll(
    store: Arc<LockStore>,
    id: ServerId,
    events: UnboundedSender<LockEvent>,
    mut backoff: Backoff,
    cancel: CancellationToken,
) {
    let mut observer = LockObserver::default();

    loop {
        let check = tokio::select! {
            _ = cancel.cancelled() => return,
            check = store.read_remote(&id) => check,
        };

        let (delay, event) = match check {
            LockCheck::Found(lock) => (backoff.reset(), observer.observe(Some(lock))),
            LockCheck::NotFound => (backoff.reset(), observer.observe(None)),
            LockCheck::Unknown(err) => {
                let delay = backoff.fail();
                warn!(
                    "Lock check for {} failed (retry {} in {:?}): {}",
                    id,
                    backoff.retries(),
                    delay,
                    err
                );
                let event = LockEvent::CheckFailed {
                    server_id: id.clone(),
                    error: err.to_string(),
                    retry_delay: delay,
                };
                if !deliver(&events, &cancel, event) {
                    return;
                }
                (delay, None)
            }
        };

        let event = event.map(|transition| match transition {
            Transition::Locked(lock) => {
                info!("{} is now hosted by {}", id, lock.owner);
                LockEvent::Detected {
                    server_id: id.clone(),
                    owner: lock.owner,
                    started_at: lock.started_at,
                }
            }
            Transition::Freed => {
                info!("{} is available", id);
                LockEvent::Available { server_id: id.clone() }
            }
        });

        if let Some(event) = event {
            if !deliver(&events, &cancel, event) {
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Sends unless the watch was stopped. `false` ends the poll loop.
fn deliver(events: &UnboundedSender<LockEvent>, cancel: &CancellationToken, event: LockEvent) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    events.send(event).is_ok()
}
