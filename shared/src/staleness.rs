//! Decides whether the local copy of a world is older than the shared one.
//!
//! Last-writer-wins on the `lastPlayedTimestamp` each host records with its
//! own wall clock. Clock skew between hosts can make this answer wrong; it is
//! a convenience for cooperating players, not a consistency mechanism.

use crate::SessionLedger;

/// Returns `true` when the world must be fetched before hosting.
///
/// - no local ledger: nothing to compare against, fetch
/// - no remote ledger (absent or unreadable): trust the local copy
/// - both: fetch only if the remote was played strictly later
pub fn should_pull(local: Option<&SessionLedger>, remote: Option<&SessionLedger>) -> bool {
    match (local, remote) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(local), Some(remote)) => {
            remote.last_played_epoch_millis > local.last_played_epoch_millis
        }
    }
}
