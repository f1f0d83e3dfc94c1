//! # Shared World Hosting
//!
//! Lets several machines take turns hosting the same game world. The world
//! directory lives in an S3-compatible bucket; whoever wants to host pulls
//! the latest copy, announces occupancy with a lock object, plays, pushes
//! the world back and removes the lock.
//!
//! ## Coordination Model
//!
//! ### Advisory Locking
//! Occupancy is a plain `server.lock` object next to the world. Creating it
//! is not atomic with checking for it, so two hosts racing within the same
//! second can both succeed. The lock never expires: a host that crashes
//! leaves it in place until an operator runs the release escape hatch.
//!
//! ### Freshness
//! Each world carries a `session.json` ledger. Its `lastPlayedTimestamp`,
//! compared between the local and the stored copy, decides whether a pull
//! is needed. This is last-writer-wins on wall-clock time and is therefore
//! sensitive to clock skew between machines.
//!
//! ### Unknown Is Not Free
//! A lock read that fails, or a lock object that cannot be parsed, is
//! reported as unknown. Nothing proceeds on an unknown lock state.
//!
//! ## Module Organization
//!
//! ### Remote Backends (`remote`, `rclone`, `local_remote`)
//! - [`remote::Remote`]: the storage operations everything else is built on
//! - [`rclone::RcloneRemote`]: runs the `rclone` tool per operation, passing
//!   credentials through its environment only
//! - [`local_remote::LocalRemote`]: a directory acting as the bucket
//!
//! ### Components (`lock_store`, `sync_engine`, `session_ledger`)
//! - Lock create, upload, read and idempotent delete
//! - Whole-world mirroring with progress reporting, listing and sizing
//! - Session history and playtime statistics
//!
//! ### Watching (`lock_monitor`)
//! A background task polling one lock with exponential backoff on failures,
//! reporting only transitions over an unbounded channel.
//!
//! ### Hosting Cycle (`coordinator`)
//! Composes the components into `acquire` and `release`.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use host::config::Layout;
//! use host::coordinator::Coordinator;
//! use host::local_remote::LocalRemote;
//! use shared::ServerId;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let remote = Arc::new(LocalRemote::new("/mnt/shared/bucket"));
//!     let coordinator = Coordinator::new(Layout::default(), remote);
//!     let world = ServerId::new("survival")?;
//!
//!     // Fails with `Locked` while someone else is hosting
//!     coordinator.acquire(&world, "steve", None).await?;
//!
//!     // ... run the game server ...
//!
//!     coordinator.release(&world, "steve", None).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod local_remote;
pub mod lock_monitor;
pub mod lock_store;
pub mod progress;
pub mod rclone;
pub mod remote;
pub mod session_ledger;
pub mod sync_engine;

pub use error::{HostError, Removal};
