//! # sync-store
//!
//! Shared durable store for liftsync.
//!
//! A small key-value and blob store used for last-known-state snapshots and
//! the persisted pending queue. It is written only by the sync coordinator
//! and may be read by the business layer at any time.
//!
//! ## Example
//!
//! ```rust,ignore
//! use liftsync_store::{FileStore, SharedStore, SharedStoreExt};
//!
//! let store = FileStore::open("/var/lib/liftsync").await?;
//! store.set("snapshot.timer", &timer).await?;
//! let timer: Option<TimerStatePayload> = store.get("snapshot.timer").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod file;
mod store;

pub use error::PersistenceError;
pub use file::FileStore;
pub use store::{validate_key, MemoryStore, SharedStore, SharedStoreExt};
