//! Shard membership tracking.
//!
//! - `payload`: shard node name and payload parsing
//! - `state_machine`: watch registration lifecycle
//! - `watcher`: the task that mirrors the shard namespace into the registry

pub mod payload;
pub mod state_machine;
pub mod watcher;

pub use payload::{PayloadError, ShardPayload, VACANT_SENTINEL, parse_shard_index};
pub use state_machine::{WatchState, WatchStateMachine, WatchTable, WatchTrigger};
pub use watcher::{MembershipWatcher, Notification, NotificationKind, WatchTarget};
