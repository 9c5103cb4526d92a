//! shard-keeper library crate
//!
//! A client-side sharding layer for key/value stores. Shard membership is
//! published in a ZooKeeper namespace; the client watches it, keeps one
//! connection per shard, and forwards each operation to the shard selected
//! by its first argument.

pub mod client;
pub mod config;
pub mod coordination;
pub mod error;
pub mod health;
pub mod membership;
pub mod registry;

/// Position of a shard in the namespace (`<base_path>/cluster/<index>`).
pub type ShardIndex = u32;

pub use client::{Backend, BackendConnector, Selector, ShardedClient, ValkeyShardedClient, Value};
pub use config::{BackoffConfig, KeeperConfig, VacantPolicy};
pub use coordination::{CoordinationError, CoordinationService, NodeEvent, ZooKeeperService};
pub use error::{Error, Result};
pub use health::HealthState;
pub use registry::{EndpointInfo, EndpointRegistry, EndpointSummary};
