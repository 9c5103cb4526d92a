//! Sharded store client.
//!
//! [`ShardedClient`] routes every operation to one shard by its first
//! argument. The shard list is owned by a background membership watcher
//! and read here on every dispatch.
//!
//! ## Architecture
//!
//! - `backend`: the per-shard handle abstraction and its Valkey implementation
//! - `selector`: `(shard_count, key) -> index` functions
//!
//! ## Example
//!
//! ```rust,ignore
//! use shard_keeper::{KeeperConfig, ShardedClient};
//!
//! let client = ShardedClient::connect(KeeperConfig::default().with_env_overrides()).await?;
//! client.set("user:42", "alice").await?;
//! let name: Option<String> = client.get("user:42").await?;
//! ```

pub mod backend;
pub mod selector;

pub use backend::{
    Backend, BackendConfig, BackendConnector, BackendError, Value, ValkeyBackend, ValkeyConnector,
};
pub use selector::{Selector, byte_sum};

use std::sync::Arc;
use std::time::Instant;

use fred::types::FromValue;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::ShardIndex;
use crate::config::KeeperConfig;
use crate::coordination::{CoordinationService, ZooKeeperService};
use crate::error::{Error, Result};
use crate::health::HealthState;
use crate::membership::MembershipWatcher;
use crate::registry::{EndpointInfo, EndpointRegistry, EndpointSummary, Resolution};

/// Client backed by Valkey shards discovered through ZooKeeper.
pub type ValkeyShardedClient = ShardedClient<ValkeyBackend>;

/// Handle to the running membership task.
struct MembershipTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Routes operations to shards by key.
pub struct ShardedClient<B: Backend> {
    registry: Arc<EndpointRegistry<B>>,
    selector: RwLock<Selector>,
    health: Option<Arc<HealthState>>,
    membership: Mutex<Option<MembershipTask>>,
}

impl ShardedClient<ValkeyBackend> {
    /// Connect to the coordination service and the shards it lists.
    pub async fn connect(config: KeeperConfig) -> Result<Self> {
        Self::connect_with_health(config, None).await
    }

    /// Like [`connect`](Self::connect), recording metrics into `health`.
    #[instrument(skip(config, health), fields(address = %config.coordination_address, base_path = %config.base_path))]
    pub async fn connect_with_health(
        config: KeeperConfig,
        health: Option<Arc<HealthState>>,
    ) -> Result<Self> {
        config.validate()?;
        let coordination = ZooKeeperService::connect(&config.coordination_address).await?;
        let connector = ValkeyConnector::new(config.backend_config());
        Self::start(coordination, connector, &config, health).await
    }
}

impl<B: Backend> ShardedClient<B> {
    /// Run the initial membership sync and start watching for changes.
    ///
    /// Fails if the coordination session breaks during the initial sync. A
    /// missing shard parent node is not fatal: the client starts with no
    /// shards and keeps retrying in the background.
    pub async fn start<C, K>(
        coordination: C,
        connector: K,
        config: &KeeperConfig,
        health: Option<Arc<HealthState>>,
    ) -> Result<Self>
    where
        C: CoordinationService,
        K: BackendConnector<Backend = B>,
    {
        let registry = Arc::new(EndpointRegistry::new());
        let mut watcher = MembershipWatcher::new(
            Arc::new(coordination),
            Arc::new(connector),
            registry.clone(),
            config,
        )
        .with_health(health.clone());

        let pending = match watcher.resync().await {
            Ok(()) => None,
            Err(e) if e.is_session_level() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Initial membership sync incomplete, continuing in background");
                Some(e)
            }
        };

        if let Some(ref health) = health {
            health.set_ready(true).await;
        }
        let shards = registry.size().await;
        info!(path = %watcher.cluster_path(), shards, "Sharded client started");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(watcher.run(shutdown_rx, pending));

        Ok(Self {
            registry,
            selector: RwLock::new(Selector::default()),
            health,
            membership: Mutex::new(Some(MembershipTask { shutdown, handle })),
        })
    }

    /// Execute `operation` on the shard owning `args[0]`.
    ///
    /// The full argument list is forwarded unchanged and the store's reply
    /// or error is returned as is.
    #[instrument(skip(self, args), fields(arg_count = args.len()))]
    pub async fn dispatch(&self, operation: &str, args: Vec<Value>) -> Result<Value> {
        let started = Instant::now();
        let result = self.forward(operation, args).await;
        if let Some(ref health) = self.health {
            health
                .metrics
                .record_dispatch(operation, result.is_ok(), started.elapsed().as_secs_f64());
        }
        result
    }

    async fn forward(&self, operation: &str, args: Vec<Value>) -> Result<Value> {
        let key = routing_key(&args)?;
        let (index, endpoint) = self.route(&key).await?;
        debug!(shard = index, endpoint = %endpoint.address(), "Forwarding operation");
        Ok(endpoint.backend.execute(operation, args).await?)
    }

    /// Find the shard index and endpoint for `key` without executing anything.
    pub async fn route(&self, key: &str) -> Result<(ShardIndex, Arc<EndpointInfo<B>>)> {
        let selector = self.selector.read().await.clone();
        match self
            .registry
            .resolve(|shard_count| selector.select(shard_count, key))
            .await
        {
            Resolution::Found { index, endpoint } => Ok((index, endpoint)),
            Resolution::Missing { index, shard_count } => {
                Err(Error::ShardUnavailable { index, shard_count })
            }
            Resolution::Empty => Err(Error::ShardUnavailable {
                index: 0,
                shard_count: 0,
            }),
        }
    }

    /// Replace the selector; the next dispatch uses it.
    pub async fn set_selector(&self, selector: Selector) {
        info!(selector = selector.name(), "Installing shard selector");
        *self.selector.write().await = selector;
    }

    /// Name of the active selector.
    pub async fn selector_name(&self) -> &'static str {
        self.selector.read().await.name()
    }

    /// The shared endpoint registry.
    pub fn registry(&self) -> &Arc<EndpointRegistry<B>> {
        &self.registry
    }

    /// Number of registered shards.
    pub async fn shard_count(&self) -> usize {
        self.registry.size().await
    }

    /// Describe every registered shard.
    pub async fn snapshot(&self) -> Vec<EndpointSummary> {
        self.registry.snapshot().await
    }

    /// `GET key`.
    pub async fn get<R: FromValue>(&self, key: &str) -> Result<R> {
        self.call("GET", vec![key.into()]).await
    }

    /// `SET key value`.
    pub async fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.dispatch("SET", vec![key.into(), value.into()]).await?;
        Ok(())
    }

    /// `DEL key`, returning the number of keys removed.
    pub async fn del(&self, key: &str) -> Result<i64> {
        self.call("DEL", vec![key.into()]).await
    }

    /// `INCR key`.
    pub async fn incr(&self, key: &str) -> Result<i64> {
        self.call("INCR", vec![key.into()]).await
    }

    /// `INCRBY key delta`.
    pub async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.call("INCRBY", vec![key.into(), delta.into()]).await
    }

    /// `EXPIRE key seconds`, returning whether a timeout was set.
    pub async fn expire(&self, key: &str, seconds: i64) -> Result<bool> {
        self.call("EXPIRE", vec![key.into(), seconds.into()]).await
    }

    /// `EXISTS key`.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.call("EXISTS", vec![key.into()]).await
    }

    async fn call<R: FromValue>(&self, operation: &str, args: Vec<Value>) -> Result<R> {
        Ok(self.dispatch(operation, args).await?.convert()?)
    }

    /// Stop the membership watcher and close every shard handle.
    ///
    /// Later dispatches fail with [`Error::ShardUnavailable`].
    pub async fn shutdown(&self) {
        let Some(task) = self.membership.lock().await.take() else {
            return;
        };
        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Membership task ended abnormally");
        }
        self.registry.clear().await;
        if let Some(ref health) = self.health {
            health.set_ready(false).await;
            health.metrics.set_shards_registered(0);
        }
        info!("Sharded client shut down");
    }
}

/// Read the routing key from the first argument.
fn routing_key(args: &[Value]) -> Result<String> {
    let first = args.first().ok_or(Error::NoRoutingKey)?;
    match first {
        Value::String(s) => Ok(String::from(&**s)),
        Value::Bytes(b) => std::str::from_utf8(b)
            .map(str::to_owned)
            .map_err(|_| Error::InvalidRoutingKey("key bytes are not valid UTF-8".to_string())),
        Value::Integer(i) => Ok(i.to_string()),
        other => Err(Error::InvalidRoutingKey(format!("{:?}", other.kind()))),
    }
}
