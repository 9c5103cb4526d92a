//! Membership watcher: keeps the endpoint registry in step with the
//! coordination namespace.
//!
//! One task owns all registry mutations. Every armed watch is awaited on its
//! own small task which forwards the notification, tagged with the session
//! epoch and its target, over a channel. The owning task handles
//! notifications one at a time, so changes to one shard are applied in the
//! order they were delivered.
//!
//! ```text
//! watch fired ──► waiter task ──► channel ──► handle()
//!                                               │ re-arm watch
//!                                               │ read payload
//!                                               ▼
//!                                        EndpointRegistry
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::ShardIndex;
use crate::client::backend::BackendConnector;
use crate::config::{BackoffConfig, KeeperConfig, VacantPolicy};
use crate::coordination::{
    CoordinationError, CoordinationService, NodeEvent, OneshotWatch, child_path,
};
use crate::error::Error;
use crate::health::HealthState;
use crate::registry::{EndpointInfo, EndpointRegistry};

use super::payload::{ShardPayload, parse_shard_index};
use super::state_machine::{WatchState, WatchTable, WatchTrigger};

/// What a watch was registered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    /// The parent node listing all shards.
    Children,
    /// A single shard node.
    Shard(ShardIndex),
}

/// Why the watcher should look at a target again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// A registered watch fired.
    Fired(NodeEvent),
    /// A previous read failed and should be retried.
    Retry,
}

/// A notification queued for the watcher task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    /// Session epoch the watch was registered in.
    pub epoch: u64,
    pub target: WatchTarget,
    pub kind: NotificationKind,
}

/// Keeps an [`EndpointRegistry`] synchronized with the shard namespace.
pub struct MembershipWatcher<C, K>
where
    C: CoordinationService,
    K: BackendConnector,
{
    coordination: Arc<C>,
    connector: Arc<K>,
    registry: Arc<EndpointRegistry<K::Backend>>,
    cluster_path: String,
    vacant_policy: VacantPolicy,
    backoff: BackoffConfig,
    health: Option<Arc<HealthState>>,
    watches: WatchTable,
    /// Shards present in the last listing, by node path.
    tracked: BTreeMap<ShardIndex, String>,
    /// Consecutive failed reads per shard.
    read_failures: BTreeMap<ShardIndex, u32>,
    epoch: u64,
    events_tx: mpsc::UnboundedSender<Notification>,
    events_rx: mpsc::UnboundedReceiver<Notification>,
}

impl<C, K> MembershipWatcher<C, K>
where
    C: CoordinationService,
    K: BackendConnector,
{
    /// Create a watcher; nothing is read until [`resync`](Self::resync) or [`run`](Self::run).
    pub fn new(
        coordination: Arc<C>,
        connector: Arc<K>,
        registry: Arc<EndpointRegistry<K::Backend>>,
        config: &KeeperConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            coordination,
            connector,
            registry,
            cluster_path: config.cluster_path(),
            vacant_policy: config.vacant_policy,
            backoff: config.reconnect.clone(),
            health: None,
            watches: WatchTable::new(),
            tracked: BTreeMap::new(),
            read_failures: BTreeMap::new(),
            epoch: 0,
            events_tx,
            events_rx,
        }
    }

    /// Attach health state for metrics and readiness.
    pub fn with_health(mut self, health: Option<Arc<HealthState>>) -> Self {
        self.health = health;
        self
    }

    /// Path whose children are the shard nodes.
    pub fn cluster_path(&self) -> &str {
        &self.cluster_path
    }

    /// Current session epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Shard indices present in the last listing.
    pub fn tracked(&self) -> Vec<ShardIndex> {
        self.tracked.keys().copied().collect()
    }

    /// Watch state of a path.
    pub fn watch_state(&self, path: &str) -> WatchState {
        self.watches.state(path)
    }

    /// Forget all registrations and re-read the whole namespace.
    ///
    /// Watches from earlier epochs are ignored once this starts. The
    /// registry keeps its entries until the new listing proves them gone.
    #[instrument(skip(self), fields(path = %self.cluster_path))]
    pub async fn resync(&mut self) -> Result<(), CoordinationError> {
        self.epoch += 1;
        self.watches.reset();
        debug!(epoch = self.epoch, "Starting full membership sync");
        self.sync_children(true).await?;
        if let Some(ref health) = self.health {
            health.mark_synced();
        }
        Ok(())
    }

    /// Process notifications until `shutdown` flips or its sender is dropped.
    ///
    /// `pending` is an error from an initial sync that still needs recovery.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>, pending: Option<CoordinationError>) {
        if let Some(err) = pending
            && !self.recover(err, &mut shutdown).await
        {
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Membership watcher stopping");
                    break;
                }
                Some(notification) = self.events_rx.recv() => {
                    if let Err(err) = self.handle(notification).await
                        && !self.recover(err, &mut shutdown).await
                    {
                        break;
                    }
                }
            }
        }
    }

    /// Handle one notification.
    ///
    /// Returns an error only when the whole listing must be rebuilt
    /// (session loss or the parent node vanishing).
    pub async fn handle(&mut self, notification: Notification) -> Result<(), CoordinationError> {
        if notification.epoch != self.epoch {
            debug!(
                epoch = notification.epoch,
                current = self.epoch,
                "Discarding notification from earlier session"
            );
            return Ok(());
        }

        if let NotificationKind::Fired(event) = notification.kind {
            self.record_event(&event.to_string());
            if event == NodeEvent::SessionLost {
                return Err(CoordinationError::Unavailable(
                    "coordination session lost".to_string(),
                ));
            }
        }

        match (notification.target, notification.kind) {
            (WatchTarget::Children, NotificationKind::Fired(_)) => {
                let path = self.cluster_path.clone();
                self.watches.apply(&path, WatchTrigger::Fired);
                self.sync_children(false).await
            }
            (WatchTarget::Children, NotificationKind::Retry) => {
                if self.watches.state(&self.cluster_path) == WatchState::Unwatched {
                    self.sync_children(false).await
                } else {
                    Ok(())
                }
            }
            (WatchTarget::Shard(index), NotificationKind::Fired(NodeEvent::Deleted)) => {
                let Some(path) = self.tracked.get(&index).cloned() else {
                    return Ok(());
                };
                // The node may have been recreated since; only a failed read forgets it.
                self.watches.apply(&path, WatchTrigger::Fired);
                self.load_shard(index, &path).await
            }
            (WatchTarget::Shard(index), NotificationKind::Fired(_)) => {
                let Some(path) = self.tracked.get(&index).cloned() else {
                    debug!(shard = index, "Notification for untracked shard");
                    return Ok(());
                };
                self.watches.apply(&path, WatchTrigger::Fired);
                self.load_shard(index, &path).await
            }
            (WatchTarget::Shard(index), NotificationKind::Retry) => {
                let Some(path) = self.tracked.get(&index).cloned() else {
                    return Ok(());
                };
                if self.watches.state(&path) == WatchState::Unwatched {
                    self.load_shard(index, &path).await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// List shard nodes, re-arm the children watch and reconcile the registry.
    ///
    /// With `force`, every present shard is re-read; otherwise only shards
    /// not seen in the previous listing.
    async fn sync_children(&mut self, force: bool) -> Result<(), CoordinationError> {
        let path = self.cluster_path.clone();
        let (children, watch) = match self.coordination.list_children_and_watch(&path).await {
            Ok(listing) => listing,
            Err(CoordinationError::NoNode(missing)) => {
                warn!(path = %missing, "Shard parent node missing, treating shard list as empty");
                self.watches.apply(&path, WatchTrigger::Dropped);
                let gone: Vec<ShardIndex> = self.tracked.keys().copied().collect();
                for index in gone {
                    self.forget_shard(index).await;
                }
                self.registry.clear().await;
                self.update_shard_gauge().await;
                return Err(CoordinationError::NoNode(missing));
            }
            Err(e) => {
                if !e.is_session_level() {
                    self.watches.apply(&path, WatchTrigger::Dropped);
                }
                return Err(e);
            }
        };
        self.arm(&path, WatchTarget::Children, watch);

        let mut present: BTreeMap<ShardIndex, String> = BTreeMap::new();
        for name in &children {
            match parse_shard_index(name) {
                Some(index) => {
                    present.insert(index, child_path(&path, name));
                }
                None => {
                    warn!(child = %name, "Ignoring shard node with non-numeric name");
                    self.record_failure("invalid_name");
                }
            }
        }

        let removed: Vec<ShardIndex> = self
            .tracked
            .keys()
            .filter(|index| !present.contains_key(index))
            .copied()
            .collect();
        for index in removed {
            self.forget_shard(index).await;
        }

        for (index, node_path) in present.iter().rev() {
            let is_new = !self.tracked.contains_key(index);
            if is_new {
                self.tracked.insert(*index, node_path.clone());
            }
            if is_new || force {
                self.load_shard(*index, node_path).await?;
            }
        }

        let registered = self.registry.size().await;
        debug!(shards = present.len(), registered, "Shard listing reconciled");
        self.update_shard_gauge().await;
        Ok(())
    }

    /// Read one shard's payload with a watch and apply it.
    ///
    /// Per-node failures are isolated; only session-level errors propagate.
    async fn load_shard(&mut self, index: ShardIndex, path: &str) -> Result<(), CoordinationError> {
        match self.coordination.get_data_and_watch(path).await {
            Ok((data, watch)) => {
                self.read_failures.remove(&index);
                self.arm(path, WatchTarget::Shard(index), watch);
                self.apply_payload(index, path, &data).await;
                Ok(())
            }
            Err(CoordinationError::NoNode(_)) => {
                debug!(shard = index, path, "Shard node vanished before read");
                self.forget_shard(index).await;
                Ok(())
            }
            Err(e) if e.is_session_level() => Err(e),
            Err(e) => {
                warn!(shard = index, path, error = %e, "Failed to read shard node, will retry");
                self.record_failure("coordination");
                self.watches.apply(path, WatchTrigger::Dropped);
                let attempt = self.read_failures.entry(index).or_insert(0);
                let delay = self.backoff.delay_for_attempt(*attempt);
                *attempt = attempt.saturating_add(1);
                self.schedule_retry(WatchTarget::Shard(index), delay);
                Ok(())
            }
        }
    }

    /// Apply a shard payload to the registry.
    async fn apply_payload(&mut self, index: ShardIndex, path: &str, data: &[u8]) {
        let payload = match ShardPayload::parse(data) {
            Ok(payload) => payload,
            Err(e) => {
                let err = Error::MalformedShardData {
                    path: path.to_string(),
                    reason: e.to_string(),
                };
                warn!(shard = index, error = %err, "Keeping previous endpoint");
                self.record_failure("malformed");
                return;
            }
        };

        match payload {
            ShardPayload::Vacant => match self.vacant_policy {
                VacantPolicy::Remove => {
                    if self.registry.remove(index).await {
                        info!(shard = index, "Shard vacated, endpoint removed");
                    }
                }
                VacantPolicy::KeepStale => {
                    debug!(shard = index, "Shard vacated, keeping last known endpoint");
                }
            },
            ShardPayload::Endpoint { host, port } => {
                if let Some(current) = self.registry.get(index).await
                    && current.is_at(&host, port)
                {
                    debug!(shard = index, endpoint = %current.address(), "Shard endpoint unchanged");
                    return;
                }

                match self.connector.connect(&host, port).await {
                    Ok(backend) => {
                        self.registry
                            .set(index, EndpointInfo::new(host.clone(), port, backend, path))
                            .await;
                        info!(shard = index, host = %host, port, "Shard endpoint updated");
                    }
                    Err(e) => {
                        warn!(shard = index, host = %host, port, error = %e, "Failed to connect to shard backend");
                        self.record_failure("connect");
                    }
                }
            }
        }
        self.update_shard_gauge().await;
    }

    /// Stop tracking a shard and drop its endpoint.
    async fn forget_shard(&mut self, index: ShardIndex) {
        self.read_failures.remove(&index);
        if let Some(path) = self.tracked.remove(&index) {
            self.watches.apply(&path, WatchTrigger::Dropped);
        }
        if self.registry.remove(index).await {
            info!(shard = index, "Shard removed from namespace, endpoint dropped");
            self.update_shard_gauge().await;
        }
    }

    /// Register the watch state and wait for the watch on a new task.
    fn arm(&mut self, path: &str, target: WatchTarget, watch: C::Watch) {
        let trigger = match self.watches.state(path) {
            WatchState::Firing => WatchTrigger::Rearmed,
            _ => WatchTrigger::Armed,
        };
        if !self.watches.apply(path, trigger) {
            // Already watching; the coordination service delivers one
            // notification per path, so the duplicate handle is dropped.
            return;
        }

        let tx = self.events_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let event = watch.changed().await;
            let _ = tx.send(Notification {
                epoch,
                target,
                kind: NotificationKind::Fired(event),
            });
        });
    }

    /// Queue a retry for `target` after `delay`.
    fn schedule_retry(&self, target: WatchTarget, delay: Duration) {
        let tx = self.events_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Notification {
                epoch,
                target,
                kind: NotificationKind::Retry,
            });
        });
    }

    /// Rebuild the session (if needed) and the full listing, with backoff.
    ///
    /// Returns `false` if shutdown was requested while recovering.
    async fn recover(&mut self, err: CoordinationError, shutdown: &mut watch::Receiver<bool>) -> bool {
        warn!(error = %err, "Membership sync interrupted, serving last known shards");
        let mut session_lost = err.is_session_level();
        let mut attempt: u32 = 0;

        loop {
            let delay = self.backoff.delay_for_attempt(attempt);
            tokio::select! {
                _ = shutdown.changed() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt = attempt.saturating_add(1);

            if session_lost {
                match self.coordination.reconnect().await {
                    Ok(()) => {
                        if let Some(ref health) = self.health {
                            health.metrics.record_reconnect();
                        }
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "Reconnect to coordination service failed");
                        continue;
                    }
                }
            }

            match self.resync().await {
                Ok(()) => {
                    info!(attempt, epoch = self.epoch, "Membership resynchronized");
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Membership resync failed");
                    session_lost = e.is_session_level();
                }
            }
        }
    }

    fn record_event(&self, kind: &str) {
        if let Some(ref health) = self.health {
            health.metrics.record_membership_event(kind);
        }
    }

    fn record_failure(&self, kind: &str) {
        if let Some(ref health) = self.health {
            health.metrics.record_shard_failure(kind);
        }
    }

    async fn update_shard_gauge(&self) {
        if let Some(ref health) = self.health {
            health.metrics.set_shards_registered(self.registry.size().await);
        }
    }
}
