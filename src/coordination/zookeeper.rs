//! ZooKeeper implementation of the coordination primitives.
//!
//! Wraps `zookeeper-client`. The session client is swapped wholesale on
//! reconnect; watches registered on the old session resolve with a session
//! event which the watcher discards.

use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use zookeeper_client as zk;

use super::{CoordinationError, CoordinationService, NodeEvent, OneshotWatch};

/// ZooKeeper-backed coordination service.
pub struct ZooKeeperService {
    address: String,
    client: RwLock<zk::Client>,
}

impl ZooKeeperService {
    /// Connect to the ensemble at `address` (e.g. `127.0.0.1:2181`).
    #[instrument]
    pub async fn connect(address: &str) -> Result<Self, CoordinationError> {
        let client = zk::Client::connect(address)
            .await
            .map_err(|e| CoordinationError::Unavailable(e.to_string()))?;
        info!("Connected to ZooKeeper");
        Ok(Self {
            address: address.to_string(),
            client: RwLock::new(client),
        })
    }

    /// Get the ensemble address this service connects to.
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn session(&self) -> zk::Client {
        self.client.read().await.clone()
    }
}

/// One-shot ZooKeeper watch.
pub struct ZooKeeperWatch(zk::OneshotWatcher);

impl OneshotWatch for ZooKeeperWatch {
    async fn changed(self) -> NodeEvent {
        let event = self.0.changed().await;
        match event.event_type {
            zk::EventType::NodeChildrenChanged => NodeEvent::ChildrenChanged,
            zk::EventType::NodeDataChanged => NodeEvent::DataChanged,
            zk::EventType::NodeCreated => NodeEvent::Created,
            zk::EventType::NodeDeleted => NodeEvent::Deleted,
            _ => NodeEvent::SessionLost,
        }
    }
}

impl CoordinationService for ZooKeeperService {
    type Watch = ZooKeeperWatch;

    #[instrument(skip(self))]
    async fn list_children_and_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, Self::Watch), CoordinationError> {
        let (children, watcher) = self
            .session()
            .await
            .list_and_watch_children(path)
            .await
            .map_err(|e| classify_path(e, path))?;
        debug!(children = children.len(), "Listed children");
        Ok((children, ZooKeeperWatch(watcher)))
    }

    #[instrument(skip(self))]
    async fn get_data_and_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<u8>, Self::Watch), CoordinationError> {
        let (data, _stat, watcher) = self
            .session()
            .await
            .get_and_watch_data(path)
            .await
            .map_err(|e| classify_path(e, path))?;
        Ok((data, ZooKeeperWatch(watcher)))
    }

    #[instrument(skip(self), fields(address = %self.address))]
    async fn reconnect(&self) -> Result<(), CoordinationError> {
        let client = zk::Client::connect(&self.address)
            .await
            .map_err(|e| CoordinationError::Unavailable(e.to_string()))?;
        *self.client.write().await = client;
        info!("Re-established ZooKeeper session");
        Ok(())
    }
}

fn classify(e: zk::Error) -> CoordinationError {
    match e {
        zk::Error::ConnectionLoss | zk::Error::SessionExpired | zk::Error::ClientClosed => {
            CoordinationError::Unavailable(e.to_string())
        }
        other => CoordinationError::Request(other.to_string()),
    }
}

fn classify_path(e: zk::Error, path: &str) -> CoordinationError {
    match e {
        zk::Error::NoNode => CoordinationError::NoNode(path.to_string()),
        other => classify(other),
    }
}
