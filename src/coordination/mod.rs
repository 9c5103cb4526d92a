//! Coordination service primitives consumed by the membership watcher.
//!
//! The watcher only needs three things from the coordination service:
//! list a node's children with a watch, read a node's data with a watch,
//! and re-establish the session after it is lost. Watches are one-shot:
//! each registration delivers at most one [`NodeEvent`].
//!
//! ## Architecture
//!
//! - [`CoordinationService`]: the primitive surface, implemented by
//!   [`ZooKeeperService`] for production and by in-memory fakes in tests
//! - [`OneshotWatch`]: the handle returned alongside every watched read
//! - [`NodeEvent`]: what a fired watch reports

pub mod zookeeper;

use std::future::Future;

use thiserror::Error;

pub use zookeeper::ZooKeeperService;

/// Errors surfaced by coordination service calls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// The node does not exist (deleted between list and read, or never created).
    #[error("Node does not exist: {0}")]
    NoNode(String),

    /// Connection or session level failure; the whole session must be rebuilt.
    #[error("Coordination service unavailable: {0}")]
    Unavailable(String),

    /// Any other per-node failure.
    #[error("Coordination request failed: {0}")]
    Request(String),
}

impl CoordinationError {
    /// Check if this error invalidates the session rather than a single node.
    pub fn is_session_level(&self) -> bool {
        matches!(self, CoordinationError::Unavailable(_))
    }
}

/// Notification delivered by a fired one-shot watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEvent {
    /// The watched node gained or lost children.
    ChildrenChanged,
    /// The watched node's data was written.
    DataChanged,
    /// The watched node was created.
    Created,
    /// The watched node was deleted.
    Deleted,
    /// The session backing the watch ended; no further events will arrive.
    SessionLost,
}

impl std::fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeEvent::ChildrenChanged => write!(f, "ChildrenChanged"),
            NodeEvent::DataChanged => write!(f, "DataChanged"),
            NodeEvent::Created => write!(f, "Created"),
            NodeEvent::Deleted => write!(f, "Deleted"),
            NodeEvent::SessionLost => write!(f, "SessionLost"),
        }
    }
}

/// A registered one-shot watch.
pub trait OneshotWatch: Send + 'static {
    /// Wait for the single notification this watch will deliver.
    fn changed(self) -> impl Future<Output = NodeEvent> + Send;
}

/// Watchable hierarchical namespace.
pub trait CoordinationService: Send + Sync + 'static {
    /// Watch handle type returned by watched reads.
    type Watch: OneshotWatch;

    /// List the children of `path` and watch it for children changes.
    fn list_children_and_watch(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<(Vec<String>, Self::Watch), CoordinationError>> + Send;

    /// Read the data of `path` and watch it for data changes or deletion.
    fn get_data_and_watch(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<(Vec<u8>, Self::Watch), CoordinationError>> + Send;

    /// Tear down the current session and establish a new one.
    fn reconnect(&self) -> impl Future<Output = Result<(), CoordinationError>> + Send;
}

/// Join a parent path and a child name without doubling separators.
pub fn child_path(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child)
}
