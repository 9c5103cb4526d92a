//! Backend store handles.
//!
//! A [`Backend`] is one connection to one shard's store. It exposes a single
//! forwarding capability, [`Backend::execute`], which takes an operation name
//! and its positional arguments and returns the store's reply. The router
//! never enumerates commands: anything the store understands can be sent.
//!
//! [`ValkeyBackend`] implements this on top of a centralized `fred` client.

use std::future::Future;
use std::time::Duration;

use fred::prelude::*;
use fred::types::{ClusterHash, CustomCommand};
use tracing::{debug, instrument, warn};

/// Reply and argument type shared with the store client.
pub use fred::types::Value;

/// Error type raised by backend stores.
pub type BackendError = fred::error::Error;

/// Commands that park the connection until data arrives.
const BLOCKING_COMMANDS: &[&str] = &[
    "BLPOP",
    "BRPOP",
    "BRPOPLPUSH",
    "BLMOVE",
    "BLMPOP",
    "BZPOPMIN",
    "BZPOPMAX",
    "BZMPOP",
];

/// One connection to a shard's backend store.
pub trait Backend: Send + Sync + 'static {
    /// Execute `operation` with `args` and return the raw reply.
    fn execute(
        &self,
        operation: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<Value, BackendError>> + Send;

    /// Close the connection. Commands already queued on it still complete.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Factory for backend handles, invoked by the membership watcher.
pub trait BackendConnector: Send + Sync + 'static {
    /// Handle type produced by this connector.
    type Backend: Backend;

    /// Open a handle to the store at `host:port`.
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = Result<Self::Backend, BackendError>> + Send;
}

/// Connection settings applied to every shard connection.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Connection timeout.
    pub connection_timeout: Duration,
    /// Command timeout.
    pub command_timeout: Duration,
    /// Password for authentication.
    pub password: Option<String>,
    /// Connect with TLS using the platform's root certificates.
    pub tls: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            password: None,
            tls: false,
        }
    }
}

impl BackendConfig {
    /// Set password.
    pub fn with_password(mut self, password: String) -> Self {
        self.password = Some(password);
        self
    }

    /// Set connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Enable or disable TLS.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }
}

/// Valkey/Redis handle for a single shard.
pub struct ValkeyBackend {
    client: Client,
    host: String,
    port: u16,
}

impl ValkeyBackend {
    /// Create and connect a client for a single (non-clustered) node.
    #[instrument(skip(config), fields(tls = config.tls))]
    pub async fn connect(host: &str, port: u16, config: &BackendConfig) -> Result<Self, BackendError> {
        let mut redis_config = Config {
            server: ServerConfig::Centralized {
                server: Server::new(host, port),
            },
            ..Default::default()
        };

        if let Some(ref password) = config.password {
            redis_config.password = Some(password.clone());
        }

        if config.tls {
            redis_config.tls = Some(TlsConnector::default_rustls()?.into());
        }

        let command_timeout = config.command_timeout;
        let connection_timeout = config.connection_timeout;

        let client = Builder::from_config(redis_config)
            .with_performance_config(|perf| {
                perf.default_command_timeout = command_timeout;
            })
            .with_connection_config(|conn| {
                conn.connection_timeout = connection_timeout;
            })
            .build()?;

        client.init().await?;
        debug!("Connected to shard backend");

        Ok(Self {
            client,
            host: host.to_string(),
            port,
        })
    }

    /// Get the underlying fred client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Host this handle is connected to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port this handle is connected to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Check if the client is connected.
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Ping the server.
    #[instrument(skip(self), fields(host = %self.host, port = self.port))]
    pub async fn ping(&self) -> Result<String, BackendError> {
        let response: String = self.client.ping(None).await?;
        Ok(response)
    }
}

impl Backend for ValkeyBackend {
    #[instrument(skip(self, args), fields(host = %self.host, port = self.port, arg_count = args.len()))]
    async fn execute(&self, operation: &str, args: Vec<Value>) -> Result<Value, BackendError> {
        let name = operation.to_ascii_uppercase();
        let blocking = is_blocking(&name);
        let command = CustomCommand::new(name, ClusterHash::FirstKey, blocking);
        self.client.custom(command, args).await
    }

    async fn close(&self) {
        if let Err(e) = self.client.quit().await {
            warn!(host = %self.host, port = self.port, error = %e, "Failed to close shard backend");
        } else {
            debug!(host = %self.host, port = self.port, "Closed shard backend");
        }
    }
}

/// Connector producing [`ValkeyBackend`] handles.
#[derive(Clone, Debug, Default)]
pub struct ValkeyConnector {
    config: BackendConfig,
}

impl ValkeyConnector {
    /// Create a connector with the given connection settings.
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    /// Get the connection settings.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }
}

impl BackendConnector for ValkeyConnector {
    type Backend = ValkeyBackend;

    async fn connect(&self, host: &str, port: u16) -> Result<ValkeyBackend, BackendError> {
        ValkeyBackend::connect(host, port, &self.config).await
    }
}

/// Check whether a command blocks its connection.
pub fn is_blocking(operation: &str) -> bool {
    BLOCKING_COMMANDS
        .iter()
        .any(|cmd| cmd.eq_ignore_ascii_case(operation))
}
