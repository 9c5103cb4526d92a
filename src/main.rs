//! shard-keeper - sharded key/value client driven by ZooKeeper membership.
//!
//! This is the command line entry point:
//! - `watch` follows shard membership and serves health and metrics
//! - `route` prints which shard a key maps to
//! - `exec` runs one operation on the shard owning its first argument

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use shard_keeper::health::{HealthState, run_health_server};
use shard_keeper::{KeeperConfig, ValkeyShardedClient, Value};

/// Sharded key/value client with ZooKeeper-published membership.
#[derive(Parser, Debug)]
#[command(name = "shard-keeper", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "SHARD_KEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Coordination service address, overriding the configuration.
    #[arg(long, global = true)]
    zk: Option<String>,

    /// Namespace root, overriding the configuration.
    #[arg(long, global = true)]
    base_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Follow shard membership and serve /healthz, /readyz and /metrics.
    Watch,

    /// Print the shard a key routes to.
    Route {
        /// Routing key.
        key: String,
    },

    /// Execute an operation; the first argument is the routing key.
    Exec {
        /// Operation name, e.g. GET.
        operation: String,
        /// Operation arguments.
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shard_keeper=info".parse()?)
                .add_directive("zookeeper_client=warn".parse()?)
                .add_directive("fred=warn".parse()?),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Watch => watch(config).await?,
        Commands::Route { key } => route(config, &key).await?,
        Commands::Exec { operation, args } => exec(config, &operation, args).await?,
    }

    Ok(())
}

/// Configuration from file, then environment, then command line.
fn load_config(cli: &Cli) -> shard_keeper::Result<KeeperConfig> {
    let mut config = match cli.config {
        Some(ref path) => KeeperConfig::load(path)?,
        None => KeeperConfig::default(),
    }
    .with_env_overrides();

    if let Some(ref zk) = cli.zk {
        config.coordination_address = zk.clone();
    }
    if let Some(ref base_path) = cli.base_path {
        config.base_path = base_path.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn watch(config: KeeperConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        address = %config.coordination_address,
        path = %config.cluster_path(),
        "Starting shard-keeper"
    );

    let health_state = Arc::new(HealthState::new());

    // Probes should answer while the first sync is still running.
    let mut health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let client = ValkeyShardedClient::connect_with_health(config, Some(health_state)).await?;
    let mut changes = client.registry().subscribe();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let generation = *changes.borrow_and_update();
                let shards = client.snapshot().await;
                info!(shards = shards.len(), generation, "Shard membership changed");
            }
            result = &mut health_handle => {
                if let Err(e) = result {
                    error!("Health server task panicked: {}", e);
                }
                break;
            }
            _ = &mut shutdown => {
                info!("Received shutdown signal, initiating graceful shutdown...");
                break;
            }
        }
    }

    client.shutdown().await;
    health_handle.abort();
    info!("shard-keeper stopped");
    Ok(())
}

async fn route(config: KeeperConfig, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = ValkeyShardedClient::connect(config).await?;
    let result = client.route(key).await;
    let output = match result {
        Ok((index, endpoint)) => serde_json::json!({
            "key": key,
            "shard": index,
            "host": endpoint.host,
            "port": endpoint.port,
            "source_path": endpoint.source_path,
            "shard_count": client.shard_count().await,
        }),
        Err(e) => serde_json::json!({
            "key": key,
            "error": e.to_string(),
            "shards": client.snapshot().await,
        }),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    client.shutdown().await;
    Ok(())
}

async fn exec(
    config: KeeperConfig,
    operation: &str,
    args: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = ValkeyShardedClient::connect(config).await?;
    let args: Vec<Value> = args.into_iter().map(Value::from).collect();
    let result = client.dispatch(operation, args).await;
    client.shutdown().await;

    let reply = result?;
    println!("{}", serde_json::to_string_pretty(&render(reply))?);
    Ok(())
}

/// Render a store reply as JSON for display.
fn render(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(b),
        Value::Integer(i) => serde_json::Value::from(i),
        Value::Double(d) => serde_json::Value::from(d),
        Value::String(s) => serde_json::Value::String(String::from(&*s)),
        Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(&b).into_owned()),
        Value::Array(values) => serde_json::Value::Array(values.into_iter().map(render).collect()),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Signal handler setup failures are fatal; the process cannot shut down
/// gracefully without them.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
