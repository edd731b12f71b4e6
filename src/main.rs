mod backend;
mod config;
mod mcp;
mod mongo_backend;
mod operations;
mod registry;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mongo_backend::MongoBackend;
use registry::Registry;

/// A Model Context Protocol (MCP) server for `MongoDB` administration.
///
/// Exposes listDatabases, listCollections, listIndexes and createCollection as tools.
/// It communicates via JSON-RPC 2.0 over stdin/stdout.
#[derive(Parser)]
#[command(name = "mongo-admin-mcp-rs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "MCP server for MongoDB administrative operations", long_about = None)]
struct Cli {
    /// Path to a YAML config file (default: <config dir>/mongo-admin-mcp-rs/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MongoDB connection string; overrides mongodb_uri from the config file
    #[arg(long, env = "MONGODB_URI", hide_env_values = true)]
    mongodb_uri: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mongo_admin_mcp_rs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = config::Config::load(cli.config.as_deref(), cli.mongodb_uri.as_deref())?;
    tracing::info!("MongoDB URI: {}", config.redacted_uri());

    // Client is created lazily on the first tool call
    let backend = Arc::new(MongoBackend::new(config));

    let mut registry = Registry::new();
    operations::register_admin_operations(&mut registry, backend)?;
    tracing::info!(
        "Registered {} operations: {}",
        registry.len(),
        registry.names().join(", ")
    );

    let mcp_server = mcp::McpServer::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        registry,
    );
    mcp_server.run().await?;

    Ok(())
}
