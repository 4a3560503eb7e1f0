//! node-ipam agent binary
//!
//! Runs the per-node address agent, or talks to a running one.
//!
//! # Examples
//!
//! ```bash
//! # Start the agent
//! node-ipam serve --config /etc/node-ipam/config.toml --node-name worker-1
//!
//! # Allocate and release by hand
//! node-ipam allocate default web-0 0f3c9a
//! node-ipam release default web-0 0f3c9a
//!
//! # Show owned blocks
//! node-ipam status
//! ```

use clap::{Args, Parser, Subcommand};
use node_ipam::client::IpamClient;
use node_ipam::routing::{IpRouteInstaller, NoopRouteInstaller, RouteInstaller};
use node_ipam::server::start_server;
use node_ipam::{AgentConfig, IpamEngine, MemoryStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Node-local IP address management agent
#[derive(Parser, Debug)]
#[command(name = "node-ipam")]
#[command(version = node_ipam::VERSION)]
#[command(about = "Node-local IP address management for container networks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "NODE_IPAM_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent
    Serve(ServeArgs),

    /// Allocate an address for a pod
    Allocate(PodArgs),

    /// Release a pod's address
    Release(PodArgs),

    /// Show the address of a container
    Lookup {
        container_id: String,
        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Show blocks owned by the node
    Status(RemoteArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// TOML configuration file
    #[arg(short, long, env = "NODE_IPAM_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Override the node name
    #[arg(long)]
    node_name: Option<String>,

    /// Do not install routes
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct RemoteArgs {
    /// Agent base URL
    #[arg(long, default_value = "http://127.0.0.1:9383")]
    server: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,
}

#[derive(Args, Debug)]
struct PodArgs {
    namespace: String,
    pod_name: String,
    container_id: String,
    #[command(flatten)]
    remote: RemoteArgs,
}

impl RemoteArgs {
    fn client(&self) -> anyhow::Result<IpamClient> {
        Ok(IpamClient::new(
            self.server.clone(),
            Duration::from_secs(self.timeout),
        )?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    match cli.command {
        Commands::Serve(args) => serve_command(args).await,
        Commands::Allocate(args) => {
            let ip = args
                .remote
                .client()?
                .allocate(&args.namespace, &args.pod_name, &args.container_id)
                .await?;
            println!("{}", ip);
            Ok(())
        }
        Commands::Release(args) => {
            let released = args
                .remote
                .client()?
                .release(&args.namespace, &args.pod_name, &args.container_id)
                .await?;
            match released {
                Some(ip) => println!("released {}", ip),
                None => println!("nothing to release"),
            }
            Ok(())
        }
        Commands::Lookup {
            container_id,
            remote,
        } => {
            println!("{}", remote.client()?.lookup(&container_id).await?);
            Ok(())
        }
        Commands::Status(remote) => {
            let status = remote.client()?.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "node-ipam.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

async fn serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = AgentConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(node_name) = args.node_name {
        config.node_name = node_name;
    }
    if args.dry_run {
        config.dry_run = true;
    }
    config.validate()?;

    info!(version = %node_ipam::VERSION, node = %config.node_name, "node-ipam starting");

    let store = Arc::new(MemoryStore::with_pools(config.pools.clone()));
    let routes: Arc<dyn RouteInstaller> = if config.dry_run {
        warn!("Dry-run mode: block routes will not be installed");
        Arc::new(NoopRouteInstaller)
    } else {
        Arc::new(IpRouteInstaller::new(config.table_id, config.protocol_id))
    };

    let engine = Arc::new(IpamEngine::new(
        &config.node_name,
        store,
        routes,
        config.dry_run,
    ));

    start_server(config, engine).await
}
