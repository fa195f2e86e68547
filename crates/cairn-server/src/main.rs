//! Cairn Server - cluster discovery host runtime

use anyhow::Context;
use cairn_core::{DiscoveryService, NodeAddress, Settings};
use cairn_server::{
    api,
    backends::{self, BackendKind, BackendOptions},
    membership,
    observability::{self, TracingConfig},
    version,
};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cairn-server")]
#[command(about = "Cluster discovery: register this node and track its peers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the cluster and serve the HTTP API until Ctrl-C
    Run {
        #[command(flatten)]
        backend: BackendArgs,

        /// Address advertised for this node
        #[arg(long, env = "CAIRN_SELF_ADDRESS", default_value = "127.0.0.1:2552")]
        self_address: NodeAddress,

        /// HTTP listen address
        #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Enumerate nodes once and print them as JSON
    Nodes {
        #[command(flatten)]
        backend: BackendArgs,

        /// Include nodes the directory reports as unhealthy
        #[arg(long)]
        all: bool,
    },
    /// Print build information
    Version,
}

#[derive(Args)]
struct BackendArgs {
    #[arg(long, env = "CAIRN_BACKEND", value_enum, default_value_t = BackendKind::Etcd)]
    backend: BackendKind,

    /// Cluster DNS suffix for the dns backend
    #[arg(long, env = "CAIRN_CLUSTER_DOMAIN", default_value = backends::DEFAULT_CLUSTER_DOMAIN)]
    cluster_domain: String,

    /// Port assigned to nodes found by the dns backend
    #[arg(long, env = "CAIRN_DNS_PORT", default_value_t = 2552)]
    dns_port: u16,
}

impl BackendArgs {
    fn options(&self) -> BackendOptions {
        BackendOptions {
            cluster_domain: self.cluster_domain.clone(),
            dns_port: self.dns_port,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("{}", version::build_info());
            Ok(())
        }
        Commands::Nodes { backend, all } => {
            observability::init_tracing(TracingConfig::from_env())?;
            print_nodes(&backend, all).await
        }
        Commands::Run {
            backend,
            self_address,
            bind,
        } => {
            observability::init_tracing(TracingConfig::from_env())?;
            let result = run(&backend, self_address, &bind).await;
            observability::shutdown_tracing();
            result
        }
    }
}

async fn print_nodes(args: &BackendArgs, all: bool) -> anyhow::Result<()> {
    let settings = Arc::new(Settings::from_env()?);
    let factory = backends::build_factory(args.backend, settings, &args.options());

    let client = factory.create().await?;
    let nodes = client.enumerate(!all).await?;
    client.close().await;

    println!("{}", serde_json::to_string_pretty(&nodes)?);
    Ok(())
}

async fn run(args: &BackendArgs, self_address: NodeAddress, bind: &str) -> anyhow::Result<()> {
    info!(version = %version::full_version(), "Starting cairn-server");

    let metrics_state = match observability::init_metrics() {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
            None
        }
    };

    let settings = Settings::from_env().context("invalid CAIRN_* configuration")?;
    info!(
        backend = %args.backend,
        endpoints = ?settings.endpoints(),
        namespace = %settings.namespace(),
        services = ?settings.service_names(),
        self_address = %self_address,
        "Configuration loaded"
    );

    let factory = backends::build_factory(args.backend, Arc::new(settings.clone()), &args.options());
    let service = DiscoveryService::new(settings, factory, self_address.clone())
        .with_metadata("version", version::VERSION);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let consumer = membership::spawn_event_consumer(self_address.clone(), events_rx);
    let discovery = service.start(events_tx).await?;

    let state = api::AppState {
        status: discovery.status(),
        self_address,
        backend: args.backend.to_string(),
        metrics_state,
    };
    let app = api::create_router(state);

    info!(bind = %bind, "Starting API server");
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let server_exited = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("Ctrl-C received, shutting down");
            false
        }
        result = &mut server => {
            warn!(result = ?result, "API server exited unexpectedly");
            true
        }
    };

    discovery.stop().await;
    if let Err(e) = consumer.await {
        warn!(error = %e, "Event consumer task failed");
    }

    if server_exited {
        anyhow::bail!("API server exited before shutdown");
    }
    let _ = shutdown_tx.send(());
    server.await??;

    info!("cairn-server stopped");
    Ok(())
}
