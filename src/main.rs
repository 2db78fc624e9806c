//! phantomlet - simulate thousands of fake kubelets

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use phantomlet::config::{Options, Settings};
use phantomlet::metrics::ControllerMetrics;
use phantomlet::{client, controller, server};
use tokio_util::sync::CancellationToken;

/// phantomlet is a tool for simulating thousands of fake kubelets
#[derive(Parser, Debug)]
#[command(name = "phantomlet", version, about, long_about = None)]
struct Cli {
    /// CIDR of the pod ip
    #[arg(long, default_value = phantomlet::DEFAULT_CIDR)]
    cidr: String,

    /// IP of the node
    #[arg(long, default_value = phantomlet::DEFAULT_NODE_IP)]
    node_ip: String,

    /// All nodes will be watched and managed. Conflicts with the node
    /// selector flags.
    #[arg(long)]
    manage_all_nodes: bool,

    /// Nodes matching the annotation selector will be watched and managed
    #[arg(long)]
    manage_nodes_with_annotation_selector: Option<String>,

    /// Nodes matching the label selector will be watched and managed
    #[arg(long)]
    manage_nodes_with_label_selector: Option<String>,

    /// Status of objects matching the annotation selector is never written
    #[arg(long)]
    disregard_status_with_annotation_selector: Option<String>,

    /// Status of objects matching the label selector is never written
    #[arg(long)]
    disregard_status_with_label_selector: Option<String>,

    /// Path to the kubeconfig file to use
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Address of the kubernetes cluster
    #[arg(long)]
    master: Option<String>,

    /// Address to expose health and metrics on
    #[arg(long)]
    server_address: Option<SocketAddr>,

    /// Experimental support for getting pod ips from CNI
    #[arg(long = "experimental-enable-cni")]
    enable_cni: bool,

    /// Seconds between two status heartbeats of one node
    #[arg(long, default_value_t = phantomlet::DEFAULT_HEARTBEAT_INTERVAL_SECS)]
    heartbeat_interval: u64,

    /// Worker lanes serializing pod status updates
    #[arg(long, default_value_t = phantomlet::DEFAULT_LOCK_POD_PARALLELISM)]
    lock_pod_parallelism: usize,

    /// Workers finalizing pod deletions
    #[arg(long, default_value_t = phantomlet::DEFAULT_DELETE_POD_PARALLELISM)]
    delete_pod_parallelism: usize,

    /// File overriding the built-in pod status template
    #[arg(long)]
    pod_status_template: Option<PathBuf>,

    /// File overriding the built-in node initialization template
    #[arg(long)]
    node_initialization_template: Option<PathBuf>,

    /// File overriding the built-in node heartbeat template
    #[arg(long)]
    node_heartbeat_template: Option<PathBuf>,
}

impl Cli {
    fn into_options(self) -> Options {
        Options {
            cidr: self.cidr,
            node_ip: self.node_ip,
            manage_all_nodes: self.manage_all_nodes,
            manage_nodes_with_annotation_selector: self.manage_nodes_with_annotation_selector,
            manage_nodes_with_label_selector: self.manage_nodes_with_label_selector,
            disregard_status_with_annotation_selector: self
                .disregard_status_with_annotation_selector,
            disregard_status_with_label_selector: self.disregard_status_with_label_selector,
            server_address: self.server_address,
            enable_cni: self.enable_cni,
            kubeconfig: self.kubeconfig,
            master: self.master,
            heartbeat_interval_secs: self.heartbeat_interval,
            lock_pod_parallelism: self.lock_pod_parallelism,
            delete_pod_parallelism: self.delete_pod_parallelism,
            pod_status_template: self.pod_status_template,
            node_initialization_template: self.node_initialization_template,
            node_heartbeat_template: self.node_heartbeat_template,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_options(cli.into_options()).map_err(|e| {
        error!(error = %e, "Invalid configuration");
        anyhow::anyhow!("{e}")
    })?;

    let client = client::build_client(settings.kubeconfig.as_deref(), settings.master.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {e}"))?;

    // The whole process is gated on the API server being reachable
    client::wait_for_api_server(&client).await?;

    let metrics = Arc::new(ControllerMetrics::new());
    let token = CancellationToken::new();

    if let Some(address) = settings.server_address {
        let listener = server::bind(address).await?;
        let metrics = metrics.clone();
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(listener, metrics, token.clone()).await {
                error!(error = %e, "Health server failed");
                token.cancel();
            }
        });
    }

    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                token.cancel();
            }
        });
    }

    controller::run(client, settings, metrics, token).await?;

    info!("Exiting");
    Ok(())
}
