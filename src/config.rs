//! Runtime settings and startup validation
//!
//! Raw option values (straight from the CLI/environment) are validated
//! into [`Settings`] exactly once, before any watch begins. Every
//! invariant violated here is startup-fatal: conflicting ownership flags,
//! an unsupported CNI request, an unparsable CIDR or selector.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::Ipv4Net;
use tracing::warn;

use crate::error::Error;
use crate::ipam::cni;
use crate::selector::{DisregardPredicate, OwnershipPredicate};
use crate::template::StatusTemplates;
use crate::{
    DEFAULT_DELETE_POD_PARALLELISM, DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_LANE_CAPACITY,
    DEFAULT_LOCK_POD_PARALLELISM, DEFAULT_SHUTDOWN_DEADLINE_SECS,
};

/// Raw option values as collected by the CLI
#[derive(Clone, Debug)]
pub struct Options {
    /// CIDR of the pod IP range
    pub cidr: String,
    /// IP reported for every virtual node
    pub node_ip: String,
    /// Watch and manage every node
    pub manage_all_nodes: bool,
    /// Manage nodes matching this annotation selector
    pub manage_nodes_with_annotation_selector: Option<String>,
    /// Manage nodes matching this label selector
    pub manage_nodes_with_label_selector: Option<String>,
    /// Never write status of objects matching this annotation selector
    pub disregard_status_with_annotation_selector: Option<String>,
    /// Never write status of objects matching this label selector
    pub disregard_status_with_label_selector: Option<String>,
    /// Address to expose health and metrics on
    pub server_address: Option<SocketAddr>,
    /// Get pod IPs from the host CNI instead of the built-in allocator
    pub enable_cni: bool,
    /// Path to the kubeconfig file to use
    pub kubeconfig: Option<PathBuf>,
    /// Address of the Kubernetes API server
    pub master: Option<String>,
    /// Seconds between two status heartbeats of one node
    pub heartbeat_interval_secs: u64,
    /// Worker lanes serializing pod status updates
    pub lock_pod_parallelism: usize,
    /// Workers finalizing pod deletions
    pub delete_pod_parallelism: usize,
    /// Override file for the pod status template
    pub pod_status_template: Option<PathBuf>,
    /// Override file for the node initialization template
    pub node_initialization_template: Option<PathBuf>,
    /// Override file for the node heartbeat template
    pub node_heartbeat_template: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cidr: crate::DEFAULT_CIDR.to_string(),
            node_ip: crate::DEFAULT_NODE_IP.to_string(),
            manage_all_nodes: false,
            manage_nodes_with_annotation_selector: None,
            manage_nodes_with_label_selector: None,
            disregard_status_with_annotation_selector: None,
            disregard_status_with_label_selector: None,
            server_address: None,
            enable_cni: false,
            kubeconfig: None,
            master: None,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            lock_pod_parallelism: DEFAULT_LOCK_POD_PARALLELISM,
            delete_pod_parallelism: DEFAULT_DELETE_POD_PARALLELISM,
            pod_status_template: None,
            node_initialization_template: None,
            node_heartbeat_template: None,
        }
    }
}

/// Validated controller settings, immutable after startup
#[derive(Clone, Debug)]
pub struct Settings {
    /// Pod IP range for the built-in allocator
    pub cidr: Ipv4Net,
    /// IP reported for every virtual node
    pub node_ip: String,
    /// Which nodes this process claims
    pub ownership: OwnershipPredicate,
    /// Which objects never get their status written
    pub disregard: DisregardPredicate,
    /// Interval between two status heartbeats of one node
    pub heartbeat_interval: Duration,
    /// Worker lanes serializing pod status updates
    pub lock_pod_parallelism: usize,
    /// Workers finalizing pod deletions
    pub delete_pod_parallelism: usize,
    /// Bound of a single worker lane queue
    pub lane_capacity: usize,
    /// Grace given to in-flight workers after cancellation
    pub shutdown_deadline: Duration,
    /// Address to expose health and metrics on
    pub server_address: Option<SocketAddr>,
    /// Delegate pod IP allocation to the host CNI
    pub enable_cni: bool,
    /// Path to the kubeconfig file to use
    pub kubeconfig: Option<PathBuf>,
    /// Address of the Kubernetes API server
    pub master: Option<String>,
    /// The three status templates
    pub templates: StatusTemplates,
}

impl Settings {
    /// Validate raw options into settings.
    ///
    /// # Errors
    ///
    /// Every failure here is startup-fatal; the process must exit
    /// non-zero before any watch begins.
    pub fn from_options(options: Options) -> Result<Self, Error> {
        let ownership = OwnershipPredicate::from_options(
            options.manage_all_nodes,
            options.manage_nodes_with_annotation_selector.as_deref(),
            options.manage_nodes_with_label_selector.as_deref(),
        )?;

        let disregard = DisregardPredicate::from_options(
            options.disregard_status_with_annotation_selector.as_deref(),
            options.disregard_status_with_label_selector.as_deref(),
        )?;

        let cidr: Ipv4Net = options
            .cidr
            .parse()
            .map_err(|e| Error::config(format!("invalid cidr {:?}: {e}", options.cidr)))?;

        if options.enable_cni && !cni::supported() {
            return Err(Error::config(
                "enable-cni requested but CNI is not supported here",
            ));
        }

        if options.heartbeat_interval_secs == 0 {
            return Err(Error::config("heartbeat-interval must be positive"));
        }
        if options.lock_pod_parallelism == 0 || options.delete_pod_parallelism == 0 {
            return Err(Error::config("pod parallelism must be positive"));
        }

        let templates = StatusTemplates::load(
            options.pod_status_template.as_deref(),
            options.node_initialization_template.as_deref(),
            options.node_heartbeat_template.as_deref(),
        )?;

        Ok(Self {
            cidr,
            node_ip: options.node_ip,
            ownership,
            disregard,
            heartbeat_interval: Duration::from_secs(options.heartbeat_interval_secs),
            lock_pod_parallelism: options.lock_pod_parallelism,
            delete_pod_parallelism: options.delete_pod_parallelism,
            lane_capacity: DEFAULT_LANE_CAPACITY,
            shutdown_deadline: Duration::from_secs(DEFAULT_SHUTDOWN_DEADLINE_SECS),
            server_address: options.server_address,
            enable_cni: options.enable_cni,
            kubeconfig: sanitize_kubeconfig(options.kubeconfig),
            master: options.master,
            templates,
        })
    }
}

/// A kubeconfig path that is missing or a directory is logged and treated
/// as unset, falling through to the next client-configuration source.
fn sanitize_kubeconfig(path: Option<PathBuf>) -> Option<PathBuf> {
    let path = path?;
    match std::fs::metadata(&path) {
        Ok(meta) if meta.is_file() => Some(path),
        Ok(_) => {
            warn!(kubeconfig = %path.display(), "Kubeconfig path is a directory, ignoring it");
            None
        }
        Err(e) => {
            warn!(kubeconfig = %path.display(), error = %e, "Failed to read kubeconfig, ignoring it");
            None
        }
    }
}
