//! phantomlet - simulate thousands of fake kubelets against a real cluster
//!
//! phantomlet attaches to a Kubernetes API server and impersonates virtual
//! compute nodes: it claims Node objects matching a configurable ownership
//! predicate, keeps their status fresh on a heartbeat schedule, and drives
//! every Pod scheduled onto a claimed node through a plausible
//! Pending → Running → Terminated lifecycle without ever starting a
//! container. Authoritative state lives in the API server; the process
//! itself is stateless and rebuilds everything from a list/watch on start.
//!
//! # Modules
//!
//! - [`config`] - runtime settings and startup validation
//! - [`client`] - Kubernetes client construction (kubeconfig/master/in-cluster)
//! - [`controller`] - node and pod controllers plus the write-side API seam
//! - [`heartbeat`] - deadline-driven node heartbeat scheduler
//! - [`pool`] - hash-partitioned worker lanes with per-key ordering
//! - [`template`] - status rendering from user-supplied templates
//! - [`ipam`] - pod IP allocation from a CIDR
//! - [`selector`] - ownership and disregard-status predicates
//! - [`registry`] - the set of currently claimed nodes
//! - [`server`] - health and metrics HTTP surface
//! - [`metrics`] - process counters exposed on `/metrics`
//! - [`retry`] - exponential backoff helper
//! - [`error`] - crate error taxonomy

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod heartbeat;
pub mod ipam;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod selector;
pub mod server;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default CIDR pod IPs are allocated from
pub const DEFAULT_CIDR: &str = "10.0.0.1/24";

/// Default IP reported for every virtual node
pub const DEFAULT_NODE_IP: &str = "10.0.0.1";

/// Default interval between two status heartbeats of one node, in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default number of worker lanes serializing pod status updates
pub const DEFAULT_LOCK_POD_PARALLELISM: usize = 16;

/// Default number of workers finalizing pod deletions
pub const DEFAULT_DELETE_POD_PARALLELISM: usize = 16;

/// Default bound of a single worker lane queue; the oldest entry is dropped
/// (and counted) when a watch storm pushes past it
pub const DEFAULT_LANE_CAPACITY: usize = 1024;

/// Default grace given to in-flight workers after cancellation, in seconds
pub const DEFAULT_SHUTDOWN_DEADLINE_SECS: u64 = 10;
