//! Node and pod controllers
//!
//! Two controllers watch the two entity streams. The node controller
//! claims Nodes matching the ownership predicate and keeps their status
//! fresh on the heartbeat schedule; the pod controller drives every Pod
//! bound to a claimed node through a synthetic lifecycle. Both write
//! through the [`KubeApi`] seam so tests can mock the API server, and
//! both push their work through hash-partitioned lanes so updates to one
//! object never run concurrently.

mod node;
mod pod;

pub use node::NodeController;
pub use pod::{PodController, PodKey};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::Settings;
use crate::error::Error;
use crate::heartbeat::HeartbeatScheduler;
use crate::ipam::CidrAllocator;
use crate::metrics::ControllerMetrics;
use crate::registry::NodeRegistry;
use crate::template::TemplateRenderer;

/// Field manager name used for status patches
const FIELD_MANAGER: &str = "phantomlet";

/// The render wall clock: RFC 3339 at second precision, UTC
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Trait abstracting the write half of the Kubernetes API
///
/// Controllers only ever issue three kinds of writes; narrowing the seam
/// to them lets tests mock the API server while production wraps the real
/// client.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// Merge-patch a node's status subresource
    async fn patch_node_status(&self, name: &str, status: &serde_json::Value)
        -> Result<(), Error>;

    /// Merge-patch a pod's status subresource
    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<(), Error>;

    /// Delete a pod, completing its finalization
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes API implementation
pub struct RealKubeApi {
    client: Client,
}

impl RealKubeApi {
    /// Create a new RealKubeApi wrapping the given kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeApi for RealKubeApi {
    async fn patch_node_status(
        &self,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn patch_pod_status(
        &self,
        namespace: &str,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Run both controllers until cancellation or a fatal failure.
///
/// Wires up the shared collaborators (ownership registry, IP allocator,
/// heartbeat scheduler, renderer, metrics), starts the node and pod
/// controllers, and supervises them: a controller that returns an error
/// (a permanently broken watch) cancels everything and propagates, so the
/// process never silently services only part of the fleet.
///
/// On cancellation, in-flight workers get `settings.shutdown_deadline` to
/// finish their current object before remaining tasks are aborted.
///
/// # Errors
///
/// Returns the first controller error, or template errors at setup.
pub async fn run(
    client: Client,
    settings: Settings,
    metrics: Arc<ControllerMetrics>,
    token: CancellationToken,
) -> Result<(), Error> {
    let renderer = Arc::new(TemplateRenderer::new(settings.templates.clone())?);
    let registry = Arc::new(NodeRegistry::new());
    let scheduler = Arc::new(HeartbeatScheduler::new(settings.heartbeat_interval));
    let allocator = Arc::new(CidrAllocator::new(settings.cidr));
    let writer = Arc::new(RealKubeApi::new(client.clone()));

    let nodes = Arc::new(NodeController::new(
        writer.clone(),
        renderer.clone(),
        registry.clone(),
        scheduler.clone(),
        settings.ownership.clone(),
        settings.disregard.clone(),
        settings.node_ip.clone(),
        metrics.clone(),
    ));

    let pods = Arc::new(PodController::new(
        writer,
        renderer,
        allocator,
        registry,
        settings.disregard.clone(),
        settings.node_ip.clone(),
        metrics,
    ));

    let mut set = JoinSet::new();
    {
        let nodes = nodes.clone();
        let client = client.clone();
        let token = token.clone();
        let lane_capacity = settings.lane_capacity;
        set.spawn(async move { nodes.run(client, lane_capacity, token).await });
    }
    {
        let pods = pods.clone();
        let token = token.clone();
        let lock_parallelism = settings.lock_pod_parallelism;
        let delete_parallelism = settings.delete_pod_parallelism;
        let lane_capacity = settings.lane_capacity;
        set.spawn(async move {
            pods.run(
                client,
                lock_parallelism,
                delete_parallelism,
                lane_capacity,
                token,
            )
            .await
        });
    }

    info!("Controllers started");

    let mut failure: Option<Error> = None;

    tokio::select! {
        _ = token.cancelled() => {
            info!("Shutting down controllers");
        }
        joined = set.join_next() => {
            match joined {
                Some(Ok(Err(e))) => {
                    error!(error = %e, "Controller failed, shutting everything down");
                    failure = Some(e);
                }
                Some(Err(e)) => {
                    error!(error = %e, "Controller task panicked");
                    failure = Some(Error::watch(format!("controller task panicked: {e}")));
                }
                _ => {
                    if !token.is_cancelled() {
                        failure = Some(Error::watch("controller exited unexpectedly"));
                    }
                }
            }
            token.cancel();
        }
    }

    drain(&mut set, settings.shutdown_deadline).await;

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Wait for remaining controller tasks, forcing the issue at the deadline
async fn drain(set: &mut JoinSet<Result<(), Error>>, deadline: Duration) {
    let graceful = async {
        while let Some(joined) = set.join_next().await {
            if let Ok(Err(e)) = joined {
                warn!(error = %e, "Controller error during shutdown");
            }
        }
    };
    if tokio::time::timeout(deadline, graceful).await.is_err() {
        warn!(
            deadline_secs = deadline.as_secs(),
            "Shutdown deadline exceeded, aborting remaining workers"
        );
        set.abort_all();
    }
}
