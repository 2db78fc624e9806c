//! Pod controller
//!
//! Drives every pod bound to a claimed node through a synthetic
//! lifecycle: first reconcile assigns an IP and writes a Running status,
//! a deletion timestamp routes the pod to the finalization pool for the
//! completing DELETE, and the confirmed deletion event returns the IP and
//! drops the in-memory record.
//!
//! Reconciliations for one pod are serialized through a worker lane keyed
//! by a stable hash of (namespace, name); deletions run on their own,
//! independently sized pool so slow finalization cannot starve status
//! updates.

use std::fmt;
use std::net::Ipv4Addr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{watcher, Config as WatcherConfig, Event};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::controller::KubeApi;
use crate::error::Error;
use crate::ipam::IpAllocator;
use crate::metrics::ControllerMetrics;
use crate::pool::LanePool;
use crate::registry::NodeRegistry;
use crate::selector::DisregardPredicate;
use crate::template::{RenderInput, StatusRenderer};

const WATCH_MAX_STRIKES: u32 = 5;
const WATCH_BACKOFF_BASE: Duration = Duration::from_secs(1);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(16);

/// Identity of a managed pod
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PodKey {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl PodKey {
    /// The key of an observed pod
    pub fn of(pod: &Pod) -> Self {
        Self {
            namespace: pod.namespace().unwrap_or_else(|| "default".to_string()),
            name: pod.name_any(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Default)]
struct PodRecord {
    ip: Option<Ipv4Addr>,
    /// Inputs of the last successful status write; reconciling an object
    /// whose inputs are unchanged issues zero writes.
    fingerprint: Option<serde_json::Value>,
    last_status: Option<serde_json::Value>,
}

/// Synthesizes the lifecycle of pods bound to claimed nodes
pub struct PodController {
    writer: Arc<dyn KubeApi>,
    renderer: Arc<dyn StatusRenderer>,
    allocator: Arc<dyn IpAllocator>,
    registry: Arc<NodeRegistry>,
    disregard: DisregardPredicate,
    node_ip: String,
    version: String,
    metrics: Arc<ControllerMetrics>,
    records: DashMap<PodKey, PodRecord>,
}

impl PodController {
    /// Create a pod controller from its collaborators
    pub fn new(
        writer: Arc<dyn KubeApi>,
        renderer: Arc<dyn StatusRenderer>,
        allocator: Arc<dyn IpAllocator>,
        registry: Arc<NodeRegistry>,
        disregard: DisregardPredicate,
        node_ip: String,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        Self {
            writer,
            renderer,
            allocator,
            registry,
            disregard,
            node_ip,
            version: env!("CARGO_PKG_VERSION").to_string(),
            metrics,
            records: DashMap::new(),
        }
    }

    /// Watch Pods in all namespaces until cancellation.
    ///
    /// # Errors
    ///
    /// Returns a watch error after too many consecutive stream failures;
    /// the supervisor treats that as fatal for the whole process.
    pub async fn run(
        self: Arc<Self>,
        client: Client,
        lock_parallelism: usize,
        delete_parallelism: usize,
        lane_capacity: usize,
        token: CancellationToken,
    ) -> Result<(), Error> {
        let (status_pool, delete_pool) =
            self.start_pools(lock_parallelism, delete_parallelism, lane_capacity, &token);

        let result = self
            .watch(client, &status_pool, &delete_pool, token.clone())
            .await;
        if result.is_err() {
            // The supervisor cancels the token; workers stop with it.
            return result;
        }

        status_pool.join().await;
        delete_pool.join().await;
        Ok(())
    }

    /// Start the status lanes and the finalization pool
    fn start_pools(
        self: &Arc<Self>,
        lock_parallelism: usize,
        delete_parallelism: usize,
        lane_capacity: usize,
        token: &CancellationToken,
    ) -> (Arc<LanePool<Pod>>, Arc<LanePool<PodKey>>) {
        let status_pool = {
            let controller = self.clone();
            let metrics = self.metrics.clone();
            Arc::new(LanePool::start(
                lock_parallelism,
                lane_capacity,
                token.clone(),
                move || metrics.record_event_dropped(),
                move |pod: Pod| {
                    let controller = controller.clone();
                    async move { controller.reconcile(pod).await }
                },
            ))
        };

        let delete_pool = {
            let controller = self.clone();
            let metrics = self.metrics.clone();
            Arc::new(LanePool::start(
                delete_parallelism,
                lane_capacity,
                token.clone(),
                move || metrics.record_event_dropped(),
                move |key: PodKey| {
                    let controller = controller.clone();
                    async move { controller.finalize(&key).await }
                },
            ))
        };

        (status_pool, delete_pool)
    }

    async fn watch(
        &self,
        client: Client,
        status_pool: &Arc<LanePool<Pod>>,
        delete_pool: &Arc<LanePool<PodKey>>,
        token: CancellationToken,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::all(client);
        let mut stream = pin!(watcher(api, WatcherConfig::default()));
        let mut strikes = 0u32;

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                event = stream.try_next() => match event {
                    Ok(Some(event)) => {
                        strikes = 0;
                        self.route(event, status_pool, delete_pool);
                    }
                    Ok(None) => return Err(Error::watch("pod watch stream ended")),
                    Err(e) => {
                        strikes += 1;
                        if strikes >= WATCH_MAX_STRIKES {
                            return Err(Error::watch(format!(
                                "pod watch failed {strikes} consecutive times: {e}"
                            )));
                        }
                        let delay =
                            (WATCH_BACKOFF_BASE * 2u32.pow(strikes - 1)).min(WATCH_BACKOFF_MAX);
                        warn!(error = %e, strikes, delay_ms = delay.as_millis(), "Pod watch error, will relist");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => return Ok(()),
                        }
                    }
                }
            }
        }
    }

    fn route(
        &self,
        event: Event<Pod>,
        status_pool: &Arc<LanePool<Pod>>,
        delete_pool: &Arc<LanePool<PodKey>>,
    ) {
        match event {
            Event::Apply(pod) | Event::InitApply(pod) => {
                self.observe(pod, status_pool, delete_pool)
            }
            Event::Delete(pod) => self.observe_deleted(&pod),
            Event::Init | Event::InitDone => {}
        }
    }

    /// Route one observed pod: drop, finalize, or reconcile it
    fn observe(
        &self,
        pod: Pod,
        status_pool: &Arc<LanePool<Pod>>,
        delete_pool: &Arc<LanePool<PodKey>>,
    ) {
        let key = PodKey::of(&pod);
        let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
            return; // not scheduled yet
        };

        if !self.registry.has(node_name) {
            // Bound to a node that is not ours, or whose ownership moved
            // away: stop writing and return the IP.
            self.forget(&key);
            return;
        }

        if pod.metadata.deletion_timestamp.is_some() {
            debug!(pod = %key, "Pod is terminating");
            delete_pool.submit(&key, key.clone());
            return;
        }

        status_pool.submit(&key, pod);
    }

    /// Confirmed deletion: return the IP and drop the record
    fn observe_deleted(&self, pod: &Pod) {
        let key = PodKey::of(pod);
        if self.forget(&key) {
            debug!(pod = %key, "Pod gone");
        }
    }

    fn forget(&self, key: &PodKey) -> bool {
        let Some((_, record)) = self.records.remove(key) else {
            return false;
        };
        self.metrics.record_pod_forgotten();
        if let Some(ip) = record.ip {
            self.allocator.release(&key.to_string(), ip);
            self.metrics.record_ip_released();
        }
        true
    }

    /// Reconcile one pod: assign an IP if needed, render the status
    /// document, and write it back unless nothing changed.
    async fn reconcile(&self, pod: Pod) {
        let key = PodKey::of(&pod);
        let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
            return;
        };

        // Ownership may have flipped while the pod sat in the queue
        if !self.registry.has(node_name) {
            self.forget(&key);
            return;
        }

        if !self.records.contains_key(&key) {
            self.records.insert(key.clone(), PodRecord::default());
            self.metrics.record_pod_tracked();
        }

        if self.disregard.matches(pod.labels(), pod.annotations()) {
            // Lifecycle keeps running, the status subresource is never
            // touched.
            debug!(pod = %key, "Pod status is frozen");
            return;
        }

        let ip = match self.ensure_ip(&key, &pod) {
            Ok(ip) => ip,
            Err(e) => {
                warn!(pod = %key, error = %e, "Failed to allocate pod IP");
                self.metrics.record_ip_allocation_failure();
                let status = serde_json::json!({
                    "phase": "Pending",
                    "reason": "IpAllocationFailed",
                    "message": e.to_string(),
                });
                self.write_status(&key, status).await;
                return;
            }
        };

        let fingerprint = match render_fingerprint(&pod, ip) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                error!(pod = %key, error = %e, "Failed to serialize pod");
                return;
            }
        };
        let converged = self
            .records
            .get(&key)
            .is_some_and(|r| r.fingerprint.as_ref() == Some(&fingerprint));
        if converged {
            return;
        }

        let object = match serde_json::to_value(&pod) {
            Ok(object) => object,
            Err(e) => {
                error!(pod = %key, error = %e, "Failed to serialize pod");
                return;
            }
        };
        let input = RenderInput {
            object,
            node_ip: self.node_ip.clone(),
            pod_ip: Some(ip.to_string()),
            now: super::now_rfc3339(),
            version: self.version.clone(),
        };

        let desired = match self.renderer.render_pod_status(&input) {
            Ok(desired) => desired,
            Err(e) => {
                error!(pod = %key, error = %e, "Failed to render pod status");
                self.metrics.record_render_failure();
                return;
            }
        };

        if self.write_status(&key, desired).await {
            if let Some(mut record) = self.records.get_mut(&key) {
                record.fingerprint = Some(fingerprint);
            }
        }
    }

    /// The pod's IP: recorded, adopted from its existing status, or
    /// freshly allocated.
    fn ensure_ip(&self, key: &PodKey, pod: &Pod) -> Result<Ipv4Addr, crate::ipam::IpamError> {
        if let Some(ip) = self.records.get(key).and_then(|r| r.ip) {
            return Ok(ip);
        }

        let adopted = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .and_then(|s| s.parse::<Ipv4Addr>().ok());

        let ip = match adopted {
            Some(ip) => {
                // Assigned before a restart: reserve it so it is never
                // handed out twice.
                self.allocator.restore(&key.to_string(), ip);
                ip
            }
            None => self.allocator.allocate(&key.to_string())?,
        };

        if let Some(mut record) = self.records.get_mut(key) {
            record.ip = Some(ip);
            self.metrics.record_ip_assigned();
        } else {
            // Forgotten while we were allocating; do not leak the address
            self.allocator.release(&key.to_string(), ip);
        }
        Ok(ip)
    }

    /// Write a status document unless it equals the last one written.
    /// Returns true when the write happened and succeeded.
    async fn write_status(&self, key: &PodKey, desired: serde_json::Value) -> bool {
        let unchanged = self
            .records
            .get(key)
            .is_some_and(|r| r.last_status.as_ref() == Some(&desired));
        if unchanged {
            return false;
        }

        match self
            .writer
            .patch_pod_status(&key.namespace, &key.name, &desired)
            .await
        {
            Ok(()) => {
                self.metrics.record_pod_status_write(true);
                if let Some(mut record) = self.records.get_mut(key) {
                    record.last_status = Some(desired);
                }
                true
            }
            Err(e) => {
                // Logged and retried on the pod's next event
                warn!(pod = %key, error = %e, "Failed to patch pod status");
                self.metrics.record_pod_status_write(false);
                false
            }
        }
    }

    /// Complete a terminating pod with the finalizing DELETE
    async fn finalize(&self, key: &PodKey) {
        match self.writer.delete_pod(&key.namespace, &key.name).await {
            Ok(()) => {
                self.metrics.record_pod_delete(true);
                debug!(pod = %key, "Deleted pod");
            }
            Err(e) => {
                // Retried when the terminating pod is observed again
                warn!(pod = %key, error = %e, "Failed to delete pod");
                self.metrics.record_pod_delete(false);
            }
        }
    }
}

/// Everything a status write depends on besides the wall clock: the pod
/// spec and metadata, plus the assigned IP. Unchanged inputs mean the
/// object is converged and no write is needed.
fn render_fingerprint(pod: &Pod, ip: Ipv4Addr) -> Result<serde_json::Value, serde_json::Error> {
    Ok(serde_json::json!({
        "spec": serde_json::to_value(&pod.spec)?,
        "labels": pod.labels(),
        "annotations": pod.annotations(),
        "ip": ip.to_string(),
    }))
}
