//! Node controller
//!
//! Observes every Node in the cluster, claims the ones matching the
//! ownership predicate, writes their initialization status, and keeps
//! them fresh through the heartbeat scheduler. A node whose labels stop
//! matching (or that is deleted) is released: it leaves the schedule and
//! the ownership registry, and pods bound to it fall out of management on
//! their next event.

use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::{watcher, Config as WatcherConfig, Event};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::KubeApi;
use crate::error::Error;
use crate::heartbeat::HeartbeatScheduler;
use crate::metrics::ControllerMetrics;
use crate::pool::LanePool;
use crate::registry::NodeRegistry;
use crate::selector::{DisregardPredicate, OwnershipPredicate};
use crate::template::{RenderInput, StatusRenderer};

/// Consecutive watch failures tolerated before the controller gives up
const WATCH_MAX_STRIKES: u32 = 5;
/// Base delay between watch reconnect attempts
const WATCH_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Cap on the watch reconnect delay
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(16);

#[derive(Debug)]
struct NodeRecord {
    snapshot: serde_json::Value,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    initialized: bool,
}

/// Claims virtual nodes and keeps their status fresh
pub struct NodeController {
    writer: Arc<dyn KubeApi>,
    renderer: Arc<dyn StatusRenderer>,
    registry: Arc<NodeRegistry>,
    scheduler: Arc<HeartbeatScheduler>,
    ownership: OwnershipPredicate,
    disregard: DisregardPredicate,
    node_ip: String,
    version: String,
    metrics: Arc<ControllerMetrics>,
    nodes: DashMap<String, NodeRecord>,
}

impl NodeController {
    /// Create a node controller from its collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        writer: Arc<dyn KubeApi>,
        renderer: Arc<dyn StatusRenderer>,
        registry: Arc<NodeRegistry>,
        scheduler: Arc<HeartbeatScheduler>,
        ownership: OwnershipPredicate,
        disregard: DisregardPredicate,
        node_ip: String,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        Self {
            writer,
            renderer,
            registry,
            scheduler,
            ownership,
            disregard,
            node_ip,
            version: env!("CARGO_PKG_VERSION").to_string(),
            metrics,
            nodes: DashMap::new(),
        }
    }

    /// Watch Nodes until cancellation, refreshing claimed ones from the
    /// heartbeat schedule through a worker lane pool.
    ///
    /// # Errors
    ///
    /// Returns a watch error after too many consecutive stream failures;
    /// the supervisor treats that as fatal for the whole process.
    pub async fn run(
        self: Arc<Self>,
        client: Client,
        lane_capacity: usize,
        token: CancellationToken,
    ) -> Result<(), Error> {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get() * 4)
            .unwrap_or(16);

        let pool = {
            let controller = self.clone();
            let metrics = self.metrics.clone();
            Arc::new(LanePool::start(
                parallelism,
                lane_capacity,
                token.clone(),
                move || metrics.record_event_dropped(),
                move |name: String| {
                    let controller = controller.clone();
                    async move { controller.refresh(&name).await }
                },
            ))
        };

        let ticker = {
            let scheduler = self.scheduler.clone();
            let pool = pool.clone();
            let token = token.clone();
            tokio::spawn(async move {
                scheduler
                    .run(token, move |batch| {
                        for name in &batch {
                            pool.submit(name, name.clone());
                        }
                    })
                    .await;
            })
        };

        let result = self.watch(client, &pool, token.clone()).await;
        if result.is_err() {
            // The supervisor cancels the token; workers stop with it.
            return result;
        }

        pool.join().await;
        let _ = ticker.await;
        Ok(())
    }

    async fn watch(
        &self,
        client: Client,
        pool: &Arc<LanePool<String>>,
        token: CancellationToken,
    ) -> Result<(), Error> {
        let api: Api<Node> = Api::all(client);
        let mut stream = pin!(watcher(api, WatcherConfig::default()));
        let mut strikes = 0u32;

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                event = stream.try_next() => match event {
                    Ok(Some(event)) => {
                        strikes = 0;
                        self.handle(event, pool);
                    }
                    Ok(None) => return Err(Error::watch("node watch stream ended")),
                    Err(e) => {
                        strikes += 1;
                        if strikes >= WATCH_MAX_STRIKES {
                            return Err(Error::watch(format!(
                                "node watch failed {strikes} consecutive times: {e}"
                            )));
                        }
                        let delay =
                            (WATCH_BACKOFF_BASE * 2u32.pow(strikes - 1)).min(WATCH_BACKOFF_MAX);
                        warn!(error = %e, strikes, delay_ms = delay.as_millis(), "Node watch error, will relist");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => return Ok(()),
                        }
                    }
                }
            }
        }
    }

    fn handle(&self, event: Event<Node>, pool: &Arc<LanePool<String>>) {
        match event {
            Event::Apply(node) | Event::InitApply(node) => self.observe(&node, pool),
            Event::Delete(node) => self.observe_deleted(&node.name_any()),
            Event::Init | Event::InitDone => {}
        }
    }

    /// Apply one observed node: claim, re-claim, or release it
    fn observe(&self, node: &Node, pool: &Arc<LanePool<String>>) {
        let name = node.name_any();
        let labels = node.labels();
        let annotations = node.annotations();

        if !self.ownership.matches(labels, annotations) {
            if self.registry.has(&name) {
                info!(node = %name, "Node no longer matches the ownership predicate");
                self.release(&name);
            }
            return;
        }

        let snapshot = match serde_json::to_value(node) {
            Ok(v) => v,
            Err(e) => {
                error!(node = %name, error = %e, "Failed to serialize node");
                return;
            }
        };

        match self.nodes.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.snapshot = snapshot;
                record.labels = labels.clone();
                record.annotations = annotations.clone();
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(NodeRecord {
                    snapshot,
                    labels: labels.clone(),
                    annotations: annotations.clone(),
                    initialized: false,
                });
            }
        }

        if self.registry.claim(&name) {
            self.metrics.record_node_claimed();
            self.scheduler.register(&name);
            info!(node = %name, "Claimed node");
            // First refresh writes the initialization status right away;
            // the scheduler takes over from one interval out.
            let item = name.clone();
            pool.submit(&name, item);
        }
    }

    fn observe_deleted(&self, name: &str) {
        if self.registry.has(name) {
            info!(node = %name, "Node deleted");
            self.release(name);
        }
    }

    fn release(&self, name: &str) {
        if self.registry.release(name) {
            self.metrics.record_node_released();
        }
        self.scheduler.remove(name);
        self.nodes.remove(name);
    }

    /// Refresh one node's status: the initialization document on the
    /// first write, the heartbeat document afterwards. Failures keep the
    /// node scheduled at a backoff-adjusted deadline.
    async fn refresh(&self, name: &str) {
        let Some(record) = self.nodes.get(name) else {
            return; // released while queued
        };
        let snapshot = record.snapshot.clone();
        let frozen = self.disregard.matches(&record.labels, &record.annotations);
        let initialized = record.initialized;
        drop(record);

        if !self.registry.has(name) {
            return;
        }

        if frozen {
            // Status writes are off for this node; keep the schedule
            // ticking so a selector change picks it back up.
            self.scheduler.succeed(name);
            return;
        }

        let input = RenderInput {
            object: snapshot,
            node_ip: self.node_ip.clone(),
            pod_ip: None,
            now: super::now_rfc3339(),
            version: self.version.clone(),
        };

        let rendered = if initialized {
            self.renderer.render_node_heartbeat(&input)
        } else {
            self.renderer.render_node_initialization(&input)
        };
        let status = match rendered {
            Ok(status) => status,
            Err(e) => {
                error!(node = %name, error = %e, "Failed to render node status");
                self.metrics.record_render_failure();
                self.scheduler.fail(name);
                return;
            }
        };

        match self.writer.patch_node_status(name, &status).await {
            Ok(()) => {
                self.metrics.record_heartbeat(true);
                self.scheduler.succeed(name);
                if !initialized {
                    if let Some(mut record) = self.nodes.get_mut(name) {
                        record.initialized = true;
                    }
                    debug!(node = %name, "Node initialized");
                }
            }
            Err(e) => {
                warn!(node = %name, error = %e, "Failed to patch node status");
                self.metrics.record_heartbeat(false);
                self.scheduler.fail(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockKubeApi;
    use crate::template::{StatusTemplates, TemplateRenderer};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mockall::Sequence;

    fn test_node(name: &str, labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct Fixture {
        controller: Arc<NodeController>,
        scheduler: Arc<HeartbeatScheduler>,
        registry: Arc<NodeRegistry>,
        pool: Arc<LanePool<String>>,
        token: CancellationToken,
    }

    fn fixture(writer: MockKubeApi, ownership: &str, disregard: Option<&str>) -> Fixture {
        let registry = Arc::new(NodeRegistry::new());
        let scheduler = Arc::new(HeartbeatScheduler::new(Duration::from_secs(30)));
        let renderer =
            Arc::new(TemplateRenderer::new(StatusTemplates::default()).unwrap());
        let metrics = Arc::new(ControllerMetrics::new());
        let token = CancellationToken::new();
        // Inert pool: tests drive refresh() directly
        let pool = Arc::new(LanePool::start(
            1,
            16,
            token.clone(),
            || {},
            |_: String| async {},
        ));

        let controller = Arc::new(NodeController::new(
            Arc::new(writer),
            renderer,
            registry.clone(),
            scheduler.clone(),
            OwnershipPredicate::from_options(false, None, Some(ownership)).unwrap(),
            DisregardPredicate::from_options(None, disregard).unwrap(),
            "10.0.0.1".to_string(),
            metrics,
        ));

        Fixture {
            controller,
            scheduler,
            registry,
            pool,
            token,
        }
    }

    // =========================================================================
    // Story: claiming and releasing nodes
    // =========================================================================

    #[tokio::test]
    async fn test_matching_node_is_claimed_and_scheduled() {
        let f = fixture(MockKubeApi::new(), "type=virtual", None);

        f.controller
            .observe(&test_node("node0", &[("type", "virtual")]), &f.pool);

        assert!(f.registry.has("node0"));
        assert!(f.scheduler.contains("node0"));
        f.token.cancel();
    }

    #[tokio::test]
    async fn test_non_matching_node_is_ignored() {
        let f = fixture(MockKubeApi::new(), "type=virtual", None);

        f.controller
            .observe(&test_node("real0", &[("type", "metal")]), &f.pool);

        assert!(!f.registry.has("real0"));
        assert!(!f.scheduler.contains("real0"));
        f.token.cancel();
    }

    #[tokio::test]
    async fn test_ownership_flip_releases_the_node() {
        let f = fixture(MockKubeApi::new(), "type=virtual", None);

        f.controller
            .observe(&test_node("node0", &[("type", "virtual")]), &f.pool);
        assert!(f.registry.has("node0"));

        // Label removed: the node stops matching on its next event
        f.controller.observe(&test_node("node0", &[]), &f.pool);
        assert!(!f.registry.has("node0"));
        assert!(!f.scheduler.contains("node0"));
        f.token.cancel();
    }

    #[tokio::test]
    async fn test_deleted_node_is_released() {
        let f = fixture(MockKubeApi::new(), "type=virtual", None);

        f.controller
            .observe(&test_node("node0", &[("type", "virtual")]), &f.pool);
        f.controller.observe_deleted("node0");

        assert!(!f.registry.has("node0"));
        assert!(!f.scheduler.contains("node0"));
        f.token.cancel();
    }

    // =========================================================================
    // Story: initialization first, heartbeats afterwards
    // =========================================================================

    #[tokio::test]
    async fn test_first_refresh_initializes_then_heartbeats() {
        let mut writer = MockKubeApi::new();
        let mut seq = Sequence::new();
        // Initialization carries the full node document
        writer
            .expect_patch_node_status()
            .withf(|name, status| {
                name == "node0"
                    && status["addresses"][0]["address"] == "10.0.0.1"
                    && status["phase"] == "Running"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        // Heartbeats only refresh conditions
        writer
            .expect_patch_node_status()
            .withf(|name, status| {
                name == "node0"
                    && status.get("addresses").is_none()
                    && status["conditions"][0]["type"] == "Ready"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let f = fixture(writer, "type=virtual", None);
        f.controller
            .observe(&test_node("node0", &[("type", "virtual")]), &f.pool);

        f.controller.refresh("node0").await;
        f.controller.refresh("node0").await;
        f.token.cancel();
    }

    #[tokio::test]
    async fn test_failed_refresh_backs_off_instead_of_waiting_a_full_interval() {
        let mut writer = MockKubeApi::new();
        writer
            .expect_patch_node_status()
            .times(1)
            .returning(|_, _| Err(Error::serialization("api is down")));

        let f = fixture(writer, "type=virtual", None);
        f.controller
            .observe(&test_node("node0", &[("type", "virtual")]), &f.pool);

        let before = tokio::time::Instant::now();
        f.controller.refresh("node0").await;

        let deadline = f.scheduler.deadline_of("node0").unwrap();
        assert!(
            deadline - before <= Duration::from_secs(2),
            "failure retries on the backoff ladder, not the full interval"
        );
        assert!(f.scheduler.contains("node0"), "node stays scheduled");
        f.token.cancel();
    }

    // =========================================================================
    // Story: disregard-status nodes are claimed but never written
    // =========================================================================

    #[tokio::test]
    async fn test_frozen_node_gets_no_status_writes() {
        // No expectations on the mock: any write panics the test
        let f = fixture(MockKubeApi::new(), "type=virtual", Some("frozen=yes"));

        f.controller.observe(
            &test_node("node0", &[("type", "virtual"), ("frozen", "yes")]),
            &f.pool,
        );
        assert!(f.registry.has("node0"), "frozen nodes are still claimed");

        f.controller.refresh("node0").await;
        f.controller.refresh("node0").await;
        f.token.cancel();
    }

    #[tokio::test]
    async fn test_render_failure_skips_the_write_and_backs_off() {
        // Any write to the mock panics the test; the render never succeeds
        let mut renderer = crate::template::MockStatusRenderer::new();
        renderer.expect_render_node_initialization().returning(|_| {
            Err(crate::template::TemplateError::Render(minijinja::Error::new(
                minijinja::ErrorKind::UndefinedError,
                "node.metadata.nope is undefined",
            )))
        });

        let registry = Arc::new(NodeRegistry::new());
        let scheduler = Arc::new(HeartbeatScheduler::new(Duration::from_secs(30)));
        let token = CancellationToken::new();
        let pool = Arc::new(LanePool::start(
            1,
            16,
            token.clone(),
            || {},
            |_: String| async {},
        ));

        let controller = Arc::new(NodeController::new(
            Arc::new(MockKubeApi::new()),
            Arc::new(renderer),
            registry,
            scheduler.clone(),
            OwnershipPredicate::from_options(true, None, None).unwrap(),
            DisregardPredicate::default(),
            "10.0.0.1".to_string(),
            Arc::new(ControllerMetrics::new()),
        ));

        controller.observe(&test_node("node0", &[]), &pool);
        let before = tokio::time::Instant::now();
        controller.refresh("node0").await;

        // The bad template keeps the node on the backoff ladder
        let deadline = scheduler.deadline_of("node0").unwrap();
        assert!(deadline - before <= Duration::from_secs(2));
        token.cancel();
    }

    #[tokio::test]
    async fn test_refresh_after_release_is_a_no_op() {
        let f = fixture(MockKubeApi::new(), "type=virtual", None);

        f.controller
            .observe(&test_node("node0", &[("type", "virtual")]), &f.pool);
        f.controller.release("node0");

        // Queued refresh runs after the node is gone: no write
        f.controller.refresh("node0").await;
        f.token.cancel();
    }
}
