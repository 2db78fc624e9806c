//! Process metrics exposed on `/metrics`
//!
//! Plain atomic counters; the HTTP handler renders them in Prometheus text
//! exposition format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters and gauges for the controller core
#[derive(Debug, Default)]
pub struct ControllerMetrics {
    /// Nodes currently claimed by this process
    pub nodes_owned: AtomicI64,
    /// Pods currently tracked on claimed nodes
    pub pods_managed: AtomicI64,
    /// Pod IPs currently held by live pods
    pub ips_in_use: AtomicI64,
    /// Node heartbeat status writes issued
    pub heartbeats_total: AtomicU64,
    /// Node heartbeat status writes that failed
    pub heartbeat_failures_total: AtomicU64,
    /// Pod status writes issued
    pub pod_status_writes_total: AtomicU64,
    /// Pod status writes that failed
    pub pod_status_write_failures_total: AtomicU64,
    /// Pod finalization DELETE calls issued
    pub pod_deletes_total: AtomicU64,
    /// Pod finalization DELETE calls that failed
    pub pod_delete_failures_total: AtomicU64,
    /// Template render failures (object skipped until its next event)
    pub render_failures_total: AtomicU64,
    /// Pod IP allocation failures
    pub ip_allocation_failures_total: AtomicU64,
    /// Events dropped from full worker lanes (drop-oldest policy)
    pub events_dropped_total: AtomicU64,
}

impl ControllerMetrics {
    /// Create a zeroed metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node claim
    pub fn record_node_claimed(&self) {
        self.nodes_owned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a node release
    pub fn record_node_released(&self) {
        self.nodes_owned.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a heartbeat status write outcome
    pub fn record_heartbeat(&self, ok: bool) {
        self.heartbeats_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.heartbeat_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a pod status write outcome
    pub fn record_pod_status_write(&self, ok: bool) {
        self.pod_status_writes_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.pod_status_write_failures_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a pod finalization DELETE outcome
    pub fn record_pod_delete(&self, ok: bool) {
        self.pod_deletes_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.pod_delete_failures_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a pod entering management
    pub fn record_pod_tracked(&self) {
        self.pods_managed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pod leaving management
    pub fn record_pod_forgotten(&self) {
        self.pods_managed.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a pod IP entering use (allocated or adopted)
    pub fn record_ip_assigned(&self) {
        self.ips_in_use.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pod IP returning to the pool
    pub fn record_ip_released(&self) {
        self.ips_in_use.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a template render failure
    pub fn record_render_failure(&self) {
        self.render_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pod IP allocation failure
    pub fn record_ip_allocation_failure(&self) {
        self.ip_allocation_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event dropped from a full lane
    pub fn record_event_dropped(&self) {
        self.events_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Render all counters in Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        let gauge = |out: &mut String, name: &str, help: &str, value: i64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
            ));
        };
        let counter = |out: &mut String, name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };

        gauge(
            &mut out,
            "phantomlet_nodes_owned",
            "Nodes currently claimed by this process",
            self.nodes_owned.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "phantomlet_pods_managed",
            "Pods currently tracked on claimed nodes",
            self.pods_managed.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "phantomlet_ips_in_use",
            "Pod IPs currently held by live pods",
            self.ips_in_use.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "phantomlet_heartbeats_total",
            "Node heartbeat status writes issued",
            self.heartbeats_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "phantomlet_heartbeat_failures_total",
            "Node heartbeat status writes that failed",
            self.heartbeat_failures_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "phantomlet_pod_status_writes_total",
            "Pod status writes issued",
            self.pod_status_writes_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "phantomlet_pod_status_write_failures_total",
            "Pod status writes that failed",
            self.pod_status_write_failures_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "phantomlet_pod_deletes_total",
            "Pod finalization DELETE calls issued",
            self.pod_deletes_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "phantomlet_pod_delete_failures_total",
            "Pod finalization DELETE calls that failed",
            self.pod_delete_failures_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "phantomlet_render_failures_total",
            "Template render failures",
            self.render_failures_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "phantomlet_ip_allocation_failures_total",
            "Pod IP allocation failures",
            self.ip_allocation_failures_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "phantomlet_events_dropped_total",
            "Events dropped from full worker lanes",
            self.events_dropped_total.load(Ordering::Relaxed),
        );

        out
    }
}
