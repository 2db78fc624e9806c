//! Render input and template context construction

use minijinja::Value;

/// Everything a status template can see: the live object plus the fields
/// the controller provides on top of it.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderInput {
    /// Full JSON representation of the object being reconciled
    pub object: serde_json::Value,
    /// The IP reported for the (virtual) node
    pub node_ip: String,
    /// The IP allocated to the pod, when one is assigned
    pub pod_ip: Option<String>,
    /// Render wall clock, RFC 3339
    pub now: String,
    /// Process version
    pub version: String,
}

impl RenderInput {
    /// Build the minijinja context, exposing the object under `key`
    /// (`"pod"` or `"node"`).
    ///
    /// `podIP` is always defined - the empty string stands for
    /// "not yet allocated" so strict-undefined templates can test it.
    pub fn to_context(&self, key: &str) -> Value {
        let ctx = serde_json::json!({
            key: self.object,
            "nodeIP": self.node_ip,
            "podIP": self.pod_ip.as_deref().unwrap_or(""),
            "now": self.now,
            "version": self.version,
        });
        Value::from_serialize(&ctx)
    }
}
