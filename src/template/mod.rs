//! Status rendering from user-supplied templates
//!
//! Node and pod status documents are produced by rendering text templates
//! against the live object, using `${...}` placeholder syntax backed by
//! minijinja:
//!
//! - `${pod.spec.nodeName}` / `${node.metadata.name}` - fields of the
//!   object being reconciled
//! - `${nodeIP}`, `${podIP}` - controller-provided addresses
//! - `${now}` - the render wall clock, RFC 3339
//! - `${version}` - the process version
//! - `{% for %}` / `{% if %}` - blocks, e.g. one container status per
//!   container in the spec
//! - `$${...}` - escape producing a literal `${...}`
//!
//! Template output is a YAML document of the same shape as the object's
//! status subresource; the controllers merge it onto the object with a
//! status PATCH. Rendering is pure: two renders with identical inputs
//! produce byte-identical output.
//!
//! Three templates are required (pod status, node initialization, node
//! heartbeat). Built-in defaults ship with the binary and each can be
//! overridden from a file at startup; templates are immutable afterwards.

mod context;
mod defaults;
mod engine;
mod error;
mod renderer;

pub use context::RenderInput;
pub use defaults::{NODE_HEARTBEAT_TEMPLATE, NODE_INITIALIZATION_TEMPLATE, POD_STATUS_TEMPLATE};
pub use engine::TemplateEngine;
pub use error::TemplateError;
pub use renderer::{StatusRenderer, StatusTemplates, TemplateRenderer};

#[cfg(test)]
pub use renderer::MockStatusRenderer;
