//! The status renderer capability
//!
//! Controllers depend on the [`StatusRenderer`] trait rather than the
//! template engine directly, so tests can inject a deterministic mock
//! while production uses [`TemplateRenderer`].

use std::fs;
use std::path::Path;

#[cfg(test)]
use mockall::automock;

use super::context::RenderInput;
use super::defaults;
use super::engine::TemplateEngine;
use super::error::TemplateError;

/// The three required templates, loaded once at startup
#[derive(Clone, Debug)]
pub struct StatusTemplates {
    /// Pod status document
    pub pod_status: String,
    /// Node status written once when a node is claimed
    pub node_initialization: String,
    /// Node status refresh asserting liveness
    pub node_heartbeat: String,
}

impl Default for StatusTemplates {
    fn default() -> Self {
        Self {
            pod_status: defaults::POD_STATUS_TEMPLATE.to_string(),
            node_initialization: defaults::NODE_INITIALIZATION_TEMPLATE.to_string(),
            node_heartbeat: defaults::NODE_HEARTBEAT_TEMPLATE.to_string(),
        }
    }
}

impl StatusTemplates {
    /// Build the template set, replacing defaults with file contents for
    /// every path that is given.
    ///
    /// # Errors
    ///
    /// Returns a load error naming the offending path.
    pub fn load(
        pod_status: Option<&Path>,
        node_initialization: Option<&Path>,
        node_heartbeat: Option<&Path>,
    ) -> Result<Self, TemplateError> {
        let mut templates = Self::default();

        if let Some(path) = pod_status {
            templates.pod_status = read_template(path)?;
        }
        if let Some(path) = node_initialization {
            templates.node_initialization = read_template(path)?;
        }
        if let Some(path) = node_heartbeat {
            templates.node_heartbeat = read_template(path)?;
        }

        Ok(templates)
    }
}

fn read_template(path: &Path) -> Result<String, TemplateError> {
    fs::read_to_string(path).map_err(|source| TemplateError::Load {
        path: path.display().to_string(),
        source,
    })
}

/// Renders status patch documents for the objects the controllers manage.
///
/// Rendering is pure and deterministic for fixed inputs. A render error
/// is non-fatal for the fleet: the caller logs it and skips the object
/// until its next event.
#[cfg_attr(test, automock)]
pub trait StatusRenderer: Send + Sync {
    /// Render the pod status document
    fn render_pod_status(&self, input: &RenderInput)
        -> Result<serde_json::Value, TemplateError>;

    /// Render the node status document written when a node is claimed
    fn render_node_initialization(
        &self,
        input: &RenderInput,
    ) -> Result<serde_json::Value, TemplateError>;

    /// Render the node status refresh asserting liveness
    fn render_node_heartbeat(
        &self,
        input: &RenderInput,
    ) -> Result<serde_json::Value, TemplateError>;
}

/// Production renderer backed by the minijinja engine
pub struct TemplateRenderer {
    engine: TemplateEngine,
    templates: StatusTemplates,
}

impl TemplateRenderer {
    /// Create a renderer, validating the syntax of all three templates.
    ///
    /// # Errors
    ///
    /// Returns the first syntax error found; templates are a startup
    /// input, so this fails the process before any watch begins.
    pub fn new(templates: StatusTemplates) -> Result<Self, TemplateError> {
        TemplateEngine::validate_syntax(&templates.pod_status)?;
        TemplateEngine::validate_syntax(&templates.node_initialization)?;
        TemplateEngine::validate_syntax(&templates.node_heartbeat)?;

        Ok(Self {
            engine: TemplateEngine::new(),
            templates,
        })
    }

    fn render(
        &self,
        template: &str,
        input: &RenderInput,
        key: &str,
    ) -> Result<serde_json::Value, TemplateError> {
        let ctx = input.to_context(key);
        let rendered = self.engine.render(template, &ctx)?;
        let value: serde_json::Value = serde_yaml::from_str(&rendered)?;
        Ok(value)
    }
}

impl StatusRenderer for TemplateRenderer {
    fn render_pod_status(
        &self,
        input: &RenderInput,
    ) -> Result<serde_json::Value, TemplateError> {
        self.render(&self.templates.pod_status, input, "pod")
    }

    fn render_node_initialization(
        &self,
        input: &RenderInput,
    ) -> Result<serde_json::Value, TemplateError> {
        self.render(&self.templates.node_initialization, input, "node")
    }

    fn render_node_heartbeat(
        &self,
        input: &RenderInput,
    ) -> Result<serde_json::Value, TemplateError> {
        self.render(&self.templates.node_heartbeat, input, "node")
    }
}
