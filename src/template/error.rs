//! Template error types

use thiserror::Error;

/// Errors from loading or rendering status templates
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Template rendering failed (syntax error, undefined variable, ...)
    #[error("template render error: {0}")]
    Render(#[from] minijinja::Error),

    /// The rendered output was not a valid YAML document
    #[error("template output is not a valid status document: {0}")]
    InvalidOutput(#[from] serde_yaml::Error),

    /// A template override file could not be read
    #[error("failed to read template {path}: {source}")]
    Load {
        /// Path of the template file
        path: String,
        /// Underlying IO error
        source: std::io::Error,
    },
}
