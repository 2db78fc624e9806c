//! Error types for phantomlet

use thiserror::Error;

use crate::ipam::IpamError;
use crate::template::TemplateError;

/// Main error type for phantomlet operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Status template error
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// Pod IP allocation error
    #[error("ipam error: {0}")]
    Ipam(#[from] IpamError),

    /// Invalid configuration detected before any watch begins
    #[error("configuration error: {0}")]
    Config(String),

    /// Fatal startup error (unreachable API server, bind failure, ...)
    #[error("startup error: {0}")]
    Startup(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A watch stream failed repeatedly and the controller cannot continue
    #[error("watch error: {0}")]
    Watch(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a startup error with the given message
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a watch error with the given message
    pub fn watch(msg: impl Into<String>) -> Self {
        Self::Watch(msg.into())
    }

    /// True when the error should terminate the process rather than be
    /// retried inside a worker
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Startup(_) | Self::Watch(_))
    }
}
