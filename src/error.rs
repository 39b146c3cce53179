//! Error types for staging, dependency resolution and commit.

use thiserror::Error;

/// Errors raised by the fluent resource core.
#[derive(Debug, Error)]
pub enum FluentError {
    /// A staging call was rejected before any network call was made.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The dependency graph contains a cycle.
    #[error("cyclic dependency between tasks: {}", keys.join(" -> "))]
    CyclicDependency { keys: Vec<String> },

    /// A creatable dependency failed; the parent was not written.
    #[error("dependency '{key}' failed to create")]
    DependencyExecution {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Staging against a collection the resource kind does not declare.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// A task key that was never registered with the dependency graph.
    #[error("unknown dependency key: {0}")]
    UnknownDependency(String),

    /// A resource kind missing from the registry.
    #[error("unknown resource kind: {0}")]
    UnknownResourceKind(String),

    /// The remote read, write or delete call failed.
    #[error("remote {operation} failed")]
    RemoteOperation {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
}

impl FluentError {
    pub(crate) fn remote(operation: &str, source: anyhow::Error) -> Self {
        Self::RemoteOperation {
            operation: operation.to_string(),
            source,
        }
    }
}

/// Result type for the fluent resource core.
pub type Result<T> = std::result::Result<T, FluentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_keys() {
        let err = FluentError::CyclicDependency {
            keys: vec!["a-1".into(), "b-2".into(), "a-1".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency between tasks: a-1 -> b-2 -> a-1");
    }

    #[test]
    fn test_remote_error_keeps_source() {
        let err = FluentError::remote("createOrUpdate", anyhow::anyhow!("API request failed: 500"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("API request failed: 500"));
    }
}
