use thiserror::Error;

use crate::resource::{ResourceId, Target};

/// Problems with the declaration set itself. Always fatal: nothing is applied.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("dependency cycle detected: {}", format_path(.path))]
    Cycle { path: Vec<ResourceId> },

    #[error("{from} references {target}, which is not declared")]
    UnresolvedReference { from: ResourceId, target: Target },

    #[error("{target} is a repeated resource; {from} must select an instance or use [*]")]
    MissingInstanceKey { from: ResourceId, target: Target },

    #[error("cannot match {family} to prior state: {reason}")]
    AmbiguousCountIndex { family: String, reason: String },

    #[error("resource {0} is declared more than once")]
    DuplicateResource(ResourceId),

    #[error("{from} references attribute '{attribute}' which {target} does not have")]
    UnsupportedAttribute {
        from: ResourceId,
        target: ResourceId,
        attribute: String,
    },

    #[error("no provider handles resource type '{resource_type}' (needed by {id})")]
    UnsupportedResourceType { id: ResourceId, resource_type: String },
}

fn format_path(path: &[ResourceId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// The state document could not be trusted or persisted.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state is corrupt ({location}): {message}; reconcile it manually before applying")]
    Corruption { location: String, message: String },

    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum GroundworkError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Declaration(#[from] crate::declaration::DeclarationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Provider(#[from] crate::providers::ProviderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GroundworkError {
    /// Errors that abort a run before any remote mutation is attempted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Declaration(_) | Self::State(_)
        )
    }
}
