use std::fmt::{self, Display, Formatter};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FeastError>;

/// Kind of registry object an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Project,
    Entity,
    FeatureView,
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Project => write!(f, "Project"),
            ObjectKind::Entity => write!(f, "Entity"),
            ObjectKind::FeatureView => write!(f, "Feature view"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FeastError {
    #[error("{kind} '{name}' not found in project '{project}'")]
    NotFound {
        project: String,
        kind: ObjectKind,
        name: String,
    },
    #[error("Validation failed: {0}")]
    Validation(String),
    /// The registry changed between load and save. The caller should reload and retry.
    #[error(
        "Registry at '{location}' was modified concurrently: expected version {expected}, found {found}"
    )]
    StaleRegistry {
        location: String,
        expected: u64,
        found: u64,
    },
    #[error("{context}")]
    Backend {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

impl FeastError {
    pub fn entity_not_found(name: impl Into<String>, project: impl Into<String>) -> Self {
        Self::NotFound {
            project: project.into(),
            kind: ObjectKind::Entity,
            name: name.into(),
        }
    }

    pub fn feature_view_not_found(name: impl Into<String>, project: impl Into<String>) -> Self {
        Self::NotFound {
            project: project.into(),
            kind: ObjectKind::FeatureView,
            name: name.into(),
        }
    }

    pub fn project_not_found(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::NotFound {
            project: name.clone(),
            kind: ObjectKind::Project,
            name,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn backend(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Backend {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Attaches a backend context to any fallible storage call.
pub trait BackendContext<T> {
    fn backend(self, context: &str) -> Result<T>;

    fn with_backend<F, C>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> BackendContext<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn backend(self, context: &str) -> Result<T> {
        self.map_err(|e| FeastError::backend(context, e))
    }

    fn with_backend<F, C>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| FeastError::backend(context(), e))
    }
}
