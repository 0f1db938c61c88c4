//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only. Storage and transport failures are
/// modelled by the layers that own them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed or missing input.
    #[error("{0}")]
    Validation(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The resource does not exist *or* the caller may not see it.
    ///
    /// Both cases deliberately share this variant.
    #[error("{0}")]
    NotFound(String),

    /// The job's start time has passed; it can only be read or deleted now.
    #[error("Cannot modify a job that has already started!")]
    AlreadyStarted,

    /// A caller attempted to change an identity field of a stored job.
    #[error("{0}")]
    ImmutableField(String),

    /// The operation is blocked by another user's CDN lock.
    #[error("{0}")]
    Forbidden(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn immutable(field: &str) -> Self {
        Self::ImmutableField(format!(
            "Cannot change '{field}' of an existing invalidation job!"
        ))
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }
}
