use thiserror::Error;
use uuid::Uuid;

/// Domain errors of the tag core. Transient slug conflicts are handled
/// internally by the allocation retry loop and never surface as an error
/// variant of their own.
#[derive(Debug, Error)]
pub enum TagError {
    /// The slug retry loop hit its cap; treat the input as pathological.
    #[error("could not allocate a unique slug for {base:?} after {attempts} attempts")]
    SlugRetriesExhausted { base: String, attempts: u32 },

    /// An operation expected an existing tag by identity.
    #[error("tag {0} not found")]
    TagNotFound(Uuid),

    /// A state that must never reach storage: an empty tenant set or a
    /// duplicated live slug. Indicates a bug in the orchestration layer.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
