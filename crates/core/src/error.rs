use crate::relationship::RelationshipStatus;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid relationship transition from {from} to {to}")]
    InvalidTransition {
        from: RelationshipStatus,
        to: RelationshipStatus,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}
