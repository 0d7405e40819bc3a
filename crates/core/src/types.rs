use uuid::Uuid;

/// Identifier of a user profile row.
pub type UserId = Uuid;

/// Primary key of a relationship, message, or block row.
pub type RowId = Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
