//! Change-feed records: the transport shape and its typed decoding.
//!
//! The realtime collaborator delivers `{ table, eventType, old, new }`
//! records with JSON row payloads. Deletes usually carry only the primary
//! key in `old`, so the typed form keeps the key separately.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blocking::BlockRow;
use crate::error::CoreError;
use crate::notifications::MessageRow;
use crate::profile::ProfileRow;
use crate::relationship::RelationshipRow;
use crate::types::{RowId, UserId};

// ---------------------------------------------------------------------------
// Wire shape
// ---------------------------------------------------------------------------

/// Tables the engine subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Profiles,
    Relationships,
    Messages,
    Blocks,
}

/// Every table the engine consumes.
pub const ALL_TABLES: &[Table] = &[
    Table::Profiles,
    Table::Relationships,
    Table::Messages,
    Table::Blocks,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level mutation as delivered by the realtime transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRecord {
    pub table: Table,
    pub event_type: ChangeKind,
    #[serde(default)]
    pub old: serde_json::Value,
    #[serde(default)]
    pub new: serde_json::Value,
}

impl FeedRecord {
    pub fn insert<T: Serialize>(table: Table, row: &T) -> Result<Self, CoreError> {
        Ok(Self {
            table,
            event_type: ChangeKind::Insert,
            old: serde_json::Value::Null,
            new: to_value(row)?,
        })
    }

    pub fn update<T: Serialize>(table: Table, old: Option<&T>, new: &T) -> Result<Self, CoreError> {
        Ok(Self {
            table,
            event_type: ChangeKind::Update,
            old: old.map(to_value).transpose()?.unwrap_or_default(),
            new: to_value(new)?,
        })
    }

    /// A delete that carries only the primary key, as most transports send.
    pub fn delete_key(table: Table, key: Uuid) -> Self {
        Self {
            table,
            event_type: ChangeKind::Delete,
            old: serde_json::json!({ "id": key }),
            new: serde_json::Value::Null,
        }
    }

    /// Decode the JSON payloads into a typed change.
    pub fn decode(&self) -> Result<FeedChange, CoreError> {
        let change = match self.table {
            Table::Profiles => FeedChange::Profile(self.decode_rows()?),
            Table::Relationships => FeedChange::Relationship(self.decode_rows()?),
            Table::Messages => FeedChange::Message(self.decode_rows()?),
            Table::Blocks => FeedChange::Block(self.decode_rows()?),
        };
        Ok(change)
    }

    fn decode_rows<T: DeserializeOwned>(&self) -> Result<RowChange<T, Uuid>, CoreError> {
        match self.event_type {
            ChangeKind::Insert => Ok(RowChange::Insert(parse_row(self.table, &self.new)?)),
            ChangeKind::Update => Ok(RowChange::Update(parse_row(self.table, &self.new)?)),
            ChangeKind::Delete => {
                let key = self
                    .old
                    .get("id")
                    .cloned()
                    .map(serde_json::from_value::<Uuid>)
                    .transpose()
                    .map_err(|e| invalid(self.table, e))?
                    .ok_or_else(|| {
                        CoreError::Validation(format!(
                            "Delete on {:?} is missing the row key",
                            self.table
                        ))
                    })?;
                // Key-only payloads fail the full parse; that is expected.
                let old = serde_json::from_value(self.old.clone()).ok();
                Ok(RowChange::Delete { key, old })
            }
        }
    }
}

fn to_value<T: Serialize>(row: &T) -> Result<serde_json::Value, CoreError> {
    serde_json::to_value(row).map_err(|e| CoreError::Internal(e.to_string()))
}

fn parse_row<T: DeserializeOwned>(table: Table, value: &serde_json::Value) -> Result<T, CoreError> {
    serde_json::from_value(value.clone()).map_err(|e| invalid(table, e))
}

fn invalid(table: Table, e: serde_json::Error) -> CoreError {
    CoreError::Validation(format!("Malformed {table:?} payload: {e}"))
}

// ---------------------------------------------------------------------------
// Typed changes
// ---------------------------------------------------------------------------

/// A typed row change. Deletes expose the key and, when the transport sent
/// the full old row, the row itself.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange<T, K> {
    Insert(T),
    Update(T),
    Delete { key: K, old: Option<T> },
}

impl<T, K> RowChange<T, K> {
    /// The row carried by inserts and updates.
    pub fn upserted(&self) -> Option<&T> {
        match self {
            RowChange::Insert(row) | RowChange::Update(row) => Some(row),
            RowChange::Delete { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedChange {
    Profile(RowChange<ProfileRow, UserId>),
    Relationship(RowChange<RelationshipRow, RowId>),
    Message(RowChange<MessageRow, RowId>),
    Block(RowChange<BlockRow, RowId>),
}

impl FeedChange {
    pub fn table(&self) -> Table {
        match self {
            FeedChange::Profile(_) => Table::Profiles,
            FeedChange::Relationship(_) => Table::Relationships,
            FeedChange::Message(_) => Table::Messages,
            FeedChange::Block(_) => Table::Blocks,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
