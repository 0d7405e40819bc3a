//! Block-list rows and the blocked-set filter predicate.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::{RowId, Timestamp, UserId};

/// A row of the block-list table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRow {
    pub id: RowId,
    pub blocker_id: UserId,
    pub blocked_id: UserId,
    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

impl BlockRow {
    /// The other party relative to `me`, in either direction.
    pub fn counterpart(&self, me: UserId) -> Option<UserId> {
        if self.blocker_id == me {
            Some(self.blocked_id)
        } else if self.blocked_id == me {
            Some(self.blocker_id)
        } else {
            None
        }
    }
}

/// Users hidden from the local user, regardless of who blocked whom.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockedSet {
    ids: HashSet<UserId>,
}

impl BlockedSet {
    /// Assemble from the two block queries: users I blocked, users who blocked me.
    pub fn from_queries(
        blocked_by_me: impl IntoIterator<Item = UserId>,
        blocking_me: impl IntoIterator<Item = UserId>,
    ) -> Self {
        Self {
            ids: blocked_by_me.into_iter().chain(blocking_me).collect(),
        }
    }

    pub fn contains(&self, id: &UserId) -> bool {
        self.ids.contains(id)
    }

    pub fn insert(&mut self, id: UserId) -> bool {
        self.ids.insert(id)
    }

    pub fn remove(&mut self, id: &UserId) -> bool {
        self.ids.remove(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserId> {
        self.ids.iter()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_from_queries_unions_both_directions() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let set = BlockedSet::from_queries([a], [b, a]);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
        assert!(set.contains(&b));
    }

    #[test]
    fn test_counterpart_either_direction() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let row = BlockRow {
            id: Uuid::new_v4(),
            blocker_id: other,
            blocked_id: me,
            created_at: None,
        };
        assert_eq!(row.counterpart(me), Some(other));
        assert_eq!(row.counterpart(other), Some(me));
        assert_eq!(row.counterpart(Uuid::new_v4()), None);
    }
}
