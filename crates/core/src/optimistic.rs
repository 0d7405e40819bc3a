//! Optimistic relationship edits with an explicit apply/rollback pair.
//!
//! The edit is applied synchronously before the remote write is issued.
//! Only the relationship fields of one counterpart are captured, so a
//! rollback never discards concurrent remote updates to other fields.

use crate::relationship::{RelationshipLink, RelationshipRow, RowRef};
use crate::roster::{LinkSnapshot, RosterStore};
use crate::types::UserId;

#[derive(Debug, Clone, PartialEq)]
#[must_use = "an optimistic edit must be committed or rolled back"]
pub struct OptimisticLink {
    prior: LinkSnapshot,
    applied: Option<RelationshipLink>,
}

impl OptimisticLink {
    /// Capture the current fields of `user`, then overwrite them with `next`.
    pub fn apply(roster: &mut RosterStore, user: UserId, next: Option<RelationshipLink>) -> Self {
        let prior = roster.link_snapshot(user);
        roster.set_link(user, next.clone());
        Self {
            prior,
            applied: next,
        }
    }

    pub fn user(&self) -> UserId {
        self.prior.user
    }

    pub fn prior(&self) -> Option<&RelationshipLink> {
        self.prior.link.as_ref()
    }

    pub fn applied(&self) -> Option<&RelationshipLink> {
        self.applied.as_ref()
    }

    /// Restore the captured fields exactly as they were.
    pub fn rollback(self, roster: &mut RosterStore) {
        roster.restore_link(self.prior);
    }

    /// Keep the edit, swapping a temporary row id for the confirmed row.
    pub fn commit(self, roster: &mut RosterStore, confirmed: Option<&RelationshipRow>) -> bool {
        match (self.applied.as_ref().map(|l| l.row), confirmed) {
            (Some(provisional @ RowRef::Temporary(_)), Some(row)) => {
                roster.confirm_link(self.prior.user, provisional, row)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::feed::RowChange;
    use crate::profile::ProfileRow;
    use crate::relationship::RelationshipStatus;

    fn roster_with(user: UserId) -> RosterStore {
        let mut roster = RosterStore::new(Uuid::new_v4());
        roster.apply_change_event(&RowChange::Insert(ProfileRow {
            latitude: Some(1.0),
            longitude: Some(1.0),
            location_enabled: true,
            ..ProfileRow::new(user)
        }));
        roster
    }

    #[test]
    fn test_rollback_restores_prior_fields() {
        let a = Uuid::new_v4();
        let mut roster = roster_with(a);
        let me = roster.me();

        let provisional = RelationshipLink::provisional_request(me);
        let edit = OptimisticLink::apply(&mut roster, a, Some(provisional));
        assert!(roster.get(&a).unwrap().relationship.is_some());

        edit.rollback(&mut roster);
        assert!(roster.get(&a).unwrap().relationship.is_none());
    }

    #[test]
    fn test_rollback_keeps_concurrent_profile_update() {
        let a = Uuid::new_v4();
        let mut roster = roster_with(a);
        let me = roster.me();

        let provisional = RelationshipLink::provisional_request(me);
        let edit = OptimisticLink::apply(&mut roster, a, Some(provisional));
        roster.apply_change_event(&RowChange::Update(ProfileRow {
            display_name: Some("renamed".into()),
            latitude: Some(2.0),
            longitude: Some(2.0),
            location_enabled: true,
            ..ProfileRow::new(a)
        }));
        edit.rollback(&mut roster);

        let entity = roster.get(&a).unwrap();
        assert_eq!(entity.display_name, "renamed");
        assert_eq!(entity.position.lat, 2.0);
        assert!(entity.relationship.is_none());
    }

    #[test]
    fn test_commit_swaps_temporary_id() {
        let a = Uuid::new_v4();
        let mut roster = roster_with(a);
        let me = roster.me();

        let provisional = RelationshipLink::provisional_request(me);
        let edit = OptimisticLink::apply(&mut roster, a, Some(provisional));
        let row = RelationshipRow {
            id: Uuid::new_v4(),
            requester_id: me,
            receiver_id: a,
            status: RelationshipStatus::Pending,
            requester_muted_until: None,
            receiver_muted_until: None,
            created_at: None,
        };
        assert!(edit.commit(&mut roster, Some(&row)));
        assert_eq!(
            roster.relationship_with(&a).unwrap().row,
            RowRef::Stored(row.id)
        );
    }
}
