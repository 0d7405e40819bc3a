//! The canonical in-memory roster of nearby users.
//!
//! Three sources race to mutate it: full re-fetch snapshots, change-feed
//! events, and optimistic local edits. Merges are field-level upserts. A
//! logical [`Revision`] clock stamps every event-driven or optimistic
//! mutation per identifier, and a snapshot carries the clock value at the
//! moment it was issued, so a slow snapshot can never overwrite anything
//! that happened after it was requested.
//!
//! Every mutation is a total function of (roster, input), which makes any
//! event sequence replayable.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use uuid::Uuid;

use crate::blocking::{BlockRow, BlockedSet};
use crate::feed::RowChange;
use crate::profile::{NearbyUser, ProfileRow, SnapshotEntry, StoryFlags};
use crate::relationship::{RelationshipLink, RelationshipRow, RowRef};
use crate::types::{RowId, UserId};

// ---------------------------------------------------------------------------
// Logical clock
// ---------------------------------------------------------------------------

/// Monotonic logical time of the roster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(pub u64);

/// Last revision at which each identifier (user or row) was mutated.
#[derive(Debug, Clone, Default)]
pub(crate) struct Stamps(HashMap<Uuid, Revision>);

impl Stamps {
    pub(crate) fn touch(&mut self, id: Uuid, at: Revision) {
        self.0.insert(id, at);
    }

    /// Whether `id` was mutated after the snapshot `ticket` was issued.
    pub(crate) fn newer_than(&self, id: &Uuid, ticket: Revision) -> bool {
        self.0.get(id).is_some_and(|at| *at > ticket)
    }

    /// Drop stamps no later snapshot can be older than.
    pub(crate) fn prune_through(&mut self, ticket: Revision) {
        self.0.retain(|_, at| *at > ticket);
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What a single event did to the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Upserted,
    Removed,
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub upserted: usize,
    pub removed: usize,
    /// Identifiers skipped because a newer event already touched them.
    pub stale: usize,
}

/// Captured relationship fields of one counterpart.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSnapshot {
    pub user: UserId,
    pub link: Option<RelationshipLink>,
}

// ---------------------------------------------------------------------------
// RosterStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RosterStore {
    me: UserId,
    entities: IndexMap<UserId, NearbyUser>,
    blocked: BlockedSet,
    /// Relationship fields of counterparts not currently in the roster.
    detached_links: HashMap<UserId, RelationshipLink>,
    /// Relationship row id -> counterpart.
    counterparts: HashMap<RowId, UserId>,
    /// Block row id -> counterpart, for key-only delete events.
    block_rows: HashMap<RowId, UserId>,
    clock: Revision,
    profile_stamps: Stamps,
    link_stamps: Stamps,
    block_stamps: Stamps,
    last_profile_snapshot: Revision,
    last_link_snapshot: Revision,
    last_block_snapshot: Revision,
}

impl RosterStore {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            entities: IndexMap::new(),
            blocked: BlockedSet::default(),
            detached_links: HashMap::new(),
            counterparts: HashMap::new(),
            block_rows: HashMap::new(),
            clock: Revision::default(),
            profile_stamps: Stamps::default(),
            link_stamps: Stamps::default(),
            block_stamps: Stamps::default(),
            last_profile_snapshot: Revision::default(),
            last_link_snapshot: Revision::default(),
            last_block_snapshot: Revision::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Read model
    // -----------------------------------------------------------------------

    pub fn me(&self) -> UserId {
        self.me
    }

    /// Visible entities in insertion order.
    pub fn entities(&self) -> &IndexMap<UserId, NearbyUser> {
        &self.entities
    }

    pub fn get(&self, id: &UserId) -> Option<&NearbyUser> {
        self.entities.get(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn blocked(&self) -> &BlockedSet {
        &self.blocked
    }

    pub fn revision(&self) -> Revision {
        self.clock
    }

    /// The locally known relationship with `user`, visible or not.
    pub fn relationship_with(&self, user: &UserId) -> Option<&RelationshipLink> {
        match self.entities.get(user) {
            Some(entity) => entity.relationship.as_ref(),
            None => self.detached_links.get(user),
        }
    }

    /// Counterpart cached for a relationship row id.
    pub fn counterpart_of(&self, row: &RowId) -> Option<UserId> {
        self.counterparts.get(row).copied()
    }

    // -----------------------------------------------------------------------
    // Profile snapshot
    // -----------------------------------------------------------------------

    /// Ticket to pass to the `apply_*_snapshot` call that completes a fetch
    /// issued now.
    pub fn begin_snapshot(&self) -> Revision {
        self.clock
    }

    /// Merge a full re-fetch of visible profiles.
    ///
    /// Upserts every listed entity without touching relationship fields
    /// (and story flags unless the entry carries them), and removes entities
    /// the snapshot no longer lists. Identifiers mutated after `ticket` are
    /// left alone.
    pub fn apply_snapshot(
        &mut self,
        ticket: Revision,
        entries: impl IntoIterator<Item = SnapshotEntry>,
    ) -> SnapshotSummary {
        let mut summary = SnapshotSummary::default();
        if ticket < self.last_profile_snapshot {
            return summary;
        }
        self.last_profile_snapshot = ticket;

        let mut listed = HashSet::new();
        for entry in entries {
            let id = entry.profile.id;
            if id == self.me {
                continue;
            }
            listed.insert(id);
            if self.blocked.contains(&id) {
                continue;
            }
            if self.profile_stamps.newer_than(&id, ticket) {
                summary.stale += 1;
                continue;
            }
            match entry.profile.visible_position() {
                Some(_) => {
                    self.upsert(&entry.profile, entry.stories);
                    summary.upserted += 1;
                }
                None => {
                    if self.remove(&id) {
                        summary.removed += 1;
                    }
                }
            }
        }

        let absent: Vec<UserId> = self
            .entities
            .keys()
            .filter(|id| !listed.contains(*id) && !self.profile_stamps.newer_than(id, ticket))
            .copied()
            .collect();
        for id in absent {
            if self.remove(&id) {
                summary.removed += 1;
            }
        }

        summary
    }

    // -----------------------------------------------------------------------
    // Profile change events
    // -----------------------------------------------------------------------

    /// Apply an insert/update/delete on the profiles table.
    pub fn apply_change_event(&mut self, change: &RowChange<ProfileRow, UserId>) -> Applied {
        let id = match change {
            RowChange::Insert(row) | RowChange::Update(row) => row.id,
            RowChange::Delete { key, .. } => *key,
        };
        if self.blocked.contains(&id) {
            return self.removal(&id);
        }
        if id == self.me {
            return Applied::Ignored;
        }

        let at = self.tick();
        self.profile_stamps.touch(id, at);

        let visible = change
            .upserted()
            .filter(|row| row.visible_position().is_some());
        match visible {
            Some(row) => {
                self.upsert(row, None);
                Applied::Upserted
            }
            None => self.removal(&id),
        }
    }

    // -----------------------------------------------------------------------
    // Relationship events and snapshot
    // -----------------------------------------------------------------------

    /// Patch the counterpart's relationship fields from a relationship row change.
    pub fn apply_relationship_event(
        &mut self,
        change: &RowChange<RelationshipRow, RowId>,
    ) -> Applied {
        match change {
            RowChange::Insert(row) | RowChange::Update(row) => {
                let Some((counterpart, link)) = row.link_for(self.me) else {
                    return Applied::Ignored;
                };
                let at = self.tick();
                self.link_stamps.touch(counterpart, at);
                self.write_link(counterpart, Some(link));
                Applied::Upserted
            }
            RowChange::Delete { key, old } => {
                let counterpart = self
                    .counterparts
                    .get(key)
                    .copied()
                    .or_else(|| old.as_ref().and_then(|row| row.counterpart(self.me)));
                let Some(counterpart) = counterpart else {
                    return Applied::Ignored;
                };
                // Only clear fields that still describe the deleted row.
                let describes_row = self
                    .relationship_with(&counterpart)
                    .is_some_and(|link| link.row == RowRef::Stored(*key));
                self.counterparts.remove(key);
                if !describes_row {
                    return Applied::Ignored;
                }
                let at = self.tick();
                self.link_stamps.touch(counterpart, at);
                self.write_link(counterpart, None);
                Applied::Removed
            }
        }
    }

    /// Re-derive relationship fields from every row involving the local user.
    ///
    /// Temporary links belong to an in-flight command and are left alone.
    pub fn apply_relationship_snapshot(
        &mut self,
        ticket: Revision,
        rows: impl IntoIterator<Item = RelationshipRow>,
    ) -> SnapshotSummary {
        let mut summary = SnapshotSummary::default();
        if ticket < self.last_link_snapshot {
            return summary;
        }
        self.last_link_snapshot = ticket;

        let mut listed = HashSet::new();
        for row in rows {
            let Some((counterpart, link)) = row.link_for(self.me) else {
                continue;
            };
            listed.insert(counterpart);
            if self.link_stamps.newer_than(&counterpart, ticket) || self.is_provisional(&counterpart)
            {
                summary.stale += 1;
                continue;
            }
            self.write_link(counterpart, Some(link));
            summary.upserted += 1;
        }

        let linked: Vec<UserId> = self
            .entities
            .iter()
            .filter(|(_, e)| e.relationship.is_some())
            .map(|(id, _)| *id)
            .chain(self.detached_links.keys().copied())
            .collect();
        for counterpart in linked {
            if listed.contains(&counterpart)
                || self.link_stamps.newer_than(&counterpart, ticket)
                || self.is_provisional(&counterpart)
            {
                continue;
            }
            self.write_link(counterpart, None);
            summary.removed += 1;
        }

        summary
    }

    // -----------------------------------------------------------------------
    // Blocking
    // -----------------------------------------------------------------------

    /// Replace the blocked set with the result of the two block queries.
    pub fn apply_blocked_snapshot(&mut self, ticket: Revision, fetched: BlockedSet) -> usize {
        if ticket < self.last_block_snapshot {
            return 0;
        }
        self.last_block_snapshot = ticket;

        let mut next = BlockedSet::default();
        for id in fetched.iter() {
            // Unblocked after the fetch was issued.
            let recently_unblocked =
                self.block_stamps.newer_than(id, ticket) && !self.blocked.contains(id);
            if !recently_unblocked {
                next.insert(*id);
            }
        }
        for id in self.blocked.iter() {
            if self.block_stamps.newer_than(id, ticket) {
                next.insert(*id);
            }
        }
        self.blocked = next;
        self.evict_blocked()
    }

    /// Apply an insert/delete on the block-list table.
    pub fn apply_block_event(&mut self, change: &RowChange<BlockRow, RowId>) -> Applied {
        match change {
            RowChange::Insert(row) | RowChange::Update(row) => {
                let Some(counterpart) = row.counterpart(self.me) else {
                    return Applied::Ignored;
                };
                self.block_rows.insert(row.id, counterpart);
                self.mark_blocked(counterpart)
            }
            RowChange::Delete { key, old } => {
                let counterpart = self
                    .block_rows
                    .remove(key)
                    .or_else(|| old.as_ref().and_then(|row| row.counterpart(self.me)));
                let Some(counterpart) = counterpart else {
                    return Applied::Ignored;
                };
                let at = self.tick();
                self.block_stamps.touch(counterpart, at);
                self.blocked.remove(&counterpart);
                // The entity comes back with the next snapshot.
                Applied::Ignored
            }
        }
    }

    /// Hide `user` immediately, e.g. after a confirmed local block.
    pub fn mark_blocked(&mut self, user: UserId) -> Applied {
        let at = self.tick();
        self.block_stamps.touch(user, at);
        self.blocked.insert(user);
        self.removal(&user)
    }

    // -----------------------------------------------------------------------
    // Optimistic edits
    // -----------------------------------------------------------------------

    pub fn link_snapshot(&self, user: UserId) -> LinkSnapshot {
        LinkSnapshot {
            user,
            link: self.relationship_with(&user).cloned(),
        }
    }

    /// Overwrite the relationship fields of `user` as a local edit.
    pub fn set_link(&mut self, user: UserId, link: Option<RelationshipLink>) {
        let at = self.tick();
        self.link_stamps.touch(user, at);
        self.write_link(user, link);
    }

    /// Restore captured relationship fields verbatim.
    pub fn restore_link(&mut self, snapshot: LinkSnapshot) {
        self.set_link(snapshot.user, snapshot.link);
    }

    /// Drop a row id from the counterpart cache so that the echo of our
    /// own delete is not mistaken for a remote change.
    pub fn forget_row(&mut self, row: &RowId) -> Option<UserId> {
        self.counterparts.remove(row)
    }

    /// Swap a provisional row reference for the confirmed row.
    ///
    /// Returns `false` when the link has moved on (e.g. the feed already
    /// delivered the row, or another edit replaced it).
    pub fn confirm_link(&mut self, user: UserId, provisional: RowRef, row: &RelationshipRow) -> bool {
        let still_provisional = self
            .relationship_with(&user)
            .is_some_and(|link| link.row == provisional);
        if !still_provisional {
            return false;
        }
        match row.link_for(self.me) {
            Some((counterpart, link)) if counterpart == user => {
                self.set_link(user, Some(link));
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn tick(&mut self) -> Revision {
        self.clock = Revision(self.clock.0 + 1);
        self.clock
    }

    fn is_provisional(&self, user: &UserId) -> bool {
        self.relationship_with(user)
            .is_some_and(|link| matches!(link.row, RowRef::Temporary(_)))
    }

    fn upsert(&mut self, row: &ProfileRow, stories: Option<StoryFlags>) {
        let Some(position) = row.visible_position() else {
            return;
        };
        match self.entities.get_mut(&row.id) {
            Some(entity) => {
                entity.merge_profile(row, position);
                if let Some(stories) = stories {
                    entity.stories = stories;
                }
            }
            None => {
                let link = self.detached_links.remove(&row.id);
                let entity =
                    NearbyUser::from_profile(row, position, link, stories.unwrap_or_default());
                self.entities.insert(row.id, entity);
            }
        }
    }

    /// Remove an entity, keeping its relationship fields for later.
    fn remove(&mut self, id: &UserId) -> bool {
        match self.entities.shift_remove(id) {
            Some(entity) => {
                if let Some(link) = entity.relationship {
                    self.detached_links.insert(*id, link);
                }
                true
            }
            None => false,
        }
    }

    fn removal(&mut self, id: &UserId) -> Applied {
        if self.remove(id) {
            Applied::Removed
        } else {
            Applied::Ignored
        }
    }

    fn evict_blocked(&mut self) -> usize {
        let blocked: Vec<UserId> = self
            .entities
            .keys()
            .filter(|id| self.blocked.contains(id))
            .copied()
            .collect();
        for id in &blocked {
            self.remove(id);
        }
        blocked.len()
    }

    fn write_link(&mut self, user: UserId, link: Option<RelationshipLink>) {
        if let Some(previous) = self.relationship_with(&user).and_then(|l| l.row.stored_id()) {
            if self.counterparts.get(&previous) == Some(&user) {
                self.counterparts.remove(&previous);
            }
        }
        if let Some(id) = link.as_ref().and_then(|l| l.row.stored_id()) {
            self.counterparts.insert(id, user);
        }

        match self.entities.get_mut(&user) {
            Some(entity) => entity.relationship = link,
            None => match link {
                Some(link) => {
                    self.detached_links.insert(user, link);
                }
                None => {
                    self.detached_links.remove(&user);
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::relationship::RelationshipStatus;

    fn visible(id: UserId, lat: f64) -> ProfileRow {
        ProfileRow {
            display_name: Some(format!("user-{lat}")),
            latitude: Some(lat),
            longitude: Some(4.0),
            location_enabled: true,
            ..ProfileRow::new(id)
        }
    }

    fn pending(requester: UserId, receiver: UserId) -> RelationshipRow {
        RelationshipRow {
            id: Uuid::new_v4(),
            requester_id: requester,
            receiver_id: receiver,
            status: RelationshipStatus::Pending,
            requester_muted_until: None,
            receiver_muted_until: None,
            created_at: None,
        }
    }

    fn roster() -> RosterStore {
        RosterStore::new(Uuid::new_v4())
    }

    // -----------------------------------------------------------------------
    // Snapshot merge
    // -----------------------------------------------------------------------

    #[test]
    fn test_snapshot_inserts_visible_and_skips_hidden() {
        let mut r = roster();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let hidden = ProfileRow {
            ghost_mode: true,
            ..visible(b, 1.0)
        };

        let ticket = r.begin_snapshot();
        let summary = r.apply_snapshot(ticket, [visible(a, 1.0).into(), hidden.into()]);

        assert_eq!(summary.upserted, 1);
        assert!(r.get(&a).is_some());
        assert!(r.get(&b).is_none());
    }

    #[test]
    fn test_snapshot_preserves_relationship_fields() {
        let mut r = roster();
        let me = r.me();
        let a = Uuid::new_v4();
        r.apply_change_event(&RowChange::Insert(visible(a, 1.0)));
        r.apply_relationship_event(&RowChange::Insert(pending(me, a)));

        let ticket = r.begin_snapshot();
        r.apply_snapshot(ticket, [visible(a, 2.0).into()]);

        let entity = r.get(&a).unwrap();
        assert_eq!(entity.position.lat, 2.0);
        assert_eq!(
            entity.relationship.as_ref().map(|l| l.status),
            Some(RelationshipStatus::Pending)
        );
    }

    #[test]
    fn test_snapshot_removes_unlisted_entities() {
        let mut r = roster();
        let a = Uuid::new_v4();
        let ticket = r.begin_snapshot();
        r.apply_snapshot(ticket, [visible(a, 1.0).into()]);

        let ticket = r.begin_snapshot();
        let summary = r.apply_snapshot(ticket, Vec::<SnapshotEntry>::new());
        assert_eq!(summary.removed, 1);
        assert!(r.is_empty());
    }

    #[test]
    fn test_stale_snapshot_does_not_resurrect_hidden_entity() {
        let mut r = roster();
        let a = Uuid::new_v4();
        r.apply_change_event(&RowChange::Insert(visible(a, 1.0)));

        // Snapshot issued while `a` was visible, completes after the push
        // event hid it.
        let ticket = r.begin_snapshot();
        let hidden = ProfileRow {
            location_enabled: false,
            ..visible(a, 1.0)
        };
        assert_eq!(r.apply_change_event(&RowChange::Update(hidden)), Applied::Removed);

        let summary = r.apply_snapshot(ticket, [visible(a, 1.0).into()]);
        assert_eq!(summary.stale, 1);
        assert!(r.get(&a).is_none());
    }

    #[test]
    fn test_stale_snapshot_does_not_remove_fresh_insert() {
        let mut r = roster();
        let a = Uuid::new_v4();
        let ticket = r.begin_snapshot();
        r.apply_change_event(&RowChange::Insert(visible(a, 1.0)));

        r.apply_snapshot(ticket, Vec::<SnapshotEntry>::new());
        assert!(r.get(&a).is_some());
    }

    #[test]
    fn test_older_snapshot_after_newer_is_ignored() {
        let mut r = roster();
        let a = Uuid::new_v4();
        let old_ticket = r.begin_snapshot();
        r.apply_change_event(&RowChange::Insert(visible(Uuid::new_v4(), 9.0)));
        let new_ticket = r.begin_snapshot();

        r.apply_snapshot(new_ticket, [visible(a, 1.0).into()]);
        let summary = r.apply_snapshot(old_ticket, Vec::<SnapshotEntry>::new());
        assert_eq!(summary, SnapshotSummary::default());
        assert!(r.get(&a).is_some());
    }

    #[test]
    fn test_snapshot_entry_story_flags_override() {
        let mut r = roster();
        let a = Uuid::new_v4();
        let flags = StoryFlags {
            has_story: true,
            has_unseen_story: true,
        };
        let ticket = r.begin_snapshot();
        r.apply_snapshot(
            ticket,
            [SnapshotEntry {
                profile: visible(a, 1.0),
                stories: Some(flags),
            }],
        );
        // Push events carry no story flags and must keep them.
        r.apply_change_event(&RowChange::Update(visible(a, 1.5)));
        assert_eq!(r.get(&a).unwrap().stories, flags);
    }

    // -----------------------------------------------------------------------
    // Change events
    // -----------------------------------------------------------------------

    #[test]
    fn test_update_is_idempotent() {
        let mut r = roster();
        let a = Uuid::new_v4();
        let change = RowChange::Update(visible(a, 1.0));

        r.apply_change_event(&change);
        let once = r.entities().clone();
        r.apply_change_event(&change);
        assert_eq!(r.entities(), &once);
    }

    #[test]
    fn test_delete_event_removes_entity() {
        let mut r = roster();
        let a = Uuid::new_v4();
        r.apply_change_event(&RowChange::Insert(visible(a, 1.0)));
        let applied = r.apply_change_event(&RowChange::Delete { key: a, old: None });
        assert_eq!(applied, Applied::Removed);
        assert!(r.is_empty());
    }

    #[test]
    fn test_own_profile_is_never_in_roster() {
        let mut r = roster();
        let me = r.me();
        assert_eq!(
            r.apply_change_event(&RowChange::Insert(visible(me, 1.0))),
            Applied::Ignored
        );
        assert!(r.is_empty());
    }

    #[test]
    fn test_insertion_order_is_preserved() {
        let mut r = roster();
        let ids: Vec<UserId> = (0..4).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            r.apply_change_event(&RowChange::Insert(visible(*id, i as f64)));
        }
        r.apply_change_event(&RowChange::Delete {
            key: ids[1],
            old: None,
        });
        r.apply_change_event(&RowChange::Update(visible(ids[0], 10.0)));

        let order: Vec<UserId> = r.entities().keys().copied().collect();
        assert_eq!(order, vec![ids[0], ids[2], ids[3]]);
    }

    #[test]
    fn test_reappearing_entity_keeps_relationship() {
        let mut r = roster();
        let me = r.me();
        let a = Uuid::new_v4();
        r.apply_change_event(&RowChange::Insert(visible(a, 1.0)));
        r.apply_relationship_event(&RowChange::Insert(pending(a, me)));

        let ghost = ProfileRow {
            ghost_mode: true,
            ..visible(a, 1.0)
        };
        r.apply_change_event(&RowChange::Update(ghost));
        assert!(r.get(&a).is_none());
        assert!(r.relationship_with(&a).is_some());

        r.apply_change_event(&RowChange::Update(visible(a, 1.0)));
        assert!(r.get(&a).unwrap().relationship.is_some());
    }

    // -----------------------------------------------------------------------
    // Blocking
    // -----------------------------------------------------------------------

    #[test]
    fn test_blocked_ids_dropped_before_processing() {
        let mut r = roster();
        let a = Uuid::new_v4();
        let ticket = r.begin_snapshot();
        r.apply_blocked_snapshot(ticket, BlockedSet::from_queries([a], []));

        assert_eq!(
            r.apply_change_event(&RowChange::Insert(visible(a, 1.0))),
            Applied::Ignored
        );
        let ticket = r.begin_snapshot();
        r.apply_snapshot(ticket, [visible(a, 1.0).into()]);
        assert!(r.get(&a).is_none());
    }

    #[test]
    fn test_block_event_evicts_either_direction() {
        let mut r = roster();
        let me = r.me();
        let a = Uuid::new_v4();
        r.apply_change_event(&RowChange::Insert(visible(a, 1.0)));

        let row = BlockRow {
            id: Uuid::new_v4(),
            blocker_id: a,
            blocked_id: me,
            created_at: None,
        };
        r.apply_block_event(&RowChange::Insert(row.clone()));
        assert!(r.get(&a).is_none());
        assert!(r.blocked().contains(&a));

        r.apply_block_event(&RowChange::Delete {
            key: row.id,
            old: None,
        });
        assert!(!r.blocked().contains(&a));
    }

    #[test]
    fn test_block_event_reports_whether_entity_was_visible() {
        let mut r = roster();
        let me = r.me();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        r.apply_change_event(&RowChange::Insert(visible(a, 1.0)));

        let block = |blocked_id| BlockRow {
            id: Uuid::new_v4(),
            blocker_id: me,
            blocked_id,
            created_at: None,
        };
        assert_eq!(
            r.apply_block_event(&RowChange::Insert(block(a))),
            Applied::Removed
        );
        assert_eq!(
            r.apply_block_event(&RowChange::Insert(block(b))),
            Applied::Ignored
        );
        assert!(r.blocked().contains(&b));

        // Already hidden by the first block.
        assert_eq!(r.mark_blocked(a), Applied::Ignored);
    }

    #[test]
    fn test_blocked_snapshot_keeps_fresh_local_block() {
        let mut r = roster();
        let a = Uuid::new_v4();
        let ticket = r.begin_snapshot();
        r.mark_blocked(a);

        r.apply_blocked_snapshot(ticket, BlockedSet::default());
        assert!(r.blocked().contains(&a));
    }

    // -----------------------------------------------------------------------
    // Relationship events
    // -----------------------------------------------------------------------

    #[test]
    fn test_relationship_event_patches_counterpart() {
        let mut r = roster();
        let me = r.me();
        let a = Uuid::new_v4();
        r.apply_change_event(&RowChange::Insert(visible(a, 1.0)));

        let row = pending(a, me);
        r.apply_relationship_event(&RowChange::Insert(row.clone()));
        assert_eq!(r.counterpart_of(&row.id), Some(a));

        let accepted = RelationshipRow {
            status: RelationshipStatus::Accepted,
            ..row.clone()
        };
        r.apply_relationship_event(&RowChange::Update(accepted));
        assert_eq!(
            r.get(&a).unwrap().relationship.as_ref().unwrap().status,
            RelationshipStatus::Accepted
        );

        r.apply_relationship_event(&RowChange::Delete {
            key: row.id,
            old: None,
        });
        assert!(r.get(&a).unwrap().relationship.is_none());
        assert_eq!(r.counterpart_of(&row.id), None);
    }

    #[test]
    fn test_unrelated_relationship_row_is_ignored() {
        let mut r = roster();
        let row = pending(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(
            r.apply_relationship_event(&RowChange::Insert(row)),
            Applied::Ignored
        );
    }

    #[test]
    fn test_forgotten_row_delete_is_ignored() {
        let mut r = roster();
        let me = r.me();
        let a = Uuid::new_v4();
        r.apply_change_event(&RowChange::Insert(visible(a, 1.0)));
        let row = pending(me, a);
        r.apply_relationship_event(&RowChange::Insert(row.clone()));

        // Cancel: forget, then optimistically re-poke before the echo lands.
        r.forget_row(&row.id);
        let provisional = RelationshipLink::provisional_request(me);
        r.set_link(a, Some(provisional.clone()));

        let applied = r.apply_relationship_event(&RowChange::Delete {
            key: row.id,
            old: None,
        });
        assert_eq!(applied, Applied::Ignored);
        assert_eq!(r.relationship_with(&a), Some(&provisional));
    }

    #[test]
    fn test_relationship_snapshot_clears_missing_rows() {
        let mut r = roster();
        let me = r.me();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        r.apply_change_event(&RowChange::Insert(visible(a, 1.0)));
        r.apply_change_event(&RowChange::Insert(visible(b, 2.0)));
        r.apply_relationship_event(&RowChange::Insert(pending(me, a)));

        let ticket = r.begin_snapshot();
        let row_b = pending(b, me);
        let summary = r.apply_relationship_snapshot(ticket, [row_b]);

        assert_eq!(summary.upserted, 1);
        assert_eq!(summary.removed, 1);
        assert!(r.get(&a).unwrap().relationship.is_none());
        assert!(r.get(&b).unwrap().relationship.is_some());
    }

    #[test]
    fn test_relationship_snapshot_keeps_provisional_link() {
        let mut r = roster();
        let me = r.me();
        let a = Uuid::new_v4();
        r.set_link(a, Some(RelationshipLink::provisional_request(me)));

        let ticket = r.begin_snapshot();
        r.apply_relationship_snapshot(ticket, Vec::new());
        assert!(r.relationship_with(&a).is_some());
    }

    // -----------------------------------------------------------------------
    // Optimistic support
    // -----------------------------------------------------------------------

    #[test]
    fn test_confirm_replaces_temporary_id() {
        let mut r = roster();
        let me = r.me();
        let a = Uuid::new_v4();
        let provisional = RelationshipLink::provisional_request(me);
        r.set_link(a, Some(provisional.clone()));

        let row = pending(me, a);
        assert!(r.confirm_link(a, provisional.row, &row));
        assert_eq!(r.relationship_with(&a).unwrap().row, RowRef::Stored(row.id));
        assert_eq!(r.counterpart_of(&row.id), Some(a));

        // Second confirmation is a no-op.
        assert!(!r.confirm_link(a, provisional.row, &row));
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    #[test]
    fn test_events_on_distinct_ids_commute() {
        let me = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let events_a = vec![
            RowChange::Insert(visible(a, 1.0)),
            RowChange::Update(visible(a, 1.5)),
        ];
        let events_b = vec![
            RowChange::Insert(visible(b, 2.0)),
            RowChange::Update(ProfileRow {
                ghost_mode: true,
                ..visible(b, 2.0)
            }),
            RowChange::Update(visible(b, 2.5)),
        ];

        let mut first = RosterStore::new(me);
        for e in events_a.iter().chain(events_b.iter()) {
            first.apply_change_event(e);
        }

        let mut second = RosterStore::new(me);
        let interleaved = [
            &events_b[0],
            &events_a[0],
            &events_b[1],
            &events_a[1],
            &events_b[2],
        ];
        for e in interleaved {
            second.apply_change_event(e);
        }

        // IndexMap equality ignores order; contents must match.
        assert_eq!(first.entities(), second.entities());
    }

    enum Step {
        Profile(RowChange<ProfileRow, UserId>),
        Relationship(RowChange<RelationshipRow, RowId>),
        SetLink(UserId, Option<RelationshipLink>),
        Capture(UserId),
        Restore(UserId),
        ProfileSnapshot(Vec<SnapshotEntry>),
        RelationshipSnapshot(Vec<RelationshipRow>),
    }

    /// Every merge of `streams` that keeps each stream's own order.
    fn interleavings<'a>(streams: &[&'a [Step]]) -> Vec<Vec<&'a Step>> {
        fn go<'a>(
            streams: &[&'a [Step]],
            prefix: &mut Vec<&'a Step>,
            out: &mut Vec<Vec<&'a Step>>,
        ) {
            if streams.iter().all(|s| s.is_empty()) {
                out.push(prefix.clone());
                return;
            }
            for i in 0..streams.len() {
                if let Some((head, rest)) = streams[i].split_first() {
                    let mut next = streams.to_vec();
                    next[i] = rest;
                    prefix.push(head);
                    go(&next, prefix, out);
                    prefix.pop();
                }
            }
        }
        let mut out = Vec::new();
        go(streams, &mut Vec::new(), &mut out);
        out
    }

    fn replay(base: &RosterStore, ticket: Revision, steps: &[&Step]) -> RosterStore {
        let mut r = base.clone();
        let mut captured = HashMap::new();
        for step in steps {
            match step {
                Step::Profile(change) => {
                    r.apply_change_event(change);
                }
                Step::Relationship(change) => {
                    r.apply_relationship_event(change);
                }
                Step::SetLink(user, link) => r.set_link(*user, link.clone()),
                Step::Capture(user) => {
                    captured.insert(*user, r.link_snapshot(*user));
                }
                Step::Restore(user) => {
                    if let Some(snapshot) = captured.remove(user) {
                        r.restore_link(snapshot);
                    }
                }
                Step::ProfileSnapshot(entries) => {
                    r.apply_snapshot(ticket, entries.clone());
                }
                Step::RelationshipSnapshot(rows) => {
                    r.apply_relationship_snapshot(ticket, rows.clone());
                }
            }
        }
        r
    }

    #[test]
    fn test_snapshots_and_edits_commute_across_ids() {
        let mut base = roster();
        let me = base.me();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        base.apply_change_event(&RowChange::Insert(visible(a, 1.0)));
        base.apply_change_event(&RowChange::Insert(visible(b, 2.0)));

        // Both reads are issued before any of the steps below and return
        // what the server held at that moment.
        let ticket = base.begin_snapshot();
        let reads = [
            Step::ProfileSnapshot(vec![visible(a, 1.1).into(), visible(b, 2.2).into()]),
            Step::RelationshipSnapshot(vec![pending(a, me), pending(b, me)]),
        ];

        let to_a = pending(me, a);
        let accepted_a = RelationshipRow {
            status: RelationshipStatus::Accepted,
            ..to_a.clone()
        };
        let steps_a = [
            Step::Profile(RowChange::Update(visible(a, 1.5))),
            Step::Relationship(RowChange::Insert(to_a.clone())),
            Step::Capture(a),
            Step::SetLink(a, accepted_a.link_for(me).map(|(_, link)| link)),
            Step::Restore(a),
        ];

        let from_b = pending(b, me);
        let accepted_b = RelationshipRow {
            status: RelationshipStatus::Accepted,
            ..from_b.clone()
        };
        let steps_b = [
            Step::Relationship(RowChange::Insert(from_b.clone())),
            Step::Profile(RowChange::Update(ProfileRow {
                ghost_mode: true,
                ..visible(b, 2.0)
            })),
            Step::SetLink(b, accepted_b.link_for(me).map(|(_, link)| link)),
            Step::Profile(RowChange::Update(visible(b, 2.5))),
        ];

        let orderings = interleavings(&[&steps_a[..], &steps_b[..], &reads[..]]);
        assert_eq!(orderings.len(), 6930);

        let expected = replay(&base, ticket, &orderings[0]);
        assert_eq!(expected.get(&a).map(|u| u.position.lat), Some(1.5));
        assert_eq!(expected.get(&b).map(|u| u.position.lat), Some(2.5));
        let link_a = expected.relationship_with(&a).unwrap();
        assert_eq!(
            (link_a.row, link_a.status),
            (RowRef::Stored(to_a.id), RelationshipStatus::Pending)
        );
        let link_b = expected.relationship_with(&b).unwrap();
        assert_eq!(
            (link_b.row, link_b.status),
            (RowRef::Stored(from_b.id), RelationshipStatus::Accepted)
        );

        for ordering in &orderings[1..] {
            let replayed = replay(&base, ticket, ordering);
            assert_eq!(replayed.entities(), expected.entities());
            for id in [a, b] {
                assert_eq!(replayed.relationship_with(&id), expected.relationship_with(&id));
            }
        }
    }
}
