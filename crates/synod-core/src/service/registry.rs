// Node registry
// Fixed set of cluster members with their mutable status and data

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::model::{Dataset, Member, MemberId, MemberStatus};

/// Result of a status transition
#[derive(Clone, Debug)]
pub struct StatusChange {
    /// Member state after the transition
    pub member: Member,
    pub previous: MemberStatus,
    /// Whether the member held the coordinator flag before the transition
    pub was_coordinator: bool,
}

/// Registry of every cluster member
///
/// Members are created once and never removed. Each member record sits
/// behind its own map entry, so mutations of one member are atomic with
/// respect to each other. Coordinator flag changes and reads that must
/// observe them consistently are additionally serialized by
/// `coordinator_lock` (always taken before any entry lock).
#[derive(Debug)]
pub struct NodeRegistry {
    members: DashMap<MemberId, Member>,
    coordinator_lock: Mutex<()>,
}

impl NodeRegistry {
    /// Create a registry where every member starts Active with its own copy of `seed`
    pub fn new(ids: impl IntoIterator<Item = MemberId>, seed: &Dataset) -> Self {
        let members = DashMap::new();
        for id in ids {
            members.insert(id, Member::new(id, seed.clone()));
        }

        Self {
            members,
            coordinator_lock: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.members.contains_key(&id)
    }

    /// All members in ascending id order
    pub fn list_all(&self) -> Vec<Member> {
        let _guard = self.coordinator_lock.lock();
        let mut members: Vec<Member> = self.members.iter().map(|e| e.value().clone()).collect();
        members.sort_by_key(|m| m.id);
        members
    }

    /// Active members in ascending id order
    pub fn list_active(&self) -> Vec<Member> {
        let _guard = self.coordinator_lock.lock();
        let mut members: Vec<Member> = self
            .members
            .iter()
            .filter(|e| e.value().is_active())
            .map(|e| e.value().clone())
            .collect();
        members.sort_by_key(|m| m.id);
        members
    }

    /// Ids of Active members in ascending order
    pub fn active_ids(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self
            .members
            .iter()
            .filter(|e| e.value().is_active())
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    pub fn ids(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self.members.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn find(&self, id: MemberId) -> Result<Member> {
        self.members
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(ClusterError::MemberNotFound(id))
    }

    pub fn status(&self, id: MemberId) -> Result<MemberStatus> {
        self.members
            .get(&id)
            .map(|e| e.value().status)
            .ok_or(ClusterError::MemberNotFound(id))
    }

    /// Unconditionally set a member's status, returning the previous one.
    /// Moving to Crashed drops the coordinator flag in the same step.
    pub fn set_status(&self, id: MemberId, status: MemberStatus) -> Result<MemberStatus> {
        let _guard = self.coordinator_lock.lock();
        let mut entry = self
            .members
            .get_mut(&id)
            .ok_or(ClusterError::MemberNotFound(id))?;
        let previous = entry.status;
        if previous != status {
            entry.status = status;
            entry.status_changed_at = chrono::Utc::now().timestamp_millis();
        }
        if !status.is_active() {
            entry.is_coordinator = false;
        }
        Ok(previous)
    }

    /// Compare-and-set a member's status from `from` to `to`.
    ///
    /// Fails with `AlreadyCrashed` / `NotCrashed` when the member is not in
    /// the expected state, so concurrent callers racing on the same
    /// transition see exactly one success.
    pub fn transition(&self, id: MemberId, from: MemberStatus, to: MemberStatus) -> Result<StatusChange> {
        let _guard = self.coordinator_lock.lock();
        let mut entry = self
            .members
            .get_mut(&id)
            .ok_or(ClusterError::MemberNotFound(id))?;

        if entry.status != from {
            return Err(match entry.status {
                MemberStatus::Crashed => ClusterError::AlreadyCrashed(id),
                MemberStatus::Active => ClusterError::NotCrashed(id),
            });
        }

        let was_coordinator = entry.is_coordinator;
        entry.status = to;
        entry.status_changed_at = chrono::Utc::now().timestamp_millis();
        if !to.is_active() {
            entry.is_coordinator = false;
        }

        debug!("Member {} transitioned {} -> {}", id, from, to);

        Ok(StatusChange {
            member: entry.value().clone(),
            previous: from,
            was_coordinator,
        })
    }

    /// Give the coordinator flag to `id`, clearing it on every other member first.
    ///
    /// Only an Active member can hold the flag.
    pub fn mark_coordinator(&self, id: MemberId) -> Result<()> {
        let _guard = self.coordinator_lock.lock();

        match self.members.get(&id) {
            None => return Err(ClusterError::MemberNotFound(id)),
            Some(entry) if !entry.is_active() => return Err(ClusterError::MemberUnavailable(id)),
            Some(_) => {}
        }

        for mut entry in self.members.iter_mut() {
            let holds = *entry.key() == id;
            entry.value_mut().is_coordinator = holds;
        }
        Ok(())
    }

    /// Drop the coordinator flag from `id`. Returns whether it was set.
    pub fn clear_coordinator(&self, id: MemberId) -> bool {
        let _guard = self.coordinator_lock.lock();
        match self.members.get_mut(&id) {
            Some(mut entry) => std::mem::replace(&mut entry.is_coordinator, false),
            None => false,
        }
    }

    pub fn clear_all_coordinators(&self) {
        let _guard = self.coordinator_lock.lock();
        for mut entry in self.members.iter_mut() {
            entry.value_mut().is_coordinator = false;
        }
    }

    /// The member currently flagged as coordinator, if any
    pub fn coordinator_id(&self) -> Option<MemberId> {
        let _guard = self.coordinator_lock.lock();
        self.members
            .iter()
            .find(|e| e.value().is_coordinator)
            .map(|e| *e.key())
    }

    /// Number of members flagged as coordinator
    pub fn coordinator_count(&self) -> usize {
        let _guard = self.coordinator_lock.lock();
        self.members.iter().filter(|e| e.value().is_coordinator).count()
    }

    /// Run `f` with exclusive access to one member's record
    pub fn with_member_mut<R>(&self, id: MemberId, f: impl FnOnce(&mut Member) -> R) -> Result<R> {
        let mut entry = self
            .members
            .get_mut(&id)
            .ok_or(ClusterError::MemberNotFound(id))?;
        Ok(f(entry.value_mut()))
    }

    /// Deep copy of a member's dataset
    pub fn dataset(&self, id: MemberId) -> Result<Dataset> {
        self.members
            .get(&id)
            .map(|e| e.value().dataset.clone())
            .ok_or(ClusterError::MemberNotFound(id))
    }

    /// Replace a member's dataset wholesale
    pub fn replace_dataset(&self, id: MemberId, dataset: Dataset) -> Result<()> {
        self.with_member_mut(id, |member| member.dataset = dataset)
    }
}
