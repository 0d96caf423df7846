//! Coordinator election
//!
//! A collapsed bully election: every Active member with a higher id than the
//! initiator would win its challenge, so the contest always resolves to the
//! highest Active id. Rather than simulating the per-node message exchange,
//! the winner is computed directly from the registry.
//!
//! ```text
//!   Idle ──start_election──► InProgress ──winner marked──► Idle
//!    │                                                      │
//!    └──── no Active members ──► Idle (leaderless) ◄────────┘
//! ```
//!
//! Overlapping elections are rejected rather than queued: the in-progress
//! flag is taken with a compare-and-swap and released by a guard on every
//! exit path. A rejected request marks the running election stale, and the
//! holder re-resolves once after releasing the flag, so membership changes
//! that raced with an election are never lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};
use crate::model::{Member, MemberId};

use super::registry::NodeRegistry;

/// Process-wide view of the election
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionState {
    pub in_progress: bool,
    pub current_coordinator_id: Option<MemberId>,
    /// Completed elections since startup
    pub term: u64,
}

/// Outcome of an election request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ElectionOutcome {
    #[serde(rename_all = "camelCase")]
    Elected {
        coordinator: MemberId,
        initiator: MemberId,
        /// Active members with an id above the initiator
        challengers: Vec<MemberId>,
        term: u64,
    },
    /// Another election was running; nothing changed
    AlreadyInProgress,
}

impl ElectionOutcome {
    pub fn coordinator(&self) -> Option<MemberId> {
        match self {
            ElectionOutcome::Elected { coordinator, .. } => Some(*coordinator),
            ElectionOutcome::AlreadyInProgress => None,
        }
    }
}

/// Clears the in-progress flag when dropped
struct ElectionGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ElectionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Coordinator election over the node registry
pub struct CoordinatorElection {
    registry: Arc<NodeRegistry>,
    in_progress: AtomicBool,
    /// Set when a request was rejected while an election was running
    stale: AtomicBool,
    current: RwLock<Option<MemberId>>,
    term: AtomicU64,
}

impl std::fmt::Debug for CoordinatorElection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorElection")
            .field("in_progress", &self.in_progress.load(Ordering::SeqCst))
            .field("current", &*self.current.read())
            .field("term", &self.term.load(Ordering::SeqCst))
            .finish()
    }
}

impl CoordinatorElection {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry,
            in_progress: AtomicBool::new(false),
            stale: AtomicBool::new(false),
            current: RwLock::new(None),
            term: AtomicU64::new(0),
        }
    }

    fn try_begin(&self) -> Option<ElectionGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ElectionGuard {
                flag: &self.in_progress,
            })
    }

    /// Select the highest-id Active member as the initial coordinator
    pub fn initialize(&self) -> Result<MemberId> {
        let Some(guard) = self.try_begin() else {
            return Err(ClusterError::ElectionAlreadyInProgress);
        };

        let result = match self.elect_highest(None) {
            Ok(Some((coordinator, _))) => {
                info!("Initial coordinator is {}", coordinator);
                Ok(coordinator)
            }
            Ok(None) => {
                self.enter_leaderless();
                Err(ClusterError::NoActiveMembers)
            }
            Err(e) => Err(e),
        };

        drop(guard);
        self.settle();
        result
    }

    /// Run an election on behalf of `initiator`.
    ///
    /// Returns `AlreadyInProgress` without touching any state when another
    /// election holds the flag.
    pub fn start_election(&self, initiator: MemberId) -> Result<ElectionOutcome> {
        let Some(guard) = self.try_begin() else {
            debug!(
                "Election requested by {} rejected: already in progress",
                initiator
            );
            self.mark_stale();
            return Ok(ElectionOutcome::AlreadyInProgress);
        };

        let result = self.run_election(initiator);

        drop(guard);
        self.settle();
        result
    }

    fn run_election(&self, initiator: MemberId) -> Result<ElectionOutcome> {
        let status = self
            .registry
            .status(initiator)
            .map_err(|_| ClusterError::InvalidInitiator(initiator))?;
        if !status.is_active() {
            return Err(ClusterError::InvalidInitiator(initiator));
        }

        info!("Election started by {}", initiator);

        match self.elect_highest(Some(initiator))? {
            Some((coordinator, challengers)) => {
                let term = self.term.load(Ordering::SeqCst);
                Ok(ElectionOutcome::Elected {
                    coordinator,
                    initiator,
                    challengers,
                    term,
                })
            }
            // The initiator itself crashed while the election was running
            None => {
                self.enter_leaderless();
                Err(ClusterError::NoActiveMembers)
            }
        }
    }

    fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
        // The holder may have released the flag before seeing the mark
        if !self.in_progress.load(Ordering::SeqCst) {
            self.settle();
        }
    }

    /// Re-resolve after requests were rejected. Must be called after the flag
    /// is released; if another election holds it, that holder settles instead.
    fn settle(&self) {
        while self.stale.load(Ordering::SeqCst) {
            let Some(_guard) = self.try_begin() else {
                return;
            };
            self.stale.store(false, Ordering::SeqCst);

            let highest = self.registry.active_ids().last().copied();
            if highest.is_some() && highest == self.registry.coordinator_id() {
                continue;
            }
            debug!("Re-resolving coordinator after a rejected election request");
            match self.elect_highest(None) {
                Ok(Some(_)) => {}
                Ok(None) => self.enter_leaderless(),
                Err(e) => warn!("Re-resolving coordinator failed: {}", e),
            }
        }
    }

    /// Compute and mark the winner. Must be called with the election flag held.
    ///
    /// Retries when the chosen winner crashes between selection and marking.
    fn elect_highest(
        &self,
        initiator: Option<MemberId>,
    ) -> Result<Option<(MemberId, Vec<MemberId>)>> {
        for _ in 0..=self.registry.len() {
            let active = self.registry.active_ids();
            let challengers: Vec<MemberId> = match initiator {
                Some(initiator) => active.iter().copied().filter(|id| *id > initiator).collect(),
                None => Vec::new(),
            };

            // Highest challenger wins; with no challengers the initiator keeps it
            let winner = match (challengers.last(), initiator) {
                (Some(highest), _) => *highest,
                (None, Some(initiator)) if active.contains(&initiator) => initiator,
                (None, _) => match active.last() {
                    Some(highest) => *highest,
                    None => return Ok(None),
                },
            };

            match self.registry.mark_coordinator(winner) {
                Ok(()) => {
                    *self.current.write() = Some(winner);
                    let term = self.term.fetch_add(1, Ordering::SeqCst) + 1;
                    metrics::counter!("synod_elections_total").increment(1);
                    info!(
                        "{} elected coordinator (term {}, challengers: {:?})",
                        winner, term, challengers
                    );
                    return Ok(Some((winner, challengers)));
                }
                Err(ClusterError::MemberUnavailable(id)) => {
                    debug!("Election winner {} crashed before taking over, retrying", id);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        warn!("Election could not settle on a coordinator");
        Ok(None)
    }

    fn enter_leaderless(&self) {
        self.registry.clear_all_coordinators();
        *self.current.write() = None;
        warn!("No active members, cluster is leaderless");
    }

    /// Handle a crashed member: drop its coordinator role if it held one,
    /// then re-elect from the highest remaining Active id.
    pub fn on_member_crashed(&self, id: MemberId) -> Result<ElectionOutcome> {
        self.forget_coordinator(id);

        let Some(highest) = self.registry.active_ids().last().copied() else {
            self.enter_leaderless();
            return Err(ClusterError::NoActiveMembers);
        };

        self.start_election(highest)
    }

    /// Clear the recorded coordinator if it is `id`
    pub fn forget_coordinator(&self, id: MemberId) {
        if self.registry.clear_coordinator(id) {
            info!("Coordinator {} lost", id);
        }
        let mut current = self.current.write();
        if *current == Some(id) {
            *current = None;
        }
    }

    pub fn current_coordinator_id(&self) -> Option<MemberId> {
        *self.current.read()
    }

    /// The current coordinator, if it is still Active
    pub fn current_coordinator(&self) -> Option<Member> {
        let id = self.current_coordinator_id()?;
        self.registry
            .find(id)
            .ok()
            .filter(|member| member.is_active() && member.is_coordinator)
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ElectionState {
        ElectionState {
            in_progress: self.is_in_progress(),
            current_coordinator_id: self.current_coordinator_id(),
            term: self.term.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dataset, MemberStatus};

    fn election(n: u32) -> (Arc<NodeRegistry>, CoordinatorElection) {
        let registry = Arc::new(NodeRegistry::new((1..=n).map(MemberId), &Dataset::default()));
        let election = CoordinatorElection::new(registry.clone());
        (registry, election)
    }

    #[test]
    fn test_initialize_picks_highest_id() {
        let (registry, election) = election(5);
        assert_eq!(election.initialize().unwrap(), MemberId(5));
        assert_eq!(registry.coordinator_id(), Some(MemberId(5)));
        assert_eq!(election.current_coordinator().map(|m| m.id), Some(MemberId(5)));
        assert!(!election.is_in_progress());
    }

    #[test]
    fn test_initialize_without_active_members() {
        let (registry, election) = election(2);
        registry.set_status(MemberId(1), MemberStatus::Crashed).unwrap();
        registry.set_status(MemberId(2), MemberStatus::Crashed).unwrap();

        assert_eq!(election.initialize().unwrap_err(), ClusterError::NoActiveMembers);
        assert!(election.current_coordinator().is_none());
        assert!(!election.is_in_progress());
    }

    #[test]
    fn test_lowest_initiator_yields_to_highest() {
        let (registry, election) = election(4);
        let outcome = election.start_election(MemberId(1)).unwrap();

        match outcome {
            ElectionOutcome::Elected {
                coordinator,
                challengers,
                ..
            } => {
                assert_eq!(coordinator, MemberId(4));
                assert_eq!(challengers, vec![MemberId(2), MemberId(3), MemberId(4)]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(registry.coordinator_count(), 1);
    }

    #[test]
    fn test_highest_initiator_wins_itself() {
        let (registry, election) = election(3);
        registry.set_status(MemberId(3), MemberStatus::Crashed).unwrap();

        let outcome = election.start_election(MemberId(2)).unwrap();
        assert_eq!(outcome.coordinator(), Some(MemberId(2)));
    }

    #[test]
    fn test_crashed_initiator_is_rejected() {
        let (registry, election) = election(3);
        registry.set_status(MemberId(1), MemberStatus::Crashed).unwrap();

        assert_eq!(
            election.start_election(MemberId(1)).unwrap_err(),
            ClusterError::InvalidInitiator(MemberId(1))
        );
        assert_eq!(
            election.start_election(MemberId(42)).unwrap_err(),
            ClusterError::InvalidInitiator(MemberId(42))
        );
        assert!(!election.is_in_progress());
    }

    #[test]
    fn test_overlapping_election_is_a_noop() {
        let (registry, election) = election(4);
        election.initialize().unwrap();
        registry.set_status(MemberId(4), MemberStatus::Crashed).unwrap();
        let before = registry.list_all();

        let _held = election.try_begin().unwrap();
        let outcome = election.start_election(MemberId(1)).unwrap();

        assert_eq!(outcome, ElectionOutcome::AlreadyInProgress);
        assert_eq!(registry.list_all(), before);
        assert_eq!(election.initialize().unwrap_err(), ClusterError::ElectionAlreadyInProgress);
    }

    #[test]
    fn test_rejected_request_is_settled_after_release() {
        let (registry, election) = election(4);
        election.initialize().unwrap();

        let held = election.try_begin().unwrap();
        registry.set_status(MemberId(4), MemberStatus::Crashed).unwrap();
        assert_eq!(
            election.start_election(MemberId(2)).unwrap(),
            ElectionOutcome::AlreadyInProgress
        );
        assert_eq!(registry.coordinator_id(), None);

        drop(held);
        election.settle();
        assert_eq!(registry.coordinator_id(), Some(MemberId(3)));
        assert_eq!(election.current_coordinator_id(), Some(MemberId(3)));
        assert!(!election.is_in_progress());
    }

    #[test]
    fn test_on_member_crashed_reelects() {
        let (registry, election) = election(6);
        election.initialize().unwrap();

        registry.set_status(MemberId(6), MemberStatus::Crashed).unwrap();
        let outcome = election.on_member_crashed(MemberId(6)).unwrap();
        assert_eq!(outcome.coordinator(), Some(MemberId(5)));
        assert_eq!(election.state().term, 2);
    }

    #[test]
    fn test_on_member_crashed_last_member_goes_leaderless() {
        let (registry, election) = election(1);
        election.initialize().unwrap();

        registry.set_status(MemberId(1), MemberStatus::Crashed).unwrap();
        assert_eq!(
            election.on_member_crashed(MemberId(1)).unwrap_err(),
            ClusterError::NoActiveMembers
        );
        assert_eq!(election.current_coordinator_id(), None);
        assert_eq!(registry.coordinator_count(), 0);
    }
}
