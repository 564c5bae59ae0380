//! Failover/Election.
//!
//! Every peer periodically reads the session's [`CoordinatorRecord`]. When the
//! coordinator is missing from the player list, all peers independently pick
//! the lexicographically smallest listed id. Only the elected peer writes,
//! and it writes with compare-and-swap on the record version, so two peers
//! that race on a promotion cannot both win.
//!
//! Same deterministic-convergence idea as a minimum-id tie-break: no voting
//! round is needed because every peer computes the same answer.

use crate::actor::ActorId;
use crate::error::SessionError;
use crate::events::{EventBus, GameEvent};
use crate::wire::{decode, encode, SessionKeys};
use courtsync_env::{LockMode, PeerId, SharedStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// CAS attempts before a membership update gives up.
const MEMBERSHIP_ATTEMPTS: usize = 8;

/// A listed peer and the actor it drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    pub peer: PeerId,
    pub actor: ActorId,
}

/// Shared-store record naming the session's coordinator.
///
/// Seats change under the same compare-and-swap as the player list, so an
/// actor is never handed to two live peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorRecord {
    pub coordinator_id: Option<PeerId>,
    pub player_list: Vec<PeerId>,
    /// Bumped on every promotion
    pub epoch: u64,
    #[serde(default)]
    pub seats: Vec<Seat>,
}

impl CoordinatorRecord {
    /// A fresh session with `coordinator` in the first of `actors` seats.
    pub fn new(coordinator: PeerId, actors: u32) -> Self {
        let mut record = Self {
            player_list: Vec::new(),
            coordinator_id: Some(coordinator.clone()),
            epoch: 1,
            seats: Vec::new(),
        };
        record.admit(coordinator, actors);
        record
    }

    /// Lists `peer` and seats it at the lowest free actor, if any is left.
    pub fn admit(&mut self, peer: PeerId, actors: u32) {
        if let Some(actor) = self.free_actor(actors) {
            self.seats.push(Seat {
                peer: peer.clone(),
                actor,
            });
        }
        self.player_list.push(peer);
    }

    /// Unlists `peer` and frees its seat.
    pub fn dismiss(&mut self, peer: &PeerId) {
        self.player_list.retain(|p| p != peer);
        self.seats.retain(|seat| seat.peer != *peer);
    }

    pub fn actor_of(&self, peer: &PeerId) -> Option<ActorId> {
        self.seats.iter().find(|seat| seat.peer == *peer).map(|seat| seat.actor)
    }

    /// Lowest actor id below `actors` that no seat holds.
    pub fn free_actor(&self, actors: u32) -> Option<ActorId> {
        (0..actors)
            .map(ActorId)
            .find(|id| self.seats.iter().all(|seat| seat.actor != *id))
    }

    /// True while the coordinator is listed.
    pub fn is_healthy(&self) -> bool {
        self.coordinator_id
            .as_ref()
            .is_some_and(|c| self.player_list.contains(c))
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.player_list.contains(peer)
    }
}

/// Deterministic election: the lexicographically smallest id.
pub fn elect_new_coordinator(players: &[PeerId]) -> Option<PeerId> {
    players.iter().min().cloned()
}

/// Health of a coordinator record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy(PeerId),
    FailoverNeeded,
}

pub fn check_health(record: &CoordinatorRecord) -> HealthStatus {
    match &record.coordinator_id {
        Some(c) if record.player_list.contains(c) => HealthStatus::Healthy(c.clone()),
        _ => HealthStatus::FailoverNeeded,
    }
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// Coordinator present
    Healthy { coordinator: PeerId, epoch: u64 },
    /// This peer won the election and wrote the record
    Promoted { epoch: u64 },
    /// Another peer is elected; its write is pending
    AwaitingPromotion { elected: PeerId },
    /// Lost a CAS race; re-check next interval
    Contended,
    /// Nobody left to elect
    Abandoned,
    /// No record in the store yet
    NoRecord,
}

/// Reads the record and its store version.
pub async fn read_record<S: SharedStore>(
    store: &S,
    keys: &SessionKeys,
) -> Result<Option<(CoordinatorRecord, u64)>, SessionError> {
    let stored = store
        .read(keys.scope(), &keys.coordinator(), LockMode::Exclusive)
        .await?;
    match stored {
        Some(value) => Ok(Some((decode(&value.payload)?, value.version))),
        None => Ok(None),
    }
}

/// Runs the health check and, when elected, the promotion.
pub struct FailoverMonitor {
    local: PeerId,
    promotions: u64,
}

impl FailoverMonitor {
    pub fn new(local: PeerId) -> Self {
        Self { local, promotions: 0 }
    }

    pub fn promotions(&self) -> u64 {
        self.promotions
    }

    pub async fn check<S: SharedStore>(
        &mut self,
        store: &S,
        keys: &SessionKeys,
        events: &mut EventBus,
    ) -> Result<FailoverOutcome, SessionError> {
        let Some((record, version)) = read_record(store, keys).await? else {
            return Ok(FailoverOutcome::NoRecord);
        };

        if let HealthStatus::Healthy(coordinator) = check_health(&record) {
            return Ok(FailoverOutcome::Healthy {
                coordinator,
                epoch: record.epoch,
            });
        }

        let Some(elected) = elect_new_coordinator(&record.player_list) else {
            warn!("session {} has no candidate coordinator", keys.session());
            events.emit(GameEvent::SessionAbandoned {
                session: keys.session(),
            });
            return Ok(FailoverOutcome::Abandoned);
        };

        if elected != self.local {
            debug!("{} awaits promotion of {}", self.local, elected);
            return Ok(FailoverOutcome::AwaitingPromotion { elected });
        }

        let promoted = CoordinatorRecord {
            coordinator_id: Some(self.local.clone()),
            epoch: record.epoch + 1,
            ..record.clone()
        };
        let won = store
            .compare_and_swap(keys.scope(), &keys.coordinator(), Some(version), encode(&promoted)?)
            .await?;
        if !won {
            info!("{} lost the promotion race", self.local);
            return Ok(FailoverOutcome::Contended);
        }

        self.promotions += 1;
        info!(
            "{} promoted to coordinator (epoch {}, replacing {:?})",
            self.local, promoted.epoch, record.coordinator_id
        );
        events.emit(GameEvent::CoordinatorChanged {
            old: record.coordinator_id,
            new: self.local.clone(),
            epoch: promoted.epoch,
        });
        Ok(FailoverOutcome::Promoted {
            epoch: promoted.epoch,
        })
    }
}

// ============================================================================
// MEMBERSHIP
// ============================================================================

/// Adds `peer` to the session, creating it (with `peer` as coordinator)
/// when no record exists. The peer takes the lowest of `actors` seats not
/// held by a listed peer; with every seat taken it joins without an actor.
pub async fn join_session<S: SharedStore>(
    store: &S,
    keys: &SessionKeys,
    peer: &PeerId,
    actors: u32,
) -> Result<CoordinatorRecord, SessionError> {
    update_membership(store, keys, |record| match record {
        None => Some(CoordinatorRecord::new(peer.clone(), actors)),
        Some(mut record) => {
            if record.contains(peer) {
                return None;
            }
            record.admit(peer.clone(), actors);
            Some(record)
        }
    })
    .await
}

/// Removes `peer` from the player list. A departing coordinator is
/// replaced by the next health check.
pub async fn leave_session<S: SharedStore>(
    store: &S,
    keys: &SessionKeys,
    peer: &PeerId,
) -> Result<CoordinatorRecord, SessionError> {
    update_membership(store, keys, |record| {
        let mut record = record?;
        if !record.contains(peer) {
            return None;
        }
        record.dismiss(peer);
        Some(record)
    })
    .await
}

/// Read-modify-CAS loop. `change` returns `None` when nothing needs writing.
async fn update_membership<S, F>(store: &S, keys: &SessionKeys, change: F) -> Result<CoordinatorRecord, SessionError>
where
    S: SharedStore,
    F: Fn(Option<CoordinatorRecord>) -> Option<CoordinatorRecord>,
{
    for _ in 0..MEMBERSHIP_ATTEMPTS {
        let current = read_record(store, keys).await?;
        let (existing, version) = match current {
            Some((record, version)) => (Some(record), Some(version)),
            None => (None, None),
        };

        let Some(next) = change(existing.clone()) else {
            return existing.ok_or_else(|| SessionError::NotInSession(store.local_id()));
        };

        if store
            .compare_and_swap(keys.scope(), &keys.coordinator(), version, encode(&next)?)
            .await?
        {
            debug!("membership now {:?}", next.player_list);
            return Ok(next);
        }
    }
    Err(SessionError::Contended)
}
