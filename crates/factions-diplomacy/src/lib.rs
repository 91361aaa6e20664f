//! Diplomacy Engine for the factions core.
//!
//! Relations live on the faction records themselves (`Faction::relations`,
//! absence meaning Neutral). This crate adds the ephemeral pending-ally
//! table and the rules for moving between states.
//!
//! # Symmetry
//!
//! - **Ally** can only be formed by the two-call handshake (request,
//!   accept), which writes both sides. Going neutral on a mutual ally
//!   clears both sides at once.
//! - **Enemy** and **Neutral** are one-sided. Declaring an enemy never
//!   changes how the target sees you, even if the target still lists you
//!   as an ally.
//!
//! Pending requests naming a faction that a reload from storage removed
//! are dropped inside that reload.
//!
//! Every mutation runs inside a registry transaction and takes the pending
//! table's lock after the registry's, so the relation maps and the pending
//! table change together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use factions_core::config::FactionsConfig;
use factions_core::error::FactionError;
use factions_core::event::{DisbandEvent, HookPriority};
use factions_core::faction::{
    Faction, FactionRelation, LogEntry, LogKind, Permission, Relation, RelationKind, Role,
};
use factions_core::id::{FactionId, PlayerId};
use factions_core::registry::{FactionRegistry, RegistryTxn};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An outstanding request from `from` to ally with `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAlly {
    pub from: FactionId,
    pub to: FactionId,
    pub requested_by: PlayerId,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllyRequestOutcome {
    /// A request is now pending on the target.
    RequestSent,
    /// The target had already asked us; the alliance is in place.
    AllianceFormed,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DiplomacyError {
    #[error("player is not in a faction")]
    NotInFaction,
    #[error("requires rank {required:?} or higher")]
    InsufficientRole { required: Role },
    #[error("faction not found")]
    FactionNotFound,
    #[error("a faction cannot have relations with itself")]
    CannotTargetSelf,
    #[error("already allied")]
    AlreadyAllied,
    #[error("already enemies")]
    AlreadyEnemy,
    #[error("already neutral")]
    AlreadyNeutral,
    #[error("no pending ally request from that faction")]
    NoPendingRequest,
    #[error(transparent)]
    Faction(#[from] FactionError),
}

/// Incoming requests keyed by target faction, then requesting faction.
type PendingTable = HashMap<FactionId, HashMap<FactionId, PendingAlly>>;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct DiplomacyEngine {
    pending: Mutex<PendingTable>,
    config: Arc<FactionsConfig>,
}

impl std::fmt::Debug for DiplomacyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiplomacyEngine")
            .field("pending", &self.lock().values().map(HashMap::len).sum::<usize>())
            .finish_non_exhaustive()
    }
}

impl DiplomacyEngine {
    pub fn new(config: Arc<FactionsConfig>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the disband hook that scrubs a faction's relations and the
    /// reload hook that forgets requests naming vanished factions.
    pub fn install(self: &Arc<Self>, registry: &FactionRegistry) {
        let engine = Arc::clone(self);
        registry.add_disband_hook(
            "diplomacy.clear_all_relations",
            HookPriority::Normal,
            Box::new(move |event: &DisbandEvent, txn: &mut RegistryTxn<'_>| {
                engine.clear_all_relations(txn, event.faction.id);
            }),
        );
        let engine = Arc::clone(self);
        registry.add_reload_hook(
            "diplomacy.drop_stale_requests",
            Box::new(move |txn: &mut RegistryTxn<'_>| {
                engine.drop_stale_requests(txn);
            }),
        );
    }

    // -- Queries --

    /// How `from` sees `to`.
    pub fn relation(&self, registry: &FactionRegistry, from: &FactionId, to: &FactionId) -> Relation {
        registry
            .get(from)
            .map(|f| f.relation_to(to))
            .unwrap_or(Relation::Neutral)
    }

    /// Requests waiting on `target`, oldest first.
    pub fn pending_for(&self, target: &FactionId) -> Vec<PendingAlly> {
        let mut requests: Vec<PendingAlly> = self
            .lock()
            .get(target)
            .map(|incoming| incoming.values().cloned().collect())
            .unwrap_or_default();
        requests.sort_by_key(|r| (r.requested_at, r.from));
        requests
    }

    pub fn has_pending(&self, from: &FactionId, to: &FactionId) -> bool {
        self.lock()
            .get(to)
            .is_some_and(|incoming| incoming.contains_key(from))
    }

    /// Drop requests older than the configured timeout. A timeout of zero
    /// keeps requests forever.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let secs = self.config.diplomacy.ally_request_timeout_secs;
        if secs == 0 {
            return 0;
        }
        let ttl = Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX));
        let mut pending = self.lock();
        let mut pruned = 0;
        for incoming in pending.values_mut() {
            let before = incoming.len();
            incoming.retain(|_, request| {
                request
                    .requested_at
                    .checked_add_signed(ttl)
                    .is_none_or(|expires| expires > now)
            });
            pruned += before - incoming.len();
        }
        pending.retain(|_, incoming| !incoming.is_empty());
        if pruned > 0 {
            debug!(pruned, "expired ally requests pruned");
        }
        pruned
    }

    // -- Handshake --

    /// Ask `target` for an alliance. If `target` already asked us, the
    /// alliance forms immediately.
    pub fn request_ally(
        &self,
        registry: &FactionRegistry,
        actor: PlayerId,
        target: FactionId,
    ) -> Result<AllyRequestOutcome, DiplomacyError> {
        registry.transaction(|txn| {
            let (mine, theirs) = pair(txn, actor, target)?;
            if mine.relation_to(&target) == Relation::Ally {
                return Err(DiplomacyError::AlreadyAllied);
            }

            let mut pending = self.lock();
            if pending
                .get(&mine.id)
                .is_some_and(|incoming| incoming.contains_key(&target))
            {
                form_alliance(txn, &mut pending, &mine, &theirs, actor)?;
                return Ok(AllyRequestOutcome::AllianceFormed);
            }

            pending.entry(target).or_default().insert(
                mine.id,
                PendingAlly {
                    from: mine.id,
                    to: target,
                    requested_by: actor,
                    requested_at: txn.now(),
                },
            );
            debug!(from = %mine.id, to = %target, "ally request sent");
            Ok(AllyRequestOutcome::RequestSent)
        })
    }

    /// Accept a pending request from `from`, making both sides allies.
    pub fn accept_ally(
        &self,
        registry: &FactionRegistry,
        actor: PlayerId,
        from: FactionId,
    ) -> Result<Arc<Faction>, DiplomacyError> {
        registry.transaction(|txn| {
            let mine = acting_faction(txn, actor)?;
            let mut pending = self.lock();
            if !pending
                .get(&mine.id)
                .is_some_and(|incoming| incoming.contains_key(&from))
            {
                return Err(DiplomacyError::NoPendingRequest);
            }
            let theirs = txn.faction(&from).ok_or(DiplomacyError::FactionNotFound)?;
            form_alliance(txn, &mut pending, &mine, &theirs, actor)
        })
    }

    /// Refuse a pending request from `from`.
    pub fn deny_ally(
        &self,
        registry: &FactionRegistry,
        actor: PlayerId,
        from: FactionId,
    ) -> Result<(), DiplomacyError> {
        registry.transaction(|txn| {
            let mine = acting_faction(txn, actor)?;
            let mut pending = self.lock();
            let removed = pending
                .get_mut(&mine.id)
                .and_then(|incoming| incoming.remove(&from));
            if removed.is_none() {
                return Err(DiplomacyError::NoPendingRequest);
            }
            if pending.get(&mine.id).is_some_and(HashMap::is_empty) {
                pending.remove(&mine.id);
            }
            debug!(from = %from, to = %mine.id, "ally request denied");
            Ok(())
        })
    }

    // -- Declarations --

    /// Mark `target` as an enemy on our side only. Pending requests between
    /// the pair are dropped; the target's view of us is left as it was.
    pub fn set_enemy(
        &self,
        registry: &FactionRegistry,
        actor: PlayerId,
        target: FactionId,
    ) -> Result<Arc<Faction>, DiplomacyError> {
        registry.transaction(|txn| {
            let (mine, theirs) = pair(txn, actor, target)?;
            if mine.relation_to(&target) == Relation::Enemy {
                return Err(DiplomacyError::AlreadyEnemy);
            }

            let mut pending = self.lock();
            clear_pair(&mut pending, mine.id, target);

            let now = txn.now();
            let updated = mine
                .with_relation(FactionRelation {
                    target,
                    kind: RelationKind::Enemy,
                    since: now,
                })
                .with_log(LogEntry::new(
                    now,
                    Some(actor),
                    LogKind::Relation,
                    format!("declared {} an enemy", theirs.name),
                ));
            let updated = txn.put(updated)?;
            info!(from = %mine.id, to = %target, "enemy declared");
            Ok(updated)
        })
    }

    /// Return to Neutral with `target`. Leaving an alliance clears the
    /// target's entry for us as well; otherwise only our side changes.
    pub fn set_neutral(
        &self,
        registry: &FactionRegistry,
        actor: PlayerId,
        target: FactionId,
    ) -> Result<Arc<Faction>, DiplomacyError> {
        registry.transaction(|txn| {
            let (mine, theirs) = pair(txn, actor, target)?;
            let current = mine.relation_to(&target);

            let mut pending = self.lock();
            let has_pending = pending
                .get(&target)
                .is_some_and(|incoming| incoming.contains_key(&mine.id))
                || pending
                    .get(&mine.id)
                    .is_some_and(|incoming| incoming.contains_key(&target));
            if current == Relation::Neutral && !has_pending {
                return Err(DiplomacyError::AlreadyNeutral);
            }
            clear_pair(&mut pending, mine.id, target);

            if current == Relation::Neutral {
                return Ok(mine);
            }

            let now = txn.now();
            if current == Relation::Ally && theirs.relation_to(&mine.id) != Relation::Neutral {
                let mirrored = theirs.without_relation(&mine.id).with_log(LogEntry::new(
                    now,
                    Some(actor),
                    LogKind::Relation,
                    format!("{} ended the alliance", mine.name),
                ));
                txn.put(mirrored)?;
                info!(from = %mine.id, to = %target, "alliance ended");
            }
            let updated = mine.without_relation(&target).with_log(LogEntry::new(
                now,
                Some(actor),
                LogKind::Relation,
                format!("now neutral with {}", theirs.name),
            ));
            Ok(txn.put(updated)?)
        })
    }

    // -- Disband cleanup --

    /// Remove every pending request involving `faction` and every other
    /// faction's relation entry pointing at it. Runs inside the disband
    /// transaction. Returns the number of relation entries scrubbed.
    pub fn clear_all_relations(&self, txn: &mut RegistryTxn<'_>, faction: FactionId) -> usize {
        {
            let mut pending = self.lock();
            pending.remove(&faction);
            for incoming in pending.values_mut() {
                incoming.remove(&faction);
            }
            pending.retain(|_, incoming| !incoming.is_empty());
        }

        let holders: Vec<Arc<Faction>> = txn
            .state()
            .factions()
            .filter(|f| f.relations.contains_key(&faction))
            .cloned()
            .collect();
        let now = txn.now();
        let mut scrubbed = 0;
        for holder in holders {
            let updated = holder.without_relation(&faction).with_log(LogEntry::new(
                now,
                None,
                LogKind::Relation,
                "a faction you had relations with disbanded".to_string(),
            ));
            if txn.put(updated).is_ok() {
                scrubbed += 1;
            }
        }
        debug!(faction = %faction, scrubbed, "relations cleared");
        scrubbed
    }

    /// Drop every pending request whose requester or target is no longer
    /// registered. Run from the reload hook.
    pub fn drop_stale_requests(&self, txn: &RegistryTxn<'_>) -> usize {
        let state = txn.state();
        let mut pending = self.lock();
        let before: usize = pending.values().map(HashMap::len).sum();
        pending.retain(|target, incoming| {
            if state.get(target).is_none() {
                return false;
            }
            incoming.retain(|from, _| state.get(from).is_some());
            !incoming.is_empty()
        });
        let dropped = before - pending.values().map(HashMap::len).sum::<usize>();
        if dropped > 0 {
            debug!(dropped, "stale ally requests dropped after reload");
        }
        dropped
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The actor's faction, provided their rank allows relation changes.
fn acting_faction(txn: &RegistryTxn<'_>, actor: PlayerId) -> Result<Arc<Faction>, DiplomacyError> {
    let faction = txn.faction_of(&actor).ok_or(DiplomacyError::NotInFaction)?;
    if !faction.allows(&actor, Permission::Relations) {
        return Err(DiplomacyError::InsufficientRole {
            required: faction.required_role(Permission::Relations),
        });
    }
    Ok(faction)
}

/// The actor's faction and a distinct, existing target.
fn pair(
    txn: &RegistryTxn<'_>,
    actor: PlayerId,
    target: FactionId,
) -> Result<(Arc<Faction>, Arc<Faction>), DiplomacyError> {
    let mine = acting_faction(txn, actor)?;
    if mine.id == target {
        return Err(DiplomacyError::CannotTargetSelf);
    }
    let theirs = txn.faction(&target).ok_or(DiplomacyError::FactionNotFound)?;
    Ok((mine, theirs))
}

fn clear_pair(pending: &mut PendingTable, a: FactionId, b: FactionId) {
    for (to, from) in [(a, b), (b, a)] {
        if let Some(incoming) = pending.get_mut(&to) {
            incoming.remove(&from);
            if incoming.is_empty() {
                pending.remove(&to);
            }
        }
    }
}

fn form_alliance(
    txn: &mut RegistryTxn<'_>,
    pending: &mut PendingTable,
    mine: &Faction,
    theirs: &Faction,
    actor: PlayerId,
) -> Result<Arc<Faction>, DiplomacyError> {
    let now = txn.now();
    let ally = |f: &Faction, other: &Faction| {
        f.with_relation(FactionRelation {
            target: other.id,
            kind: RelationKind::Ally,
            since: now,
        })
        .with_log(LogEntry::new(
            now,
            Some(actor),
            LogKind::Relation,
            format!("allied with {}", other.name),
        ))
    };
    let ours = ally(mine, theirs);
    let other = ally(theirs, mine);
    txn.put(other)?;
    let ours = txn.put(ours)?;
    clear_pair(pending, mine.id, theirs.id);
    info!(a = %mine.id, b = %theirs.id, "alliance formed");
    Ok(ours)
}
