//! Claim Index for the factions core.
//!
//! A chunk-keyed map from [`ChunkKey`] to the owning [`FactionId`]. It is a
//! derived cache of every faction's `claims` set and is only written while
//! the registry's write lock is held, inside a [`FactionRegistry::transaction`].
//! That gives a total lock order (registry, then chunk map, then ledger) and
//! serializes every claim, unclaim, and overclaim, so two callers racing for
//! the same chunk always resolve to a single winner.
//!
//! Reloads from storage rebuild the index through a registry reload hook,
//! inside the same write that swaps in the stored records.
//!
//! Plain lookups ([`ClaimIndex::owner`]) only take the chunk map's read lock.
//! Callers that need the index and the faction records to agree in one view
//! should read through [`FactionRegistry::inspect`], as
//! [`ClaimIndex::verify`] does.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use factions_core::chunk::ChunkKey;
use factions_core::config::FactionsConfig;
use factions_core::error::FactionError;
use factions_core::event::{DisbandEvent, HookPriority};
use factions_core::faction::{
    Faction, FactionClaim, LogEntry, LogKind, Permission, Relation, Role,
};
use factions_core::id::{FactionId, PlayerId};
use factions_core::registry::{FactionRegistry, RegistryTxn};
use factions_power::PowerLedger;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

/// Why a claim operation was refused. Nothing changes when one is returned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClaimError {
    #[error("player is not in a faction")]
    NotInFaction,
    #[error("requires rank {required:?} or higher")]
    InsufficientRole { required: Role },
    #[error("claiming is not allowed in world `{0}`")]
    WorldNotAllowed(String),
    #[error("chunk is already claimed by {owner}")]
    AlreadyClaimed { owner: FactionId },
    #[error("your faction already owns this chunk")]
    AlreadyOwned,
    #[error("claim capacity of {capacity} reached")]
    CapacityReached { capacity: usize },
    #[error("chunk must border your territory")]
    NotAdjacent,
    #[error("chunk is not claimed")]
    NotClaimed,
    #[error("chunk belongs to another faction")]
    NotOwner,
    #[error("chunk contains your faction home")]
    ContainsHome,
    #[error("cannot overclaim from an ally")]
    Allied,
    #[error("target faction is not raidable")]
    NotRaidable,
    #[error(transparent)]
    Faction(#[from] FactionError),
}

/// Successful overclaim results.
#[derive(Debug, Clone)]
pub enum OverclaimOutcome {
    /// The chunk moved from `from` to the attacker.
    Taken {
        faction: Arc<Faction>,
        from: FactionId,
    },
    /// The owning faction no longer exists; the chunk was reassigned.
    Orphaned { faction: Arc<Faction> },
    /// The attacker already owns the chunk. Nothing changed.
    AlreadyOwned,
}

/// One disagreement between the index and the faction records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClaimMismatch {
    /// A faction lists the chunk but the index does not map it to them.
    Unindexed { chunk: ChunkKey, faction: FactionId },
    /// The index maps the chunk to a faction that does not list it.
    Stale { chunk: ChunkKey, faction: FactionId },
}

/// Result of rebuilding the index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub chunks: usize,
    /// Chunks listed by more than one faction; the earliest claim kept it.
    pub conflicts: usize,
}

// ---------------------------------------------------------------------------
// Claim index
// ---------------------------------------------------------------------------

pub struct ClaimIndex {
    chunks: RwLock<HashMap<ChunkKey, FactionId>>,
    config: Arc<FactionsConfig>,
}

impl std::fmt::Debug for ClaimIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimIndex")
            .field("chunks", &self.len())
            .finish_non_exhaustive()
    }
}

impl ClaimIndex {
    pub fn new(config: Arc<FactionsConfig>) -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ChunkKey, FactionId>> {
        self.chunks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ChunkKey, FactionId>> {
        self.chunks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the disband hook that drops a faction's chunks and the
    /// reload hook that rebuilds the index from reloaded records.
    pub fn install(self: &Arc<Self>, registry: &FactionRegistry) {
        let index = Arc::clone(self);
        registry.add_disband_hook(
            "claims.unclaim_all",
            HookPriority::Normal,
            Box::new(move |event: &DisbandEvent, _txn: &mut RegistryTxn<'_>| {
                index.unclaim_all(event.faction.id);
            }),
        );
        let index = Arc::clone(self);
        registry.add_reload_hook(
            "claims.rebuild",
            Box::new(move |txn: &mut RegistryTxn<'_>| {
                index.rebuild(txn);
            }),
        );
    }

    // -- Queries --

    /// The faction owning `chunk`, if any.
    pub fn owner(&self, chunk: &ChunkKey) -> Option<FactionId> {
        self.read().get(chunk).copied()
    }

    /// Every chunk the index maps to `faction`, sorted.
    pub fn claims_of(&self, faction: &FactionId) -> Vec<ChunkKey> {
        let mut chunks: Vec<ChunkKey> = self
            .read()
            .iter()
            .filter(|(_, owner)| *owner == faction)
            .map(|(chunk, _)| chunk.clone())
            .collect();
        chunks.sort();
        chunks
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Compare the index with every faction's claim set under one consistent
    /// view. Empty means they agree.
    pub fn verify(&self, registry: &FactionRegistry) -> Vec<ClaimMismatch> {
        registry.inspect(|state| {
            let chunks = self.read();
            let mut mismatches = Vec::new();
            for faction in state.factions() {
                for chunk in faction.claims.keys() {
                    if chunks.get(chunk) != Some(&faction.id) {
                        mismatches.push(ClaimMismatch::Unindexed {
                            chunk: chunk.clone(),
                            faction: faction.id,
                        });
                    }
                }
            }
            for (chunk, owner) in chunks.iter() {
                if !state.get(owner).is_some_and(|f| f.owns(chunk)) {
                    mismatches.push(ClaimMismatch::Stale {
                        chunk: chunk.clone(),
                        faction: *owner,
                    });
                }
            }
            mismatches.sort();
            mismatches
        })
    }

    // -- Rebuild --

    /// Rebuild from every faction's claim set. A chunk listed by several
    /// factions stays with the earliest claim and is removed from the others.
    pub fn build_index(&self, registry: &FactionRegistry) -> BuildReport {
        registry.transaction(|txn| self.rebuild(txn))
    }

    /// [`ClaimIndex::build_index`] within an open transaction.
    pub fn rebuild(&self, txn: &mut RegistryTxn<'_>) -> BuildReport {
        let mut built: HashMap<ChunkKey, (FactionId, DateTime<Utc>)> = HashMap::new();
        let mut losers: Vec<(FactionId, ChunkKey)> = Vec::new();

        let mut factions: Vec<Arc<Faction>> = txn.state().factions().cloned().collect();
        factions.sort_by_key(|f| f.id);
        for faction in &factions {
            for claim in faction.claims.values() {
                match built.entry(claim.chunk.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert((faction.id, claim.claimed_at));
                    }
                    Entry::Occupied(mut slot) => {
                        let (holder, held_since) = *slot.get();
                        warn!(
                            chunk = %claim.chunk,
                            first = %holder,
                            second = %faction.id,
                            "chunk claimed by two factions"
                        );
                        if claim.claimed_at < held_since {
                            losers.push((holder, claim.chunk.clone()));
                            slot.insert((faction.id, claim.claimed_at));
                        } else {
                            losers.push((faction.id, claim.chunk.clone()));
                        }
                    }
                }
            }
        }

        let now = txn.now();
        for (loser, chunk) in &losers {
            let Some(faction) = txn.faction(loser) else {
                continue;
            };
            let updated = faction.without_claim(chunk).with_log(LogEntry::new(
                now,
                None,
                LogKind::LostClaim,
                format!("lost {chunk} to an earlier claim"),
            ));
            if let Err(err) = txn.put(updated) {
                warn!(faction = %loser, error = %err, "failed to drop conflicting claim");
            }
        }

        let mut chunks = self.write();
        *chunks = built
            .into_iter()
            .map(|(chunk, (owner, _))| (chunk, owner))
            .collect();
        let report = BuildReport {
            chunks: chunks.len(),
            conflicts: losers.len(),
        };
        info!(chunks = report.chunks, conflicts = report.conflicts, "claim index built");
        report
    }

    /// Drop every index entry owned by `faction`. Run from the disband hook,
    /// inside the disband transaction.
    pub fn unclaim_all(&self, faction: FactionId) -> usize {
        let mut chunks = self.write();
        let before = chunks.len();
        chunks.retain(|_, owner| *owner != faction);
        let removed = before - chunks.len();
        debug!(faction = %faction, removed, "released faction claims");
        removed
    }

    // -- Mutation --

    /// Claim an unowned chunk for the player's faction.
    pub fn claim(
        &self,
        registry: &FactionRegistry,
        ledger: &PowerLedger,
        player: PlayerId,
        chunk: ChunkKey,
    ) -> Result<Arc<Faction>, ClaimError> {
        registry.transaction(|txn| {
            let faction = member_with(txn, player, Permission::Claim)?;
            self.check_world(&chunk)?;

            let mut chunks = self.write();
            match chunks.get(&chunk) {
                Some(owner) if *owner == faction.id => return Err(ClaimError::AlreadyOwned),
                Some(owner) => return Err(ClaimError::AlreadyClaimed { owner: *owner }),
                None => {}
            }
            let capacity = ledger.claim_capacity(&faction);
            if faction.claim_count() >= capacity {
                return Err(ClaimError::CapacityReached { capacity });
            }
            if self.config.claims.require_adjacency
                && faction.claim_count() > 0
                && !faction.borders(&chunk)
            {
                return Err(ClaimError::NotAdjacent);
            }

            let now = txn.now();
            let updated = faction
                .with_claim(FactionClaim {
                    chunk: chunk.clone(),
                    claimed_at: now,
                    claimed_by: player,
                })
                .with_log(LogEntry::new(
                    now,
                    Some(player),
                    LogKind::Claimed,
                    format!("claimed {chunk}"),
                ));
            let updated = txn.put(updated)?;
            chunks.insert(chunk.clone(), faction.id);
            debug!(faction = %faction.id, %chunk, "chunk claimed");
            Ok(updated)
        })
    }

    /// Release a chunk the player's faction owns.
    pub fn unclaim(
        &self,
        registry: &FactionRegistry,
        player: PlayerId,
        chunk: ChunkKey,
    ) -> Result<Arc<Faction>, ClaimError> {
        registry.transaction(|txn| {
            let faction = member_with(txn, player, Permission::Unclaim)?;

            let mut chunks = self.write();
            match chunks.get(&chunk) {
                None => return Err(ClaimError::NotClaimed),
                Some(owner) if *owner != faction.id => return Err(ClaimError::NotOwner),
                Some(_) => {}
            }
            if faction.home_in(&chunk) {
                return Err(ClaimError::ContainsHome);
            }

            let updated = faction.without_claim(&chunk).with_log(LogEntry::new(
                txn.now(),
                Some(player),
                LogKind::Unclaimed,
                format!("unclaimed {chunk}"),
            ));
            let updated = txn.put(updated)?;
            chunks.remove(&chunk);
            debug!(faction = %faction.id, %chunk, "chunk unclaimed");
            Ok(updated)
        })
    }

    /// Take a chunk from a raidable faction.
    pub fn overclaim(
        &self,
        registry: &FactionRegistry,
        ledger: &PowerLedger,
        player: PlayerId,
        chunk: ChunkKey,
    ) -> Result<OverclaimOutcome, ClaimError> {
        registry.transaction(|txn| {
            let attacker = member_with(txn, player, Permission::Claim)?;
            self.check_world(&chunk)?;

            let mut chunks = self.write();
            let owner = *chunks.get(&chunk).ok_or(ClaimError::NotClaimed)?;
            if owner == attacker.id {
                return Ok(OverclaimOutcome::AlreadyOwned);
            }
            let now = txn.now();
            let claim = FactionClaim {
                chunk: chunk.clone(),
                claimed_at: now,
                claimed_by: player,
            };

            let Some(defender) = txn.faction(&owner) else {
                warn!(%chunk, orphaned_by = %owner, "reassigning orphaned claim");
                let updated = attacker.with_claim(claim).with_log(LogEntry::new(
                    now,
                    Some(player),
                    LogKind::Claimed,
                    format!("took orphaned {chunk}"),
                ));
                let updated = txn.put(updated)?;
                chunks.insert(chunk, attacker.id);
                return Ok(OverclaimOutcome::Orphaned { faction: updated });
            };

            if attacker.relation_to(&defender.id) == Relation::Ally
                || defender.relation_to(&attacker.id) == Relation::Ally
            {
                return Err(ClaimError::Allied);
            }
            if !ledger.is_raidable(&defender) {
                return Err(ClaimError::NotRaidable);
            }
            let capacity = ledger.claim_capacity(&attacker);
            if attacker.claim_count() >= capacity {
                return Err(ClaimError::CapacityReached { capacity });
            }

            let mut weakened = defender.without_claim(&chunk).with_log(LogEntry::new(
                now,
                Some(player),
                LogKind::LostClaim,
                format!("{chunk} was overclaimed by {}", attacker.name),
            ));
            if defender.home_in(&chunk) {
                weakened = weakened.with_home(None).with_log(LogEntry::new(
                    now,
                    Some(player),
                    LogKind::HomeChanged,
                    "home lost to an overclaim".to_string(),
                ));
            }
            let strengthened = attacker.with_claim(claim).with_log(LogEntry::new(
                now,
                Some(player),
                LogKind::Overclaimed,
                format!("overclaimed {chunk} from {}", defender.name),
            ));

            txn.put(weakened)?;
            let updated = txn.put(strengthened)?;
            chunks.insert(chunk.clone(), attacker.id);
            info!(attacker = %attacker.id, defender = %defender.id, %chunk, "chunk overclaimed");
            Ok(OverclaimOutcome::Taken {
                faction: updated,
                from: defender.id,
            })
        })
    }

    fn check_world(&self, chunk: &ChunkKey) -> Result<(), ClaimError> {
        if self.config.claims.worlds.allows(&chunk.world) {
            Ok(())
        } else {
            Err(ClaimError::WorldNotAllowed(chunk.world.clone()))
        }
    }
}

/// The player's faction, provided their rank covers `permission`.
fn member_with(
    txn: &RegistryTxn<'_>,
    player: PlayerId,
    permission: Permission,
) -> Result<Arc<Faction>, ClaimError> {
    let faction = txn.faction_of(&player).ok_or(ClaimError::NotInFaction)?;
    if !faction.allows(&player, permission) {
        return Err(ClaimError::InsufficientRole {
            required: faction.required_role(permission),
        });
    }
    Ok(faction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use factions_core::chunk::Location;
    use factions_core::faction::{FactionMember, FactionRelation, RelationKind};
    use factions_core::test_utils::*;
    use factions_power::test_utils::LedgerFixture;

    struct Fixture {
        fx: RegistryFixture,
        power: LedgerFixture,
        index: Arc<ClaimIndex>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(FactionsConfig::default())
        }

        fn with_config(config: FactionsConfig) -> Self {
            let fx = RegistryFixture::with_config(config.clone());
            let power = LedgerFixture::with_config(config);
            let index = Arc::new(ClaimIndex::new(fx.config.clone()));
            index.install(&fx.registry);
            Self { fx, power, index }
        }

        fn claim(&self, n: u128, x: i32, z: i32) -> Result<Arc<Faction>, ClaimError> {
            self.index
                .claim(&self.fx.registry, &self.power.ledger, player(n), chunk(x, z))
        }

        fn overclaim(&self, n: u128, x: i32, z: i32) -> Result<OverclaimOutcome, ClaimError> {
            self.index
                .overclaim(&self.fx.registry, &self.power.ledger, player(n), chunk(x, z))
        }

        fn assert_consistent(&self) {
            assert_eq!(self.index.verify(&self.fx.registry), vec![]);
        }
    }

    fn chunk(x: i32, z: i32) -> ChunkKey {
        ChunkKey::new("world", x, z)
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    #[test]
    fn claim_updates_index_and_faction_together() {
        let w = Fixture::new();
        let faction = w.fx.found(1, "Alpha");

        let updated = w.claim(1, 3, -2).unwrap();
        assert!(updated.owns(&chunk(3, -2)));
        assert_eq!(w.index.owner(&chunk(3, -2)), Some(faction.id));
        assert_eq!(w.index.claims_of(&faction.id), vec![chunk(3, -2)]);
        assert_eq!(updated.log.front().map(|e| e.kind), Some(LogKind::Claimed));
        w.assert_consistent();
    }

    #[test]
    fn claim_requires_officer_unless_overridden() {
        let w = Fixture::new();
        let faction = w.fx.found(1, "Alpha");
        w.fx.join(faction.id, 2);

        assert_eq!(
            w.claim(2, 0, 0).unwrap_err(),
            ClaimError::InsufficientRole {
                required: Role::Officer
            }
        );
        w.fx.registry
            .set_permission(player(1), Permission::Claim, Role::Member)
            .unwrap();
        assert!(w.claim(2, 0, 0).is_ok());
        assert_eq!(w.claim(9, 1, 0).unwrap_err(), ClaimError::NotInFaction);
    }

    #[test]
    fn claim_rejects_denied_world() {
        let mut config = FactionsConfig::default();
        config.claims.worlds.deny = vec!["nether".into()];
        let w = Fixture::with_config(config);
        w.fx.found(1, "Alpha");

        let err = w
            .index
            .claim(
                &w.fx.registry,
                &w.power.ledger,
                player(1),
                ChunkKey::new("nether", 0, 0),
            )
            .unwrap_err();
        assert_eq!(err, ClaimError::WorldNotAllowed("nether".into()));
        assert!(w.index.is_empty());
    }

    #[test]
    fn claim_rejects_owned_chunks() {
        let w = Fixture::new();
        let alpha = w.fx.found(1, "Alpha");
        w.fx.found(2, "Beta");
        w.claim(1, 0, 0).unwrap();

        assert_eq!(w.claim(1, 0, 0).unwrap_err(), ClaimError::AlreadyOwned);
        assert_eq!(
            w.claim(2, 0, 0).unwrap_err(),
            ClaimError::AlreadyClaimed { owner: alpha.id }
        );
    }

    #[test]
    fn capacity_gate_stops_sixth_claim() {
        let mut config = FactionsConfig::default();
        config.power.power_per_claim = 2.0;
        config.claims.max_claims = 100;
        let w = Fixture::with_config(config);
        let faction = w.fx.found(1, "Alpha");
        assert_eq!(w.power.ledger.faction_power(&faction), 10.0);

        for x in 0..5 {
            w.claim(1, x, 0).unwrap();
        }
        assert_eq!(
            w.claim(1, 5, 0).unwrap_err(),
            ClaimError::CapacityReached { capacity: 5 }
        );
        assert_eq!(w.index.len(), 5);
        assert!(w.index.owner(&chunk(5, 0)).is_none());
        w.assert_consistent();
    }

    #[test]
    fn adjacency_rule_ignores_diagonals() {
        let mut config = FactionsConfig::default();
        config.claims.require_adjacency = true;
        let w = Fixture::with_config(config);
        w.fx.found(1, "Alpha");

        w.claim(1, 10, 10).unwrap();
        assert_eq!(w.claim(1, 11, 11).unwrap_err(), ClaimError::NotAdjacent);
        w.claim(1, 11, 10).unwrap();
        w.claim(1, 11, 11).unwrap();
    }

    #[test]
    fn adjacency_rule_holds_at_the_coordinate_edge() {
        let mut config = FactionsConfig::default();
        config.claims.require_adjacency = true;
        let w = Fixture::with_config(config);
        w.fx.found(1, "Alpha");
        w.fx.found(2, "Beta");

        w.claim(1, 0, 0).unwrap();
        assert_eq!(w.claim(1, i32::MAX, 0).unwrap_err(), ClaimError::NotAdjacent);
        assert_eq!(w.claim(1, i32::MIN, 0).unwrap_err(), ClaimError::NotAdjacent);

        w.claim(2, i32::MAX, i32::MAX).unwrap();
        w.claim(2, i32::MAX - 1, i32::MAX).unwrap();
        assert_eq!(
            w.claim(2, i32::MIN, i32::MAX).unwrap_err(),
            ClaimError::NotAdjacent
        );
        w.assert_consistent();
    }

    // -----------------------------------------------------------------------
    // Unclaim
    // -----------------------------------------------------------------------

    #[test]
    fn unclaim_checks_ownership_and_home() {
        let w = Fixture::new();
        w.fx.found(1, "Alpha");
        w.fx.found(2, "Beta");
        w.claim(1, 0, 0).unwrap();
        w.claim(1, 1, 0).unwrap();

        let unclaim = |n, x, z| w.index.unclaim(&w.fx.registry, player(n), chunk(x, z));
        assert_eq!(unclaim(1, 5, 5).unwrap_err(), ClaimError::NotClaimed);
        assert_eq!(unclaim(2, 0, 0).unwrap_err(), ClaimError::NotOwner);

        w.fx.registry
            .set_home(player(1), Some(Location::new("world", 1.0, 64.0, 1.0)))
            .unwrap();
        assert_eq!(unclaim(1, 0, 0).unwrap_err(), ClaimError::ContainsHome);

        let updated = unclaim(1, 1, 0).unwrap();
        assert!(!updated.owns(&chunk(1, 0)));
        assert!(w.index.owner(&chunk(1, 0)).is_none());
        w.assert_consistent();
    }

    // -----------------------------------------------------------------------
    // Overclaim
    // -----------------------------------------------------------------------

    /// Alpha (player 1) holds ten chunks on ten power, then loses four.
    fn raidable_alpha(w: &Fixture) -> FactionId {
        let alpha = w.fx.found(1, "Alpha");
        for x in 0..10 {
            w.claim(1, x, 0).unwrap();
        }
        w.power.ledger.apply_death_penalty(player(1));
        alpha.id
    }

    #[test]
    fn overclaim_requires_raidable_defender() {
        let w = Fixture::new();
        w.fx.found(1, "Alpha");
        w.fx.found(2, "Beta");
        w.claim(1, 0, 0).unwrap();
        assert_eq!(w.overclaim(2, 0, 0).unwrap_err(), ClaimError::NotRaidable);
        assert_eq!(w.overclaim(2, 7, 7).unwrap_err(), ClaimError::NotClaimed);
    }

    #[test]
    fn overclaim_moves_chunk_between_factions() {
        let w = Fixture::new();
        let alpha = raidable_alpha(&w);
        let beta = w.fx.found(2, "Beta");

        let outcome = w.overclaim(2, 4, 0).unwrap();
        let OverclaimOutcome::Taken { faction, from } = outcome else {
            panic!("expected Taken, got {outcome:?}");
        };
        assert_eq!(from, alpha);
        assert!(faction.owns(&chunk(4, 0)));
        assert_eq!(w.index.owner(&chunk(4, 0)), Some(beta.id));
        let alpha_now = w.fx.registry.get(&alpha).unwrap();
        assert!(!alpha_now.owns(&chunk(4, 0)));
        assert_eq!(alpha_now.log.front().map(|e| e.kind), Some(LogKind::LostClaim));
        w.assert_consistent();
    }

    #[test]
    fn overclaim_home_chunk_clears_home() {
        let w = Fixture::new();
        let alpha = raidable_alpha(&w);
        w.fx.found(2, "Beta");
        w.fx.registry
            .set_home(player(1), Some(Location::new("world", 40.0, 64.0, 3.0)))
            .unwrap();

        w.overclaim(2, 2, 0).unwrap();
        assert!(w.fx.registry.get(&alpha).unwrap().home.is_none());
    }

    #[test]
    fn overclaim_rejects_allies_from_either_side() {
        let w = Fixture::new();
        let alpha = raidable_alpha(&w);
        let beta = w.fx.found(2, "Beta");
        w.fx.registry
            .transaction(|txn| {
                let current = txn.faction(&alpha).unwrap();
                txn.put(current.with_relation(FactionRelation {
                    target: beta.id,
                    kind: RelationKind::Ally,
                    since: day(0),
                }))
            })
            .unwrap();

        assert_eq!(w.overclaim(2, 0, 0).unwrap_err(), ClaimError::Allied);
    }

    #[test]
    fn overclaim_requires_attacker_headroom() {
        let w = Fixture::new();
        raidable_alpha(&w);
        w.fx.found(2, "Beta");
        w.power.ledger.set_power(player(2), 0.0).unwrap();

        assert_eq!(
            w.overclaim(2, 0, 0).unwrap_err(),
            ClaimError::CapacityReached { capacity: 0 }
        );
        w.assert_consistent();
    }

    #[test]
    fn overclaim_own_chunk_is_noop() {
        let w = Fixture::new();
        w.fx.found(1, "Alpha");
        w.claim(1, 0, 0).unwrap();
        assert!(matches!(
            w.overclaim(1, 0, 0).unwrap(),
            OverclaimOutcome::AlreadyOwned
        ));
    }

    #[test]
    fn overclaim_reassigns_orphaned_chunk() {
        let w = Fixture::new();
        let beta = w.fx.found(2, "Beta");
        w.index.write().insert(chunk(0, 0), faction_id(404));

        let outcome = w.overclaim(2, 0, 0).unwrap();
        assert!(matches!(outcome, OverclaimOutcome::Orphaned { .. }));
        assert_eq!(w.index.owner(&chunk(0, 0)), Some(beta.id));
        w.assert_consistent();
    }

    // -----------------------------------------------------------------------
    // Disband, rebuild, races
    // -----------------------------------------------------------------------

    #[test]
    fn disband_releases_every_chunk() {
        let w = Fixture::new();
        let alpha = w.fx.found(1, "Alpha");
        w.fx.found(2, "Beta");
        w.claim(1, 0, 0).unwrap();
        w.claim(1, 1, 0).unwrap();
        w.claim(2, 5, 5).unwrap();

        w.fx.registry.disband(player(1)).unwrap();
        assert!(w.index.claims_of(&alpha.id).is_empty());
        assert_eq!(w.index.len(), 1);
        w.claim(2, 0, 0).unwrap();
        w.assert_consistent();
    }

    #[test]
    fn reload_keeps_earliest_conflicting_claim() {
        let w = Fixture::new();
        let claim_at = |x, at| FactionClaim {
            chunk: chunk(x, 0),
            claimed_at: at,
            claimed_by: player(1),
        };
        let early = Faction::new(
            faction_id(1),
            "Early",
            None,
            FactionMember::new(player(1), "p1", Role::Leader, day(0)),
            day(0),
        )
        .with_claim(claim_at(0, day(1)))
        .with_claim(claim_at(1, day(1)));
        let late = Faction::new(
            faction_id(2),
            "Late",
            None,
            FactionMember::new(player(2), "p2", Role::Leader, day(0)),
            day(0),
        )
        .with_claim(claim_at(0, day(3)))
        .with_claim(claim_at(2, day(3)));
        w.fx.store.set_factions(vec![late.clone(), early.clone()]);
        w.fx.registry.load_all().unwrap();

        // The reload itself rebuilt the index and dropped the later claim.
        assert_eq!(w.index.owner(&chunk(0, 0)), Some(faction_id(1)));
        assert!(!w.fx.registry.get(&faction_id(2)).unwrap().owns(&chunk(0, 0)));
        w.assert_consistent();
        assert_eq!(
            w.index.build_index(&w.fx.registry),
            BuildReport { chunks: 3, conflicts: 0 }
        );

        let fresh = Fixture::new();
        fresh.fx.store.set_factions(vec![late, early]);
        fresh.fx.registry.load_all().unwrap();
        let conflicted = fresh.fx.registry.transaction(|txn| {
            let late = txn.faction(&faction_id(2)).unwrap();
            txn.put(late.with_claim(claim_at(0, day(3)))).unwrap();
            fresh.index.rebuild(txn)
        });
        assert_eq!(conflicted, BuildReport { chunks: 3, conflicts: 1 });
        fresh.assert_consistent();
    }

    #[test]
    fn registry_reload_alone_restores_chunk_ownership() {
        let w = Fixture::new();
        let stored = Faction::new(
            faction_id(1),
            "Alpha",
            None,
            FactionMember::new(player(1), "p1", Role::Leader, day(0)),
            day(0),
        )
        .with_claim(FactionClaim {
            chunk: chunk(0, 0),
            claimed_at: day(1),
            claimed_by: player(1),
        });
        w.fx.store.set_factions(vec![stored]);

        w.fx.registry.load_all().unwrap();
        w.fx.found(2, "Beta");

        assert_eq!(
            w.claim(2, 0, 0).unwrap_err(),
            ClaimError::AlreadyClaimed {
                owner: faction_id(1)
            }
        );
        assert!(w.fx.registry.sync_from_disk().is_ok());
        assert_eq!(w.index.owner(&chunk(0, 0)), Some(faction_id(1)));
        w.assert_consistent();
    }

    #[test]
    fn verify_reports_both_directions() {
        let w = Fixture::new();
        let alpha = w.fx.found(1, "Alpha");
        w.claim(1, 0, 0).unwrap();
        w.index.write().remove(&chunk(0, 0));
        w.index.write().insert(chunk(9, 9), alpha.id);

        assert_eq!(
            w.index.verify(&w.fx.registry),
            vec![
                ClaimMismatch::Unindexed {
                    chunk: chunk(0, 0),
                    faction: alpha.id
                },
                ClaimMismatch::Stale {
                    chunk: chunk(9, 9),
                    faction: alpha.id
                },
            ]
        );
    }

    #[test]
    fn racing_claims_have_one_winner() {
        let w = Fixture::new();
        for n in 1..=8 {
            w.fx.found(n, &format!("Faction{n}"));
        }
        for round in 0..50 {
            let wins = std::thread::scope(|scope| {
                let handles: Vec<_> = (1..=8u128)
                    .map(|n| {
                        let w = &w;
                        scope.spawn(move || w.claim(n, round, 100).is_ok())
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or(false))
                    .filter(|won| *won)
                    .count()
            });
            assert_eq!(wins, 1, "round {round}");
        }
        w.assert_consistent();
    }
}
