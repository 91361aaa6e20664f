//! Power Ledger for the factions core.
//!
//! Tracks a regenerating per-player resource and derives each faction's
//! claim capacity from it. Records live independently of membership, so a
//! player keeps their power across leaving and rejoining factions.
//!
//! # Design
//!
//! - Power is an `f64` clamped to `[0, max_power]` on every mutation.
//! - Faction power is the sum over all members, online or not. Members the
//!   ledger has never seen count at the configured starting power.
//! - Capacity is derived on demand; nothing here enforces it. The claim
//!   index consults [`PowerLedger::claim_capacity`] before claiming.
//! - Persistence is issued after the in-memory change; failures are logged.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use factions_core::clock::Clock;
use factions_core::config::FactionsConfig;
use factions_core::faction::Faction;
use factions_core::id::PlayerId;
use factions_core::store::StoreError;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// ---------------------------------------------------------------------------
// Player power record
// ---------------------------------------------------------------------------

/// One player's power.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerPower {
    pub player_id: PlayerId,
    /// Current power, always within `[0, max_power]`.
    pub power: f64,
    pub max_power: f64,
    pub last_death: Option<DateTime<Utc>>,
    pub last_regen: Option<DateTime<Utc>>,
}

impl PlayerPower {
    pub fn new(player_id: PlayerId, power: f64, max_power: f64) -> Self {
        let max_power = max_power.max(0.0);
        Self {
            player_id,
            power: power.clamp(0.0, max_power),
            max_power,
            last_death: None,
            last_regen: None,
        }
    }

    pub fn with_power(&self, power: f64) -> Self {
        Self {
            power: power.clamp(0.0, self.max_power),
            ..self.clone()
        }
    }

    /// Changing the ceiling re-clamps current power.
    pub fn with_max_power(&self, max_power: f64) -> Self {
        let max_power = max_power.max(0.0);
        Self {
            max_power,
            power: self.power.clamp(0.0, max_power),
            ..self.clone()
        }
    }

    pub fn is_full(&self) -> bool {
        self.power >= self.max_power
    }

    /// Restore the clamp on a record that came from outside.
    fn sanitized(self) -> Self {
        let max_power = if self.max_power.is_finite() {
            self.max_power.max(0.0)
        } else {
            0.0
        };
        let power = if self.power.is_finite() {
            self.power.clamp(0.0, max_power)
        } else {
            0.0
        };
        Self {
            power,
            max_power,
            ..self
        }
    }
}

// ---------------------------------------------------------------------------
// Errors, reports, persistence
// ---------------------------------------------------------------------------

/// Rejected admin input.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PowerError {
    #[error("power value must be finite and non-negative, got {0}")]
    InvalidAmount(f64),
}

/// Result of a regeneration pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Records whose power went up.
    pub regenerated: usize,
    /// Players who reached their ceiling during this pass.
    pub restored: Vec<PlayerId>,
}

/// Result of a bulk reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerLoad {
    Replaced { players: usize },
    /// Storage returned nothing while memory was populated; memory was kept.
    KeptExisting { in_memory: usize },
}

/// Durable storage for power records.
pub trait PowerStore: Send + Sync {
    fn load_all_player_power(&self) -> Result<Vec<PlayerPower>, StoreError>;

    fn load_player_power(&self, player: PlayerId) -> Result<Option<PlayerPower>, StoreError>;

    fn save_player_power(&self, record: &PlayerPower) -> Result<(), StoreError>;
}

/// A store that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPowerStore;

impl PowerStore for NullPowerStore {
    fn load_all_player_power(&self) -> Result<Vec<PlayerPower>, StoreError> {
        Ok(Vec::new())
    }

    fn load_player_power(&self, _player: PlayerId) -> Result<Option<PlayerPower>, StoreError> {
        Ok(None)
    }

    fn save_player_power(&self, _record: &PlayerPower) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Claims a given amount of power supports: `floor(total / per_claim)`
/// capped at `max_claims`. A non-positive `per_claim` disables the gate.
pub fn capacity_for_power(total: f64, per_claim: f64, max_claims: usize) -> usize {
    if per_claim <= 0.0 {
        return max_claims;
    }
    let claims = (total.max(0.0) / per_claim).floor();
    if claims >= max_claims as f64 {
        max_claims
    } else {
        claims as usize
    }
}

// ---------------------------------------------------------------------------
// Power ledger
// ---------------------------------------------------------------------------

/// Owns every player's power record and the online set.
pub struct PowerLedger {
    records: RwLock<HashMap<PlayerId, PlayerPower>>,
    online: RwLock<HashSet<PlayerId>>,
    config: Arc<FactionsConfig>,
    store: Arc<dyn PowerStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PowerLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerLedger")
            .field("players", &self.len())
            .field("online", &self.online_count())
            .finish_non_exhaustive()
    }
}

impl PowerLedger {
    pub fn new(
        config: Arc<FactionsConfig>,
        store: Arc<dyn PowerStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            online: RwLock::new(HashSet::new()),
            config,
            store,
            clock,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<PlayerId, PlayerPower>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PlayerId, PlayerPower>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh(&self, player: PlayerId) -> PlayerPower {
        let power = &self.config.power;
        PlayerPower::new(player, power.starting_power, power.max_power)
    }

    fn save(&self, record: &PlayerPower) {
        if let Err(err) = self.store.save_player_power(record) {
            warn!(player = %record.player_id, error = %err, "failed to persist player power");
        }
    }

    // -- Record access --

    /// The player's record, creating one at starting power if unknown.
    pub fn get(&self, player: PlayerId) -> PlayerPower {
        if let Some(record) = self.read().get(&player) {
            return record.clone();
        }
        let (record, created) = {
            let mut records = self.write();
            match records.get(&player) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let record = self.fresh(player);
                    records.insert(player, record.clone());
                    (record, true)
                }
            }
        };
        if created {
            debug!(player = %player, power = record.power, "created power record");
            self.save(&record);
        }
        record
    }

    /// Like [`get`](Self::get), but consults storage before creating a new
    /// record. Used when a player connects.
    pub fn load_player(&self, player: PlayerId) -> PlayerPower {
        if let Some(record) = self.peek(player) {
            return record;
        }
        match self.store.load_player_power(player) {
            Ok(Some(stored)) => {
                let stored = PlayerPower {
                    player_id: player,
                    ..stored
                }
                .sanitized();
                self.write().entry(player).or_insert(stored).clone()
            }
            Ok(None) => self.get(player),
            Err(err) => {
                // Keep the stored copy intact: create in memory only.
                warn!(player = %player, error = %err, "failed to load player power");
                self.write()
                    .entry(player)
                    .or_insert_with(|| self.fresh(player))
                    .clone()
            }
        }
    }

    /// The player's record if the ledger knows them.
    pub fn peek(&self, player: PlayerId) -> Option<PlayerPower> {
        self.read().get(&player).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // -- Mutation --

    /// Subtract the configured penalty, flooring at zero.
    pub fn apply_death_penalty(&self, player: PlayerId) -> PlayerPower {
        let penalty = self.config.power.death_penalty;
        let now = self.clock.now();
        let record = {
            let mut records = self.write();
            let current = records
                .get(&player)
                .cloned()
                .unwrap_or_else(|| self.fresh(player));
            let updated = PlayerPower {
                last_death: Some(now),
                ..current.with_power(current.power - penalty)
            };
            records.insert(player, updated.clone());
            updated
        };
        debug!(player = %player, power = record.power, "death penalty applied");
        self.save(&record);
        record
    }

    /// Add `amount`, capped at the ceiling. Returns `None` and changes
    /// nothing if the player is unknown, already full, or `amount` is not
    /// positive.
    pub fn regenerate(&self, player: PlayerId, amount: f64) -> Option<PlayerPower> {
        if amount.is_nan() || amount <= 0.0 {
            return None;
        }
        let now = self.clock.now();
        let record = {
            let mut records = self.write();
            let current = records.get(&player)?;
            if current.is_full() {
                return None;
            }
            let updated = PlayerPower {
                last_regen: Some(now),
                ..current.with_power(current.power + amount)
            };
            records.insert(player, updated.clone());
            updated
        };
        self.save(&record);
        Some(record)
    }

    /// Admin override of current power.
    pub fn set_power(&self, player: PlayerId, power: f64) -> Result<PlayerPower, PowerError> {
        check_amount(power)?;
        Ok(self.replace(player, |r| r.with_power(power)))
    }

    /// Admin override of a player's ceiling.
    pub fn set_max_power(&self, player: PlayerId, max: f64) -> Result<PlayerPower, PowerError> {
        check_amount(max)?;
        Ok(self.replace(player, |r| r.with_max_power(max)))
    }

    fn replace(&self, player: PlayerId, f: impl FnOnce(&PlayerPower) -> PlayerPower) -> PlayerPower {
        let record = {
            let mut records = self.write();
            let current = records
                .get(&player)
                .cloned()
                .unwrap_or_else(|| self.fresh(player));
            let updated = f(&current);
            records.insert(player, updated.clone());
            updated
        };
        self.save(&record);
        record
    }

    // -- Online tracking & regeneration --

    pub fn set_online(&self, player: PlayerId, online: bool) {
        let mut set = self.online.write().unwrap_or_else(PoisonError::into_inner);
        if online {
            set.insert(player);
        } else {
            set.remove(&player);
        }
    }

    pub fn is_online(&self, player: &PlayerId) -> bool {
        self.online
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(player)
    }

    pub fn online_count(&self) -> usize {
        self.online
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// One regeneration pass over online players, or over every known
    /// player when `regen_online_only` is off. Each call applies exactly
    /// one increment per eligible record.
    pub fn tick(&self) -> TickReport {
        let amount = self.config.power.regen_per_tick;
        let mut report = TickReport::default();
        if amount.is_nan() || amount <= 0.0 {
            return report;
        }
        let now = self.clock.now();
        let online: Option<HashSet<PlayerId>> = self.config.power.regen_online_only.then(|| {
            self.online
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        });

        let mut changed = Vec::new();
        {
            let mut records = self.write();
            for record in records.values_mut() {
                if online
                    .as_ref()
                    .is_some_and(|set| !set.contains(&record.player_id))
                {
                    continue;
                }
                if record.is_full() {
                    continue;
                }
                *record = PlayerPower {
                    last_regen: Some(now),
                    ..record.with_power(record.power + amount)
                };
                if record.is_full() {
                    report.restored.push(record.player_id);
                }
                changed.push(record.clone());
            }
        }
        report.regenerated = changed.len();
        for record in &changed {
            self.save(record);
        }
        debug!(regenerated = report.regenerated, "power tick");
        report
    }

    // -- Faction aggregates --

    fn member_sum(&self, faction: &Faction, f: impl Fn(&PlayerPower) -> f64) -> f64 {
        let records = self.read();
        let starting = &self.config.power;
        faction
            .members
            .keys()
            .map(|player| match records.get(player) {
                Some(record) => f(record),
                None => f(&PlayerPower::new(
                    *player,
                    starting.starting_power,
                    starting.max_power,
                )),
            })
            .sum()
    }

    /// Sum of current power across all members.
    pub fn faction_power(&self, faction: &Faction) -> f64 {
        self.member_sum(faction, |r| r.power)
    }

    /// Sum of members' ceilings.
    pub fn faction_max_power(&self, faction: &Faction) -> f64 {
        self.member_sum(faction, |r| r.max_power)
    }

    /// Claims the faction's current power entitles it to hold.
    pub fn claim_capacity(&self, faction: &Faction) -> usize {
        capacity_for_power(
            self.faction_power(faction),
            self.config.power.power_per_claim,
            self.config.claims.max_claims,
        )
    }

    /// Whether the faction holds more claims than its power supports.
    pub fn is_raidable(&self, faction: &Faction) -> bool {
        faction.claim_count() > self.claim_capacity(faction)
    }

    // -- Bulk load --

    /// Replace memory with storage. An empty result over a populated ledger
    /// is treated as a failed read and ignored.
    pub fn load_all(&self) -> Result<LedgerLoad, StoreError> {
        let loaded = self.store.load_all_player_power().map_err(|err| {
            error!(error = %err, "failed to load player power; keeping in-memory state");
            err
        })?;

        let mut records = self.write();
        if loaded.is_empty() && !records.is_empty() {
            warn!(
                in_memory = records.len(),
                "storage returned no power records; keeping in-memory state"
            );
            return Ok(LedgerLoad::KeptExisting {
                in_memory: records.len(),
            });
        }
        *records = loaded
            .into_iter()
            .map(|r| (r.player_id, r.sanitized()))
            .collect();
        info!(players = records.len(), "player power loaded");
        Ok(LedgerLoad::Replaced {
            players: records.len(),
        })
    }
}

fn check_amount(value: f64) -> Result<(), PowerError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(PowerError::InvalidAmount(value))
    }
}
