//! The faction registry: authoritative owner of faction records.
//!
//! # Indices
//!
//! Alongside the records the registry keeps three lookup indices:
//! player → faction, lowercase name → faction, and uppercase tag → faction.
//! They are only ever changed by [`RegistryState::insert`] and
//! [`RegistryState::remove`], which update a record and its index entries
//! together under the write lock.
//!
//! # Transactions
//!
//! [`FactionRegistry::transaction`] runs a closure against a
//! [`RegistryTxn`]. The closure validates first and writes last, so an
//! `Err` return leaves nothing behind. When the closure returns, the lock is
//! released, queued persistence calls are issued, and passive listeners are
//! notified, in that order.
//!
//! Reloads from storage go through the same path: the stored records are
//! swapped in and every reload hook runs before the lock is released.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::chunk::Location;
use crate::clock::Clock;
use crate::config::{FactionsConfig, NameRules};
use crate::error::FactionError;
use crate::event::{
    DisbandEvent, DisbandHook, DisbandReason, FactionEvent, FactionListener, HookEntry,
    HookPriority, ReloadEntry, ReloadHook, Subscribers,
};
use crate::faction::{Faction, FactionMember, LogEntry, LogKind, Permission, Role};
use crate::id::{FactionId, PlayerId};
use crate::store::{FactionStore, StoreError};

/// Longest allowed tag.
pub const MAX_TAG_LEN: usize = 5;
/// Characters used by the generated tag base.
const TAG_BASE_LEN: usize = 3;
/// Numeric suffixes tried before falling back to random ones.
const TAG_SUFFIX_RANGE: std::ops::RangeInclusive<u32> = 2..=99;
const RANDOM_TAG_ATTEMPTS: usize = 64;
const TAG_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

// ===========================================================================
// Outcomes
// ===========================================================================

/// Result of removing a member.
#[derive(Debug, Clone)]
pub enum RemoveOutcome {
    /// A non-leader left or was kicked.
    Removed(Arc<Faction>),
    /// The leader left and `new_leader` inherited the faction.
    Succeeded {
        faction: Arc<Faction>,
        new_leader: PlayerId,
    },
    /// The leader was the last member; the faction is gone.
    Disbanded(Arc<Faction>),
}

/// Result of a bulk reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadReport {
    /// The registry now mirrors storage.
    Replaced { factions: usize, skipped: usize },
    /// Storage returned nothing while memory was populated; memory was kept.
    KeptExisting { in_memory: usize },
}

/// Result of merging storage into memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub factions_added: usize,
    pub members_added: usize,
    pub members_updated: usize,
    pub skipped: usize,
    /// Storage returned nothing while memory was populated; nothing merged.
    pub kept_existing: bool,
}

// ===========================================================================
// RegistryState
// ===========================================================================

/// Records plus their lookup indices.
#[derive(Debug, Default, Clone)]
pub struct RegistryState {
    factions: HashMap<FactionId, Arc<Faction>>,
    player_to_faction: HashMap<PlayerId, FactionId>,
    name_to_faction: HashMap<String, FactionId>,
    tag_to_faction: HashMap<String, FactionId>,
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn tag_key(tag: &str) -> String {
    tag.trim().to_ascii_uppercase()
}

impl RegistryState {
    // -- Queries --

    pub fn get(&self, id: &FactionId) -> Option<&Arc<Faction>> {
        self.factions.get(id)
    }

    pub fn faction_id_of(&self, player: &PlayerId) -> Option<FactionId> {
        self.player_to_faction.get(player).copied()
    }

    pub fn faction_of(&self, player: &PlayerId) -> Option<&Arc<Faction>> {
        self.faction_id_of(player)
            .and_then(|id| self.factions.get(&id))
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<Faction>> {
        self.name_to_faction
            .get(&name_key(name))
            .and_then(|id| self.factions.get(id))
    }

    pub fn by_tag(&self, tag: &str) -> Option<&Arc<Faction>> {
        self.tag_to_faction
            .get(&tag_key(tag))
            .and_then(|id| self.factions.get(id))
    }

    pub fn name_taken(&self, name: &str) -> bool {
        self.name_to_faction.contains_key(&name_key(name))
    }

    pub fn tag_taken(&self, tag: &str) -> bool {
        self.tag_to_faction.contains_key(&tag_key(tag))
    }

    pub fn factions(&self) -> impl Iterator<Item = &Arc<Faction>> {
        self.factions.values()
    }

    pub fn len(&self) -> usize {
        self.factions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factions.is_empty()
    }

    /// Check that every index entry agrees with the records.
    pub fn indices_consistent(&self) -> bool {
        let players: usize = self.factions.values().map(|f| f.member_count()).sum();
        players == self.player_to_faction.len()
            && self.player_to_faction.iter().all(|(player, id)| {
                self.factions
                    .get(id)
                    .is_some_and(|f| f.is_member(player))
            })
            && self.name_to_faction.len() == self.factions.len()
            && self
                .name_to_faction
                .iter()
                .all(|(key, id)| self.factions.get(id).is_some_and(|f| &name_key(&f.name) == key))
            && self.tag_to_faction.iter().all(|(key, id)| {
                self.factions
                    .get(id)
                    .is_some_and(|f| f.tag.as_deref().map(tag_key).as_ref() == Some(key))
            })
    }

    // -- Mutation --

    /// Insert or replace a record, keeping every index in step. Fails without
    /// touching anything if the record's name, tag, or members collide with
    /// another faction.
    pub(crate) fn insert(&mut self, faction: Faction) -> Result<Arc<Faction>, FactionError> {
        let id = faction.id;

        if self
            .name_to_faction
            .get(&name_key(&faction.name))
            .is_some_and(|owner| *owner != id)
        {
            return Err(FactionError::NameTaken);
        }
        if let Some(tag) = &faction.tag
            && self
                .tag_to_faction
                .get(&tag_key(tag))
                .is_some_and(|owner| *owner != id)
        {
            return Err(FactionError::TagTaken);
        }
        for player in faction.members.keys() {
            if let Some(owner) = self.player_to_faction.get(player)
                && *owner != id
            {
                return Err(FactionError::MemberConflict(*player, *owner));
            }
        }

        self.unindex(id);

        let faction = Arc::new(faction);
        self.name_to_faction.insert(name_key(&faction.name), id);
        if let Some(tag) = &faction.tag {
            self.tag_to_faction.insert(tag_key(tag), id);
        }
        for player in faction.members.keys() {
            self.player_to_faction.insert(*player, id);
        }
        self.factions.insert(id, faction.clone());
        Ok(faction)
    }

    /// Remove a record and all index entries pointing at it.
    pub(crate) fn remove(&mut self, id: &FactionId) -> Option<Arc<Faction>> {
        self.unindex(*id);
        self.factions.remove(id)
    }

    fn unindex(&mut self, id: FactionId) {
        let Some(old) = self.factions.get(&id) else {
            return;
        };
        let name = name_key(&old.name);
        if self.name_to_faction.get(&name) == Some(&id) {
            self.name_to_faction.remove(&name);
        }
        if let Some(tag) = &old.tag {
            let tag = tag_key(tag);
            if self.tag_to_faction.get(&tag) == Some(&id) {
                self.tag_to_faction.remove(&tag);
            }
        }
        for player in old.members.keys() {
            if self.player_to_faction.get(player) == Some(&id) {
                self.player_to_faction.remove(player);
            }
        }
    }

    /// Build a fresh state from stored records. Records that cannot be
    /// indexed are skipped and counted.
    fn from_records(records: Vec<Faction>) -> (Self, usize) {
        let mut state = Self::default();
        let mut skipped = 0;
        let mut records = records;
        records.sort_by_key(|f| f.created_at);
        for record in records {
            let id = record.id;
            let Some(record) = normalize_leadership(record, None) else {
                warn!(faction = %id, "skipping stored faction with no members");
                skipped += 1;
                continue;
            };
            if let Err(err) = state.insert(record) {
                warn!(faction = %id, error = %err, "skipping conflicting stored faction");
                skipped += 1;
            }
        }
        (state, skipped)
    }
}

/// Force exactly one leader. `preferred` keeps its leadership if it is
/// still a leader; otherwise the best-ranked, longest-serving member leads.
/// Returns `None` for a faction with no members.
fn normalize_leadership(faction: Faction, preferred: Option<PlayerId>) -> Option<Faction> {
    if faction.members.is_empty() {
        return None;
    }
    if faction.leader_count() == 1 {
        return Some(faction);
    }
    let leader = preferred
        .filter(|p| faction.role_of(p) == Some(Role::Leader))
        .or_else(|| {
            faction
                .members
                .values()
                .min_by(|a, b| {
                    b.role
                        .cmp(&a.role)
                        .then(a.joined_at.cmp(&b.joined_at))
                        .then(a.player_id.cmp(&b.player_id))
                })
                .map(|m| m.player_id)
        })?;
    warn!(faction = %faction.id, leader = %leader, "repairing faction leadership");
    let mut repaired = faction.clone();
    for member in faction.members.values() {
        let role = if member.player_id == leader {
            Role::Leader
        } else if member.role == Role::Leader {
            Role::Officer
        } else {
            member.role
        };
        if role != member.role {
            repaired = repaired.with_member(member.with_role(role));
        }
    }
    Some(repaired)
}

// ===========================================================================
// RegistryTxn
// ===========================================================================

/// Exclusive access to the registry for the duration of one operation.
///
/// Everything done through a transaction becomes visible to readers at once
/// when [`FactionRegistry::transaction`] returns.
pub struct RegistryTxn<'a> {
    state: RwLockWriteGuard<'a, RegistryState>,
    hooks: &'a [HookEntry],
    reload_hooks: &'a [ReloadEntry],
    config: &'a FactionsConfig,
    now: DateTime<Utc>,
    saves: Vec<Arc<Faction>>,
    deletes: Vec<FactionId>,
    events: Vec<FactionEvent>,
}

impl RegistryTxn<'_> {
    /// Timestamp for everything recorded in this transaction.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn config(&self) -> &FactionsConfig {
        self.config
    }

    pub fn state(&self) -> &RegistryState {
        &self.state
    }

    pub fn faction(&self, id: &FactionId) -> Option<Arc<Faction>> {
        self.state.get(id).cloned()
    }

    pub fn faction_of(&self, player: &PlayerId) -> Option<Arc<Faction>> {
        self.state.faction_of(player).cloned()
    }

    /// Store a new version of a faction and schedule it for persistence.
    pub fn put(&mut self, faction: Faction) -> Result<Arc<Faction>, FactionError> {
        let stored = self.state.insert(faction)?;
        self.saves.push(stored.clone());
        Ok(stored)
    }

    /// Queue a passive notification for after commit.
    pub fn emit(&mut self, event: FactionEvent) {
        self.events.push(event);
    }

    /// Delete a faction, running every disband hook inside this transaction.
    pub fn disband(
        &mut self,
        id: FactionId,
        actor: Option<PlayerId>,
        reason: DisbandReason,
    ) -> Option<Arc<Faction>> {
        let faction = self.state.remove(&id)?;
        let event = DisbandEvent {
            faction: faction.clone(),
            actor,
            reason,
        };
        let hooks = self.hooks;
        for entry in hooks {
            debug!(faction = %id, hook = entry.name, "running disband hook");
            (entry.hook)(&event, self);
        }
        info!(faction = %id, name = %faction.name, ?reason, "faction disbanded");
        self.deletes.push(id);
        self.events.push(FactionEvent::Disbanded(event));
        Some(faction)
    }

    fn run_reload_hooks(&mut self) {
        let hooks = self.reload_hooks;
        for entry in hooks {
            debug!(hook = entry.name, "running reload hook");
            (entry.hook)(self);
        }
    }
}

// ===========================================================================
// FactionRegistry
// ===========================================================================

/// Owns every faction record and the indices derived from them.
pub struct FactionRegistry {
    state: RwLock<RegistryState>,
    subscribers: RwLock<Subscribers>,
    config: Arc<FactionsConfig>,
    store: Arc<dyn FactionStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactionRegistry")
            .field("factions", &self.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FactionRegistry {
    pub fn new(
        config: Arc<FactionsConfig>,
        store: Arc<dyn FactionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            subscribers: RwLock::new(Subscribers::default()),
            config,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &FactionsConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Subscribers --

    /// Register cleanup to run inside every disband transaction.
    pub fn add_disband_hook(&self, name: &'static str, priority: HookPriority, hook: DisbandHook) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_hook(name, priority, hook);
    }

    /// Register a rebuild to run inside every reload from storage, after the
    /// stored records are in place and before the write lock is released.
    pub fn add_reload_hook(&self, name: &'static str, hook: ReloadHook) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_reload_hook(name, hook);
    }

    /// Register a passive listener for committed changes.
    pub fn add_listener(&self, listener: FactionListener) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_listener(listener);
    }

    // -- Transactions --

    /// Run `f` with exclusive access to the registry.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut RegistryTxn<'_>) -> R) -> R {
        let subscribers = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
        let (result, saves, deletes, events) = {
            let mut txn = RegistryTxn {
                state: self.write_state(),
                hooks: &subscribers.hooks,
                reload_hooks: &subscribers.reload_hooks,
                config: &self.config,
                now: self.clock.now(),
                saves: Vec::new(),
                deletes: Vec::new(),
                events: Vec::new(),
            };
            let result = f(&mut txn);
            (
                result,
                std::mem::take(&mut txn.saves),
                std::mem::take(&mut txn.deletes),
                std::mem::take(&mut txn.events),
            )
        };
        let listeners = subscribers.listeners.clone();
        drop(subscribers);

        self.persist(saves, deletes);
        for event in &events {
            for listener in &listeners {
                listener(event);
            }
        }
        result
    }

    /// Read-only access to the whole state under one lock acquisition.
    pub fn inspect<R>(&self, f: impl FnOnce(&RegistryState) -> R) -> R {
        f(&self.read_state())
    }

    fn persist(&self, saves: Vec<Arc<Faction>>, deletes: Vec<FactionId>) {
        let mut latest: BTreeMap<FactionId, Arc<Faction>> = BTreeMap::new();
        for faction in saves {
            latest.insert(faction.id, faction);
        }
        for id in &deletes {
            latest.remove(id);
        }
        for (id, faction) in latest {
            if let Err(err) = self.store.save_faction(faction) {
                warn!(faction = %id, error = %err, "failed to persist faction");
            }
        }
        for id in deletes {
            if let Err(err) = self.store.delete_faction(id) {
                warn!(faction = %id, error = %err, "failed to delete stored faction");
            }
        }
    }

    // -- Queries --

    pub fn get(&self, id: &FactionId) -> Option<Arc<Faction>> {
        self.read_state().get(id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Faction>> {
        self.read_state().by_name(name).cloned()
    }

    pub fn by_tag(&self, tag: &str) -> Option<Arc<Faction>> {
        self.read_state().by_tag(tag).cloned()
    }

    pub fn faction_of(&self, player: &PlayerId) -> Option<Arc<Faction>> {
        self.read_state().faction_of(player).cloned()
    }

    pub fn faction_id_of(&self, player: &PlayerId) -> Option<FactionId> {
        self.read_state().faction_id_of(player)
    }

    pub fn all(&self) -> Vec<Arc<Faction>> {
        self.read_state().factions().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read_state().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_state().is_empty()
    }

    // -- Lifecycle --

    /// Found a new faction led by `founder`.
    pub fn create(
        &self,
        founder: PlayerId,
        founder_name: &str,
        name: &str,
    ) -> Result<Arc<Faction>, FactionError> {
        let name = name.trim();
        self.transaction(|txn| {
            if txn.state.faction_id_of(&founder).is_some() {
                return Err(FactionError::AlreadyInFaction);
            }
            validate_name(&txn.config.names, name)?;
            if txn.state.name_taken(name) {
                return Err(FactionError::NameTaken);
            }
            let tag = derive_tag(name, |candidate| txn.state.tag_taken(candidate));
            if tag.is_none() {
                warn!(name, "no free tag for new faction");
            }

            let now = txn.now;
            let leader = FactionMember::new(founder, founder_name, Role::Leader, now);
            let faction = Faction::new(FactionId::random(), name, tag, leader, now).with_log(
                LogEntry::new(
                    now,
                    Some(founder),
                    LogKind::Created,
                    format!("{founder_name} founded {name}"),
                ),
            );
            let faction = txn.put(faction)?;
            txn.emit(FactionEvent::Created {
                faction: faction.id,
                founder,
            });
            info!(faction = %faction.id, name, tag = ?faction.tag, "faction created");
            Ok(faction)
        })
    }

    /// Disband the actor's faction. Leader only.
    pub fn disband(&self, actor: PlayerId) -> Result<Arc<Faction>, FactionError> {
        self.transaction(|txn| {
            let faction = txn.faction_of(&actor).ok_or(FactionError::NotInFaction)?;
            if faction.role_of(&actor) != Some(Role::Leader) {
                return Err(FactionError::NotLeader);
            }
            txn.disband(faction.id, Some(actor), DisbandReason::Leader)
                .ok_or(FactionError::FactionNotFound)
        })
    }

    /// Disband any faction regardless of membership.
    pub fn force_disband(
        &self,
        id: FactionId,
        actor: Option<PlayerId>,
    ) -> Result<Arc<Faction>, FactionError> {
        self.transaction(|txn| {
            txn.disband(id, actor, DisbandReason::Admin)
                .ok_or(FactionError::FactionNotFound)
        })
    }

    // -- Membership --

    /// The faction `actor` may issue invites for. Invite bookkeeping lives
    /// with the caller; this only checks rank.
    pub fn authorize_invite(&self, actor: PlayerId) -> Result<Arc<Faction>, FactionError> {
        let state = self.read_state();
        let faction = state.faction_of(&actor).ok_or(FactionError::NotInFaction)?;
        if !faction.allows(&actor, Permission::Invite) {
            return Err(FactionError::InsufficientRole {
                required: faction.required_role(Permission::Invite),
            });
        }
        let max = self.config.members.max_members;
        if max > 0 && faction.member_count() >= max {
            return Err(FactionError::FactionFull);
        }
        Ok(faction.clone())
    }

    /// Add a player who holds an invite (invite bookkeeping lives elsewhere).
    pub fn add_member(
        &self,
        faction_id: FactionId,
        player: PlayerId,
        username: &str,
    ) -> Result<Arc<Faction>, FactionError> {
        self.join(faction_id, player, username, false)
    }

    /// Join a faction that has its `open` flag set.
    pub fn join_open(
        &self,
        faction_id: FactionId,
        player: PlayerId,
        username: &str,
    ) -> Result<Arc<Faction>, FactionError> {
        self.join(faction_id, player, username, true)
    }

    fn join(
        &self,
        faction_id: FactionId,
        player: PlayerId,
        username: &str,
        require_open: bool,
    ) -> Result<Arc<Faction>, FactionError> {
        self.transaction(|txn| {
            if txn.state.faction_id_of(&player).is_some() {
                return Err(FactionError::AlreadyInFaction);
            }
            let faction = txn
                .faction(&faction_id)
                .ok_or(FactionError::FactionNotFound)?;
            if require_open && !faction.open {
                return Err(FactionError::FactionClosed);
            }
            let max = txn.config.members.max_members;
            if max > 0 && faction.member_count() >= max {
                return Err(FactionError::FactionFull);
            }
            let now = txn.now;
            let updated = faction
                .with_member(FactionMember::new(player, username, Role::Member, now))
                .with_log(LogEntry::new(
                    now,
                    Some(player),
                    LogKind::Joined,
                    format!("{username} joined"),
                ));
            let updated = txn.put(updated)?;
            txn.emit(FactionEvent::MemberJoined {
                faction: faction_id,
                player,
            });
            debug!(faction = %faction_id, player = %player, "member joined");
            Ok(updated)
        })
    }

    /// Leave the player's own faction.
    pub fn leave(&self, player: PlayerId) -> Result<RemoveOutcome, FactionError> {
        self.remove_member(player, player)
    }

    /// Remove `target` from the actor's faction.
    pub fn kick(&self, actor: PlayerId, target: PlayerId) -> Result<RemoveOutcome, FactionError> {
        if actor == target {
            return Err(FactionError::CannotTargetSelf);
        }
        self.remove_member(actor, target)
    }

    /// Remove `target` from the actor's faction. Self-removal is always
    /// allowed; removing someone else needs a strictly higher rank. When the
    /// leader leaves, the best-ranked longest-serving member succeeds them,
    /// or the faction is disbanded if nobody remains.
    pub fn remove_member(
        &self,
        actor: PlayerId,
        target: PlayerId,
    ) -> Result<RemoveOutcome, FactionError> {
        self.transaction(|txn| {
            let faction = txn.faction_of(&actor).ok_or(FactionError::NotInFaction)?;
            let departing = faction
                .member(&target)
                .cloned()
                .ok_or(FactionError::TargetNotInFaction)?;
            let kicked_by = (actor != target).then_some(actor);

            if kicked_by.is_some() {
                let actor_role = faction.role_of(&actor).ok_or(FactionError::NotInFaction)?;
                if actor_role.level() <= departing.role.level() {
                    return Err(FactionError::OutrankedTarget);
                }
                let required = faction.required_role(Permission::Kick);
                if actor_role < required {
                    return Err(FactionError::InsufficientRole { required });
                }
            }

            let now = txn.now;
            let (kind, message) = match kicked_by {
                Some(_) => (LogKind::Kicked, format!("{} was kicked", departing.username)),
                None => (LogKind::Left, format!("{} left", departing.username)),
            };
            let left = FactionEvent::MemberLeft {
                faction: faction.id,
                player: target,
                kicked_by,
            };

            if departing.role != Role::Leader {
                let updated = faction
                    .without_member(&target)
                    .with_log(LogEntry::new(now, Some(actor), kind, message));
                let updated = txn.put(updated)?;
                txn.emit(left);
                debug!(faction = %faction.id, player = %target, "member removed");
                return Ok(RemoveOutcome::Removed(updated));
            }

            let Some(heir) = faction.successor(&target).cloned() else {
                let disbanded = txn
                    .disband(faction.id, None, DisbandReason::Empty)
                    .ok_or(FactionError::FactionNotFound)?;
                return Ok(RemoveOutcome::Disbanded(disbanded));
            };

            let updated = faction
                .without_member(&target)
                .with_member(heir.with_role(Role::Leader))
                .with_log(LogEntry::new(now, Some(actor), kind, message))
                .with_log(LogEntry::new(
                    now,
                    None,
                    LogKind::LeaderChanged,
                    format!("{} inherited leadership", heir.username),
                ));
            let updated = txn.put(updated)?;
            txn.emit(left);
            txn.emit(FactionEvent::LeaderChanged {
                faction: faction.id,
                previous: Some(target),
                leader: heir.player_id,
            });
            info!(faction = %faction.id, leader = %heir.player_id, "leadership passed by succession");
            Ok(RemoveOutcome::Succeeded {
                faction: updated,
                new_leader: heir.player_id,
            })
        })
    }

    // -- Ranks --

    /// Raise `target` one rank. Promoting an officer hands over leadership.
    pub fn promote(&self, actor: PlayerId, target: PlayerId) -> Result<Role, FactionError> {
        self.transaction(|txn| {
            let (faction, member) = leader_and_target(txn, actor, target)?;
            match member.role.promoted() {
                None => Err(FactionError::CannotPromoteLeader),
                Some(Role::Leader) => {
                    hand_over(txn, &faction, actor, target)?;
                    Ok(Role::Leader)
                }
                Some(role) => {
                    set_role(txn, &faction, actor, &member, role, LogKind::Promoted)?;
                    Ok(role)
                }
            }
        })
    }

    /// Lower `target` one rank.
    pub fn demote(&self, actor: PlayerId, target: PlayerId) -> Result<Role, FactionError> {
        self.transaction(|txn| {
            let (faction, member) = leader_and_target(txn, actor, target)?;
            if member.role == Role::Leader {
                return Err(FactionError::CannotDemoteLeader);
            }
            let role = member.role.demoted().ok_or(FactionError::CannotDemoteMember)?;
            set_role(txn, &faction, actor, &member, role, LogKind::Demoted)?;
            Ok(role)
        })
    }

    /// Make `target` leader and the current leader an officer, in one write.
    pub fn transfer_leadership(
        &self,
        actor: PlayerId,
        target: PlayerId,
    ) -> Result<Arc<Faction>, FactionError> {
        if actor == target {
            return Err(FactionError::CannotTargetSelf);
        }
        self.transaction(|txn| {
            let (faction, _) = leader_and_target(txn, actor, target)?;
            hand_over(txn, &faction, actor, target)
        })
    }

    // -- Settings --

    /// Set or clear the faction home.
    pub fn set_home(
        &self,
        actor: PlayerId,
        home: Option<Location>,
    ) -> Result<Arc<Faction>, FactionError> {
        self.transaction(|txn| {
            let faction = txn.faction_of(&actor).ok_or(FactionError::NotInFaction)?;
            if !faction.allows(&actor, Permission::SetHome) {
                return Err(FactionError::InsufficientRole {
                    required: faction.required_role(Permission::SetHome),
                });
            }
            if let Some(location) = &home
                && txn.config.claims.home_must_be_claimed
                && !faction.owns(&location.chunk())
            {
                return Err(FactionError::HomeNotInTerritory);
            }
            let message = match &home {
                Some(loc) => format!("home set in {}", loc.chunk()),
                None => "home cleared".to_string(),
            };
            let updated = faction.with_home(home).with_log(LogEntry::new(
                txn.now,
                Some(actor),
                LogKind::HomeChanged,
                message,
            ));
            txn.put(updated)
        })
    }

    /// Apply an arbitrary transformation to a faction. The id, claims and
    /// relations cannot change through here; the claim index and diplomacy
    /// own those. The result must still have exactly one leader.
    pub fn update(
        &self,
        id: FactionId,
        f: impl FnOnce(&Faction) -> Faction,
    ) -> Result<Arc<Faction>, FactionError> {
        self.transaction(|txn| {
            let faction = txn.faction(&id).ok_or(FactionError::FactionNotFound)?;
            let updated = Faction {
                id,
                claims: faction.claims.clone(),
                relations: faction.relations.clone(),
                ..f(&faction)
            };
            validate_name(&txn.config.names, &updated.name)?;
            if updated.leader_count() != 1 {
                return Err(FactionError::InvalidLeadership);
            }
            txn.put(updated)
        })
    }

    pub fn rename(&self, actor: PlayerId, name: &str) -> Result<Arc<Faction>, FactionError> {
        let name = name.trim();
        validate_name(&self.config.names, name)?;
        self.leader_update(actor, format!("renamed to {name}"), |f| f.with_name(name))
    }

    pub fn set_tag(&self, actor: PlayerId, tag: &str) -> Result<Arc<Faction>, FactionError> {
        let tag = tag.trim();
        if tag.is_empty()
            || tag.len() > MAX_TAG_LEN
            || !tag.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(FactionError::InvalidTag);
        }
        let tag = tag_key(tag);
        self.leader_update(actor, format!("tag set to {tag}"), |f| {
            f.with_tag(Some(tag.clone()))
        })
    }

    pub fn set_description(
        &self,
        actor: PlayerId,
        description: Option<String>,
    ) -> Result<Arc<Faction>, FactionError> {
        self.leader_update(actor, "description changed".into(), |f| {
            f.with_description(description.clone())
        })
    }

    pub fn set_color(&self, actor: PlayerId, color: &str) -> Result<Arc<Faction>, FactionError> {
        self.leader_update(actor, format!("color set to {color}"), |f| f.with_color(color))
    }

    pub fn set_open(&self, actor: PlayerId, open: bool) -> Result<Arc<Faction>, FactionError> {
        let message = if open { "opened" } else { "closed" };
        self.leader_update(actor, message.into(), |f| f.with_open(open))
    }

    pub fn set_permission(
        &self,
        actor: PlayerId,
        permission: Permission,
        role: Role,
    ) -> Result<Arc<Faction>, FactionError> {
        self.leader_update(actor, format!("{permission:?} now needs {role:?}"), |f| {
            f.with_permission(permission, role)
        })
    }

    fn leader_update(
        &self,
        actor: PlayerId,
        message: String,
        f: impl FnOnce(&Faction) -> Faction,
    ) -> Result<Arc<Faction>, FactionError> {
        self.transaction(|txn| {
            let faction = txn.faction_of(&actor).ok_or(FactionError::NotInFaction)?;
            if faction.role_of(&actor) != Some(Role::Leader) {
                return Err(FactionError::NotLeader);
            }
            let updated = f(&faction).with_log(LogEntry::new(
                txn.now,
                Some(actor),
                LogKind::Settings,
                message,
            ));
            txn.put(updated)
        })
    }

    /// Refresh a member's cached username and last-online time. Returns
    /// `false` if the player is not in a faction.
    pub fn touch_member(&self, player: PlayerId, username: &str, at: DateTime<Utc>) -> bool {
        self.transaction(|txn| {
            let Some(faction) = txn.faction_of(&player) else {
                return false;
            };
            let Some(member) = faction.member(&player) else {
                return false;
            };
            let updated = faction.with_member(member.with_last_online(username, at));
            txn.put(updated).is_ok()
        })
    }

    // -- Bulk reconciliation --

    /// Replace memory with what storage holds. An empty load over a
    /// populated registry is treated as a failed read and ignored.
    pub fn load_all(&self) -> Result<LoadReport, StoreError> {
        let records = self.store.load_all_factions().map_err(|err| {
            error!(error = %err, "failed to load factions; keeping in-memory state");
            err
        })?;

        Ok(self.transaction(|txn| {
            if records.is_empty() && !txn.state.is_empty() {
                warn!(
                    in_memory = txn.state.len(),
                    "storage returned no factions; keeping in-memory state"
                );
                return LoadReport::KeptExisting {
                    in_memory: txn.state.len(),
                };
            }

            let (rebuilt, skipped) = RegistryState::from_records(records);
            let factions = rebuilt.len();
            *txn.state = rebuilt;
            txn.run_reload_hooks();
            info!(factions, skipped, "factions loaded");
            LoadReport::Replaced { factions, skipped }
        }))
    }

    /// Merge storage into memory. New factions are added; for known
    /// factions each member's more recently online record wins, members
    /// only on disk are added, and members only in memory are kept.
    pub fn sync_from_disk(&self) -> Result<SyncReport, StoreError> {
        let records = self.store.load_all_factions().map_err(|err| {
            error!(error = %err, "failed to load factions for sync");
            err
        })?;

        Ok(self.transaction(|txn| {
            let mut report = SyncReport::default();
            if records.is_empty() && !txn.state.is_empty() {
                warn!(
                    in_memory = txn.state.len(),
                    "storage returned no factions; skipping sync"
                );
                report.kept_existing = true;
                return report;
            }

            for disk in records {
                let id = disk.id;
                let Some(memory) = txn.faction(&id) else {
                    match normalize_leadership(disk, None).map(|f| txn.state.insert(f)) {
                        Some(Ok(_)) => report.factions_added += 1,
                        Some(Err(err)) => {
                            warn!(faction = %id, error = %err, "skipping conflicting stored faction");
                            report.skipped += 1;
                        }
                        None => report.skipped += 1,
                    }
                    continue;
                };

                let mut merged = (*memory).clone();
                let mut touched = false;
                for stored in disk.members.values() {
                    let player = stored.player_id;
                    match merged.member(&player) {
                        Some(current) if stored.last_online > current.last_online => {
                            merged = merged.with_member(stored.clone());
                            report.members_updated += 1;
                            touched = true;
                        }
                        Some(_) => {}
                        None if txn.state.faction_id_of(&player).is_some_and(|f| f != id) => {
                            warn!(faction = %id, player = %player, "stored member belongs elsewhere; skipping");
                            report.skipped += 1;
                        }
                        None => {
                            merged = merged.with_member(stored.clone());
                            report.members_added += 1;
                            touched = true;
                        }
                    }
                }
                if !touched {
                    continue;
                }
                let preferred = memory.leader().map(|m| m.player_id);
                let Some(merged) = normalize_leadership(merged, preferred) else {
                    continue;
                };
                if let Err(err) = txn.put(merged) {
                    warn!(faction = %id, error = %err, "failed to merge stored faction");
                    report.skipped += 1;
                }
            }
            txn.run_reload_hooks();
            info!(?report, "factions synced from storage");
            report
        }))
    }
}

// ===========================================================================
// Helpers
// ===========================================================================

fn validate_name(rules: &NameRules, name: &str) -> Result<(), FactionError> {
    let len = name.trim().chars().count();
    if len < rules.min_length {
        return Err(FactionError::NameTooShort {
            min: rules.min_length,
        });
    }
    if len > rules.max_length {
        return Err(FactionError::NameTooLong {
            max: rules.max_length,
        });
    }
    Ok(())
}

/// Derive a unique tag from a faction name: the first three alphanumerics,
/// uppercased, then numeric suffixes 2..=99, then random suffixes.
pub fn derive_tag(name: &str, taken: impl Fn(&str) -> bool) -> Option<String> {
    let base: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(TAG_BASE_LEN)
        .collect::<String>()
        .to_ascii_uppercase();

    if !base.is_empty() && !taken(&base) {
        return Some(base);
    }

    if !base.is_empty() {
        for n in TAG_SUFFIX_RANGE {
            let suffix = n.to_string();
            let keep = base.len().min(MAX_TAG_LEN - suffix.len());
            let candidate = format!("{}{}", &base[..keep], suffix);
            if !taken(&candidate) {
                return Some(candidate);
            }
        }
    }

    let mut rng = rand::rng();
    let keep = base.len().min(MAX_TAG_LEN - TAG_BASE_LEN);
    for _ in 0..RANDOM_TAG_ATTEMPTS {
        let suffix: String = (0..TAG_BASE_LEN)
            .map(|_| TAG_ALPHABET[rng.random_range(0..TAG_ALPHABET.len())] as char)
            .collect();
        let candidate = format!("{}{}", &base[..keep], suffix);
        if !taken(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Resolve the actor's faction, require them to lead it, and find `target`.
fn leader_and_target(
    txn: &RegistryTxn<'_>,
    actor: PlayerId,
    target: PlayerId,
) -> Result<(Arc<Faction>, FactionMember), FactionError> {
    let faction = txn.faction_of(&actor).ok_or(FactionError::NotInFaction)?;
    if faction.role_of(&actor) != Some(Role::Leader) {
        return Err(FactionError::NotLeader);
    }
    let member = faction
        .member(&target)
        .cloned()
        .ok_or(FactionError::TargetNotInFaction)?;
    Ok((faction, member))
}

fn set_role(
    txn: &mut RegistryTxn<'_>,
    faction: &Faction,
    actor: PlayerId,
    member: &FactionMember,
    role: Role,
    kind: LogKind,
) -> Result<Arc<Faction>, FactionError> {
    let updated = faction
        .with_member(member.with_role(role))
        .with_log(LogEntry::new(
            txn.now,
            Some(actor),
            kind,
            format!("{} is now {:?}", member.username, role),
        ));
    debug!(faction = %faction.id, player = %member.player_id, ?role, "role changed");
    txn.put(updated)
}

fn hand_over(
    txn: &mut RegistryTxn<'_>,
    faction: &Faction,
    leader: PlayerId,
    target: PlayerId,
) -> Result<Arc<Faction>, FactionError> {
    let (Some(old), Some(new)) = (faction.member(&leader), faction.member(&target)) else {
        return Err(FactionError::TargetNotInFaction);
    };
    let updated = faction
        .with_member(old.with_role(Role::Officer))
        .with_member(new.with_role(Role::Leader))
        .with_log(LogEntry::new(
            txn.now,
            Some(leader),
            LogKind::LeaderChanged,
            format!("{} handed leadership to {}", old.username, new.username),
        ));
    let updated = txn.put(updated)?;
    txn.emit(FactionEvent::LeaderChanged {
        faction: faction.id,
        previous: Some(leader),
        leader: target,
    });
    info!(faction = %faction.id, leader = %target, "leadership transferred");
    Ok(updated)
}
