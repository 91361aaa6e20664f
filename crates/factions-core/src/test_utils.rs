//! Shared test helpers for unit tests, integration tests, and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so downstream
//! crates can enable them through the `test-utils` feature.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::FactionsConfig;
use crate::faction::Faction;
use crate::id::{FactionId, PlayerId};
use crate::registry::FactionRegistry;
use crate::store::{FactionStore, StoreError};

// ===========================================================================
// Deterministic ids and times
// ===========================================================================

pub fn player(n: u128) -> PlayerId {
    PlayerId(Uuid::from_u128(n))
}

pub fn faction_id(n: u128) -> FactionId {
    FactionId(Uuid::from_u128(n))
}

/// Midnight UTC on 2024-01-01 plus `n` days.
pub fn day(n: i64) -> DateTime<Utc> {
    base_time() + Duration::days(n)
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

// ===========================================================================
// ManualClock
// ===========================================================================

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(at),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(day(0))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ===========================================================================
// MemoryFactionStore
// ===========================================================================

/// In-memory [`FactionStore`] with failure injection and call counters.
#[derive(Debug, Default)]
pub struct MemoryFactionStore {
    factions: Mutex<BTreeMap<FactionId, Faction>>,
    fail_writes: AtomicBool,
    fail_loads: AtomicBool,
    saves: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryFactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace stored contents.
    pub fn set_factions(&self, factions: Vec<Faction>) {
        let mut stored = self.lock();
        stored.clear();
        stored.extend(factions.into_iter().map(|f| (f.id, f)));
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stored(&self, id: &FactionId) -> Option<Faction> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Successful deletes so far.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<FactionId, Faction>> {
        self.factions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FactionStore for MemoryFactionStore {
    fn load_all_factions(&self) -> Result<Vec<Faction>, StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected load failure".into()));
        }
        Ok(self.lock().values().cloned().collect())
    }

    fn save_faction(&self, faction: Arc<Faction>) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        self.lock().insert(faction.id, (*faction).clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_faction(&self, id: FactionId) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        self.lock().remove(&id);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ===========================================================================
// Registry fixture
// ===========================================================================

/// A registry wired to a memory store and a manual clock.
pub struct RegistryFixture {
    pub registry: Arc<FactionRegistry>,
    pub store: Arc<MemoryFactionStore>,
    pub clock: Arc<ManualClock>,
    pub config: Arc<FactionsConfig>,
}

impl RegistryFixture {
    pub fn new() -> Self {
        Self::with_config(FactionsConfig::default())
    }

    pub fn with_config(config: FactionsConfig) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(MemoryFactionStore::new());
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(FactionRegistry::new(
            config.clone(),
            store.clone(),
            clock.clone(),
        ));
        Self {
            registry,
            store,
            clock,
            config,
        }
    }

    /// Found a faction led by `player(n)`, username `p{n}`.
    pub fn found(&self, n: u128, name: &str) -> Arc<Faction> {
        self.registry
            .create(player(n), &format!("p{n}"), name)
            .unwrap_or_else(|err| panic!("failed to found {name}: {err}"))
    }

    /// Add `player(n)` to a faction as a plain member.
    pub fn join(&self, faction: FactionId, n: u128) -> Arc<Faction> {
        self.registry
            .add_member(faction, player(n), &format!("p{n}"))
            .unwrap_or_else(|err| panic!("player {n} failed to join: {err}"))
    }
}

impl Default for RegistryFixture {
    fn default() -> Self {
        Self::new()
    }
}
