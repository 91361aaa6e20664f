//! Test helpers for the power ledger. Enabled by the `test-utils` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use factions_core::config::FactionsConfig;
use factions_core::id::PlayerId;
use factions_core::store::StoreError;
use factions_core::test_utils::ManualClock;

use crate::{PlayerPower, PowerLedger, PowerStore};

/// In-memory [`PowerStore`] with failure injection.
#[derive(Debug, Default)]
pub struct MemoryPowerStore {
    records: Mutex<HashMap<PlayerId, PlayerPower>>,
    fail_loads: AtomicBool,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryPowerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: PlayerPower) {
        self.lock().insert(record.player_id, record);
    }

    pub fn stored(&self, player: &PlayerId) -> Option<PlayerPower> {
        self.lock().get(player).cloned()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PlayerId, PlayerPower>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_load(&self) -> Result<(), StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected load failure".into()));
        }
        Ok(())
    }
}

impl PowerStore for MemoryPowerStore {
    fn load_all_player_power(&self) -> Result<Vec<PlayerPower>, StoreError> {
        self.check_load()?;
        Ok(self.lock().values().cloned().collect())
    }

    fn load_player_power(&self, player: PlayerId) -> Result<Option<PlayerPower>, StoreError> {
        self.check_load()?;
        Ok(self.lock().get(&player).cloned())
    }

    fn save_player_power(&self, record: &PlayerPower) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        self.insert(record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A ledger wired to a memory store and a manual clock.
pub struct LedgerFixture {
    pub ledger: Arc<PowerLedger>,
    pub store: Arc<MemoryPowerStore>,
    pub clock: Arc<ManualClock>,
}

impl LedgerFixture {
    pub fn new() -> Self {
        Self::with_config(FactionsConfig::default())
    }

    pub fn with_config(config: FactionsConfig) -> Self {
        let store = Arc::new(MemoryPowerStore::new());
        let clock = Arc::new(ManualClock::default());
        let ledger = Arc::new(PowerLedger::new(
            Arc::new(config),
            store.clone(),
            clock.clone(),
        ));
        Self {
            ledger,
            store,
            clock,
        }
    }
}

impl Default for LedgerFixture {
    fn default() -> Self {
        Self::new()
    }
}
