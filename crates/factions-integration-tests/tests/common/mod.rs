//! Shared setup for the cross-crate tests.

#![allow(dead_code)]

use std::sync::Arc;

use factions_core::chunk::ChunkKey;
use factions_core::config::FactionsConfig;
use factions_core::test_utils::{ManualClock, MemoryFactionStore};
use factions_engine::Factions;
use factions_power::test_utils::MemoryPowerStore;
use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once. `RUST_LOG=debug` shows the
/// component logs for a failing test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Server {
    pub factions: Factions,
    pub store: Arc<MemoryFactionStore>,
    pub power: Arc<MemoryPowerStore>,
    pub clock: Arc<ManualClock>,
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(FactionsConfig::default())
    }

    pub fn with_config(config: FactionsConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryFactionStore::new());
        let power = Arc::new(MemoryPowerStore::new());
        let clock = Arc::new(ManualClock::default());
        let factions = Factions::new(config, store.clone(), power.clone(), clock.clone())
            .expect("default-derived config is valid");
        Self {
            factions,
            store,
            power,
            clock,
        }
    }

    /// Start a fresh server over the same storage.
    pub fn restart(&self, config: FactionsConfig) -> Factions {
        Factions::new(config, self.store.clone(), self.power.clone(), self.clock.clone())
            .expect("config is valid")
    }

    /// Index and faction records agree, and every chunk has one owner.
    pub fn assert_consistent(&self) {
        let f = &self.factions;
        assert_eq!(f.claims().verify(f.registry()), Vec::new());
        let listed: usize = f.registry().all().iter().map(|x| x.claim_count()).sum();
        assert_eq!(listed, f.claims().len());
        assert!(f.registry().inspect(|state| state.indices_consistent()));
    }
}

pub fn chunk(x: i32, z: i32) -> ChunkKey {
    ChunkKey::new("world", x, z)
}
