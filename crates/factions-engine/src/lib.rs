//! The factions facade.
//!
//! [`Factions`] builds the registry, power ledger, claim index, and
//! diplomacy engine from one configuration snapshot and wires the registry
//! hooks between them. On disband, claims are released first and then
//! relations are scrubbed, both inside the disband transaction. On reload,
//! the claim index is rebuilt and stale ally requests are dropped inside the
//! write that swaps in the stored records.
//!
//! Components stay individually reachable through the accessors; the
//! methods here cover the flows that touch more than one of them.

use std::sync::Arc;

use factions_claims::{ClaimError, ClaimIndex, OverclaimOutcome};
use factions_core::chunk::{ChunkKey, Location};
use factions_core::clock::Clock;
use factions_core::config::{ConfigError, FactionsConfig};
use factions_core::error::FactionError;
use factions_core::faction::Faction;
use factions_core::id::{FactionId, PlayerId};
use factions_core::registry::{FactionRegistry, LoadReport, SyncReport};
use factions_core::store::{FactionStore, StoreError};
use factions_diplomacy::{AllyRequestOutcome, DiplomacyEngine, DiplomacyError};
use factions_power::{LedgerLoad, PlayerPower, PowerLedger, PowerStore, TickReport};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
}

/// What a full reload did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub factions: LoadReport,
    pub power: LedgerLoad,
    /// Chunks in the claim index once the reload finished.
    pub claimed_chunks: usize,
}

/// What a merge from storage did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub factions: SyncReport,
    pub claimed_chunks: usize,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    pub power: TickReport,
    pub expired_requests: usize,
}

pub struct Factions {
    config: Arc<FactionsConfig>,
    registry: Arc<FactionRegistry>,
    ledger: Arc<PowerLedger>,
    claims: Arc<ClaimIndex>,
    diplomacy: Arc<DiplomacyEngine>,
}

impl std::fmt::Debug for Factions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factions")
            .field("registry", &self.registry)
            .field("ledger", &self.ledger)
            .field("claims", &self.claims)
            .field("diplomacy", &self.diplomacy)
            .finish()
    }
}

impl Factions {
    /// Validate `config` and build every component around it.
    pub fn new(
        config: FactionsConfig,
        faction_store: Arc<dyn FactionStore>,
        power_store: Arc<dyn PowerStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let config = Arc::new(config);

        let registry = Arc::new(FactionRegistry::new(
            config.clone(),
            faction_store,
            clock.clone(),
        ));
        let ledger = Arc::new(PowerLedger::new(config.clone(), power_store, clock));
        let claims = Arc::new(ClaimIndex::new(config.clone()));
        let diplomacy = Arc::new(DiplomacyEngine::new(config.clone()));

        claims.install(&registry);
        diplomacy.install(&registry);

        Ok(Self {
            config,
            registry,
            ledger,
            claims,
            diplomacy,
        })
    }

    pub fn config(&self) -> &FactionsConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<FactionRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<PowerLedger> {
        &self.ledger
    }

    pub fn claims(&self) -> &Arc<ClaimIndex> {
        &self.claims
    }

    pub fn diplomacy(&self) -> &Arc<DiplomacyEngine> {
        &self.diplomacy
    }

    // -- Bulk reconciliation --

    /// Reload factions and power from storage. The registry's reload hooks
    /// rebuild the claim index as part of the faction reload.
    pub fn load_all(&self) -> Result<LoadSummary, EngineError> {
        let factions = self.registry.load_all()?;
        let power = self.ledger.load_all()?;
        let claimed_chunks = self.claims.len();
        info!(?factions, ?power, claimed_chunks, "factions state loaded");
        Ok(LoadSummary {
            factions,
            power,
            claimed_chunks,
        })
    }

    /// Merge storage into memory.
    pub fn sync_from_disk(&self) -> Result<SyncSummary, EngineError> {
        let factions = self.registry.sync_from_disk()?;
        Ok(SyncSummary {
            factions,
            claimed_chunks: self.claims.len(),
        })
    }

    // -- Player lifecycle --

    /// A player connected: load their power, mark them online, and refresh
    /// their membership record.
    pub fn player_joined(&self, player: PlayerId, username: &str) -> PlayerPower {
        let power = self.ledger.load_player(player);
        self.ledger.set_online(player, true);
        self.registry
            .touch_member(player, username, self.registry.clock().now());
        debug!(player = %player, power = power.power, "player joined");
        power
    }

    pub fn player_quit(&self, player: PlayerId, username: &str) {
        self.ledger.set_online(player, false);
        self.registry
            .touch_member(player, username, self.registry.clock().now());
        debug!(player = %player, "player quit");
    }

    pub fn player_died(&self, player: PlayerId) -> PlayerPower {
        self.ledger.apply_death_penalty(player)
    }

    /// Periodic maintenance: regenerate power and expire stale ally
    /// requests.
    pub fn tick(&self) -> MaintenanceReport {
        let power = self.ledger.tick();
        let expired_requests = self.diplomacy.prune_expired(self.registry.clock().now());
        MaintenanceReport {
            power,
            expired_requests,
        }
    }

    // -- Faction lifecycle --

    pub fn create_faction(
        &self,
        founder: PlayerId,
        founder_name: &str,
        name: &str,
    ) -> Result<Arc<Faction>, FactionError> {
        let faction = self.registry.create(founder, founder_name, name)?;
        self.ledger.get(founder);
        Ok(faction)
    }

    pub fn disband(&self, actor: PlayerId) -> Result<Arc<Faction>, FactionError> {
        self.registry.disband(actor)
    }

    // -- Territory --

    pub fn claim(&self, player: PlayerId, chunk: ChunkKey) -> Result<Arc<Faction>, ClaimError> {
        self.claims.claim(&self.registry, &self.ledger, player, chunk)
    }

    /// Claim the chunk containing the player's position.
    pub fn claim_here(
        &self,
        player: PlayerId,
        location: &Location,
    ) -> Result<Arc<Faction>, ClaimError> {
        self.claim(player, location.chunk())
    }

    pub fn unclaim(&self, player: PlayerId, chunk: ChunkKey) -> Result<Arc<Faction>, ClaimError> {
        self.claims.unclaim(&self.registry, player, chunk)
    }

    pub fn overclaim(
        &self,
        player: PlayerId,
        chunk: ChunkKey,
    ) -> Result<OverclaimOutcome, ClaimError> {
        self.claims
            .overclaim(&self.registry, &self.ledger, player, chunk)
    }

    /// The faction owning the chunk at `location`.
    pub fn owner_at(&self, location: &Location) -> Option<Arc<Faction>> {
        self.claims
            .owner(&location.chunk())
            .and_then(|id| self.registry.get(&id))
    }

    // -- Power views --

    pub fn faction_power(&self, faction: &FactionId) -> Option<f64> {
        self.registry
            .get(faction)
            .map(|f| self.ledger.faction_power(&f))
    }

    pub fn claim_capacity(&self, faction: &FactionId) -> Option<usize> {
        self.registry
            .get(faction)
            .map(|f| self.ledger.claim_capacity(&f))
    }

    pub fn is_raidable(&self, faction: &FactionId) -> bool {
        self.registry
            .get(faction)
            .is_some_and(|f| self.ledger.is_raidable(&f))
    }

    // -- Diplomacy --

    pub fn request_ally(
        &self,
        actor: PlayerId,
        target: FactionId,
    ) -> Result<AllyRequestOutcome, DiplomacyError> {
        self.diplomacy.request_ally(&self.registry, actor, target)
    }

    pub fn accept_ally(
        &self,
        actor: PlayerId,
        from: FactionId,
    ) -> Result<Arc<Faction>, DiplomacyError> {
        self.diplomacy.accept_ally(&self.registry, actor, from)
    }

    pub fn set_enemy(
        &self,
        actor: PlayerId,
        target: FactionId,
    ) -> Result<Arc<Faction>, DiplomacyError> {
        self.diplomacy.set_enemy(&self.registry, actor, target)
    }

    pub fn set_neutral(
        &self,
        actor: PlayerId,
        target: FactionId,
    ) -> Result<Arc<Faction>, DiplomacyError> {
        self.diplomacy.set_neutral(&self.registry, actor, target)
    }
}
