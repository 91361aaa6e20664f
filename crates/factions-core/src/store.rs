//! Persistence collaborator contract.
//!
//! The core never waits on storage. Saves and deletes are issued after a
//! mutation commits; implementations are expected to hand the work to their
//! own background writer and return promptly. A returned error is logged
//! and otherwise ignored: the in-memory state stays authoritative and the
//! call is not retried.

use std::sync::Arc;

use crate::faction::Faction;
use crate::id::FactionId;

/// Errors reported by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Durable storage for faction records.
pub trait FactionStore: Send + Sync {
    /// Read every stored faction. Used by bulk load and sync.
    fn load_all_factions(&self) -> Result<Vec<Faction>, StoreError>;

    fn save_faction(&self, faction: Arc<Faction>) -> Result<(), StoreError>;

    fn delete_faction(&self, id: FactionId) -> Result<(), StoreError>;
}

/// A store that keeps nothing. Loads return empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl FactionStore for NullStore {
    fn load_all_factions(&self) -> Result<Vec<Faction>, StoreError> {
        Ok(Vec::new())
    }

    fn save_faction(&self, _faction: Arc<Faction>) -> Result<(), StoreError> {
        Ok(())
    }

    fn delete_faction(&self, _id: FactionId) -> Result<(), StoreError> {
        Ok(())
    }
}
