//! Factions Core -- the authoritative faction model for land-claim game modes.
//!
//! This crate owns faction records, membership, ranks, and the indices that
//! keep player, name, and tag lookups consistent. The power ledger, claim
//! index, and diplomacy engine crates all build on top of it.
//!
//! # Immutable Records
//!
//! A [`faction::Faction`] is never mutated in place. Every change produces a
//! new value through a `with_*` / `without_*` transformation, backed by `im`
//! persistent collections so copies share structure:
//!
//! ```rust,ignore
//! let updated = faction.with_member(member).with_log(entry);
//! txn.put(updated)?;
//! ```
//!
//! # Transactions
//!
//! All writes go through [`registry::FactionRegistry::transaction`]. The
//! closure receives a [`registry::RegistryTxn`] holding the registry's write
//! lock; anything done through it becomes visible atomically when the closure
//! returns. Persistence calls and passive listeners run after the commit.
//!
//! # Key Types
//!
//! - [`registry::FactionRegistry`] -- Faction lifetime, membership, succession.
//! - [`faction::Faction`] -- Immutable faction record.
//! - [`chunk::ChunkKey`] -- `(world, x, z)` tile coordinate.
//! - [`config::FactionsConfig`] -- Explicit configuration snapshot.
//! - [`event::DisbandEvent`] -- Notification carrying the pre-deletion record.
//! - [`store::FactionStore`] -- Persistence collaborator contract.

pub mod chunk;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod faction;
pub mod id;
pub mod registry;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use chunk::{ChunkKey, Location};
pub use clock::{Clock, SystemClock};
pub use config::FactionsConfig;
pub use error::FactionError;
pub use event::{DisbandEvent, DisbandReason, FactionEvent, HookPriority};
pub use faction::{Faction, FactionMember, Role};
pub use id::{FactionId, PlayerId};
pub use registry::{FactionRegistry, LoadReport, RegistryTxn, RemoveOutcome, SyncReport};
pub use store::{FactionStore, NullStore, StoreError};
