//! Registry notifications.
//!
//! Three kinds of subscriber exist:
//!
//! - **Disband hooks** run *inside* the disband transaction, with mutable
//!   access to the registry. Cleanup collaborators (claim index, diplomacy)
//!   use them so no reader ever sees claims or relations pointing at a
//!   faction that no longer exists.
//! - **Reload hooks** run inside the write that swaps in records from
//!   storage, so derived state is rebuilt before any reader or writer sees
//!   the new records.
//! - **Passive listeners** receive [`FactionEvent`]s read-only, after the
//!   transaction commits and the write lock is released. Listeners may call
//!   back into the registry.
//!
//! Hooks must not call registry methods that take the lock themselves; they
//! get everything they need through the [`RegistryTxn`] argument.

use std::sync::Arc;

use crate::faction::Faction;
use crate::id::{FactionId, PlayerId};
use crate::registry::RegistryTxn;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Why a faction was disbanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisbandReason {
    /// The leader disbanded it.
    Leader,
    /// The last member left.
    Empty,
    /// An administrator forced it.
    Admin,
}

/// Emitted when a faction is disbanded. Carries the record as it was just
/// before deletion.
#[derive(Debug, Clone)]
pub struct DisbandEvent {
    pub faction: Arc<Faction>,
    /// `None` for system-initiated disbands.
    pub actor: Option<PlayerId>,
    pub reason: DisbandReason,
}

/// A committed registry change.
#[derive(Debug, Clone)]
pub enum FactionEvent {
    Created {
        faction: FactionId,
        founder: PlayerId,
    },
    Disbanded(DisbandEvent),
    MemberJoined {
        faction: FactionId,
        player: PlayerId,
    },
    MemberLeft {
        faction: FactionId,
        player: PlayerId,
        kicked_by: Option<PlayerId>,
    },
    LeaderChanged {
        faction: FactionId,
        previous: Option<PlayerId>,
        leader: PlayerId,
    },
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Cleanup run within the disband transaction.
pub type DisbandHook = Box<dyn Fn(&DisbandEvent, &mut RegistryTxn<'_>) + Send + Sync>;

/// Derived-state rebuild run within a reload from storage.
pub type ReloadHook = Box<dyn Fn(&mut RegistryTxn<'_>) + Send + Sync>;

/// Read-only observer of committed changes.
pub type FactionListener = Arc<dyn Fn(&FactionEvent) + Send + Sync>;

/// Ordering for disband hooks. Lower priorities run first; equal priorities
/// run in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookPriority {
    Pre = 0,
    Normal = 1,
    Post = 2,
}

pub(crate) struct HookEntry {
    pub(crate) name: &'static str,
    pub(crate) priority: HookPriority,
    pub(crate) insertion_order: u64,
    pub(crate) hook: DisbandHook,
}

impl std::fmt::Debug for HookEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookEntry")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("insertion_order", &self.insertion_order)
            .finish_non_exhaustive()
    }
}

pub(crate) struct ReloadEntry {
    pub(crate) name: &'static str,
    pub(crate) hook: ReloadHook,
}

/// Sorted hook list, reload hooks in registration order, and passive
/// listeners.
#[derive(Default)]
pub(crate) struct Subscribers {
    pub(crate) hooks: Vec<HookEntry>,
    pub(crate) reload_hooks: Vec<ReloadEntry>,
    pub(crate) listeners: Vec<FactionListener>,
    next_insertion_order: u64,
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("hooks", &self.hooks)
            .field(
                "reload_hooks",
                &self.reload_hooks.iter().map(|e| e.name).collect::<Vec<_>>(),
            )
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Subscribers {
    pub(crate) fn add_hook(&mut self, name: &'static str, priority: HookPriority, hook: DisbandHook) {
        let insertion_order = self.next_insertion_order;
        self.next_insertion_order += 1;
        self.hooks.push(HookEntry {
            name,
            priority,
            insertion_order,
            hook,
        });
        self.hooks
            .sort_by_key(|entry| (entry.priority, entry.insertion_order));
    }

    pub(crate) fn add_reload_hook(&mut self, name: &'static str, hook: ReloadHook) {
        self.reload_hooks.push(ReloadEntry { name, hook });
    }

    pub(crate) fn add_listener(&mut self, listener: FactionListener) {
        self.listeners.push(listener);
    }
}
