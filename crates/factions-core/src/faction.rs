//! Immutable faction records.
//!
//! Every type here is a plain value. Changes are expressed as pure
//! `with_*` / `without_*` transformations that return a new record; the
//! original is left untouched, so a reader holding an `Arc<Faction>` never
//! observes a half-applied change.

use chrono::{DateTime, Utc};
use im::{OrdMap, Vector};
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkKey, Location};
use crate::id::{FactionId, PlayerId};

/// Activity log capacity. Oldest entries are dropped first.
pub const MAX_LOG_ENTRIES: usize = 100;

// ---------------------------------------------------------------------------
// Roles & permissions
// ---------------------------------------------------------------------------

/// Rank within a faction. Ordered `Member < Officer < Leader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    Member,
    Officer,
    Leader,
}

impl Role {
    /// Ordinal level: 1, 2, 3.
    pub fn level(self) -> u8 {
        match self {
            Role::Member => 1,
            Role::Officer => 2,
            Role::Leader => 3,
        }
    }

    /// One rank up, if any.
    pub fn promoted(self) -> Option<Role> {
        match self {
            Role::Member => Some(Role::Officer),
            Role::Officer => Some(Role::Leader),
            Role::Leader => None,
        }
    }

    /// One rank down, if any.
    pub fn demoted(self) -> Option<Role> {
        match self {
            Role::Member => None,
            Role::Officer => Some(Role::Member),
            Role::Leader => Some(Role::Officer),
        }
    }
}

/// Actions whose minimum rank a faction may override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    Claim,
    Unclaim,
    SetHome,
    Kick,
    Invite,
    Relations,
}

impl Permission {
    pub fn default_role(self) -> Role {
        Role::Officer
    }
}

// ---------------------------------------------------------------------------
// Members, claims, relations, log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactionMember {
    pub player_id: PlayerId,
    /// Last known username, cached for display.
    pub username: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub last_online: DateTime<Utc>,
}

impl FactionMember {
    pub fn new(
        player_id: PlayerId,
        username: impl Into<String>,
        role: Role,
        joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            player_id,
            username: username.into(),
            role,
            joined_at,
            last_online: joined_at,
        }
    }

    pub fn with_role(&self, role: Role) -> Self {
        Self {
            role,
            ..self.clone()
        }
    }

    pub fn with_last_online(&self, username: &str, at: DateTime<Utc>) -> Self {
        Self {
            username: username.to_string(),
            last_online: at,
            ..self.clone()
        }
    }
}

/// One owned chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactionClaim {
    pub chunk: ChunkKey,
    pub claimed_at: DateTime<Utc>,
    pub claimed_by: PlayerId,
}

/// A stored relation. Absence of an entry means neutral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    Ally,
    Enemy,
}

/// Relation as seen from one faction toward another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relation {
    Neutral,
    Ally,
    Enemy,
}

impl From<RelationKind> for Relation {
    fn from(kind: RelationKind) -> Self {
        match kind {
            RelationKind::Ally => Relation::Ally,
            RelationKind::Enemy => Relation::Enemy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactionRelation {
    pub target: FactionId,
    pub kind: RelationKind,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogKind {
    Created,
    Joined,
    Left,
    Kicked,
    Promoted,
    Demoted,
    LeaderChanged,
    Claimed,
    Unclaimed,
    Overclaimed,
    LostClaim,
    HomeChanged,
    Relation,
    Settings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    /// `None` for system-initiated changes.
    pub actor: Option<PlayerId>,
    pub kind: LogKind,
    pub message: String,
}

impl LogEntry {
    pub fn new(
        at: DateTime<Utc>,
        actor: Option<PlayerId>,
        kind: LogKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            at,
            actor,
            kind,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Faction
// ---------------------------------------------------------------------------

/// A faction record. Treat as immutable; use the `with_*` methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Faction {
    pub id: FactionId,
    pub name: String,
    pub tag: Option<String>,
    pub description: Option<String>,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub home: Option<Location>,
    pub members: OrdMap<PlayerId, FactionMember>,
    pub claims: OrdMap<ChunkKey, FactionClaim>,
    pub relations: OrdMap<FactionId, FactionRelation>,
    /// Newest first, capped at [`MAX_LOG_ENTRIES`].
    pub log: Vector<LogEntry>,
    /// Players may join without an invite.
    pub open: bool,
    pub permissions: Option<OrdMap<Permission, Role>>,
}

impl Faction {
    /// A new faction whose only member is its leader.
    pub fn new(
        id: FactionId,
        name: impl Into<String>,
        tag: Option<String>,
        leader: FactionMember,
        created_at: DateTime<Utc>,
    ) -> Self {
        let leader = leader.with_role(Role::Leader);
        let mut members = OrdMap::new();
        members.insert(leader.player_id, leader);
        Self {
            id,
            name: name.into(),
            tag,
            description: None,
            color: "white".to_string(),
            created_at,
            home: None,
            members,
            claims: OrdMap::new(),
            relations: OrdMap::new(),
            log: Vector::new(),
            open: false,
            permissions: None,
        }
    }

    // -- Queries --

    pub fn member(&self, player: &PlayerId) -> Option<&FactionMember> {
        self.members.get(player)
    }

    pub fn is_member(&self, player: &PlayerId) -> bool {
        self.members.contains_key(player)
    }

    pub fn role_of(&self, player: &PlayerId) -> Option<Role> {
        self.members.get(player).map(|m| m.role)
    }

    /// The current leader. `None` only on a malformed record.
    pub fn leader(&self) -> Option<&FactionMember> {
        self.members.values().find(|m| m.role == Role::Leader)
    }

    pub fn leader_count(&self) -> usize {
        self.members.values().filter(|m| m.role == Role::Leader).count()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn claim_count(&self) -> usize {
        self.claims.len()
    }

    pub fn owns(&self, chunk: &ChunkKey) -> bool {
        self.claims.contains_key(chunk)
    }

    /// Whether `chunk` shares an edge with any chunk this faction owns.
    pub fn borders(&self, chunk: &ChunkKey) -> bool {
        chunk.neighbors_4().any(|n| self.claims.contains_key(&n))
    }

    /// Relation from this faction's point of view.
    pub fn relation_to(&self, other: &FactionId) -> Relation {
        self.relations
            .get(other)
            .map(|r| r.kind.into())
            .unwrap_or(Relation::Neutral)
    }

    /// Minimum rank needed for `permission`, honouring overrides.
    pub fn required_role(&self, permission: Permission) -> Role {
        self.permissions
            .as_ref()
            .and_then(|p| p.get(&permission).copied())
            .unwrap_or_else(|| permission.default_role())
    }

    /// Whether `player` is a member with at least the rank `permission` needs.
    pub fn allows(&self, player: &PlayerId, permission: Permission) -> bool {
        self.role_of(player)
            .is_some_and(|role| role >= self.required_role(permission))
    }

    /// Whether the home location lies in `chunk`.
    pub fn home_in(&self, chunk: &ChunkKey) -> bool {
        self.home.as_ref().is_some_and(|h| &h.chunk() == chunk)
    }

    /// The member who inherits leadership if `departing` leaves: highest
    /// rank first, then longest tenure, then lowest player id.
    pub fn successor(&self, departing: &PlayerId) -> Option<&FactionMember> {
        self.members
            .values()
            .filter(|m| &m.player_id != departing)
            .min_by(|a, b| {
                b.role
                    .cmp(&a.role)
                    .then(a.joined_at.cmp(&b.joined_at))
                    .then(a.player_id.cmp(&b.player_id))
            })
    }

    // -- Transformations --

    pub fn with_member(&self, member: FactionMember) -> Self {
        Self {
            members: self.members.update(member.player_id, member),
            ..self.clone()
        }
    }

    pub fn without_member(&self, player: &PlayerId) -> Self {
        Self {
            members: self.members.without(player),
            ..self.clone()
        }
    }

    pub fn with_claim(&self, claim: FactionClaim) -> Self {
        Self {
            claims: self.claims.update(claim.chunk.clone(), claim),
            ..self.clone()
        }
    }

    pub fn without_claim(&self, chunk: &ChunkKey) -> Self {
        Self {
            claims: self.claims.without(chunk),
            ..self.clone()
        }
    }

    pub fn with_relation(&self, relation: FactionRelation) -> Self {
        Self {
            relations: self.relations.update(relation.target, relation),
            ..self.clone()
        }
    }

    pub fn without_relation(&self, target: &FactionId) -> Self {
        Self {
            relations: self.relations.without(target),
            ..self.clone()
        }
    }

    /// Prepend a log entry, dropping the oldest beyond [`MAX_LOG_ENTRIES`].
    pub fn with_log(&self, entry: LogEntry) -> Self {
        let mut log = self.log.clone();
        log.push_front(entry);
        if log.len() > MAX_LOG_ENTRIES {
            log.truncate(MAX_LOG_ENTRIES);
        }
        Self {
            log,
            ..self.clone()
        }
    }

    pub fn with_home(&self, home: Option<Location>) -> Self {
        Self {
            home,
            ..self.clone()
        }
    }

    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn with_tag(&self, tag: Option<String>) -> Self {
        Self {
            tag,
            ..self.clone()
        }
    }

    pub fn with_description(&self, description: Option<String>) -> Self {
        Self {
            description,
            ..self.clone()
        }
    }

    pub fn with_color(&self, color: impl Into<String>) -> Self {
        Self {
            color: color.into(),
            ..self.clone()
        }
    }

    pub fn with_open(&self, open: bool) -> Self {
        Self {
            open,
            ..self.clone()
        }
    }

    pub fn with_permission(&self, permission: Permission, role: Role) -> Self {
        let permissions = self
            .permissions
            .clone()
            .unwrap_or_default()
            .update(permission, role);
        Self {
            permissions: Some(permissions),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    fn founded() -> Faction {
        let leader = FactionMember::new(player(1), "alice", Role::Member, day(0));
        Faction::new(faction_id(1), "Alpha", Some("ALP".into()), leader, day(0))
    }

    #[test]
    fn role_levels_and_order() {
        assert_eq!(Role::Member.level(), 1);
        assert_eq!(Role::Officer.level(), 2);
        assert_eq!(Role::Leader.level(), 3);
        assert!(Role::Member < Role::Officer && Role::Officer < Role::Leader);
        assert_eq!(Role::Member.promoted(), Some(Role::Officer));
        assert_eq!(Role::Leader.promoted(), None);
        assert_eq!(Role::Member.demoted(), None);
    }

    #[test]
    fn new_faction_founder_is_leader() {
        let faction = founded();
        assert_eq!(faction.leader().map(|m| m.player_id), Some(player(1)));
        assert_eq!(faction.leader_count(), 1);
    }

    #[test]
    fn transformations_do_not_touch_original() {
        let original = founded();
        let member = FactionMember::new(player(2), "bob", Role::Member, day(1));
        let updated = original.with_member(member);

        assert_eq!(original.member_count(), 1);
        assert_eq!(updated.member_count(), 2);

        let removed = updated.without_member(&player(2));
        assert_eq!(removed.member_count(), 1);
        assert_eq!(updated.member_count(), 2);
    }

    #[test]
    fn single_log_entry_is_kept() {
        let faction = founded().with_log(LogEntry::new(
            day(1),
            Some(player(1)),
            LogKind::Settings,
            "first".to_string(),
        ));
        assert_eq!(faction.log.len(), 1);
        assert_eq!(faction.log.front().map(|e| e.message.as_str()), Some("first"));
    }

    #[test]
    fn log_is_newest_first_and_capped() {
        let mut faction = founded();
        for i in 0..(MAX_LOG_ENTRIES + 5) {
            faction = faction.with_log(LogEntry::new(
                day(0),
                None,
                LogKind::Settings,
                format!("entry {i}"),
            ));
        }
        assert_eq!(faction.log.len(), MAX_LOG_ENTRIES);
        assert_eq!(
            faction.log.front().map(|e| e.message.as_str()),
            Some(format!("entry {}", MAX_LOG_ENTRIES + 4).as_str())
        );
        assert_eq!(
            faction.log.back().map(|e| e.message.as_str()),
            Some("entry 5")
        );
    }

    #[test]
    fn successor_prefers_rank_then_tenure() {
        let faction = founded()
            .with_member(FactionMember::new(player(2), "late_officer", Role::Officer, day(5)))
            .with_member(FactionMember::new(player(3), "early_officer", Role::Officer, day(1)))
            .with_member(FactionMember::new(player(4), "veteran", Role::Member, day(0)));

        let heir = faction.successor(&player(1)).unwrap();
        assert_eq!(heir.player_id, player(3));
    }

    #[test]
    fn successor_none_when_alone() {
        assert!(founded().successor(&player(1)).is_none());
    }

    #[test]
    fn relation_defaults_to_neutral() {
        let faction = founded();
        assert_eq!(faction.relation_to(&faction_id(2)), Relation::Neutral);

        let allied = faction.with_relation(FactionRelation {
            target: faction_id(2),
            kind: RelationKind::Ally,
            since: day(1),
        });
        assert_eq!(allied.relation_to(&faction_id(2)), Relation::Ally);
        assert_eq!(
            allied.without_relation(&faction_id(2)).relation_to(&faction_id(2)),
            Relation::Neutral
        );
    }

    #[test]
    fn permission_overrides() {
        let faction = founded()
            .with_member(FactionMember::new(player(2), "bob", Role::Member, day(1)));
        assert_eq!(faction.required_role(Permission::Claim), Role::Officer);
        assert!(!faction.allows(&player(2), Permission::Claim));

        let relaxed = faction.with_permission(Permission::Claim, Role::Member);
        assert!(relaxed.allows(&player(2), Permission::Claim));
        assert!(!relaxed.allows(&player(9), Permission::Claim));
    }

    #[test]
    fn borders_uses_edges_only() {
        let faction = founded().with_claim(FactionClaim {
            chunk: ChunkKey::new("world", 0, 0),
            claimed_at: day(0),
            claimed_by: player(1),
        });
        assert!(faction.borders(&ChunkKey::new("world", 0, 1)));
        assert!(!faction.borders(&ChunkKey::new("world", 1, 1)));
    }

    #[test]
    fn home_in_chunk() {
        let faction = founded().with_home(Some(Location::new("world", 8.0, 70.0, 8.0)));
        assert!(faction.home_in(&ChunkKey::new("world", 0, 0)));
        assert!(!faction.home_in(&ChunkKey::new("world", 1, 0)));
    }
}
