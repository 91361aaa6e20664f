use crate::faction::Role;
use crate::id::FactionId;

/// Expected business outcomes of registry operations that leave state untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FactionError {
    #[error("player is already in a faction")]
    AlreadyInFaction,
    #[error("player is not in a faction")]
    NotInFaction,
    #[error("faction name must be at least {min} characters")]
    NameTooShort { min: usize },
    #[error("faction name must be at most {max} characters")]
    NameTooLong { max: usize },
    #[error("faction name is already taken")]
    NameTaken,
    #[error("tag must be 1-5 alphanumeric characters")]
    InvalidTag,
    #[error("tag is already taken")]
    TagTaken,
    #[error("faction is full")]
    FactionFull,
    #[error("faction is not open")]
    FactionClosed,
    #[error("only the leader can do that")]
    NotLeader,
    #[error("requires rank {required:?} or higher")]
    InsufficientRole { required: Role },
    #[error("cannot promote the leader")]
    CannotPromoteLeader,
    #[error("cannot demote a member")]
    CannotDemoteMember,
    #[error("cannot demote the leader; transfer leadership instead")]
    CannotDemoteLeader,
    #[error("cannot act on a member of equal or higher rank")]
    OutrankedTarget,
    #[error("cannot target yourself")]
    CannotTargetSelf,
    #[error("target is not in your faction")]
    TargetNotInFaction,
    #[error("faction not found")]
    FactionNotFound,
    #[error("home must be inside your territory")]
    HomeNotInTerritory,
    #[error("a faction must have exactly one leader")]
    InvalidLeadership,
    #[error("player {0} is already a member of faction {1}")]
    MemberConflict(crate::id::PlayerId, FactionId),
}
