//! Membership status and member info

use serde::{Deserialize, Serialize};

use super::UserId;

/// A user's relationship to a room
///
/// Encoded as disjoint set membership on the room: a user is in at most one
/// of the membership, pending, or invitation sets at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Absent,
    Pending,
    Invited,
    Joined,
}

impl std::fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipStatus::Absent => write!(f, "absent"),
            MembershipStatus::Pending => write!(f, "pending"),
            MembershipStatus::Invited => write!(f, "invited"),
            MembershipStatus::Joined => write!(f, "joined"),
        }
    }
}

/// A joined member as listed in participant updates
///
/// Recomputed fresh for every broadcast, never patched incrementally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub identity: UserId,
    pub display_name: String,
}
