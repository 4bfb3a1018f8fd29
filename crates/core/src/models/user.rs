//! User model and roles

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, client-asserted user identity
pub type UserId = String;

/// Transport-assigned connection handle
pub type ConnId = Uuid;

/// Role flag carried at registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Authority-capable: may govern rooms (approve/deny/invite)
    Mentor,
    /// Ordinary participant
    #[default]
    Participant,
}

impl Role {
    /// Can this role hold room authority?
    pub fn can_govern(&self) -> bool {
        matches!(self, Role::Mentor)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Mentor => write!(f, "mentor"),
            Role::Participant => write!(f, "participant"),
        }
    }
}

/// A registered (online) user
///
/// An entry exists in the directory only while a connection is bound, so
/// `conn` is always live. Re-registration under the same identity rebinds
/// `conn` (last registration wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub identity: UserId,
    pub display_name: String,
    pub role: Role,
    pub conn: ConnId,
    /// The one room (if any) whose membership set contains this user
    pub current_room: Option<String>,
}

impl User {
    pub fn new(identity: UserId, display_name: String, role: Role, conn: ConnId) -> Self {
        Self {
            identity,
            display_name,
            role,
            conn,
            current_room: None,
        }
    }
}

/// One entry of the presence snapshot broadcast to every client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub identity: UserId,
    pub display_name: String,
    pub role: Role,
    pub online: bool,
}
