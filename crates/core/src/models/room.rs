//! Room model - membership, pending requests, and invitations
//!
//! The three record sets are kept disjoint by construction: every transition
//! that moves a user into one set removes them from the others first.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConnId, MembershipStatus, UserId};

/// Unique room identifier within the registry
pub type RoomId = String;

/// How a room came to exist, and whether it survives emptying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    /// Pre-provisioned at startup; persists when empty
    Primary,
    /// Created by user action; destroyed when its membership empties
    AdHoc,
}

/// Snapshot of a join request, taken when the requester entered `Pending`
///
/// The display name is captured here so the authority can still be shown a
/// meaningful request even if directory state changes underneath.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub display_name: String,
    pub conn: ConnId,
    pub requested_at: DateTime<Utc>,
}

/// A room with its membership state machine records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub kind: RoomKind,
    /// The one user empowered to approve/deny/invite, if any
    pub authority: Option<UserId>,
    members: BTreeSet<UserId>,
    pending: BTreeMap<UserId, JoinRequest>,
    invited: BTreeMap<UserId, UserId>,
}

impl Room {
    pub fn new(id: RoomId, name: String, kind: RoomKind) -> Self {
        Self {
            id,
            name,
            kind,
            authority: None,
            members: BTreeSet::new(),
            pending: BTreeMap::new(),
            invited: BTreeMap::new(),
        }
    }

    /// The user's current state in this room's state machine
    pub fn status(&self, user: &str) -> MembershipStatus {
        if self.members.contains(user) {
            MembershipStatus::Joined
        } else if self.pending.contains_key(user) {
            MembershipStatus::Pending
        } else if self.invited.contains_key(user) {
            MembershipStatus::Invited
        } else {
            MembershipStatus::Absent
        }
    }

    pub fn is_joined(&self, user: &str) -> bool {
        self.members.contains(user)
    }

    pub fn is_authority(&self, user: &str) -> bool {
        self.authority.as_deref() == Some(user)
    }

    pub fn members(&self) -> impl Iterator<Item = &UserId> {
        self.members.iter()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Record a pending join request (`Absent` → `Pending`)
    pub fn add_pending(&mut self, user: UserId, request: JoinRequest) {
        self.invited.remove(&user);
        self.pending.insert(user, request);
    }

    /// Consume the pending record for a user, if one exists
    pub fn take_pending(&mut self, user: &str) -> Option<JoinRequest> {
        self.pending.remove(user)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_users(&self) -> impl Iterator<Item = &UserId> {
        self.pending.keys()
    }

    /// Record an invitation (`Absent` → `Invited`)
    pub fn add_invite(&mut self, invitee: UserId, inviter: UserId) {
        self.pending.remove(&invitee);
        self.invited.insert(invitee, inviter);
    }

    /// The recorded inviter for an invitee, if invited
    pub fn invited_by(&self, invitee: &str) -> Option<&UserId> {
        self.invited.get(invitee)
    }

    /// Consume the invitation record for an invitee, if one exists
    pub fn take_invite(&mut self, invitee: &str) -> Option<UserId> {
        self.invited.remove(invitee)
    }

    pub fn invite_count(&self) -> usize {
        self.invited.len()
    }

    pub fn invited_users(&self) -> impl Iterator<Item = &UserId> {
        self.invited.keys()
    }

    /// Move a user into the membership set, clearing any pending or
    /// invitation record. Returns false if the user was already joined.
    pub fn insert_member(&mut self, user: UserId) -> bool {
        self.pending.remove(&user);
        self.invited.remove(&user);
        self.members.insert(user)
    }

    /// Remove a user from the membership set (`Joined` → `Absent`).
    /// Returns false if the user was not joined.
    pub fn remove_member(&mut self, user: &str) -> bool {
        self.members.remove(user)
    }
}
