//! Event surface: the closed sets of client and server messages
//!
//! Every inbound payload deserializes into exactly one `ClientEvent` variant
//! with a fixed field set; malformed payloads are rejected by serde before
//! they reach state-mutating logic. Connection-setup payloads (SDP, ICE
//! candidate bodies) are opaque JSON values relayed verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{MemberInfo, MembershipStatus, PresenceEntry, Role, RoomId, UserId};

/// The kind of a relayed connection-setup message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    EndOfSession,
}

/// Events a client may send
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Register {
        identity: UserId,
        display_name: String,
        #[serde(default)]
        role: Role,
    },
    CreateRoom {
        display_name: String,
    },
    RequestJoin {
        room_id: RoomId,
    },
    Invite {
        room_id: RoomId,
        target: UserId,
    },
    AcceptInvitation {
        room_id: RoomId,
        inviter: UserId,
    },
    Approve {
        room_id: RoomId,
        target: UserId,
    },
    Deny {
        room_id: RoomId,
        target: UserId,
    },
    Leave {
        room_id: RoomId,
    },
    ReadyForRelay {
        room_id: RoomId,
    },
    Offer {
        target: UserId,
        room_id: RoomId,
        payload: Value,
    },
    Answer {
        target: UserId,
        room_id: RoomId,
        payload: Value,
    },
    IceCandidate {
        target: UserId,
        room_id: RoomId,
        payload: Value,
    },
    EndOfSession {
        target: UserId,
        room_id: RoomId,
        payload: Value,
    },
    Chat {
        room_id: RoomId,
        text: String,
    },
}

/// Events the server may send
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Registration accepted
    Registered {
        identity: UserId,
    },
    /// A request was rejected; no state changed
    Error {
        message: String,
    },
    /// Full snapshot of who is online; an authoritative replacement
    Presence {
        users: Vec<PresenceEntry>,
    },
    /// An ad-hoc room was created
    RoomCreated {
        room_id: RoomId,
        display_name: String,
    },
    /// Sent to a room's authority when someone requests to join
    JoinRequested {
        room_id: RoomId,
        identity: UserId,
        display_name: String,
    },
    /// Sent to an invitee when the room authority invites them
    Invited {
        room_id: RoomId,
        room_name: String,
        inviter: UserId,
    },
    /// The recipient's own membership status in a room changed
    JoinStatus {
        room_id: RoomId,
        status: MembershipStatus,
    },
    /// The recipient's join request was denied
    JoinDenied {
        room_id: RoomId,
    },
    /// Room-scoped participant update: the full joined-member list
    Participants {
        room_id: RoomId,
        members: Vec<MemberInfo>,
    },
    /// A member left the room
    ParticipantLeft {
        room_id: RoomId,
        identity: UserId,
        display_name: String,
    },
    /// Open a direct peer session with the named member
    InitiatePeer {
        room_id: RoomId,
        identity: UserId,
    },
    /// A relayed connection-setup message, forwarded verbatim
    Signal {
        kind: SignalKind,
        sender: UserId,
        room_id: RoomId,
        payload: Value,
    },
    /// Chat delivered to joined members, sender stamped by the server
    Chat {
        room_id: RoomId,
        sender: UserId,
        display_name: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
}
