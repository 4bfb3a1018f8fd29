//! The hub: directory, session registry, and access-control state machine
//!
//! One explicitly-owned store object holds all signaling state. Every inbound
//! event first resolves the sender's identity, then mutates state and fans
//! out notifications through the [`Outbox`]. Callers must serialize access
//! (the transport layer holds the hub behind a single mutex), which makes
//! every transition atomic with respect to the shared state.

use std::collections::HashMap;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info};

use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::events::{ClientEvent, ServerEvent, SignalKind};
use crate::models::{
    ConnId, JoinRequest, MemberInfo, MembershipStatus, Role, Room, RoomId, RoomKind, User, UserId,
};

/// Length of generated ad-hoc room identifiers
const ROOM_ID_LEN: usize = 8;

/// Fire-and-forget delivery of a server event to a named connection.
///
/// Implementations must not block: delivery stalls must never reach the
/// state-mutation path. A send to a gone or saturated connection is dropped.
pub trait Outbox {
    fn send(&self, conn: ConnId, event: ServerEvent);
}

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Identifier of the pre-provisioned primary room
    pub primary_room_id: RoomId,
    /// Display name of the primary room
    pub primary_room_name: String,
    /// Maximum joined members per room
    pub max_room_members: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            primary_room_id: "lobby".to_string(),
            primary_room_name: "Lobby".to_string(),
            max_room_members: 32,
        }
    }
}

/// Signaling state and the operations over it
pub struct Hub<O: Outbox> {
    config: HubConfig,
    outbox: O,
    directory: Directory,
    rooms: HashMap<RoomId, Room>,
    /// Side table binding transport connections to identities; the only
    /// per-connection state the hub keeps.
    conn_users: HashMap<ConnId, UserId>,
}

impl<O: Outbox> Hub<O> {
    /// Create a hub with the primary room pre-provisioned.
    pub fn new(config: HubConfig, outbox: O) -> Self {
        let mut rooms = HashMap::new();
        rooms.insert(
            config.primary_room_id.clone(),
            Room::new(
                config.primary_room_id.clone(),
                config.primary_room_name.clone(),
                RoomKind::Primary,
            ),
        );
        info!(room = %config.primary_room_id, "Provisioned primary room");
        Self {
            config,
            outbox,
            directory: Directory::new(),
            rooms,
            conn_users: HashMap::new(),
        }
    }

    /// Dispatch one inbound event. Rejections are reported to the sender as
    /// an `Error` event; relay target-not-found stays silent.
    pub fn handle(&mut self, conn: ConnId, event: ClientEvent) {
        let result = match event {
            ClientEvent::Register {
                identity,
                display_name,
                role,
            } => self.register(conn, identity, display_name, role),
            ClientEvent::CreateRoom { display_name } => self.create_room(conn, display_name),
            ClientEvent::RequestJoin { room_id } => self.request_join(conn, room_id),
            ClientEvent::Invite { room_id, target } => self.invite(conn, room_id, target),
            ClientEvent::AcceptInvitation { room_id, inviter } => {
                self.accept_invitation(conn, room_id, inviter)
            }
            ClientEvent::Approve { room_id, target } => self.approve(conn, room_id, target),
            ClientEvent::Deny { room_id, target } => self.deny(conn, room_id, target),
            ClientEvent::Leave { room_id } => self.leave(conn, room_id),
            ClientEvent::ReadyForRelay { room_id } => self.ready_for_relay(conn, room_id),
            ClientEvent::Chat { room_id, text } => self.chat(conn, room_id, text),
            ClientEvent::Offer { target, room_id, payload } => {
                self.relay(conn, SignalKind::Offer, target, room_id, payload)
            }
            ClientEvent::Answer { target, room_id, payload } => {
                self.relay(conn, SignalKind::Answer, target, room_id, payload)
            }
            ClientEvent::IceCandidate { target, room_id, payload } => {
                self.relay(conn, SignalKind::IceCandidate, target, room_id, payload)
            }
            ClientEvent::EndOfSession { target, room_id, payload } => {
                self.relay(conn, SignalKind::EndOfSession, target, room_id, payload)
            }
        };

        if let Err(e) = result {
            debug!(conn = %conn, error = %e, "Rejected event");
            self.outbox.send(
                conn,
                ServerEvent::Error {
                    message: e.to_string(),
                },
            );
        }
    }

    /// Connection lifecycle: transport signalled that `conn` is gone.
    ///
    /// Room cleanup runs before `unregister` so the leave notices can still
    /// resolve the leaving user's display name. A superseded connection only
    /// drops its side-table entry; the successor's state is untouched.
    pub fn disconnect(&mut self, conn: ConnId) {
        let Some(identity) = self.conn_users.remove(&conn) else {
            debug!(conn = %conn, "Disconnect from unregistered connection");
            return;
        };

        match self.directory.get(&identity) {
            Some(user) if user.conn == conn => {}
            _ => {
                debug!(conn = %conn, identity = %identity, "Disconnect from superseded connection");
                return;
            }
        }

        self.unbind(&identity);
        self.publish_presence();
        info!(conn = %conn, identity = %identity, "Connection closed");
    }

    /// Tear down an identity's registration: leave its joined room, release
    /// any held authority, then remove the directory entry. Room cleanup runs
    /// first so the leave notices can still resolve the display name.
    fn unbind(&mut self, identity: &str) {
        if let Some(room_id) = self.directory.get(identity).and_then(|u| u.current_room.clone()) {
            if let Err(e) = self.leave_room(&room_id, identity) {
                debug!(room = %room_id, identity = %identity, error = %e, "Leave on unbind failed");
            }
        }

        // Authority must always refer to a registered user
        for room in self.rooms.values_mut() {
            if room.is_authority(identity) {
                room.authority = None;
                info!(room = %room.id, identity = %identity, "Cleared room authority on unbind");
            }
        }

        self.directory.unregister(identity);
    }

    // ── Directory ───────────────────────────────────────────────

    fn register(
        &mut self,
        conn: ConnId,
        identity: UserId,
        display_name: String,
        role: Role,
    ) -> Result<()> {
        if identity.trim().is_empty() {
            return Err(Error::Validation("identity is required".into()));
        }
        if display_name.trim().is_empty() {
            return Err(Error::Validation("display name is required".into()));
        }

        // A connection re-registering under a new identity releases the old
        // one first, as if it had disconnected
        if let Some(existing) = self.conn_users.get(&conn).cloned() {
            if existing != identity
                && self.directory.get(&existing).is_some_and(|u| u.conn == conn)
            {
                info!(conn = %conn, identity = %existing, "Released prior identity");
                self.unbind(&existing);
            }
        }

        let prior = self
            .directory
            .register(User::new(identity.clone(), display_name, role, conn));
        self.conn_users.insert(conn, identity.clone());

        // Re-registration rebinds the connection; room membership persists.
        // Only a binding held by a different connection is superseded: a
        // same-connection refresh must keep its own side-table entry.
        if let Some(prior) = prior {
            if prior.conn != conn {
                self.conn_users.remove(&prior.conn);
            }
            if let Some(user) = self.directory.get_mut(&identity) {
                user.current_room = prior.current_room;
            }
        }

        // A role downgrade forfeits any held authority
        if !role.can_govern() {
            for room in self.rooms.values_mut() {
                if room.is_authority(&identity) {
                    room.authority = None;
                }
            }
        }

        // The first authority-capable user to register governs the primary room
        if role.can_govern() {
            if let Some(primary) = self.rooms.get_mut(&self.config.primary_room_id) {
                if primary.authority.is_none() {
                    primary.authority = Some(identity.clone());
                    info!(room = %primary.id, identity = %identity, "Assigned primary room authority");
                }
            }
        }

        info!(conn = %conn, identity = %identity, role = %role, "Registered");
        self.outbox.send(
            conn,
            ServerEvent::Registered {
                identity: identity.clone(),
            },
        );
        self.publish_presence();
        Ok(())
    }

    // ── Session registry ────────────────────────────────────────

    fn create_room(&mut self, conn: ConnId, display_name: String) -> Result<()> {
        let creator = self.sender_identity(conn)?;
        if display_name.trim().is_empty() {
            return Err(Error::Validation("room name is required".into()));
        }

        let room_id = self.generate_room_id();
        let mut room = Room::new(room_id.clone(), display_name.clone(), RoomKind::AdHoc);

        // A mentor-created room is governed by its creator; otherwise open join
        let role = self.directory.get(&creator).map(|u| u.role);
        if role.is_some_and(|r| r.can_govern()) {
            room.authority = Some(creator.clone());
        }
        self.rooms.insert(room_id.clone(), room);
        info!(room = %room_id, creator = %creator, "Created ad-hoc room");

        self.outbox.send(
            conn,
            ServerEvent::RoomCreated {
                room_id: room_id.clone(),
                display_name,
            },
        );

        // The creator enters immediately; an ad-hoc room must never be born
        // empty, so a failed admit removes the room again
        if let Err(e) = self.admit(&room_id, &creator) {
            self.rooms.remove(&room_id);
            return Err(e);
        }
        Ok(())
    }

    // ── Access controller ───────────────────────────────────────

    fn request_join(&mut self, conn: ConnId, room_id: RoomId) -> Result<()> {
        let identity = self.sender_identity(conn)?;
        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| Error::NotFound(format!("unknown room {room_id}")))?;

        if room.status(&identity) != MembershipStatus::Absent {
            return Err(Error::Validation("already a member or pending".into()));
        }

        match room.authority.clone() {
            // The authority does not gate their own entry
            Some(authority) if authority != identity => {
                let display_name = self
                    .directory
                    .get(&identity)
                    .map(|u| u.display_name.clone())
                    .unwrap_or_default();
                room.add_pending(
                    identity.clone(),
                    JoinRequest {
                        display_name: display_name.clone(),
                        conn,
                        requested_at: Utc::now(),
                    },
                );
                info!(room = %room_id, identity = %identity, "Join request pending");
                self.send_to_user(
                    &authority,
                    ServerEvent::JoinRequested {
                        room_id,
                        identity,
                        display_name,
                    },
                );
                Ok(())
            }
            _ => self.admit(&room_id, &identity),
        }
    }

    fn invite(&mut self, conn: ConnId, room_id: RoomId, target: UserId) -> Result<()> {
        let inviter = self.sender_identity(conn)?;
        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| Error::NotFound(format!("unknown room {room_id}")))?;

        if !room.is_authority(&inviter) {
            return Err(Error::NotPermitted("not the room authority".into()));
        }
        if room.status(&target) != MembershipStatus::Absent {
            return Err(Error::Validation("already a member or pending".into()));
        }

        room.add_invite(target.clone(), inviter.clone());
        let room_name = room.name.clone();
        info!(room = %room_id, target = %target, inviter = %inviter, "Invited");
        self.send_to_user(
            &target,
            ServerEvent::Invited {
                room_id,
                room_name,
                inviter,
            },
        );
        Ok(())
    }

    fn accept_invitation(&mut self, conn: ConnId, room_id: RoomId, inviter: UserId) -> Result<()> {
        let identity = self.sender_identity(conn)?;
        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| Error::NotFound(format!("unknown room {room_id}")))?;

        // Only the recorded inviter may be claimed; stale or duplicate
        // invites fail and leave the record untouched.
        match room.invited_by(&identity) {
            Some(recorded) if *recorded == inviter => {
                room.take_invite(&identity);
                self.admit(&room_id, &identity)
            }
            _ => Err(Error::NotFound("invalid or expired invitation".into())),
        }
    }

    fn approve(&mut self, conn: ConnId, room_id: RoomId, target: UserId) -> Result<()> {
        let authority = self.sender_identity(conn)?;
        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| Error::NotFound(format!("unknown room {room_id}")))?;

        if !room.is_authority(&authority) {
            return Err(Error::NotPermitted("not the room authority".into()));
        }
        // Existence of the pending record gates validity: whichever of
        // approve/deny lands first consumes it and the other fails.
        room.take_pending(&target)
            .ok_or_else(|| Error::NotFound("no such request".into()))?;

        if !self.directory.contains(&target) {
            return Err(Error::NotFound("requester is no longer online".into()));
        }
        info!(room = %room_id, target = %target, "Join request approved");
        self.admit(&room_id, &target)
    }

    fn deny(&mut self, conn: ConnId, room_id: RoomId, target: UserId) -> Result<()> {
        let authority = self.sender_identity(conn)?;
        let room = self
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| Error::NotFound(format!("unknown room {room_id}")))?;

        if !room.is_authority(&authority) {
            return Err(Error::NotPermitted("not the room authority".into()));
        }
        room.take_pending(&target)
            .ok_or_else(|| Error::NotFound("no such request".into()))?;

        info!(room = %room_id, target = %target, "Join request denied");
        self.send_to_user(&target, ServerEvent::JoinDenied { room_id });
        Ok(())
    }

    fn leave(&mut self, conn: ConnId, room_id: RoomId) -> Result<()> {
        let identity = self.sender_identity(conn)?;
        self.leave_room(&room_id, &identity)
    }

    /// Shared joining path: idempotent for already-joined users, enforces
    /// capacity, then broadcasts a fresh participant list and notifies the
    /// newcomer of their status.
    fn admit(&mut self, room_id: &str, identity: &str) -> Result<()> {
        {
            let room = self
                .rooms
                .get(room_id)
                .ok_or_else(|| Error::NotFound(format!("unknown room {room_id}")))?;
            if room.is_joined(identity) {
                return Ok(());
            }
            if room.member_count() >= self.config.max_room_members {
                return Err(Error::RoomFull);
            }
        }

        // Single-room model: entering a room leaves the previous one
        if let Some(prev) = self
            .directory
            .get(identity)
            .and_then(|u| u.current_room.clone())
        {
            if let Err(e) = self.leave_room(&prev, identity) {
                debug!(room = %prev, identity = %identity, error = %e, "Leave of previous room failed");
            }
        }

        if let Some(room) = self.rooms.get_mut(room_id) {
            room.insert_member(identity.to_string());
        }
        if let Some(user) = self.directory.get_mut(identity) {
            user.current_room = Some(room_id.to_string());
        }
        info!(room = %room_id, identity = %identity, "Joined");

        self.broadcast_participants(room_id);
        self.send_to_user(
            identity,
            ServerEvent::JoinStatus {
                room_id: room_id.to_string(),
                status: MembershipStatus::Joined,
            },
        );
        Ok(())
    }

    fn leave_room(&mut self, room_id: &str, identity: &str) -> Result<()> {
        let (was_authority, destroyed) = {
            let room = self
                .rooms
                .get_mut(room_id)
                .ok_or_else(|| Error::NotFound(format!("unknown room {room_id}")))?;
            if !room.remove_member(identity) {
                return Err(Error::Validation("not a member of this room".into()));
            }
            let was_authority = room.is_authority(identity);
            if was_authority {
                // No automatic succession; the room stays ungoverned
                room.authority = None;
            }
            (was_authority, room.kind == RoomKind::AdHoc && room.is_empty())
        };

        // Display name resolved before any directory removal (disconnect
        // cleanup relies on this ordering).
        let display_name = self
            .directory
            .get(identity)
            .map(|u| u.display_name.clone())
            .unwrap_or_default();
        if let Some(user) = self.directory.get_mut(identity) {
            user.current_room = None;
        }

        self.send_to_user(
            identity,
            ServerEvent::JoinStatus {
                room_id: room_id.to_string(),
                status: MembershipStatus::Absent,
            },
        );

        if destroyed {
            self.rooms.remove(room_id);
            info!(room = %room_id, "Destroyed empty ad-hoc room");
        } else {
            self.broadcast_participants(room_id);
            self.broadcast_room(
                room_id,
                ServerEvent::ParticipantLeft {
                    room_id: room_id.to_string(),
                    identity: identity.to_string(),
                    display_name,
                },
            );
        }
        if was_authority {
            info!(room = %room_id, identity = %identity, "Cleared room authority on leave");
        }
        info!(room = %room_id, identity = %identity, "Left");
        Ok(())
    }

    /// Full-mesh introduction: every existing member and the newcomer each
    /// get a directed notice naming the other, so each pair negotiates a
    /// direct peer session.
    fn ready_for_relay(&mut self, conn: ConnId, room_id: RoomId) -> Result<()> {
        let identity = self.sender_identity(conn)?;
        let room = self
            .rooms
            .get(&room_id)
            .ok_or_else(|| Error::NotFound(format!("unknown room {room_id}")))?;
        if !room.is_joined(&identity) {
            return Err(Error::NotPermitted("not a member of this room".into()));
        }

        let others: Vec<UserId> = room
            .members()
            .filter(|m| *m != &identity)
            .cloned()
            .collect();
        for other in others {
            self.send_to_user(
                &other,
                ServerEvent::InitiatePeer {
                    room_id: room_id.clone(),
                    identity: identity.clone(),
                },
            );
            self.send_to_user(
                &identity,
                ServerEvent::InitiatePeer {
                    room_id: room_id.clone(),
                    identity: other,
                },
            );
        }
        Ok(())
    }

    // ── Relay ───────────────────────────────────────────────────

    /// Stateless forwarding. The payload is never parsed; an offline target
    /// means the message is silently dropped (connection-setup protocols
    /// retry at a higher layer).
    fn relay(
        &mut self,
        conn: ConnId,
        kind: SignalKind,
        target: UserId,
        room_id: RoomId,
        payload: Value,
    ) -> Result<()> {
        let sender = self.sender_identity(conn)?;
        match self.directory.resolve(&target) {
            Some(target_conn) => self.outbox.send(
                target_conn,
                ServerEvent::Signal {
                    kind,
                    sender,
                    room_id,
                    payload,
                },
            ),
            None => debug!(target = %target, "Relay target offline; dropped"),
        }
        Ok(())
    }

    // ── Chat ────────────────────────────────────────────────────

    fn chat(&mut self, conn: ConnId, room_id: RoomId, text: String) -> Result<()> {
        let sender = self.sender_identity(conn)?;
        if text.is_empty() {
            return Err(Error::Validation("message text is required".into()));
        }
        let room = self
            .rooms
            .get(&room_id)
            .ok_or_else(|| Error::NotFound(format!("unknown room {room_id}")))?;
        if !room.is_joined(&sender) {
            return Err(Error::NotPermitted("not a member of this room".into()));
        }

        let display_name = self
            .directory
            .get(&sender)
            .map(|u| u.display_name.clone())
            .unwrap_or_default();
        self.broadcast_room(
            &room_id,
            ServerEvent::Chat {
                room_id: room_id.clone(),
                sender,
                display_name,
                text,
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    // ── Presence publisher ──────────────────────────────────────

    /// Broadcast a full directory snapshot to every registered connection.
    fn publish_presence(&self) {
        let users = self.directory.snapshot();
        for user in self.directory.iter() {
            self.outbox.send(
                user.conn,
                ServerEvent::Presence {
                    users: users.clone(),
                },
            );
        }
    }

    // ── Helpers ─────────────────────────────────────────────────

    /// Resolve the sender's identity. A connection that was superseded by a
    /// later registration can no longer act for the identity.
    fn sender_identity(&self, conn: ConnId) -> Result<UserId> {
        let identity = self
            .conn_users
            .get(&conn)
            .ok_or_else(|| Error::Validation("not registered".into()))?;
        match self.directory.get(identity) {
            Some(user) if user.conn == conn => Ok(identity.clone()),
            _ => Err(Error::Validation("not registered".into())),
        }
    }

    fn send_to_user(&self, identity: &str, event: ServerEvent) {
        match self.directory.resolve(identity) {
            Some(conn) => self.outbox.send(conn, event),
            None => debug!(identity = %identity, "Notification target offline; dropped"),
        }
    }

    fn broadcast_room(&self, room_id: &str, event: ServerEvent) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        for member in room.members() {
            self.send_to_user(member, event.clone());
        }
    }

    /// Room-scoped participant update, recomputed fresh each time.
    fn broadcast_participants(&self, room_id: &str) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };
        let members: Vec<MemberInfo> = room
            .members()
            .filter_map(|m| self.directory.get(m))
            .map(|u| MemberInfo {
                identity: u.identity.clone(),
                display_name: u.display_name.clone(),
            })
            .collect();
        self.broadcast_room(
            room_id,
            ServerEvent::Participants {
                room_id: room_id.to_string(),
                members,
            },
        );
    }

    fn generate_room_id(&self) -> RoomId {
        loop {
            let id: String = rand::thread_rng()
                .sample_iter(&rand::distributions::Alphanumeric)
                .take(ROOM_ID_LEN)
                .map(|b| (b as char).to_ascii_lowercase())
                .collect();
            if !self.rooms.contains_key(&id) {
                return id;
            }
        }
    }

    // ── Accessors (used by the transport layer and tests) ───────

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants;
    use std::cell::RefCell;
    use std::rc::Rc;
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct RecordingOutbox {
        sent: Rc<RefCell<Vec<(ConnId, ServerEvent)>>>,
    }

    impl Outbox for RecordingOutbox {
        fn send(&self, conn: ConnId, event: ServerEvent) {
            self.sent.borrow_mut().push((conn, event));
        }
    }

    impl RecordingOutbox {
        fn events_for(&self, conn: ConnId) -> Vec<ServerEvent> {
            self.sent
                .borrow()
                .iter()
                .filter(|(c, _)| *c == conn)
                .map(|(_, e)| e.clone())
                .collect()
        }

        fn clear(&self) {
            self.sent.borrow_mut().clear();
        }
    }

    fn hub() -> (Hub<RecordingOutbox>, RecordingOutbox) {
        let outbox = RecordingOutbox::default();
        (Hub::new(HubConfig::default(), outbox.clone()), outbox)
    }

    fn register(hub: &mut Hub<RecordingOutbox>, identity: &str, role: Role) -> ConnId {
        let conn = Uuid::new_v4();
        hub.handle(
            conn,
            ClientEvent::Register {
                identity: identity.to_string(),
                display_name: identity.to_uppercase(),
                role,
            },
        );
        conn
    }

    fn check_invariants(hub: &Hub<RecordingOutbox>) {
        let rooms: Vec<&Room> = hub.rooms().collect();
        for room in &rooms {
            invariants::assert_room_records_disjoint(room);
            invariants::assert_members_connected(room, hub.directory());
            invariants::assert_authority_valid(room, hub.directory());
        }
        invariants::assert_current_room_consistent(hub.directory(), &rooms);
    }

    fn last_participants(events: &[ServerEvent]) -> Vec<String> {
        events
            .iter()
            .rev()
            .find_map(|e| match e {
                ServerEvent::Participants { members, .. } => {
                    Some(members.iter().map(|m| m.identity.clone()).collect())
                }
                _ => None,
            })
            .expect("no participant update received")
    }

    #[test]
    fn test_register_requires_fields() {
        let (mut hub, outbox) = hub();
        let conn = Uuid::new_v4();
        hub.handle(
            conn,
            ClientEvent::Register {
                identity: "".into(),
                display_name: "Alice".into(),
                role: Role::Participant,
            },
        );
        assert!(matches!(
            outbox.events_for(conn).as_slice(),
            [ServerEvent::Error { .. }]
        ));
        assert!(hub.directory().is_empty());
    }

    #[test]
    fn test_first_mentor_governs_primary_room() {
        let (mut hub, _outbox) = hub();
        register(&mut hub, "bob", Role::Participant);
        assert_eq!(hub.room("lobby").unwrap().authority, None);

        register(&mut hub, "alice", Role::Mentor);
        register(&mut hub, "carol", Role::Mentor);
        assert_eq!(
            hub.room("lobby").unwrap().authority,
            Some("alice".to_string())
        );
        check_invariants(&hub);
    }

    #[test]
    fn test_request_join_approve_scenario() {
        let (mut hub, outbox) = hub();
        let alice = register(&mut hub, "alice", Role::Mentor);
        let bob = register(&mut hub, "bob", Role::Participant);

        // The authority enters directly
        hub.handle(alice, ClientEvent::RequestJoin { room_id: "lobby".into() });
        assert_eq!(
            hub.room("lobby").unwrap().status("alice"),
            MembershipStatus::Joined
        );

        hub.handle(bob, ClientEvent::RequestJoin { room_id: "lobby".into() });
        assert_eq!(
            hub.room("lobby").unwrap().status("bob"),
            MembershipStatus::Pending
        );
        assert!(outbox.events_for(alice).iter().any(|e| matches!(
            e,
            ServerEvent::JoinRequested { identity, display_name, .. }
                if identity == "bob" && display_name == "BOB"
        )));

        outbox.clear();
        hub.handle(
            alice,
            ClientEvent::Approve { room_id: "lobby".into(), target: "bob".into() },
        );
        assert_eq!(
            hub.room("lobby").unwrap().status("bob"),
            MembershipStatus::Joined
        );
        assert_eq!(last_participants(&outbox.events_for(alice)), vec!["alice", "bob"]);
        assert_eq!(last_participants(&outbox.events_for(bob)), vec!["alice", "bob"]);
        assert!(outbox.events_for(bob).iter().any(|e| matches!(
            e,
            ServerEvent::JoinStatus { status: MembershipStatus::Joined, .. }
        )));
        check_invariants(&hub);
    }

    #[test]
    fn test_request_join_rejected_unless_absent() {
        let (mut hub, outbox) = hub();
        register(&mut hub, "alice", Role::Mentor);
        let bob = register(&mut hub, "bob", Role::Participant);

        hub.handle(bob, ClientEvent::RequestJoin { room_id: "lobby".into() });
        outbox.clear();
        hub.handle(bob, ClientEvent::RequestJoin { room_id: "lobby".into() });
        assert!(outbox.events_for(bob).iter().any(|e| matches!(
            e,
            ServerEvent::Error { message } if message.contains("already a member or pending")
        )));
        check_invariants(&hub);
    }

    #[test]
    fn test_invitation_flow() {
        let (mut hub, outbox) = hub();
        let alice = register(&mut hub, "alice", Role::Mentor);
        let carol = register(&mut hub, "carol", Role::Participant);

        hub.handle(
            alice,
            ClientEvent::Invite { room_id: "lobby".into(), target: "carol".into() },
        );
        assert_eq!(
            hub.room("lobby").unwrap().status("carol"),
            MembershipStatus::Invited
        );
        assert!(outbox.events_for(carol).iter().any(|e| matches!(
            e,
            ServerEvent::Invited { inviter, .. } if inviter == "alice"
        )));

        // Mismatched inviter fails and leaves the record in place
        outbox.clear();
        hub.handle(
            carol,
            ClientEvent::AcceptInvitation { room_id: "lobby".into(), inviter: "mallory".into() },
        );
        assert!(outbox.events_for(carol).iter().any(|e| matches!(
            e,
            ServerEvent::Error { message } if message.contains("invalid or expired")
        )));
        assert_eq!(
            hub.room("lobby").unwrap().status("carol"),
            MembershipStatus::Invited
        );

        // Correct inviter joins without ever entering Pending
        hub.handle(
            carol,
            ClientEvent::AcceptInvitation { room_id: "lobby".into(), inviter: "alice".into() },
        );
        assert_eq!(
            hub.room("lobby").unwrap().status("carol"),
            MembershipStatus::Joined
        );
        check_invariants(&hub);
    }

    #[test]
    fn test_invite_requires_authority() {
        let (mut hub, outbox) = hub();
        register(&mut hub, "alice", Role::Mentor);
        let bob = register(&mut hub, "bob", Role::Participant);
        let carol = register(&mut hub, "carol", Role::Participant);

        hub.handle(
            bob,
            ClientEvent::Invite { room_id: "lobby".into(), target: "carol".into() },
        );
        assert!(outbox.events_for(bob).iter().any(|e| matches!(
            e,
            ServerEvent::Error { message } if message.contains("not permitted")
        )));
        assert_eq!(
            hub.room("lobby").unwrap().status("carol"),
            MembershipStatus::Absent
        );
        assert!(outbox.events_for(carol).is_empty() || {
            // carol only ever saw presence broadcasts
            outbox
                .events_for(carol)
                .iter()
                .all(|e| matches!(e, ServerEvent::Presence { .. } | ServerEvent::Registered { .. }))
        });
    }

    #[test]
    fn test_approve_after_deny_fails_without_mutation() {
        let (mut hub, outbox) = hub();
        let alice = register(&mut hub, "alice", Role::Mentor);
        let bob = register(&mut hub, "bob", Role::Participant);

        hub.handle(bob, ClientEvent::RequestJoin { room_id: "lobby".into() });
        hub.handle(
            alice,
            ClientEvent::Deny { room_id: "lobby".into(), target: "bob".into() },
        );
        assert!(outbox.events_for(bob).iter().any(|e| matches!(
            e,
            ServerEvent::JoinDenied { .. }
        )));
        assert_eq!(
            hub.room("lobby").unwrap().status("bob"),
            MembershipStatus::Absent
        );

        // The pending record was consumed; a late approve finds nothing
        outbox.clear();
        hub.handle(
            alice,
            ClientEvent::Approve { room_id: "lobby".into(), target: "bob".into() },
        );
        assert!(outbox.events_for(alice).iter().any(|e| matches!(
            e,
            ServerEvent::Error { message } if message.contains("no such request")
        )));
        assert_eq!(
            hub.room("lobby").unwrap().status("bob"),
            MembershipStatus::Absent
        );
        check_invariants(&hub);
    }

    #[test]
    fn test_admit_is_idempotent() {
        let (mut hub, outbox) = hub();
        register(&mut hub, "alice", Role::Participant);
        outbox.clear();

        hub.admit("lobby", "alice").unwrap();
        let first = outbox.sent.borrow().len();
        hub.admit("lobby", "alice").unwrap();
        assert_eq!(outbox.sent.borrow().len(), first, "repeat admit broadcast");
        assert_eq!(hub.room("lobby").unwrap().member_count(), 1);
        check_invariants(&hub);
    }

    #[test]
    fn test_adhoc_destroyed_on_empty_primary_survives() {
        let (mut hub, outbox) = hub();
        let bob = register(&mut hub, "bob", Role::Participant);

        hub.handle(bob, ClientEvent::CreateRoom { display_name: "Study".into() });
        let room_id = outbox
            .events_for(bob)
            .iter()
            .find_map(|e| match e {
                ServerEvent::RoomCreated { room_id, .. } => Some(room_id.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            hub.room(&room_id).unwrap().status("bob"),
            MembershipStatus::Joined
        );

        hub.handle(bob, ClientEvent::Leave { room_id: room_id.clone() });
        assert!(hub.room(&room_id).is_none(), "ad-hoc room not destroyed");

        // The primary room survives emptying
        hub.handle(bob, ClientEvent::RequestJoin { room_id: "lobby".into() });
        hub.handle(bob, ClientEvent::Leave { room_id: "lobby".into() });
        assert!(hub.room("lobby").is_some());
        check_invariants(&hub);
    }

    #[test]
    fn test_joining_second_room_leaves_first() {
        let (mut hub, outbox) = hub();
        let bob = register(&mut hub, "bob", Role::Participant);
        hub.handle(bob, ClientEvent::RequestJoin { room_id: "lobby".into() });

        hub.handle(bob, ClientEvent::CreateRoom { display_name: "Study".into() });
        let room_id = outbox
            .events_for(bob)
            .iter()
            .find_map(|e| match e {
                ServerEvent::RoomCreated { room_id, .. } => Some(room_id.clone()),
                _ => None,
            })
            .unwrap();

        assert_eq!(
            hub.room("lobby").unwrap().status("bob"),
            MembershipStatus::Absent
        );
        assert_eq!(
            hub.room(&room_id).unwrap().status("bob"),
            MembershipStatus::Joined
        );
        assert_eq!(
            hub.directory().get("bob").unwrap().current_room.as_deref(),
            Some(room_id.as_str())
        );
        check_invariants(&hub);
    }

    #[test]
    fn test_mentor_created_room_is_governed() {
        let (mut hub, outbox) = hub();
        let alice = register(&mut hub, "alice", Role::Mentor);

        hub.handle(alice, ClientEvent::CreateRoom { display_name: "Clinic".into() });
        let room_id = outbox
            .events_for(alice)
            .iter()
            .find_map(|e| match e {
                ServerEvent::RoomCreated { room_id, .. } => Some(room_id.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            hub.room(&room_id).unwrap().authority,
            Some("alice".to_string())
        );
        check_invariants(&hub);
    }

    #[test]
    fn test_room_capacity_enforced() {
        let outbox = RecordingOutbox::default();
        let config = HubConfig {
            max_room_members: 1,
            ..HubConfig::default()
        };
        let mut hub = Hub::new(config, outbox.clone());
        let alice = register(&mut hub, "alice", Role::Participant);
        let bob = register(&mut hub, "bob", Role::Participant);

        hub.handle(alice, ClientEvent::RequestJoin { room_id: "lobby".into() });
        hub.handle(bob, ClientEvent::RequestJoin { room_id: "lobby".into() });
        assert!(outbox.events_for(bob).iter().any(|e| matches!(
            e,
            ServerEvent::Error { message } if message.contains("full")
        )));
        assert_eq!(
            hub.room("lobby").unwrap().status("bob"),
            MembershipStatus::Absent
        );
        check_invariants(&hub);
    }

    #[test]
    fn test_create_room_rolled_back_when_admit_fails() {
        let outbox = RecordingOutbox::default();
        let config = HubConfig {
            max_room_members: 0,
            ..HubConfig::default()
        };
        let mut hub = Hub::new(config, outbox.clone());
        let bob = register(&mut hub, "bob", Role::Participant);

        hub.handle(bob, ClientEvent::CreateRoom { display_name: "Study".into() });
        assert!(outbox.events_for(bob).iter().any(|e| matches!(
            e,
            ServerEvent::Error { message } if message.contains("full")
        )));
        // Only the primary room remains; no empty ad-hoc room lingers
        assert_eq!(hub.rooms().count(), 1);
        check_invariants(&hub);
    }

    #[test]
    fn test_reregistration_replaces_connection() {
        let (mut hub, outbox) = hub();
        let first = register(&mut hub, "alice", Role::Participant);
        let second = register(&mut hub, "alice", Role::Participant);

        assert_eq!(hub.directory().resolve("alice"), Some(second));
        let presence = outbox
            .events_for(second)
            .iter()
            .rev()
            .find_map(|e| match e {
                ServerEvent::Presence { users } => Some(users.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(presence.len(), 1);

        // The superseded connection disconnecting must not tear down the
        // successor's registration
        hub.disconnect(first);
        assert_eq!(hub.directory().resolve("alice"), Some(second));
        check_invariants(&hub);
    }

    #[test]
    fn test_same_connection_reregister_keeps_binding() {
        let (mut hub, _outbox) = hub();
        let conn = register(&mut hub, "alice", Role::Participant);

        // Display-name refresh over the same connection
        hub.handle(
            conn,
            ClientEvent::Register {
                identity: "alice".into(),
                display_name: "Alicia".into(),
                role: Role::Participant,
            },
        );
        assert_eq!(
            hub.directory().get("alice").unwrap().display_name,
            "Alicia"
        );

        // The connection can still act for the identity
        hub.handle(conn, ClientEvent::RequestJoin { room_id: "lobby".into() });
        assert_eq!(
            hub.room("lobby").unwrap().status("alice"),
            MembershipStatus::Joined
        );

        // And disconnect still tears everything down
        hub.disconnect(conn);
        assert!(hub.directory().get("alice").is_none());
        assert_eq!(
            hub.room("lobby").unwrap().status("alice"),
            MembershipStatus::Absent
        );
        check_invariants(&hub);
    }

    #[test]
    fn test_new_identity_on_same_connection_releases_old() {
        let (mut hub, _outbox) = hub();
        let conn = register(&mut hub, "alice", Role::Mentor);
        hub.handle(conn, ClientEvent::RequestJoin { room_id: "lobby".into() });

        hub.handle(
            conn,
            ClientEvent::Register {
                identity: "bob".into(),
                display_name: "Bob".into(),
                role: Role::Participant,
            },
        );

        // The old identity is gone from the directory, its membership and
        // authority cleared; only the new identity is bound to the connection
        assert!(hub.directory().get("alice").is_none());
        assert_eq!(
            hub.room("lobby").unwrap().status("alice"),
            MembershipStatus::Absent
        );
        assert_eq!(hub.room("lobby").unwrap().authority, None);
        assert_eq!(hub.directory().resolve("bob"), Some(conn));
        assert_eq!(hub.directory().len(), 1);

        hub.disconnect(conn);
        assert!(hub.directory().is_empty());
        check_invariants(&hub);
    }

    #[test]
    fn test_reregistration_keeps_room_membership() {
        let (mut hub, _outbox) = hub();
        let first = register(&mut hub, "alice", Role::Participant);
        hub.handle(first, ClientEvent::RequestJoin { room_id: "lobby".into() });

        let second = register(&mut hub, "alice", Role::Participant);
        assert_eq!(
            hub.room("lobby").unwrap().status("alice"),
            MembershipStatus::Joined
        );
        assert_eq!(
            hub.directory().get("alice").unwrap().current_room.as_deref(),
            Some("lobby")
        );

        // The rebound connection can act for the identity
        hub.handle(second, ClientEvent::Leave { room_id: "lobby".into() });
        assert_eq!(
            hub.room("lobby").unwrap().status("alice"),
            MembershipStatus::Absent
        );
        check_invariants(&hub);
    }

    #[test]
    fn test_role_downgrade_forfeits_authority() {
        let (mut hub, _outbox) = hub();
        register(&mut hub, "alice", Role::Mentor);
        assert_eq!(
            hub.room("lobby").unwrap().authority,
            Some("alice".to_string())
        );

        register(&mut hub, "alice", Role::Participant);
        assert_eq!(hub.room("lobby").unwrap().authority, None);
        check_invariants(&hub);
    }

    #[test]
    fn test_disconnect_cleans_room_and_directory() {
        let (mut hub, outbox) = hub();
        let alice = register(&mut hub, "alice", Role::Mentor);
        let bob = register(&mut hub, "bob", Role::Participant);
        hub.handle(alice, ClientEvent::RequestJoin { room_id: "lobby".into() });
        hub.handle(bob, ClientEvent::RequestJoin { room_id: "lobby".into() });
        hub.handle(
            alice,
            ClientEvent::Approve { room_id: "lobby".into(), target: "bob".into() },
        );
        outbox.clear();

        hub.disconnect(bob);
        assert!(hub.directory().get("bob").is_none());
        assert_eq!(
            hub.room("lobby").unwrap().status("bob"),
            MembershipStatus::Absent
        );
        // Remaining member saw the departure with the display name resolved
        assert!(outbox.events_for(alice).iter().any(|e| matches!(
            e,
            ServerEvent::ParticipantLeft { identity, display_name, .. }
                if identity == "bob" && display_name == "BOB"
        )));
        assert_eq!(last_participants(&outbox.events_for(alice)), vec!["alice"]);
        check_invariants(&hub);
    }

    #[test]
    fn test_authority_cleared_on_disconnect() {
        let (mut hub, _outbox) = hub();
        let alice = register(&mut hub, "alice", Role::Mentor);
        register(&mut hub, "bob", Role::Participant);

        hub.disconnect(alice);
        assert_eq!(hub.room("lobby").unwrap().authority, None);
        // No succession: the room is now open join
        check_invariants(&hub);
    }

    #[test]
    fn test_approve_of_departed_requester_fails() {
        let (mut hub, outbox) = hub();
        let alice = register(&mut hub, "alice", Role::Mentor);
        let bob = register(&mut hub, "bob", Role::Participant);
        hub.handle(bob, ClientEvent::RequestJoin { room_id: "lobby".into() });

        // Pending records survive the requester disconnecting
        hub.disconnect(bob);
        assert_eq!(
            hub.room("lobby").unwrap().status("bob"),
            MembershipStatus::Pending
        );

        outbox.clear();
        hub.handle(
            alice,
            ClientEvent::Approve { room_id: "lobby".into(), target: "bob".into() },
        );
        assert!(outbox.events_for(alice).iter().any(|e| matches!(
            e,
            ServerEvent::Error { message } if message.contains("no longer online")
        )));
        assert_eq!(
            hub.room("lobby").unwrap().status("bob"),
            MembershipStatus::Absent
        );
        check_invariants(&hub);
    }

    #[test]
    fn test_ready_for_relay_full_mesh() {
        let (mut hub, outbox) = hub();
        let alice = register(&mut hub, "alice", Role::Participant);
        let bob = register(&mut hub, "bob", Role::Participant);
        hub.handle(alice, ClientEvent::RequestJoin { room_id: "lobby".into() });
        hub.handle(bob, ClientEvent::RequestJoin { room_id: "lobby".into() });
        outbox.clear();

        hub.handle(bob, ClientEvent::ReadyForRelay { room_id: "lobby".into() });
        assert!(outbox.events_for(alice).iter().any(|e| matches!(
            e,
            ServerEvent::InitiatePeer { identity, .. } if identity == "bob"
        )));
        assert!(outbox.events_for(bob).iter().any(|e| matches!(
            e,
            ServerEvent::InitiatePeer { identity, .. } if identity == "alice"
        )));
    }

    #[test]
    fn test_relay_to_offline_target_is_dropped() {
        let (mut hub, outbox) = hub();
        let x = register(&mut hub, "x", Role::Participant);
        outbox.clear();

        hub.handle(
            x,
            ClientEvent::Offer {
                target: "ghost".into(),
                room_id: "lobby".into(),
                payload: serde_json::json!({"sdp": "v=0"}),
            },
        );
        // No error surfaced, nothing delivered anywhere
        assert!(outbox.sent.borrow().is_empty());
        check_invariants(&hub);
    }

    #[test]
    fn test_relay_forwards_verbatim() {
        let (mut hub, outbox) = hub();
        let x = register(&mut hub, "x", Role::Participant);
        let y = register(&mut hub, "y", Role::Participant);
        outbox.clear();

        let payload = serde_json::json!({"candidate": "candidate:1 1 udp"});
        hub.handle(
            x,
            ClientEvent::IceCandidate {
                target: "y".into(),
                room_id: "lobby".into(),
                payload: payload.clone(),
            },
        );
        let events = outbox.events_for(y);
        match events.as_slice() {
            [ServerEvent::Signal { kind, sender, room_id, payload: p }] => {
                assert_eq!(*kind, SignalKind::IceCandidate);
                assert_eq!(sender, "x");
                assert_eq!(room_id, "lobby");
                assert_eq!(*p, payload);
            }
            other => panic!("expected one signal, got {other:?}"),
        }
    }

    #[test]
    fn test_chat_scoped_and_stamped() {
        let (mut hub, outbox) = hub();
        let alice = register(&mut hub, "alice", Role::Participant);
        let bob = register(&mut hub, "bob", Role::Participant);
        let carol = register(&mut hub, "carol", Role::Participant);
        hub.handle(alice, ClientEvent::RequestJoin { room_id: "lobby".into() });
        hub.handle(bob, ClientEvent::RequestJoin { room_id: "lobby".into() });
        outbox.clear();

        hub.handle(
            alice,
            ClientEvent::Chat { room_id: "lobby".into(), text: "hello".into() },
        );
        for conn in [alice, bob] {
            assert!(outbox.events_for(conn).iter().any(|e| matches!(
                e,
                ServerEvent::Chat { sender, display_name, text, .. }
                    if sender == "alice" && display_name == "ALICE" && text == "hello"
            )));
        }
        assert!(outbox.events_for(carol).is_empty());

        // Non-members cannot send
        hub.handle(
            carol,
            ClientEvent::Chat { room_id: "lobby".into(), text: "hi".into() },
        );
        assert!(outbox.events_for(carol).iter().any(|e| matches!(
            e,
            ServerEvent::Error { message } if message.contains("not permitted")
        )));
    }

    #[test]
    fn test_unregistered_connection_rejected() {
        let (mut hub, outbox) = hub();
        let conn = Uuid::new_v4();
        hub.handle(conn, ClientEvent::RequestJoin { room_id: "lobby".into() });
        assert!(matches!(
            outbox.events_for(conn).as_slice(),
            [ServerEvent::Error { .. }]
        ));
    }
}
