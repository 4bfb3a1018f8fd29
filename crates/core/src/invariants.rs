//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible signaling states during
//! development. These checks are compiled out in release builds.

use crate::directory::Directory;
use crate::models::Room;

/// A user is in at most one of {members, pending, invited} per room
pub fn assert_room_records_disjoint(room: &Room) {
    for user in room.members() {
        debug_assert!(
            room.pending_users().all(|p| p != user),
            "Room {} user {} is both joined and pending",
            room.id,
            user
        );
        debug_assert!(
            room.invited_users().all(|i| i != user),
            "Room {} user {} is both joined and invited",
            room.id,
            user
        );
    }
    for user in room.pending_users() {
        debug_assert!(
            room.invited_users().all(|i| i != user),
            "Room {} user {} is both pending and invited",
            room.id,
            user
        );
    }
}

/// Every joined member is bound to a live connection
pub fn assert_members_connected(room: &Room, directory: &Directory) {
    for user in room.members() {
        debug_assert!(
            directory.resolve(user).is_some(),
            "Room {} member {} has no live connection",
            room.id,
            user
        );
    }
}

/// A room's authority, if set, is a registered authority-capable user
pub fn assert_authority_valid(room: &Room, directory: &Directory) {
    if let Some(ref authority) = room.authority {
        let entry = directory.get(authority);
        debug_assert!(
            entry.is_some(),
            "Room {} authority {} is not registered",
            room.id,
            authority
        );
        if let Some(user) = entry {
            debug_assert!(
                user.role.can_govern(),
                "Room {} authority {} has role {:?} which cannot govern",
                room.id,
                authority,
                user.role
            );
        }
    }
}

/// A user's `current_room` equals the unique room whose membership set
/// contains them
pub fn assert_current_room_consistent(directory: &Directory, rooms: &[&Room]) {
    for user in directory.iter() {
        let containing: Vec<&str> = rooms
            .iter()
            .filter(|r| r.is_joined(&user.identity))
            .map(|r| r.id.as_str())
            .collect();
        debug_assert!(
            containing.len() <= 1,
            "User {} is joined in {} rooms: {:?}",
            user.identity,
            containing.len(),
            containing
        );
        debug_assert_eq!(
            user.current_room.as_deref(),
            containing.first().copied(),
            "User {} current_room does not match membership",
            user.identity
        );
    }
}
