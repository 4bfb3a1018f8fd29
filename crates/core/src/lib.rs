//! Beacon Core Library
//!
//! Session membership and access-control state machine for a peer-to-peer
//! signaling relay. The hub tracks who is online, which rooms exist, who may
//! enter them, and relays opaque connection-setup messages between members.
//! Transport is an external collaborator reached through the [`Outbox`]
//! seam; this crate performs no I/O of its own.

pub mod directory;
pub mod error;
pub mod events;
pub mod hub;
pub mod invariants;
pub mod models;

pub use directory::Directory;
pub use error::{Error, Result};
pub use events::{ClientEvent, ServerEvent, SignalKind};
pub use hub::{Hub, HubConfig, Outbox};
pub use models::*;
