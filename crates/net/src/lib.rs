//! Networking layer for the signaling server
//!
//! Length-prefixed JSON frames over TCP, one reader loop and one writer
//! task per connection, all dispatched into a shared hub.

pub mod error;
pub mod frame;
pub mod server;

pub use error::{Error, Result};
pub use server::Server;
