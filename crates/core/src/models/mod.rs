//! Data models for Beacon

mod membership;
mod room;
mod user;

pub use membership::*;
pub use room::*;
pub use user::*;
