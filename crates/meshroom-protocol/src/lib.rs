//! Meshroom signaling protocol
//!
//! Wire types exchanged with the rendezvous server over the signaling
//! channel. Messages are JSON objects tagged by `type`.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
