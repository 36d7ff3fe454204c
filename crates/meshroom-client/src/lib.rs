//! Meshroom client library
//!
//! Signaling and mesh peer-connection orchestration for live video rooms:
//! joining and leaving rooms, negotiating one WebRTC connection per remote
//! participant, and managing local camera, microphone and screen tracks.

pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod network;
pub mod peer;
pub mod room;
pub mod state;

pub use self::config::ClientConfig;
pub use error::{Result, RoomError};
pub use room::{RoomHandle, RoomSession, RoomSnapshot, SessionState};
