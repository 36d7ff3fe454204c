//! Mesh peer connections: one negotiated link per remote participant

mod connection;
mod link;
mod manager;
mod webrtc;

pub use connection::{
    ConnectionFactory, Connectivity, LinkEvent, LinkEventKind, LinkEventSink, RemoteTrack,
    RtcConnection,
};
pub use link::{LinkRole, LinkState, PeerLink};
pub use manager::PeerConnectionManager;
pub use self::webrtc::{WebRtcConnection, WebRtcConnectionFactory};
