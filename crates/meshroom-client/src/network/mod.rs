//! Signaling channel to the rendezvous server

mod transport;
mod websocket;

pub use transport::{Credentials, SignalingTransport, TransportEvent, TransportEvents};
pub use websocket::WebSocketTransport;
