use async_trait::async_trait;
use meshroom_protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;

use crate::error::Result;

/// Where and as whom to connect to the rendezvous server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub url: String,
    pub token: String,
}

/// Inbound traffic from the signaling channel
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// The channel went away without being asked to
    Closed { reason: String },
}

pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Persistent, authenticated, bidirectional message channel to the
/// rendezvous server
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open and authenticate the channel. Inbound messages are delivered on
    /// the returned receiver until the channel closes.
    async fn connect(&self, credentials: &Credentials) -> Result<TransportEvents>;

    /// Queue a message for delivery
    async fn send(&self, message: ClientMessage) -> Result<()>;

    /// Close the channel. Safe to call when not connected.
    async fn close(&self);
}
