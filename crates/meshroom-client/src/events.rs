use tokio::sync::mpsc;

use crate::media::LocalStream;
use crate::peer::LinkEvent;

/// Notifications raised by the capture and connection subsystems. They are
/// handled on the room task, in arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    Link(LinkEvent),
    /// The devices answered camera/microphone request `request`
    LocalMediaAcquired {
        request: u64,
        result: anyhow::Result<LocalStream>,
    },
    /// A screen capture track ended without being stopped by us
    ScreenCaptureEnded { track_id: String },
}

pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;
pub type SessionEventReceiver = mpsc::UnboundedReceiver<SessionEvent>;
