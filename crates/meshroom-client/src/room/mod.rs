//! Room lifecycle and the task that drives it

mod handle;
mod session;

pub use handle::RoomHandle;
pub use session::{ParticipantView, RoomSession, RoomSnapshot, SessionInput, SessionState};
