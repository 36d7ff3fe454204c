pub mod registry;

pub use registry::{Participant, ParticipantRegistry};
