//! Local media: capture tracks and their toggle state

mod controller;
mod devices;

pub use controller::MediaController;
pub use devices::{LocalStream, LocalTrack, MediaDevices, MediaKind, RtpMediaDevices, TrackSource};
