use meshroom_protocol::MediaState;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::devices::{LocalStream, LocalTrack, MediaDevices};
use crate::error::{Result, RoomError};
use crate::events::{SessionEvent, SessionEventSender};

/// Owns the local capture tracks and their toggle state.
///
/// Only the controller starts, stops or swaps local tracks. Peer links get
/// clones of the handles it holds.
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    events: SessionEventSender,
    microphone: Option<LocalTrack>,
    camera: Option<LocalTrack>,
    screen: Option<LocalTrack>,
    screen_watch: Option<JoinHandle<()>>,
    acquisition: Option<(u64, JoinHandle<()>)>,
    next_request: u64,
    audio_enabled: bool,
    video_enabled: bool,
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>, events: SessionEventSender) -> Self {
        Self {
            devices,
            events,
            microphone: None,
            camera: None,
            screen: None,
            screen_watch: None,
            acquisition: None,
            next_request: 0,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    pub fn state(&self) -> MediaState {
        MediaState {
            audio: self.audio_enabled,
            video: self.video_enabled,
            screen: self.screen.is_some(),
        }
    }

    pub fn has_local_media(&self) -> bool {
        self.microphone.is_some() && self.camera.is_some()
    }

    /// Whether a camera/microphone request is waiting on the devices
    pub fn is_acquiring(&self) -> bool {
        self.acquisition.is_some()
    }

    /// Ask the devices for camera and microphone without waiting for the
    /// answer, which arrives as [`SessionEvent::LocalMediaAcquired`] and is
    /// applied with [`complete_local_media`](Self::complete_local_media).
    ///
    /// Returns false if the media is already held.
    pub fn acquire_local_media(&mut self) -> bool {
        if self.has_local_media() {
            return false;
        }
        if self.acquisition.is_some() {
            return true;
        }

        self.next_request += 1;
        let request = self.next_request;
        let devices = self.devices.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let result = devices.user_media().await;
            let _ = events.send(SessionEvent::LocalMediaAcquired { request, result });
        });
        tracing::debug!("Requested camera and microphone (request {})", request);
        self.acquisition = Some((request, task));
        true
    }

    /// Apply the answer to an acquisition request. Answers to requests that
    /// were cancelled have their tracks stopped and yield `None`.
    pub fn complete_local_media(
        &mut self,
        request: u64,
        result: anyhow::Result<LocalStream>,
    ) -> Option<Result<()>> {
        if self.acquisition.as_ref().map(|(id, _)| *id) != Some(request) {
            if let Ok(stream) = result {
                tracing::debug!("Discarding media from cancelled request {}", request);
                stream.microphone.stop();
                stream.camera.stop();
            }
            return None;
        }
        self.acquisition = None;

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Camera/microphone acquisition failed: {:#}", e);
                return Some(Err(RoomError::media(format!("{:#}", e))));
            }
        };

        stream.microphone.set_enabled(self.audio_enabled);
        stream.camera.set_enabled(self.video_enabled);
        tracing::info!(
            "Acquired local media (audio: {}, video: {})",
            stream.microphone.id(),
            stream.camera.id()
        );

        // Partially held media is replaced as a whole
        self.stop_user_media();
        self.microphone = Some(stream.microphone);
        self.camera = Some(stream.camera);
        Some(Ok(()))
    }

    /// Drop any outstanding acquisition request
    pub fn cancel_acquisition(&mut self) {
        if let Some((request, task)) = self.acquisition.take() {
            tracing::debug!("Cancelled media request {}", request);
            task.abort();
        }
    }

    /// Returns true if the flag changed
    pub fn set_audio_enabled(&mut self, enabled: bool) -> bool {
        if self.audio_enabled == enabled {
            return false;
        }
        self.audio_enabled = enabled;
        if let Some(track) = &self.microphone {
            track.set_enabled(enabled);
        }
        tracing::debug!("Microphone {}", if enabled { "enabled" } else { "muted" });
        true
    }

    /// Returns true if the flag changed
    pub fn set_video_enabled(&mut self, enabled: bool) -> bool {
        if self.video_enabled == enabled {
            return false;
        }
        self.video_enabled = enabled;
        if let Some(track) = &self.camera {
            track.set_enabled(enabled);
        }
        tracing::debug!("Camera {}", if enabled { "enabled" } else { "disabled" });
        true
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Start a screen capture. Returns the new track to substitute on every
    /// link, or `None` if a capture is already running.
    pub async fn start_screen_share(&mut self) -> Result<Option<LocalTrack>> {
        if self.screen.is_some() {
            return Ok(None);
        }

        let track = self.devices.display_media().await.map_err(|e| {
            tracing::warn!("Screen capture acquisition failed: {:#}", e);
            RoomError::media(format!("{:#}", e))
        })?;

        // Capture sources can vanish on their own (window closed, sharing
        // stopped from the OS); report that back to the room task.
        let watched = track.clone();
        let events = self.events.clone();
        self.screen_watch = Some(tokio::spawn(async move {
            watched.ended().await;
            let _ = events.send(SessionEvent::ScreenCaptureEnded {
                track_id: watched.id().to_string(),
            });
        }));

        tracing::info!("Screen share started: {}", track.id());
        self.screen = Some(track.clone());
        Ok(Some(track))
    }

    /// Stop the screen capture. Returns false if none was running.
    pub fn stop_screen_share(&mut self) -> bool {
        let Some(track) = self.screen.take() else {
            return false;
        };
        if let Some(watch) = self.screen_watch.take() {
            watch.abort();
        }
        track.stop();
        tracing::info!("Screen share stopped: {}", track.id());
        true
    }

    /// Whether `track_id` names the screen capture currently running
    pub fn is_current_screen(&self, track_id: &str) -> bool {
        self.screen.as_ref().is_some_and(|t| t.id() == track_id)
    }

    pub fn camera(&self) -> Option<&LocalTrack> {
        self.camera.as_ref()
    }

    pub fn microphone(&self) -> Option<&LocalTrack> {
        self.microphone.as_ref()
    }

    /// The track video senders should carry: the screen while sharing,
    /// the camera otherwise
    pub fn outbound_video(&self) -> Option<&LocalTrack> {
        self.screen.as_ref().or(self.camera.as_ref())
    }

    /// Every track a newly opened link should send
    pub fn outbound_tracks(&self) -> Vec<LocalTrack> {
        self.microphone
            .iter()
            .chain(self.outbound_video())
            .cloned()
            .collect()
    }

    /// Stop every held track and drop any pending request. The toggles are
    /// the user's and survive. Safe to call repeatedly.
    pub fn release(&mut self) {
        self.cancel_acquisition();
        self.stop_screen_share();
        if self.stop_user_media() {
            tracing::info!("Released local media");
        }
    }

    fn stop_user_media(&mut self) -> bool {
        let mut stopped = false;
        for track in [self.microphone.take(), self.camera.take()].into_iter().flatten() {
            stopped |= track.stop();
        }
        stopped
    }
}

impl Drop for MediaController {
    fn drop(&mut self) {
        self.cancel_acquisition();
        self.stop_screen_share();
        self.stop_user_media();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Default)]
    struct TestDevices {
        deny: bool,
        /// Never answer, like an unanswered permission prompt
        hang: bool,
        issued: Mutex<Vec<LocalTrack>>,
    }

    #[async_trait]
    impl MediaDevices for TestDevices {
        async fn user_media(&self) -> anyhow::Result<LocalStream> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.deny {
                return Err(anyhow!("Permission denied"));
            }
            let stream = LocalStream {
                microphone: LocalTrack::with_source(TrackSource::Microphone, "mic", "local"),
                camera: LocalTrack::with_source(TrackSource::Camera, "cam", "local"),
            };
            let mut issued = self.issued.lock().unwrap();
            issued.push(stream.microphone.clone());
            issued.push(stream.camera.clone());
            Ok(stream)
        }

        async fn display_media(&self) -> anyhow::Result<LocalTrack> {
            let track = LocalTrack::with_source(TrackSource::Screen, "screen", "local-screen");
            self.issued.lock().unwrap().push(track.clone());
            Ok(track)
        }
    }

    type Events = mpsc::UnboundedReceiver<SessionEvent>;

    fn controller(devices: Arc<TestDevices>) -> (MediaController, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MediaController::new(devices, tx), rx)
    }

    async fn next_acquired(rx: &mut Events) -> (u64, anyhow::Result<LocalStream>) {
        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no answer from the devices")
            .unwrap();
        match event {
            SessionEvent::LocalMediaAcquired { request, result } => (request, result),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    /// Request media and apply the answer, the way the room task does
    async fn acquire(media: &mut MediaController, rx: &mut Events) -> Result<()> {
        assert!(media.acquire_local_media());
        let (request, result) = next_acquired(rx).await;
        media
            .complete_local_media(request, result)
            .expect("answer to the pending request")
    }

    #[tokio::test]
    async fn test_denied_media_carries_cause() {
        let devices = Arc::new(TestDevices {
            deny: true,
            ..Default::default()
        });
        let (mut media, mut rx) = controller(devices);
        let err = acquire(&mut media, &mut rx).await.unwrap_err();
        assert_eq!(
            err,
            RoomError::MediaAcquisition {
                cause: "Permission denied".to_string()
            }
        );
        assert!(!media.has_local_media());
        assert!(!media.is_acquiring());
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let devices = Arc::new(TestDevices::default());
        let (mut media, mut rx) = controller(devices.clone());
        acquire(&mut media, &mut rx).await.unwrap();
        assert!(!media.acquire_local_media());
        assert_eq!(devices.issued.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_pending_request_is_not_repeated() {
        let devices = Arc::new(TestDevices {
            hang: true,
            ..Default::default()
        });
        let (mut media, mut rx) = controller(devices);

        assert!(media.acquire_local_media());
        assert!(media.acquire_local_media());
        assert!(media.is_acquiring());

        media.cancel_acquisition();
        assert!(!media.is_acquiring());
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_late_answer_to_cancelled_request_is_stopped() {
        let devices = Arc::new(TestDevices::default());
        let (mut media, mut rx) = controller(devices.clone());

        assert!(media.acquire_local_media());
        let (request, result) = next_acquired(&mut rx).await;
        media.release();

        assert!(media.complete_local_media(request, result).is_none());
        assert!(!media.has_local_media());
        let issued = devices.issued.lock().unwrap();
        assert_eq!(issued.len(), 2);
        assert!(issued.iter().all(|t| t.is_ended()));
    }

    #[tokio::test]
    async fn test_mute_toggles_track_without_stopping_it() {
        let (mut media, mut rx) = controller(Arc::new(TestDevices::default()));
        acquire(&mut media, &mut rx).await.unwrap();

        assert!(media.set_audio_enabled(false));
        assert!(!media.set_audio_enabled(false));
        let mic = media.microphone().unwrap();
        assert!(!mic.is_enabled());
        assert!(!mic.is_ended());
        assert!(!media.state().audio);
    }

    #[tokio::test]
    async fn test_toggle_before_acquire_applies_on_acquire() {
        let (mut media, mut rx) = controller(Arc::new(TestDevices::default()));
        media.set_video_enabled(false);
        acquire(&mut media, &mut rx).await.unwrap();
        assert!(!media.camera().unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_screen_share_swaps_outbound_video() {
        let (mut media, mut rx) = controller(Arc::new(TestDevices::default()));
        acquire(&mut media, &mut rx).await.unwrap();
        assert_eq!(media.outbound_video().unwrap().source(), TrackSource::Camera);

        let screen = media.start_screen_share().await.unwrap().unwrap();
        assert!(media.start_screen_share().await.unwrap().is_none());
        assert!(media.outbound_video().unwrap().same_track(&screen));
        assert_eq!(media.outbound_tracks().len(), 2);
        assert!(media.state().screen);

        assert!(media.stop_screen_share());
        assert!(!media.stop_screen_share());
        assert!(screen.is_ended());
        assert_eq!(media.outbound_video().unwrap().source(), TrackSource::Camera);
    }

    #[tokio::test]
    async fn test_external_screen_end_is_reported() {
        let (mut media, mut rx) = controller(Arc::new(TestDevices::default()));
        let screen = media.start_screen_share().await.unwrap().unwrap();

        // The capture source goes away on its own
        screen.stop();

        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::ScreenCaptureEnded { track_id } => {
                assert!(media.is_current_screen(&track_id));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_stops_everything_once() {
        let devices = Arc::new(TestDevices::default());
        let (mut media, mut rx) = controller(devices.clone());
        acquire(&mut media, &mut rx).await.unwrap();
        media.start_screen_share().await.unwrap();

        media.release();
        media.release();

        assert!(devices.issued.lock().unwrap().iter().all(|t| t.is_ended()));
        assert!(!media.has_local_media());
        assert!(!media.is_screen_sharing());
    }

    #[tokio::test]
    async fn test_release_keeps_toggles() {
        let (mut media, mut rx) = controller(Arc::new(TestDevices::default()));
        acquire(&mut media, &mut rx).await.unwrap();
        media.set_audio_enabled(false);

        media.release();
        assert!(!media.state().audio);
        assert!(media.state().video);

        acquire(&mut media, &mut rx).await.unwrap();
        assert!(!media.microphone().unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_drop_stops_tracks() {
        let devices = Arc::new(TestDevices::default());
        let (mut media, mut rx) = controller(devices.clone());
        acquire(&mut media, &mut rx).await.unwrap();
        drop(media);
        assert!(devices.issued.lock().unwrap().iter().all(|t| t.is_ended()));
    }
}
