//! Capture device seam.
//!
//! The platform layer (browser bridge, native capture) implements
//! [`MediaDevices`]; [`SyntheticDevices`] stands in for it in tests and in
//! the headless node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use murmur_shared::TrackKind;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::MediaError;
use crate::profile::MediaConstraints;
use crate::track::{LocalStream, LocalTrack, MediaFrame, TrackSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub label: String,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            label: label.into(),
        }
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Camera and/or microphone per `constraints`.
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;

    /// Screen capture: one video track, plus system audio when offered.
    async fn get_display_media(&self) -> Result<LocalStream, MediaError>;

    async fn video_inputs(&self) -> Result<Vec<DeviceInfo>, MediaError>;
}

/// Capture backend with scripted devices.
pub struct SyntheticDevices {
    cameras: Vec<DeviceInfo>,
    microphone: bool,
    screen_audio: bool,
    generate_frames: bool,
    denied: AtomicBool,
    issued: Mutex<Vec<LocalTrack>>,
    requests: Mutex<Vec<MediaConstraints>>,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self {
            cameras: vec![DeviceInfo::new("camera-front", "Front camera")],
            microphone: true,
            screen_audio: false,
            generate_frames: false,
            denied: AtomicBool::new(false),
            issued: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cameras(mut self, cameras: Vec<DeviceInfo>) -> Self {
        self.cameras = cameras;
        self
    }

    pub fn without_microphone(mut self) -> Self {
        self.microphone = false;
        self
    }

    pub fn with_screen_audio(mut self, enabled: bool) -> Self {
        self.screen_audio = enabled;
        self
    }

    /// Drive every issued track with placeholder frames until it ends.
    /// Needs a running tokio runtime.
    pub fn with_frame_generator(mut self) -> Self {
        self.generate_frames = true;
        self
    }

    /// Simulate the user denying capture permission.
    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    /// Every track handed out so far, live or not.
    pub fn issued_tracks(&self) -> Vec<LocalTrack> {
        self.issued.lock().clone()
    }

    pub fn live_track_count(&self) -> usize {
        self.issued.lock().iter().filter(|t| t.is_live()).count()
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().clone()
    }

    fn check_permission(&self) -> Result<(), MediaError> {
        if self.denied.load(Ordering::SeqCst) {
            Err(MediaError::PermissionDenied)
        } else {
            Ok(())
        }
    }

    fn issue(&self, kind: TrackKind, source: TrackSource, label: &str, device_id: Option<String>) -> LocalTrack {
        let track = LocalTrack::new(kind, source, label, device_id);
        if self.generate_frames {
            spawn_generator(track.clone());
        }
        self.issued.lock().push(track.clone());
        track
    }
}

/// Placeholder encoder output. Video frames shrink with the track's
/// resolution scale, the way a real encoder's output would.
fn frame_size(track: &LocalTrack) -> usize {
    match track.kind() {
        TrackKind::Audio => 160,
        TrackKind::Video => {
            let scale = track
                .encoding()
                .map_or(1.0, |p| p.scale_resolution_down_by.max(1.0));
            (1200.0 / (scale * scale)) as usize
        }
    }
}

fn spawn_generator(track: LocalTrack) {
    let interval = match track.kind() {
        TrackKind::Audio => Duration::from_millis(20),
        TrackKind::Video => Duration::from_millis(33),
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = track.ended() => break,
                _ = ticker.tick() => {
                    let frame = MediaFrame {
                        data: Bytes::from(vec![0u8; frame_size(&track)]),
                        duration: interval,
                    };
                    if !track.push_frame(frame) {
                        break;
                    }
                }
            }
        }
    });
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        self.check_permission()?;
        self.requests.lock().push(constraints.clone());

        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            if !self.microphone {
                return Err(MediaError::DeviceUnavailable("no microphone".into()));
            }
            tracks.push(self.issue(TrackKind::Audio, TrackSource::Microphone, "Microphone", None));
        }

        if let Some(video) = &constraints.video {
            let camera = match &video.device_id {
                Some(id) => self.cameras.iter().find(|c| &c.device_id == id),
                None => self.cameras.first(),
            };
            let Some(camera) = camera else {
                // release what we already opened for this request
                for track in &tracks {
                    track.stop();
                }
                return Err(MediaError::DeviceUnavailable("no camera".into()));
            };
            tracks.push(self.issue(
                TrackKind::Video,
                TrackSource::Camera,
                &camera.label,
                Some(camera.device_id.clone()),
            ));
        }

        debug!(tracks = tracks.len(), "synthetic capture started");
        Ok(LocalStream::new(tracks))
    }

    async fn get_display_media(&self) -> Result<LocalStream, MediaError> {
        self.check_permission()?;
        let mut tracks = vec![self.issue(TrackKind::Video, TrackSource::Screen, "Screen", None)];
        if self.screen_audio {
            tracks.push(self.issue(TrackKind::Audio, TrackSource::ScreenAudio, "System audio", None));
        }
        info!(with_audio = self.screen_audio, "synthetic screen capture started");
        Ok(LocalStream::new(tracks))
    }

    async fn video_inputs(&self) -> Result<Vec<DeviceInfo>, MediaError> {
        Ok(self.cameras.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::QualityProfile;

    #[tokio::test]
    async fn test_audio_video_capture() {
        let devices = SyntheticDevices::new();
        let stream = devices
            .get_user_media(&MediaConstraints::for_call(true))
            .await
            .unwrap();

        assert!(stream.audio_track().is_some());
        assert_eq!(stream.video_track().unwrap().device_id(), Some("camera-front"));
        assert_eq!(devices.live_track_count(), 2);
    }

    #[tokio::test]
    async fn test_denied_permission() {
        let devices = SyntheticDevices::new();
        devices.set_denied(true);
        let err = devices
            .get_user_media(&MediaConstraints::for_call(false))
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::PermissionDenied);
    }

    #[tokio::test]
    async fn test_missing_camera_releases_microphone() {
        let devices = SyntheticDevices::new().with_cameras(Vec::new());
        let err = devices
            .get_user_media(&MediaConstraints::for_call(true))
            .await
            .unwrap_err();
        assert!(err.is_capture_failure());
        assert_eq!(devices.live_track_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_microphone() {
        let devices = SyntheticDevices::new().without_microphone();
        let err = devices
            .get_user_media(&MediaConstraints::for_call(true))
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::DeviceUnavailable("no microphone".into()));
        assert_eq!(devices.live_track_count(), 0);

        let camera = devices
            .get_user_media(&MediaConstraints::camera_only(None))
            .await
            .unwrap();
        assert!(camera.audio_track().is_none());
    }

    #[test]
    fn test_scaled_video_frames_are_smaller() {
        let camera = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam", None);
        assert_eq!(frame_size(&camera), 1200);
        camera.set_encoding(QualityProfile::RELAYED.video);
        assert_eq!(frame_size(&camera), 300);
    }

    #[tokio::test]
    async fn test_screen_with_audio() {
        let devices = SyntheticDevices::new().with_screen_audio(true);
        let stream = devices.get_display_media().await.unwrap();
        assert_eq!(stream.video_track().unwrap().source(), TrackSource::Screen);
        assert_eq!(stream.audio_track().unwrap().source(), TrackSource::ScreenAudio);
    }

    #[tokio::test]
    async fn test_generator_feeds_frames() {
        let devices = SyntheticDevices::new().with_frame_generator();
        let stream = devices
            .get_user_media(&MediaConstraints::for_call(false))
            .await
            .unwrap();
        let mic = stream.audio_track().unwrap().clone();
        let mut rx = mic.subscribe_frames();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.data.len(), 160);
        mic.stop();
    }
}
