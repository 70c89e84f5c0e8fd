use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use murmur_shared::TrackKind;
use tokio::sync::{broadcast, watch};
use tracing::debug;
use uuid::Uuid;

use crate::profile::EncodingParameters;

const FRAME_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    /// System audio captured alongside a screen share.
    ScreenAudio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

/// One encoded media sample.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
    pub duration: Duration,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    label: String,
    device_id: Option<String>,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
    frames: broadcast::Sender<MediaFrame>,
    encoding: watch::Sender<Option<EncodingParameters>>,
}

/// Handle to a captured track. Clones share the same underlying track.
///
/// Capture backends push frames in with [`LocalTrack::push_frame`] and size
/// their output from [`LocalTrack::encoding`]. Peer connections read frames
/// back out with [`LocalTrack::subscribe_frames`] and follow
/// [`LocalTrack::watch_encoding`] to hold the sender ceilings.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(
        kind: TrackKind,
        source: TrackSource,
        label: impl Into<String>,
        device_id: Option<String>,
    ) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        let (encoding, _) = watch::channel(None);
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                source,
                label: label.into(),
                device_id,
                enabled: AtomicBool::new(true),
                state,
                frames,
                encoding,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn device_id(&self) -> Option<&str> {
        self.inner.device_id.as_deref()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Release the capture device. Idempotent; returns whether this call
    /// ended the track.
    pub fn stop(&self) -> bool {
        let stopped = self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Ended {
                false
            } else {
                *state = TrackState::Ended;
                true
            }
        });
        if stopped {
            debug!(track = %self.inner.id, kind = %self.inner.kind, "track stopped");
        }
        stopped
    }

    pub fn is_live(&self) -> bool {
        *self.inner.state.borrow() == TrackState::Live
    }

    /// Resolves once the track has ended, whoever stopped it.
    pub async fn ended(&self) {
        let mut rx = self.inner.state.subscribe();
        // the sender lives in `self`, so the channel cannot close under us
        let _ = rx.wait_for(|state| *state == TrackState::Ended).await;
    }

    /// Feed one encoded frame. Disabled audio is sent as silence, disabled
    /// video is dropped. Returns `false` once the track has ended.
    pub fn push_frame(&self, frame: MediaFrame) -> bool {
        if !self.is_live() {
            return false;
        }
        let frame = if self.is_enabled() {
            frame
        } else {
            match self.inner.kind {
                TrackKind::Audio => MediaFrame {
                    data: Bytes::from(vec![0u8; frame.data.len()]),
                    duration: frame.duration,
                },
                TrackKind::Video => return true,
            }
        };
        // no subscribers is fine, the frame is simply not sent anywhere
        let _ = self.inner.frames.send(frame);
        true
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<MediaFrame> {
        self.inner.frames.subscribe()
    }

    pub fn set_encoding(&self, params: EncodingParameters) {
        self.inner.encoding.send_replace(Some(params));
    }

    pub fn encoding(&self) -> Option<EncodingParameters> {
        *self.inner.encoding.borrow()
    }

    pub fn watch_encoding(&self) -> watch::Receiver<Option<EncodingParameters>> {
        self.inner.encoding.subscribe()
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Tracks captured together.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.track(TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.track(TrackKind::Video)
    }

    /// Swap in `track` for its kind, returning the previous one.
    pub fn replace(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        match self.tracks.iter_mut().find(|t| t.kind() == track.kind()) {
            Some(slot) => Some(std::mem::replace(slot, track)),
            None => {
                self.tracks.push(track);
                None
            }
        }
    }

    pub fn into_tracks(self) -> Vec<LocalTrack> {
        self.tracks
    }

    /// Stop every track; returns how many were still live.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(len: usize) -> MediaFrame {
        MediaFrame {
            data: Bytes::from(vec![7u8; len]),
            duration: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let track = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic", None);
        assert!(track.is_live());
        assert!(track.stop());
        assert!(!track.stop());
        assert!(!track.is_live());
    }

    #[tokio::test]
    async fn test_ended_resolves_after_stop() {
        let track = LocalTrack::new(TrackKind::Video, TrackSource::Screen, "screen", None);
        let other = track.clone();
        let waiter = tokio::spawn(async move { other.ended().await });
        track.stop();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_audio_sends_silence() {
        let track = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic", None);
        let mut rx = track.subscribe_frames();

        track.set_enabled(false);
        assert!(track.push_frame(frame(4)));
        let got = rx.recv().await.unwrap();
        assert_eq!(&got.data[..], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_disabled_video_drops_frames() {
        let track = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam", None);
        let mut rx = track.subscribe_frames();

        track.set_enabled(false);
        track.push_frame(frame(4));
        track.set_enabled(true);
        track.push_frame(frame(2));
        assert_eq!(rx.recv().await.unwrap().data.len(), 2);
    }

    #[test]
    fn test_ended_track_rejects_frames() {
        let track = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic", None);
        track.stop();
        assert!(!track.push_frame(frame(1)));
    }

    #[test]
    fn test_stream_replace() {
        let mic = LocalTrack::new(TrackKind::Audio, TrackSource::Microphone, "mic", None);
        let cam = LocalTrack::new(TrackKind::Video, TrackSource::Camera, "cam", None);
        let screen = LocalTrack::new(TrackKind::Video, TrackSource::Screen, "screen", None);
        let mut stream = LocalStream::new(vec![mic, cam.clone()]);

        let old = stream.replace(screen.clone()).unwrap();
        assert!(old.same_track(&cam));
        assert!(stream.video_track().unwrap().same_track(&screen));
        assert_eq!(stream.stop_all(), 2);
        assert_eq!(stream.stop_all(), 0);
    }
}
