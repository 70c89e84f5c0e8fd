//! Local media for one call: capture, mute flags, screen share, camera
//! switching and path-dependent encoding.

use std::sync::Arc;

use murmur_shared::{ConnectionMode, TrackKind};
use tracing::{debug, info, warn};

use crate::devices::{DeviceInfo, MediaDevices};
use crate::error::MediaError;
use crate::peer::PeerConnection;
use crate::profile::{MediaConstraints, QualityProfile, VideoConstraints};
use crate::track::{LocalStream, LocalTrack};

pub struct MediaPipeline {
    devices: Arc<dyn MediaDevices>,
    stream: Option<LocalStream>,
    screen: Option<LocalStream>,
    is_video: bool,
    muted: bool,
    video_enabled: bool,
}

impl MediaPipeline {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            stream: None,
            screen: None,
            is_video: false,
            muted: false,
            video_enabled: true,
        }
    }

    /// Capture microphone (and camera when `is_video`) with the fixed
    /// call profile. Replaces and stops any previous capture.
    pub async fn acquire(&mut self, is_video: bool) -> Result<LocalStream, MediaError> {
        self.stop_all();
        let stream = self
            .devices
            .get_user_media(&MediaConstraints::for_call(is_video))
            .await?;

        info!(is_video, tracks = stream.tracks().len(), "local media acquired");
        self.is_video = is_video;
        self.muted = false;
        self.video_enabled = true;
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    /// Add every captured track to `pc`.
    pub async fn attach(&self, pc: &dyn PeerConnection) -> Result<(), MediaError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| MediaError::InvalidState("no local media".into()))?;
        for track in stream.tracks() {
            pc.add_track(track).await?;
        }
        Ok(())
    }

    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    pub fn is_video(&self) -> bool {
        self.is_video
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.screen.is_some()
    }

    /// Outgoing screen track while sharing; it ends when the user or the OS
    /// stops the capture.
    pub fn screen_track(&self) -> Option<LocalTrack> {
        self.screen.as_ref().and_then(|s| s.video_track().cloned())
    }

    /// Applies to every audio track held, system audio from a screen share
    /// included.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        for track in self.audio_tracks() {
            track.set_enabled(!muted);
        }
        debug!(muted, "audio mute state changed");
    }

    fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        [self.stream.as_ref(), self.screen.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(LocalStream::audio_track)
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        if let Some(track) = self.stream.as_ref().and_then(LocalStream::video_track) {
            track.set_enabled(enabled);
        }
        debug!(enabled, "video enabled state changed");
    }

    /// Send the screen instead of the camera (and system audio instead of
    /// the microphone when the capture has it).
    pub async fn start_screen_share(&mut self, pc: &dyn PeerConnection) -> Result<LocalTrack, MediaError> {
        if self.screen.is_some() {
            return Err(MediaError::InvalidState("screen share already active".into()));
        }
        if !self.is_video {
            return Err(MediaError::InvalidState("screen share needs a video call".into()));
        }

        let screen = self.devices.get_display_media().await?;
        let Some(screen_video) = screen.video_track().cloned() else {
            screen.stop_all();
            return Err(MediaError::DeviceUnavailable("display capture has no video".into()));
        };

        if let Err(e) = pc.replace_track(TrackKind::Video, &screen_video).await {
            screen.stop_all();
            return Err(e);
        }
        if let Some(screen_audio) = screen.audio_track() {
            screen_audio.set_enabled(!self.muted);
            if let Err(e) = pc.replace_track(TrackKind::Audio, screen_audio).await {
                warn!(error = %e, "could not send screen audio, keeping microphone");
            } else if let Some(mic) = self.stream.as_ref().and_then(LocalStream::audio_track) {
                mic.stop();
            }
        }

        if let Some(camera) = self.stream.as_ref().and_then(LocalStream::video_track) {
            camera.stop();
        }

        info!(with_audio = screen.audio_track().is_some(), "screen share started");
        self.screen = Some(screen);
        Ok(screen_video)
    }

    /// End the screen share and put the camera (and microphone) back.
    pub async fn stop_screen_share(&mut self, pc: &dyn PeerConnection) -> Result<(), MediaError> {
        let Some(screen) = self.screen.take() else {
            return Ok(());
        };
        screen.stop_all();
        self.restore_capture(pc).await?;
        info!("screen share stopped, camera restored");
        Ok(())
    }

    /// Re-acquire whichever of camera/microphone is no longer live and put
    /// it back on the connection.
    async fn restore_capture(&mut self, pc: &dyn PeerConnection) -> Result<(), MediaError> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(());
        };

        let camera = stream.video_track();
        let need_video = camera.map_or(self.is_video, |t| !t.is_live());
        let need_audio = stream.audio_track().map_or(false, |t| !t.is_live());
        if !need_video && !need_audio {
            return Ok(());
        }

        let constraints = MediaConstraints {
            audio: need_audio.then(Default::default),
            video: need_video.then(|| VideoConstraints {
                device_id: camera.and_then(|t| t.device_id().map(str::to_string)),
                ..Default::default()
            }),
        };
        let fresh = self.devices.get_user_media(&constraints).await?;

        for track in fresh.into_tracks() {
            let kind = track.kind();
            match kind {
                TrackKind::Audio => track.set_enabled(!self.muted),
                TrackKind::Video => track.set_enabled(self.video_enabled),
            }
            if let Err(e) = pc.replace_track(kind, &track).await {
                track.stop();
                return Err(e);
            }
            if let Some(stream) = self.stream.as_mut() {
                stream.replace(track);
            }
        }
        Ok(())
    }

    /// Cycle to the next camera. Fails with `NoAlternateCamera` when only
    /// one video input exists.
    pub async fn switch_camera(&mut self, pc: &dyn PeerConnection) -> Result<DeviceInfo, MediaError> {
        if self.screen.is_some() {
            return Err(MediaError::InvalidState("camera switch while sharing screen".into()));
        }
        let current = self
            .stream
            .as_ref()
            .and_then(LocalStream::video_track)
            .cloned()
            .ok_or_else(|| MediaError::InvalidState("no camera in this call".into()))?;

        let inputs = self.devices.video_inputs().await?;
        if inputs.len() < 2 {
            return Err(MediaError::NoAlternateCamera);
        }

        let position = inputs
            .iter()
            .position(|d| Some(d.device_id.as_str()) == current.device_id());
        let next = match position {
            Some(i) => inputs[(i + 1) % inputs.len()].clone(),
            None => inputs[0].clone(),
        };

        let fresh = self
            .devices
            .get_user_media(&MediaConstraints::camera_only(Some(next.device_id.clone())))
            .await?;
        let Some(track) = fresh.video_track().cloned() else {
            fresh.stop_all();
            return Err(MediaError::DeviceUnavailable(next.device_id));
        };
        track.set_enabled(self.video_enabled);

        if let Err(e) = pc.replace_track(TrackKind::Video, &track).await {
            track.stop();
            return Err(e);
        }
        current.stop();
        if let Some(stream) = self.stream.as_mut() {
            stream.replace(track);
        }

        info!(camera = %next.label, "switched camera");
        Ok(next)
    }

    /// Re-apply sender encodings for the observed transport path.
    pub async fn apply_quality(
        &self,
        pc: &dyn PeerConnection,
        path: ConnectionMode,
    ) -> Result<QualityProfile, MediaError> {
        let profile = QualityProfile::for_path(path);
        pc.apply_encoding(TrackKind::Audio, &profile.audio).await?;
        if self.is_video {
            pc.apply_encoding(TrackKind::Video, &profile.video).await?;
        }
        info!(
            ?path,
            video_kbps = profile.video.max_bitrate_kbps,
            audio_kbps = profile.audio.max_bitrate_kbps,
            "applied quality profile"
        );
        Ok(profile)
    }

    /// Stop every local track, screen capture included. Returns how many
    /// tracks were still live.
    pub fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        if let Some(screen) = self.screen.take() {
            stopped += screen.stop_all();
        }
        if let Some(stream) = self.stream.take() {
            stopped += stream.stop_all();
        }
        if stopped > 0 {
            debug!(stopped, "local media released");
        }
        stopped
    }
}

impl Drop for MediaPipeline {
    fn drop(&mut self) {
        self.stop_all();
    }
}
