//! Capture constraints and sender encoding profiles.
//!
//! Capture is fixed per mode. Encoding is chosen once the transport path is
//! known: a relayed path gets a conservative ceiling, a direct one a
//! generous ceiling.

use murmur_shared::ConnectionMode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Pin a specific camera; `None` lets the backend pick.
    pub device_id: Option<String>,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            device_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Microphone always, camera when `is_video`.
    pub fn for_call(is_video: bool) -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: is_video.then(VideoConstraints::default),
        }
    }

    pub fn camera_only(device_id: Option<String>) -> Self {
        Self {
            audio: None,
            video: Some(VideoConstraints {
                device_id,
                ..Default::default()
            }),
        }
    }
}

/// Sender-side encoding ceiling for one track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EncodingParameters {
    pub max_bitrate_kbps: u32,
    /// 1.0 keeps the capture resolution, 2.0 halves each dimension.
    pub scale_resolution_down_by: f64,
    pub max_framerate: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityProfile {
    pub audio: EncodingParameters,
    pub video: EncodingParameters,
}

impl QualityProfile {
    pub const RELAYED: QualityProfile = QualityProfile {
        audio: EncodingParameters {
            max_bitrate_kbps: 32,
            scale_resolution_down_by: 1.0,
            max_framerate: None,
        },
        video: EncodingParameters {
            max_bitrate_kbps: 500,
            scale_resolution_down_by: 2.0,
            max_framerate: Some(20),
        },
    };

    pub const DIRECT: QualityProfile = QualityProfile {
        audio: EncodingParameters {
            max_bitrate_kbps: 64,
            scale_resolution_down_by: 1.0,
            max_framerate: None,
        },
        video: EncodingParameters {
            max_bitrate_kbps: 2500,
            scale_resolution_down_by: 1.0,
            max_framerate: Some(30),
        },
    };

    /// Anything not known to be direct gets the relayed ceiling.
    pub fn for_path(mode: ConnectionMode) -> Self {
        match mode {
            ConnectionMode::Direct => Self::DIRECT,
            ConnectionMode::Relayed | ConnectionMode::Disconnected => Self::RELAYED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_constraints() {
        let audio_only = MediaConstraints::for_call(false);
        assert!(audio_only.video.is_none());
        let audio = audio_only.audio.unwrap();
        assert!(audio.echo_cancellation && audio.noise_suppression && audio.auto_gain_control);

        let video = MediaConstraints::for_call(true).video.unwrap();
        assert_eq!((video.width, video.height, video.frame_rate), (1280, 720, 30));
    }

    #[test]
    fn test_relayed_is_more_conservative() {
        let relayed = QualityProfile::for_path(ConnectionMode::Relayed);
        let direct = QualityProfile::for_path(ConnectionMode::Direct);
        assert!(relayed.video.max_bitrate_kbps < direct.video.max_bitrate_kbps);
        assert!(relayed.video.scale_resolution_down_by > direct.video.scale_resolution_down_by);
        assert!(relayed.audio.max_bitrate_kbps < direct.audio.max_bitrate_kbps);
    }

    #[test]
    fn test_unknown_path_falls_back_to_relayed() {
        assert_eq!(
            QualityProfile::for_path(ConnectionMode::Disconnected),
            QualityProfile::RELAYED
        );
    }
}
