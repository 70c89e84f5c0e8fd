// Local capture, peer connections and adaptive quality for 1:1 calls.

pub mod config;
pub mod devices;
pub mod error;
pub mod pacer;
pub mod peer;
pub mod pipeline;
pub mod profile;
pub mod stats;
pub mod track;
pub mod webrtc_peer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{IceConfig, TurnServer};
pub use devices::{DeviceInfo, MediaDevices, SyntheticDevices};
pub use error::MediaError;
pub use pacer::FramePacer;
pub use peer::{PeerConnection, PeerConnector, PeerEvent, PeerState};
pub use pipeline::MediaPipeline;
pub use profile::{EncodingParameters, MediaConstraints, QualityProfile};
pub use stats::{CallStats, RawStats, StatsSampler};
pub use track::{LocalStream, LocalTrack, MediaFrame, TrackSource};
pub use webrtc_peer::{WebRtcConnector, WebRtcPeer};
