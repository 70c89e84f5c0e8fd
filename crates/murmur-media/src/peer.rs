use std::sync::Arc;

use async_trait::async_trait;
use murmur_shared::protocol::{IceCandidate, SessionDescription};
use murmur_shared::{ConnectionMode, TrackKind};
use tokio::sync::mpsc;

use crate::error::MediaError;
use crate::profile::EncodingParameters;
use crate::stats::RawStats;
use crate::track::LocalTrack;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Transport events, delivered on the channel given to
/// [`PeerConnector::connect`].
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Locally gathered candidate to trickle to the other side.
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
    RemoteTrack(TrackKind),
}

/// One peer-to-peer media connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Create an answer to the applied remote offer and install it locally.
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    async fn add_track(&self, track: &LocalTrack) -> Result<(), MediaError>;

    /// Swap the outgoing track of `kind` in place, without renegotiation.
    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<(), MediaError>;

    async fn apply_encoding(
        &self,
        kind: TrackKind,
        params: &EncodingParameters,
    ) -> Result<(), MediaError>;

    /// Route of the selected candidate pair.
    async fn selected_path(&self) -> ConnectionMode;

    async fn raw_stats(&self) -> Result<RawStats, MediaError>;

    async fn close(&self) -> Result<(), MediaError>;
}

/// Factory for peer connections; one connection per call.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;
}
