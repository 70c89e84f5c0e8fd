//! Scripted peer connection that records what the caller asked of it.
//!
//! Nothing goes over the network: offers and answers are placeholder SDP,
//! transport events are injected with [`RecordingPeer::emit`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use murmur_shared::protocol::{IceCandidate, SdpType, SessionDescription};
use murmur_shared::{ConnectionMode, TrackKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::MediaError;
use crate::peer::{PeerConnection, PeerConnector, PeerEvent};
use crate::profile::EncodingParameters;
use crate::stats::RawStats;
use crate::track::LocalTrack;

static NEXT_PEER: AtomicUsize = AtomicUsize::new(1);

#[derive(Default)]
struct Recorded {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    rejected: HashSet<String>,
    tracks: HashMap<TrackKind, LocalTrack>,
    encodings: Vec<(TrackKind, EncodingParameters)>,
    stats: Option<RawStats>,
}

pub struct RecordingPeer {
    id: usize,
    events: mpsc::UnboundedSender<PeerEvent>,
    path: Mutex<ConnectionMode>,
    closed: AtomicBool,
    recorded: Mutex<Recorded>,
}

impl RecordingPeer {
    /// Standalone peer plus the receiving end of its event channel.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_events(tx), rx)
    }

    fn with_events(events: mpsc::UnboundedSender<PeerEvent>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_PEER.fetch_add(1, Ordering::SeqCst),
            events,
            path: Mutex::new(ConnectionMode::Direct),
            closed: AtomicBool::new(false),
            recorded: Mutex::new(Recorded::default()),
        })
    }

    /// Inject a transport event as if the network stack had raised it.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_path(&self, mode: ConnectionMode) {
        *self.path.lock() = mode;
    }

    pub fn set_stats(&self, stats: RawStats) {
        self.recorded.lock().stats = Some(stats);
    }

    /// Make `add_ice_candidate` fail for this candidate string.
    pub fn reject_candidate(&self, candidate: &str) {
        self.recorded.lock().rejected.insert(candidate.to_string());
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.recorded
            .lock()
            .candidates
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.recorded.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.recorded.lock().remote.clone()
    }

    pub fn track(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.recorded.lock().tracks.get(&kind).cloned()
    }

    pub fn encodings(&self) -> Vec<(TrackKind, EncodingParameters)> {
        self.recorded.lock().encodings.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), MediaError> {
        if self.is_closed() {
            Err(MediaError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for RecordingPeer {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.check_open()?;
        let offer = SessionDescription::offer(format!("v=0\r\no=- {} 1 IN IP4 0.0.0.0\r\n", self.id));
        self.recorded.lock().local = Some(offer.clone());
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.check_open()?;
        let mut recorded = self.recorded.lock();
        if recorded.remote.as_ref().map(|d| d.sdp_type) != Some(SdpType::Offer) {
            return Err(MediaError::Sdp("no remote offer".into()));
        }
        let answer = SessionDescription::answer(format!("v=0\r\no=- {} 2 IN IP4 0.0.0.0\r\n", self.id));
        recorded.local = Some(answer.clone());
        Ok(answer)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.check_open()?;
        self.recorded.lock().remote = Some(desc);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.recorded.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.check_open()?;
        let mut recorded = self.recorded.lock();
        if recorded.remote.is_none() {
            return Err(MediaError::Candidate("remote description not set".into()));
        }
        if recorded.rejected.contains(&candidate.candidate) {
            return Err(MediaError::Candidate(candidate.candidate));
        }
        recorded.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        self.check_open()?;
        self.recorded.lock().tracks.insert(track.kind(), track.clone());
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<(), MediaError> {
        self.check_open()?;
        let mut recorded = self.recorded.lock();
        match recorded.tracks.get_mut(&kind) {
            Some(slot) => {
                *slot = track.clone();
                Ok(())
            }
            None => Err(MediaError::InvalidState(format!("no {kind} sender"))),
        }
    }

    async fn apply_encoding(
        &self,
        kind: TrackKind,
        params: &EncodingParameters,
    ) -> Result<(), MediaError> {
        self.check_open()?;
        let mut recorded = self.recorded.lock();
        if let Some(track) = recorded.tracks.get(&kind) {
            track.set_encoding(*params);
        }
        recorded.encodings.push((kind, *params));
        Ok(())
    }

    async fn selected_path(&self) -> ConnectionMode {
        if self.is_closed() {
            ConnectionMode::Disconnected
        } else {
            *self.path.lock()
        }
    }

    async fn raw_stats(&self) -> Result<RawStats, MediaError> {
        self.check_open()?;
        let path = *self.path.lock();
        Ok(self
            .recorded
            .lock()
            .stats
            .clone()
            .unwrap_or_else(|| RawStats::empty(path)))
    }

    async fn close(&self) -> Result<(), MediaError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(PeerEvent::StateChanged(crate::peer::PeerState::Closed));
        }
        Ok(())
    }
}

/// Hands out [`RecordingPeer`]s and keeps them for inspection.
#[derive(Default)]
pub struct RecordingConnector {
    peers: Mutex<Vec<Arc<RecordingPeer>>>,
    fail: AtomicBool,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<RecordingPeer>> {
        self.peers.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<RecordingPeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for RecordingConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MediaError::WebRtc("connector disabled".into()));
        }
        let peer = RecordingPeer::with_events(events);
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}
