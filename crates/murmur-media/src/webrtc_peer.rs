//! [`PeerConnection`] backed by webrtc-rs.
//!
//! Each outgoing kind gets one static sample track on the connection. A
//! pump task copies frames from whichever [`LocalTrack`] currently feeds
//! that kind, so `replace_track` is a pointer swap and never renegotiates.
//! The pump also enforces the track's encoding ceilings through a
//! [`FramePacer`], since webrtc-rs has no sender parameters to set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use murmur_shared::protocol::{IceCandidate, SdpType, SessionDescription};
use murmur_shared::{ConnectionMode, TrackKind};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice::candidate::CandidateType;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::IceConfig;
use crate::error::MediaError;
use crate::pacer::FramePacer;
use crate::peer::{PeerConnection, PeerConnector, PeerEvent, PeerState};
use crate::profile::EncodingParameters;
use crate::stats::RawStats;
use crate::track::LocalTrack;

fn rtc_err(e: webrtc::Error) -> MediaError {
    MediaError::WebRtc(e.to_string())
}

/// Builds one webrtc-rs connection per call from a shared API instance.
pub struct WebRtcConnector {
    api: API,
    ice: IceConfig,
}

impl WebRtcConnector {
    pub fn new(ice: IceConfig) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let mut ice_servers = vec![RTCIceServer {
            urls: self.ice.stun_urls.clone(),
            ..Default::default()
        }];
        if let Some(turn) = &self.ice.turn {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(rtc_err)?,
        );
        let inbound = Arc::new(InboundCounters::default());
        install_handlers(&pc, events, Arc::clone(&inbound));
        debug!(relay = self.ice.turn.is_some(), "peer connection created");

        Ok(Arc::new(WebRtcPeer {
            pc,
            senders: Mutex::new(HashMap::new()),
            inbound,
        }))
    }
}

/// Frames seen on the remote video track.
#[derive(Default)]
struct InboundCounters {
    video_seen: AtomicBool,
    video_frames: AtomicU64,
}

impl InboundCounters {
    fn video_frames(&self) -> Option<u64> {
        self.video_seen
            .load(Ordering::Acquire)
            .then(|| self.video_frames.load(Ordering::Acquire))
    }
}

fn install_handlers(
    pc: &RTCPeerConnection,
    events: mpsc::UnboundedSender<PeerEvent>,
    inbound: Arc<InboundCounters>,
) {
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let mapped = match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
                Some(PeerState::Connecting)
            }
            RTCPeerConnectionState::Connected => Some(PeerState::Connected),
            RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
            RTCPeerConnectionState::Failed => Some(PeerState::Failed),
            RTCPeerConnectionState::Closed => Some(PeerState::Closed),
            _ => None,
        };
        if let Some(mapped) = mapped {
            debug!(?mapped, "peer connection state");
            let _ = tx.send(PeerEvent::StateChanged(mapped));
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // None marks the end of gathering
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => warn!(error = %e, "could not serialize local candidate"),
            }
        }
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        };
        if let Some(kind) = kind {
            info!(%kind, "remote track arrived");
            let _ = tx.send(PeerEvent::RemoteTrack(kind));
        }
        let is_video = kind == Some(TrackKind::Video);
        if is_video {
            inbound.video_seen.store(true, Ordering::Release);
        }
        let inbound = Arc::clone(&inbound);
        Box::pin(async move {
            // playback is the platform's job; keep the receiver drained
            while let Ok((packet, _)) = track.read_rtp().await {
                // the marker bit closes a video frame
                if is_video && packet.header.marker {
                    inbound.video_frames.fetch_add(1, Ordering::AcqRel);
                }
            }
        })
    }));
}

struct SenderSlot {
    source: watch::Sender<Option<LocalTrack>>,
    pump: JoinHandle<()>,
    frames_sent: Arc<AtomicU64>,
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, SenderSlot>>,
    inbound: Arc<InboundCounters>,
}

impl WebRtcPeer {
    fn current_track(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.senders
            .lock()
            .get(&kind)
            .and_then(|slot| slot.source.borrow().clone())
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

/// Copy frames from whichever local track is current into `rtc`, dropping
/// what the track's encoding ceilings do not allow.
async fn pump_frames(
    rtc: Arc<TrackLocalStaticSample>,
    mut source: watch::Receiver<Option<LocalTrack>>,
    frames_sent: Arc<AtomicU64>,
) {
    loop {
        let current = source.borrow_and_update().clone();
        let Some(track) = current else {
            if source.changed().await.is_err() {
                return;
            }
            continue;
        };

        let mut frames = track.subscribe_frames();
        let mut encoding = track.watch_encoding();
        let mut pacer = FramePacer::new(*encoding.borrow_and_update());
        loop {
            tokio::select! {
                changed = source.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                Ok(()) = encoding.changed() => {
                    let params = *encoding.borrow_and_update();
                    debug!(kind = %track.kind(), ?params, "sender pump retuned");
                    pacer.retune(params);
                }
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        if !pacer.admit(&frame) {
                            continue;
                        }
                        let sample = Sample {
                            data: frame.data,
                            duration: frame.duration,
                            ..Default::default()
                        };
                        frames_sent.fetch_add(1, Ordering::AcqRel);
                        if let Err(e) = rtc.write_sample(&sample).await {
                            debug!(error = %e, "dropping sample");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, kind = %track.kind(), "sender pump lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        if source.changed().await.is_err() {
                            return;
                        }
                        break;
                    }
                },
            }
        }
    }
}

/// Transport path of the nominated candidate pair.
fn selected_path_in(reports: &HashMap<String, StatsReportType>) -> ConnectionMode {
    let pair = reports.values().find_map(|report| match report {
        StatsReportType::CandidatePair(pair) if pair.nominated => Some(pair),
        _ => None,
    });
    let Some(pair) = pair else {
        return ConnectionMode::Disconnected;
    };

    let relayed = [&pair.local_candidate_id, &pair.remote_candidate_id]
        .into_iter()
        .any(|id| match reports.get(id) {
            Some(StatsReportType::LocalCandidate(c)) | Some(StatsReportType::RemoteCandidate(c)) => {
                c.candidate_type == CandidateType::Relay
            }
            _ => false,
        });
    if relayed {
        ConnectionMode::Relayed
    } else {
        ConnectionMode::Direct
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let rtc = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| MediaError::Sdp(e.to_string()))?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| MediaError::Sdp(e.to_string()))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::Candidate(e.to_string()))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), MediaError> {
        let kind = track.kind();
        if self.senders.lock().contains_key(&kind) {
            return self.replace_track(kind, track).await;
        }

        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec_for(kind),
            kind.to_string(),
            "murmur".to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&rtc) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_err)?;

        // RTCP has to be read for the interceptors to run
        tokio::spawn(async move { while sender.read_rtcp().await.is_ok() {} });

        let (source, rx) = watch::channel(Some(track.clone()));
        let frames_sent = Arc::new(AtomicU64::new(0));
        let pump = tokio::spawn(pump_frames(rtc, rx, Arc::clone(&frames_sent)));
        self.senders.lock().insert(
            kind,
            SenderSlot {
                source,
                pump,
                frames_sent,
            },
        );
        debug!(%kind, track = %track.id(), "track added to connection");
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<(), MediaError> {
        let senders = self.senders.lock();
        let slot = senders
            .get(&kind)
            .ok_or_else(|| MediaError::InvalidState(format!("no {kind} sender")))?;
        // carry the active encoding over to the new source
        let encoding = slot.source.borrow().as_ref().and_then(LocalTrack::encoding);
        if let Some(params) = encoding {
            track.set_encoding(params);
        }
        slot.source.send_replace(Some(track.clone()));
        debug!(%kind, track = %track.id(), "sender source replaced");
        Ok(())
    }

    async fn apply_encoding(
        &self,
        kind: TrackKind,
        params: &EncodingParameters,
    ) -> Result<(), MediaError> {
        // the sender pump and the capture backend both follow the track's encoding
        match self.current_track(kind) {
            Some(track) => {
                track.set_encoding(*params);
                Ok(())
            }
            None => Err(MediaError::InvalidState(format!("no {kind} sender"))),
        }
    }

    async fn selected_path(&self) -> ConnectionMode {
        selected_path_in(&self.pc.get_stats().await.reports)
    }

    async fn raw_stats(&self) -> Result<RawStats, MediaError> {
        let reports = self.pc.get_stats().await.reports;
        let mut raw = RawStats::empty(selected_path_in(&reports));
        raw.frames_received = self.inbound.video_frames();

        for report in reports.values() {
            match report {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    if raw.round_trip_time.is_none() && pair.current_round_trip_time > 0.0 {
                        raw.round_trip_time = Some(pair.current_round_trip_time);
                    }
                }
                StatsReportType::InboundRTP(inbound) => {
                    raw.bytes_received += inbound.bytes_received;
                }
                // the remote's receiver reports on our outbound streams
                StatsReportType::RemoteInboundRTP(remote) => {
                    raw.packets_received += remote.packets_received;
                    raw.packets_lost += remote.packets_lost;
                    if let Some(rtt) = remote.round_trip_time {
                        raw.round_trip_time.get_or_insert(rtt);
                    }
                }
                StatsReportType::OutboundRTP(outbound) => {
                    raw.bytes_sent += outbound.bytes_sent;
                }
                _ => {}
            }
        }
        Ok(raw)
    }

    async fn close(&self) -> Result<(), MediaError> {
        let slots: Vec<SenderSlot> = self.senders.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            slot.pump.abort();
            debug!(frames = slot.frames_sent.load(Ordering::Acquire), "sender pump stopped");
        }
        self.pc.close().await.map_err(rtc_err)
    }
}
