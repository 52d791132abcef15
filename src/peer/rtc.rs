//! webrtc-rs backed connection and track factories.

use crate::error::{Error, Result};
use crate::ice::IceServerDescriptor;
use crate::logger::dump_candidate;
use crate::peer::connection::{
    BitrateHint, ConnectionEvents, ConnectionFactory, MediaTrack, PeerConnection, TrackFactory,
    TrackKind, TrackSpec,
};
use crate::peer::types::{IceCandidate, SdpType, SessionDescription};
use crate::stream::Stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn rtc_config(servers: &[IceServerDescriptor]) -> RTCConfiguration {
    let ice_servers = servers
        .iter()
        .map(|s| RTCIceServer {
            urls: vec![s.url.clone()],
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let res = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    };
    res.map_err(|e| Error::malformed(format!("sdp: {e}")))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(Error::transport(format!("unexpected description type {other}"))),
    }
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate::new(
        init.sdp_mid.unwrap_or_default(),
        init.sdp_mline_index.unwrap_or(0),
        init.candidate,
    )
}

/// Builds one `RTCPeerConnection` per session from a shared API.
pub struct RtcConnectionFactory {
    api: API,
}

impl RtcConnectionFactory {
    /// Default codecs and interceptors.
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::transport(format!("failed to register codecs: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::transport(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn create_connection(
        &self,
        peer_id: &str,
        ice_servers: &[IceServerDescriptor],
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let pc = self
            .api
            .new_peer_connection(rtc_config(ice_servers))
            .await
            .map_err(|e| Error::transport(format!("failed to create peer connection: {e}")))?;
        let pc = Arc::new(pc);

        let cand_peer = peer_id.to_string();
        let cand_events = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let peer_id = cand_peer.clone();
            let events = cand_events.clone();
            Box::pin(async move {
                let Some(c) = cand else {
                    debug!("{}: candidate gathering completed (null candidate)", peer_id);
                    return;
                };
                match c.to_json() {
                    Ok(init) => {
                        let candidate = candidate_from_init(init);
                        dump_candidate("LOCAL", &candidate);
                        events.on_local_candidate(candidate);
                    }
                    Err(e) => warn!("{}: failed to serialize local candidate: {}", peer_id, e),
                }
            })
        }));

        let gather_peer = peer_id.to_string();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            debug!("{}: ICE gathering state changed to {:?}", gather_peer, state);
            if state == RTCIceGathererState::Complete {
                events.on_gathering_complete();
            }
            Box::pin(async {})
        }));

        let state_peer = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!("{}: peer connection state changed to {:?}", state_peer, st);
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeerConnection {
            peer_id: peer_id.to_string(),
            pc,
            senders: Mutex::new(HashMap::new()),
            bitrate: Mutex::new(None),
        }))
    }

    fn check_description(&self, desc: &SessionDescription) -> Result<()> {
        to_rtc(desc).map(|_| ())
    }
}

pub struct RtcPeerConnection {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Vec<Arc<RTCRtpSender>>>>,
    bitrate: Mutex<Option<BitrateHint>>,
}

impl RtcPeerConnection {
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Last bitrate hint applied to this connection.
    pub fn bitrate(&self) -> Option<BitrateHint> {
        *self.bitrate.lock()
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::transport(format!("create offer: {e}")))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::transport(format!("create answer: {e}")))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(&desc)?)
            .await
            .map_err(|e| Error::transport(format!("set local description: {e}")))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(&desc)?)
            .await
            .map_err(|e| Error::transport(format!("set remote description: {e}")))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(Error::candidate_rejected)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .and_then(|d| from_rtc(d).ok())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc
            .remote_description()
            .await
            .and_then(|d| from_rtc(d).ok())
    }

    async fn add_stream(&self, stream: &Stream) -> Result<()> {
        let mut added = Vec::new();
        for track in stream.tracks() {
            let Some(rtp) = track.rtp_track() else {
                warn!(
                    "{}: track {} has no RTP track, not sending it",
                    self.peer_id,
                    track.id()
                );
                continue;
            };
            let sender = self
                .pc
                .add_track(rtp)
                .await
                .map_err(|e| Error::transport(format!("add track {}: {e}", track.id())))?;

            // drain RTCP so interceptors keep running
            let rtcp_sender = sender.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while rtcp_sender.read(&mut buf).await.is_ok() {}
            });
            added.push(sender);
        }
        info!(
            "{}: stream {} added with {} tracks",
            self.peer_id,
            stream.label(),
            added.len()
        );
        self.senders
            .lock()
            .entry(stream.label().to_string())
            .or_default()
            .extend(added);
        Ok(())
    }

    async fn remove_stream(&self, label: &str) -> Result<()> {
        let senders = self.senders.lock().remove(label).unwrap_or_default();
        for sender in senders {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(|e| Error::transport(format!("remove track of {label}: {e}")))?;
        }
        debug!("{}: stream {} removed", self.peer_id, label);
        Ok(())
    }

    fn set_bitrate(&self, hint: BitrateHint) {
        *self.bitrate.lock() = Some(hint);
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| Error::transport(format!("close: {e}")))
    }
}

/// Sample-fed track a capture pipeline writes encoded frames into.
pub struct RtcTrack {
    id: String,
    kind: TrackKind,
    source_id: String,
    constraints: BTreeMap<String, String>,
    sample: Arc<TrackLocalStaticSample>,
}

impl RtcTrack {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn constraints(&self) -> &BTreeMap<String, String> {
        &self.constraints
    }

    pub fn sample_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.sample
    }
}

impl MediaTrack for RtcTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn rtp_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(self.sample.clone())
    }
}

/// VP8 video, Opus audio.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcTrackFactory;

impl TrackFactory for RtcTrackFactory {
    fn create_track(&self, spec: &TrackSpec<'_>) -> Result<Arc<dyn MediaTrack>> {
        let mime_type = match spec.kind {
            TrackKind::Video => MIME_TYPE_VP8,
            TrackKind::Audio => MIME_TYPE_OPUS,
        };
        if spec.source_id.is_empty() {
            return Err(Error::stream_construction(format!(
                "no {} source for {}",
                spec.kind, spec.stream_label
            )));
        }
        if !spec.constraints.is_empty() {
            debug!("{} track {} constraints: {:?}", spec.kind, spec.track_id, spec.constraints);
        }

        let sample = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            spec.track_id.to_string(),
            spec.stream_label.to_string(),
        ));

        Ok(Arc::new(RtcTrack {
            id: spec.track_id.to_string(),
            kind: spec.kind,
            source_id: spec.source_id.to_string(),
            constraints: spec.constraints.clone(),
            sample,
        }))
    }
}
