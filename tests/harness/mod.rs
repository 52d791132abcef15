//! Fake transport and capture layers for integration tests.
//!
//! - `FakeConnectionFactory` hands out connections producing synthetic SDP;
//!   setting a local description emits one host candidate.
//! - `FakeTrackFactory` counts constructions and can be told to fail or to
//!   block for a while, like a capture device being opened.
//! - `Recorder` is a push-style session observer.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use peer_manager::ice::{IceServerDescriptor, IceServerResolver, InterfaceAddr, StaticInterfaces};
use peer_manager::peer::{
    BitrateHint, ConnectionEvents, ConnectionFactory, MediaTrack, PeerConnection, TrackFactory,
    TrackKind, TrackSpec,
};
use peer_manager::stream::Stream;
use peer_manager::{
    Error, IceCandidate, ManagerConfig, PeerConnectionManager, Result, SdpType, SessionDescription,
    SessionObserver,
};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Candidate lines containing this marker are declined by the transport.
pub const REJECTED_MARKER: &str = "unknown-mline";

#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    /// Delay before an offer or answer is produced
    pub describe_delay: Duration,
    /// Remote descriptions are accepted but never reported back
    pub drop_remote: bool,
    /// Remote descriptions fail to parse
    pub reject_remote: bool,
}

pub struct FakeConnection {
    peer_id: String,
    behavior: FakeBehavior,
    events: Arc<dyn ConnectionEvents>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    pub applied_candidates: Mutex<Vec<IceCandidate>>,
    pub streams: Mutex<Vec<String>>,
    pub bitrate: Mutex<Option<BitrateHint>>,
    pub closed: AtomicBool,
}

impl FakeConnection {
    pub fn applied(&self) -> Vec<String> {
        self.applied_candidates
            .lock()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn stream_labels(&self) -> Vec<String> {
        self.streams.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn sdp(&self, kind: &str) -> String {
        format!("v=0\r\no=fake 1 1 IN IP4 127.0.0.1\r\ns={}-{}\r\n", self.peer_id, kind)
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        tokio::time::sleep(self.behavior.describe_delay).await;
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        tokio::time::sleep(self.behavior.describe_delay).await;
        match self.remote.lock().as_ref().map(|d| d.sdp_type) {
            Some(SdpType::Offer) => Ok(SessionDescription::answer(self.sdp("answer"))),
            _ => Err(Error::transport("create answer without a remote offer")),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        *self.local.lock() = Some(desc);
        self.events.on_local_candidate(IceCandidate::new(
            "0",
            0,
            "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host",
        ));
        self.events.on_gathering_complete();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if self.behavior.reject_remote {
            return Err(Error::malformed("sdp: unparseable remote description"));
        }
        if !self.behavior.drop_remote {
            *self.remote.lock() = Some(desc);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.candidate.contains(REJECTED_MARKER) {
            return Err(Error::candidate_rejected(candidate.candidate));
        }
        self.applied_candidates.lock().push(candidate);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    async fn add_stream(&self, stream: &Stream) -> Result<()> {
        self.streams.lock().push(stream.label().to_string());
        Ok(())
    }

    async fn remove_stream(&self, label: &str) -> Result<()> {
        self.streams.lock().retain(|l| l != label);
        Ok(())
    }

    fn set_bitrate(&self, hint: BitrateHint) {
        *self.bitrate.lock() = Some(hint);
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnectionFactory {
    behavior: FakeBehavior,
    created: AtomicUsize,
    connections: Mutex<HashMap<String, Arc<FakeConnection>>>,
    pub last_ice_servers: Mutex<Vec<IceServerDescriptor>>,
}

impl FakeConnectionFactory {
    pub fn with_behavior(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            ..Default::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn connection(&self, peer_id: &str) -> Option<Arc<FakeConnection>> {
        self.connections.lock().get(peer_id).cloned()
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn create_connection(
        &self,
        peer_id: &str,
        ice_servers: &[IceServerDescriptor],
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Arc<dyn PeerConnection>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.last_ice_servers.lock() = ice_servers.to_vec();
        let conn = Arc::new(FakeConnection {
            peer_id: peer_id.to_string(),
            behavior: self.behavior.clone(),
            events,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            applied_candidates: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            bitrate: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.connections
            .lock()
            .insert(peer_id.to_string(), conn.clone());
        Ok(conn)
    }
}

pub struct FakeTrack {
    id: String,
    kind: TrackKind,
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }
}

#[derive(Default)]
pub struct FakeTrackFactory {
    constructed: AtomicUsize,
    failing: Mutex<Vec<String>>,
    build_delay: Mutex<Duration>,
    pub constraints_seen: Mutex<Vec<(String, String)>>,
}

impl FakeTrackFactory {
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    /// Track creation for `source_id` fails from now on.
    pub fn fail_source(&self, source_id: &str) {
        self.failing.lock().push(source_id.to_string());
    }

    /// Every track creation blocks the calling thread for `delay`.
    pub fn slow_down(&self, delay: Duration) {
        *self.build_delay.lock() = delay;
    }
}

impl TrackFactory for FakeTrackFactory {
    fn create_track(&self, spec: &TrackSpec<'_>) -> Result<Arc<dyn MediaTrack>> {
        let delay = *self.build_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.failing.lock().iter().any(|s| s == spec.source_id) {
            return Err(Error::stream_construction(format!(
                "capture device {} unavailable",
                spec.source_id
            )));
        }
        self.constructed.fetch_add(1, Ordering::SeqCst);
        self.constraints_seen.lock().extend(
            spec.constraints
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Ok(Arc::new(FakeTrack {
            id: spec.track_id.to_string(),
            kind: spec.kind,
        }))
    }
}

#[derive(Default)]
pub struct Recorder {
    pub candidates: Mutex<Vec<(String, IceCandidate)>>,
    pub descriptions: Mutex<Vec<(String, SessionDescription)>>,
}

impl SessionObserver for Recorder {
    fn on_ice_candidate(&self, peer_id: &str, candidate: &IceCandidate) {
        self.candidates
            .lock()
            .push((peer_id.to_string(), candidate.clone()));
    }

    fn on_local_description(&self, peer_id: &str, description: &SessionDescription) {
        self.descriptions
            .lock()
            .push((peer_id.to_string(), description.clone()));
    }
}

/// `eth0` at 192.168.1.1/24.
pub fn lan_resolver() -> IceServerResolver {
    IceServerResolver::new(Arc::new(StaticInterfaces(vec![InterfaceAddr {
        name: "eth0".into(),
        addr: Ipv4Addr::new(192, 168, 1, 1),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
    }])))
}

pub fn test_config() -> ManagerConfig {
    ManagerConfig::default()
        .with_ice_servers(["stun:0.0.0.0:3478", "turn:user:pass@turn.example.com:3478"])
        .with_negotiation_timeout(Duration::from_secs(2))
}

pub struct Fixture {
    pub manager: Arc<PeerConnectionManager>,
    pub connections: Arc<FakeConnectionFactory>,
    pub tracks: Arc<FakeTrackFactory>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(test_config(), FakeBehavior::default())
    }

    pub fn with(config: ManagerConfig, behavior: FakeBehavior) -> Self {
        let connections = Arc::new(FakeConnectionFactory::with_behavior(behavior));
        let tracks = Arc::new(FakeTrackFactory::default());
        let manager = Arc::new(PeerConnectionManager::with_resolver(
            config,
            connections.clone(),
            tracks.clone(),
            lan_resolver(),
        ));
        Self {
            manager,
            connections,
            tracks,
        }
    }
}
