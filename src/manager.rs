//! Entry point for the signaling layer.
//!
//! One manager owns the session and stream registries for its lifetime.
//! Call [`PeerConnectionManager::shutdown`] before dropping it so every
//! connection is closed.

use crate::config::ManagerConfig;
use crate::error::Result;
use crate::ice::{IceServerResolver, IceServersResponse};
use crate::negotiator::SessionNegotiator;
use crate::peer::connection::{ConnectionFactory, TrackFactory};
use crate::peer::rtc::{RtcConnectionFactory, RtcTrackFactory};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::{Session, SessionObserver, SessionRegistry, SessionSummary};
use crate::stream::{StreamRegistry, StreamSummary};
use serde_json::Value;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

pub struct PeerConnectionManager {
    config: ManagerConfig,
    sessions: Arc<SessionRegistry>,
    streams: Arc<StreamRegistry>,
    resolver: IceServerResolver,
    negotiator: SessionNegotiator,
}

impl PeerConnectionManager {
    /// Uses the host's interfaces for wildcard ICE hosts.
    pub fn new(
        config: ManagerConfig,
        connections: Arc<dyn ConnectionFactory>,
        tracks: Arc<dyn TrackFactory>,
    ) -> Self {
        Self::with_resolver(config, connections, tracks, IceServerResolver::default())
    }

    pub fn with_resolver(
        config: ManagerConfig,
        connections: Arc<dyn ConnectionFactory>,
        tracks: Arc<dyn TrackFactory>,
        resolver: IceServerResolver,
    ) -> Self {
        let streams = Arc::new(StreamRegistry::new());
        let sessions = Arc::new(SessionRegistry::new(streams.clone()));
        let negotiator = SessionNegotiator::new(
            &config,
            sessions.clone(),
            connections,
            tracks,
            resolver.clone(),
        );
        info!(
            "peer connection manager started ({} ice servers, video source {}, timeout {:?})",
            config.ice_servers.len(),
            config.video_source,
            config.negotiation_timeout()
        );
        Self {
            config,
            sessions,
            streams,
            resolver,
            negotiator,
        }
    }

    /// Backed by webrtc-rs connections and sample tracks.
    pub fn with_webrtc(config: ManagerConfig) -> Result<Self> {
        let connections = Arc::new(RtcConnectionFactory::new()?);
        Ok(Self::new(config, connections, Arc::new(RtcTrackFactory)))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Registers `peer_id` (idempotent). With an observer, candidates and
    /// local descriptions are pushed to it instead of being buffered.
    /// Fails with `SessionNotFound` after [`shutdown`](Self::shutdown).
    pub fn create_session(
        &self,
        peer_id: &str,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> Result<Arc<Session>> {
        self.sessions.create_or_get_with(peer_id, observer)
    }

    pub fn session(&self, peer_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(peer_id)
    }

    pub async fn create_offer(&self, peer_id: &str, options: &str) -> Result<SessionDescription> {
        self.negotiator.create_offer(peer_id, options).await
    }

    pub async fn accept_offer(
        &self,
        peer_id: &str,
        offer: SessionDescription,
        options: &str,
    ) -> Result<SessionDescription> {
        self.negotiator.accept_offer(peer_id, offer, options).await
    }

    /// [`accept_offer`](Self::accept_offer) for a raw signaling record.
    pub async fn accept_offer_json(
        &self,
        peer_id: &str,
        offer: &Value,
        options: &str,
    ) -> Result<Value> {
        let offer = SessionDescription::from_json(offer)?;
        let answer = self.accept_offer(peer_id, offer, options).await?;
        Ok(answer.to_json())
    }

    pub async fn set_remote_description(
        &self,
        peer_id: &str,
        desc: SessionDescription,
    ) -> Result<()> {
        self.negotiator.set_remote_description(peer_id, desc).await
    }

    pub async fn set_remote_description_json(&self, peer_id: &str, desc: &Value) -> Result<()> {
        let desc = SessionDescription::from_json(desc)?;
        self.set_remote_description(peer_id, desc).await
    }

    pub async fn add_ice_candidate(&self, peer_id: &str, candidate: IceCandidate) -> Result<()> {
        self.negotiator.add_ice_candidate(peer_id, candidate).await
    }

    pub async fn add_ice_candidate_json(&self, peer_id: &str, candidate: &Value) -> Result<()> {
        let candidate = IceCandidate::from_json(candidate)?;
        self.add_ice_candidate(peer_id, candidate).await
    }

    pub fn list_ice_candidates(&self, peer_id: &str) -> Result<Vec<IceCandidate>> {
        self.negotiator.list_ice_candidates(peer_id)
    }

    pub async fn start_streaming(&self, peer_id: &str, options: &str) -> Result<()> {
        self.negotiator.start_streaming(peer_id, options).await
    }

    pub async fn stop_streaming(&self, peer_id: &str) -> Result<BTreeSet<String>> {
        self.negotiator.stop_streaming(peer_id).await
    }

    /// Returns false when `peer_id` had no session.
    pub async fn hang_up(&self, peer_id: &str) -> bool {
        self.negotiator.hang_up(peer_id).await
    }

    pub fn get_ice_servers(&self, client: Option<IpAddr>) -> IceServersResponse {
        self.resolver.response(&self.config.ice_servers, client)
    }

    pub fn get_stream_list(&self) -> Vec<StreamSummary> {
        self.streams
            .labels()
            .iter()
            .filter_map(|label| self.streams.get(label))
            .map(|s| s.summary())
            .collect()
    }

    pub fn get_session_list(&self) -> Vec<SessionSummary> {
        self.sessions.list()
    }

    /// Hangs up every session, including ones still negotiating, and
    /// refuses new ones. Returns how many were removed.
    pub async fn shutdown(&self) -> usize {
        let removed = self.sessions.shutdown().await;
        info!("peer connection manager stopped, {} sessions removed", removed);
        removed
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        let left = self.sessions.len();
        if left > 0 {
            warn!("peer connection manager dropped with {} live sessions", left);
        }
    }
}
