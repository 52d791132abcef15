//! Offer/answer flows on top of the session and stream registries.
//!
//! Every step that waits on the connection layer is bounded by the
//! configured negotiation timeout and cut short when the session is hung
//! up, in which case the caller sees `SessionNotFound`.

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::ice::IceServerResolver;
use crate::logger;
use crate::peer::connection::{
    BitrateHint, ConnectionEvents, ConnectionFactory, PeerConnection, TrackFactory,
};
use crate::peer::state::NegotiationState;
use crate::peer::types::{IceCandidate, SdpType, SessionDescription};
use crate::session::{Session, SessionEvents, SessionRegistry};
use crate::stream::{Stream, StreamOptions, StreamSource};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runs `fut` bounded by `limit` and by the session's hang-up. A hang-up
/// wins over a timeout or a result that arrives after it.
async fn bounded_by<T, F>(limit: Duration, session: &Session, step: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = session.closed() => {
            debug!("{} for {} interrupted by hang-up", step, session.peer_id());
            Err(Error::session_not_found(session.peer_id()))
        }
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(res) => {
                session.ensure_open()?;
                res
            }
            Err(_) => {
                warn!("{} for {} timed out after {:?}", step, session.peer_id(), limit);
                Err(Error::timeout(format!(
                    "{step} for {} after {:?}",
                    session.peer_id(),
                    limit
                )))
            }
        },
    }
}

pub struct SessionNegotiator {
    sessions: Arc<SessionRegistry>,
    connections: Arc<dyn ConnectionFactory>,
    tracks: Arc<dyn TrackFactory>,
    resolver: IceServerResolver,
    ice_servers: Vec<String>,
    source: StreamSource,
    timeout: Duration,
}

impl SessionNegotiator {
    pub fn new(
        config: &ManagerConfig,
        sessions: Arc<SessionRegistry>,
        connections: Arc<dyn ConnectionFactory>,
        tracks: Arc<dyn TrackFactory>,
        resolver: IceServerResolver,
    ) -> Self {
        Self {
            sessions,
            connections,
            tracks,
            resolver,
            ice_servers: config.ice_servers.clone(),
            source: StreamSource {
                video: config.video_source.clone(),
                audio: config.audio_source.clone(),
            },
            timeout: config.negotiation_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T, F>(&self, session: &Session, step: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        bounded_by(self.timeout, session, step, fut).await
    }

    /// The session's connection, created on first use.
    async fn connection(&self, session: &Arc<Session>) -> Result<Arc<dyn PeerConnection>> {
        if let Some(conn) = session.connection() {
            session.ensure_open()?;
            return Ok(conn);
        }

        let events: Arc<dyn ConnectionEvents> = Arc::new(SessionEvents::new(session));
        let servers = self.resolver.resolve_all(&self.ice_servers, None);
        let factory = self.connections.clone();
        let peer_id = session.peer_id().to_string();

        let res = self
            .bounded(
                session,
                "create connection",
                session.connection_or_init(|| async move {
                    info!("creating peer connection for {}", peer_id);
                    factory.create_connection(&peer_id, &servers, events).await
                }),
            )
            .await;

        if matches!(&res, Err(e) if e.is_session_not_found()) {
            // hung up while the connection was being created
            if let Some(conn) = session.connection() {
                if let Err(e) = conn.close().await {
                    warn!("closing orphaned connection for {} failed: {}", session.peer_id(), e);
                }
            }
        }
        res
    }

    /// Applies the bitrate hint and attaches the stream `options` select.
    async fn attach_stream(
        &self,
        session: &Arc<Session>,
        conn: &Arc<dyn PeerConnection>,
        options: &StreamOptions,
    ) -> Result<()> {
        if let Some(bps) = options.bitrate() {
            let hint = BitrateHint::from_target(bps);
            info!(
                "session {}: bitrate min={} current={} max={}",
                session.peer_id(),
                hint.min_bps,
                hint.current_bps,
                hint.max_bps
            );
            conn.set_bitrate(hint);
        }

        let label = self.source.label(options);
        let (stream, added) = self.sessions.attach_stream(session, &label, |l| {
            Stream::build(l, &self.source, options, self.tracks.as_ref())
        })?;
        if !added {
            debug!("session {}: stream {} already attached", session.peer_id(), label);
            return Ok(());
        }

        if let Err(e) = self.bounded(session, "add stream", conn.add_stream(&stream)).await {
            warn!("session {}: adding stream {} failed: {}", session.peer_id(), label, e);
            self.sessions.detach_stream(session, &label);
            return Err(e);
        }
        Ok(())
    }

    /// Sets the local description and returns what the connection reports
    /// back, which may include candidates gathered meanwhile.
    async fn commit_local(
        &self,
        session: &Arc<Session>,
        conn: &Arc<dyn PeerConnection>,
        desc: SessionDescription,
    ) -> Result<SessionDescription> {
        self.bounded(
            session,
            "set local description",
            conn.set_local_description(desc.clone()),
        )
        .await?;
        let local = self
            .bounded(session, "read local description", async {
                Ok(conn.local_description().await)
            })
            .await?
            .unwrap_or(desc);
        session.record_local_description(local.clone())?;
        Ok(local)
    }

    /// Sets the remote description and applies candidates that arrived
    /// early. Once the set completes the connection is asked for its remote
    /// description a single time; if it has none the step fails with
    /// `NegotiationTimeout` right away.
    async fn commit_remote(
        &self,
        session: &Arc<Session>,
        conn: &Arc<dyn PeerConnection>,
        desc: SessionDescription,
    ) -> Result<()> {
        self.bounded(
            session,
            "set remote description",
            conn.set_remote_description(desc.clone()),
        )
        .await?;

        let acknowledged = self
            .bounded(session, "read remote description", async {
                Ok(conn.remote_description().await)
            })
            .await?;
        if acknowledged.is_none() {
            return Err(Error::timeout(format!(
                "remote description for {} was never acknowledged",
                session.peer_id()
            )));
        }

        let pending = session.record_remote_description(desc)?;
        if !pending.is_empty() {
            debug!("session {}: applying {} queued candidates", session.peer_id(), pending.len());
        }
        for candidate in pending {
            let res = self
                .bounded(session, "add queued candidate", conn.add_ice_candidate(candidate.clone()))
                .await;
            match res {
                Ok(()) => logger::dump_candidate("REMOTE", &candidate),
                Err(e) if e.is_session_not_found() => return Err(e),
                Err(e) => warn!("session {}: queued candidate failed: {}", session.peer_id(), e),
            }
        }
        Ok(())
    }

    /// Undoes a failed first negotiation: a session this call created is
    /// removed again, together with its connection and streams.
    async fn abandon(&self, session: &Arc<Session>, created: bool, err: Error) -> Error {
        if created && self.sessions.discard(session).await {
            info!("session {}: removed after failed negotiation: {}", session.peer_id(), err);
        }
        err
    }

    /// Creates (or reuses) the session and produces a local offer carrying
    /// the stream selected by `options`.
    pub async fn create_offer(&self, peer_id: &str, options: &str) -> Result<SessionDescription> {
        let options = StreamOptions::parse(options);
        let (session, created) = self.sessions.open(peer_id, None)?;

        let res = async {
            session.transition(NegotiationState::Offering)?;
            let conn = self.connection(&session).await?;
            self.attach_stream(&session, &conn, &options).await?;

            let offer = self
                .bounded(&session, "create offer", conn.create_offer())
                .await?;
            self.commit_local(&session, &conn, offer).await
        }
        .await;

        match res {
            Ok(local) => {
                info!("session {}: offer ready ({})", peer_id, session.state());
                Ok(local)
            }
            Err(e) => Err(self.abandon(&session, created, e).await),
        }
    }

    /// Applies a remote offer and produces the local answer.
    pub async fn accept_offer(
        &self,
        peer_id: &str,
        offer: SessionDescription,
        options: &str,
    ) -> Result<SessionDescription> {
        offer.validate()?;
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::malformed(format!(
                "expected an offer, got {}",
                offer.sdp_type
            )));
        }
        self.connections.check_description(&offer)?;
        let options = StreamOptions::parse(options);

        let (session, created) = self.sessions.open(peer_id, None)?;

        let res = async {
            session.transition(NegotiationState::Answering)?;
            let conn = self.connection(&session).await?;
            self.commit_remote(&session, &conn, offer).await?;
            self.attach_stream(&session, &conn, &options).await?;

            let answer = self
                .bounded(&session, "create answer", conn.create_answer())
                .await?;
            self.commit_local(&session, &conn, answer).await
        }
        .await;

        match res {
            Ok(local) => {
                info!("session {}: answer ready ({})", peer_id, session.state());
                Ok(local)
            }
            Err(e) => Err(self.abandon(&session, created, e).await),
        }
    }

    /// Applies a remote description to an existing session.
    pub async fn set_remote_description(
        &self,
        peer_id: &str,
        desc: SessionDescription,
    ) -> Result<()> {
        desc.validate()?;
        self.connections.check_description(&desc)?;
        let session = self.sessions.require(peer_id)?;
        let kind = desc.sdp_type;
        let conn = self.connection(&session).await?;
        self.commit_remote(&session, &conn, desc).await?;
        info!("session {}: remote {} applied ({})", peer_id, kind, session.state());
        Ok(())
    }

    /// Applies a remote candidate, or queues it until the remote
    /// description is known.
    pub async fn add_ice_candidate(&self, peer_id: &str, candidate: IceCandidate) -> Result<()> {
        candidate.validate()?;
        let session = self.sessions.require(peer_id)?;

        let Some(candidate) = session.queue_remote_candidate(candidate)? else {
            return Ok(());
        };
        let conn = self.connection(&session).await?;

        let res = self
            .bounded(&session, "add ice candidate", conn.add_ice_candidate(candidate.clone()))
            .await;
        match res {
            Ok(()) => {
                logger::dump_candidate("REMOTE", &candidate);
                Ok(())
            }
            Err(Error::Transport(msg)) => Err(Error::candidate_rejected(msg)),
            Err(e) => Err(e),
        }
    }

    /// Locally gathered candidates buffered for a polling session.
    pub fn list_ice_candidates(&self, peer_id: &str) -> Result<Vec<IceCandidate>> {
        let session = self.sessions.require(peer_id)?;
        let candidates = session.ice_candidates();
        logger::analyze_candidates(peer_id, &candidates);
        Ok(candidates)
    }

    /// Attaches the stream `options` select to an established session.
    pub async fn start_streaming(&self, peer_id: &str, options: &str) -> Result<()> {
        let options = StreamOptions::parse(options);
        let session = self.sessions.require(peer_id)?;
        let conn = self.connection(&session).await?;
        self.attach_stream(&session, &conn, &options).await
    }

    /// Detaches every stream from the session. Returns the labels that
    /// were released from the stream table.
    pub async fn stop_streaming(&self, peer_id: &str) -> Result<BTreeSet<String>> {
        let session = self.sessions.require(peer_id)?;
        let (detached, evicted) = self.sessions.detach_streams(&session)?;
        if let Some(conn) = session.connection() {
            for label in &detached {
                if let Err(e) = conn.remove_stream(label).await {
                    warn!("session {}: removing stream {} failed: {}", peer_id, label, e);
                }
            }
        }
        info!(
            "session {}: streaming stopped ({} detached, {} released)",
            peer_id,
            detached.len(),
            evicted.len()
        );
        Ok(evicted)
    }

    pub async fn hang_up(&self, peer_id: &str) -> bool {
        self.sessions.remove(peer_id).await
    }
}
