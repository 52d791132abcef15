//! Per-peer sessions and the registry that owns them.
//!
//! Lock order across the crate:
//! 1. `SessionRegistry::sessions` (table)
//! 2. `StreamRegistry::streams`
//! 3. `Session::inner` (leaf; never held while taking 1 or 2)
//!
//! Streams are built under a per-label slot lock taken with none of the
//! above held. No lock is held across an `.await`.

use crate::error::{Error, Result};
use crate::peer::connection::{ConnectionEvents, PeerConnection};
use crate::peer::state::NegotiationState;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::stream::{Stream, StreamHandle, StreamRegistry, StreamSummary};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

/// Push-style receiver of what a session produces locally.
pub trait SessionObserver: Send + Sync {
    fn on_ice_candidate(&self, peer_id: &str, candidate: &IceCandidate);

    fn on_local_description(&self, _peer_id: &str, _description: &SessionDescription) {}
}

/// How locally gathered candidates reach the signaling peer.
/// Chosen when the session is created.
pub enum CandidateDelivery {
    Push(Arc<dyn SessionObserver>),
    Pull(Vec<IceCandidate>),
}

impl CandidateDelivery {
    pub fn from_observer(observer: Option<Arc<dyn SessionObserver>>) -> Self {
        match observer {
            Some(obs) => CandidateDelivery::Push(obs),
            None => CandidateDelivery::Pull(Vec::new()),
        }
    }

    pub fn is_push(&self) -> bool {
        matches!(self, CandidateDelivery::Push(_))
    }
}

struct SessionInner {
    state: NegotiationState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    delivery: CandidateDelivery,
    stream_labels: BTreeSet<String>,
    /// Remote candidates received before the remote description
    pending_remote: Vec<IceCandidate>,
    gathering_complete: bool,
}

impl SessionInner {
    fn refresh_state(&mut self) {
        let next = match (&self.local_description, &self.remote_description) {
            (Some(_), Some(_)) => NegotiationState::Stable,
            (None, None) => return,
            _ => NegotiationState::Negotiating,
        };
        self.state = self.state.advance(next);
    }
}

/// Negotiation state for one remote peer.
pub struct Session {
    peer_id: String,
    created_at: DateTime<Utc>,
    connection: OnceCell<Arc<dyn PeerConnection>>,
    inner: Mutex<SessionInner>,
    closed_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_id", &self.peer_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(peer_id: &str, delivery: CandidateDelivery) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            peer_id: peer_id.to_string(),
            created_at: Utc::now(),
            connection: OnceCell::new(),
            inner: Mutex::new(SessionInner {
                state: NegotiationState::New,
                local_description: None,
                remote_description: None,
                delivery,
                stream_labels: BTreeSet::new(),
                pending_remote: Vec::new(),
                gathering_complete: false,
            }),
            closed_tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> NegotiationState {
        self.inner.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::session_not_found(&self.peer_id));
        }
        Ok(())
    }

    /// Resolves once the session has been hung up.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().remote_description.clone()
    }

    pub fn stream_labels(&self) -> BTreeSet<String> {
        self.inner.lock().stream_labels.clone()
    }

    pub fn has_stream(&self, label: &str) -> bool {
        self.inner.lock().stream_labels.contains(label)
    }

    /// Locally gathered candidates buffered for polling.
    /// Always empty for sessions with a push observer.
    pub fn ice_candidates(&self) -> Vec<IceCandidate> {
        match &self.inner.lock().delivery {
            CandidateDelivery::Pull(buf) => buf.clone(),
            CandidateDelivery::Push(_) => Vec::new(),
        }
    }

    pub fn gathering_complete(&self) -> bool {
        self.inner.lock().gathering_complete
    }

    pub fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.connection.get().cloned()
    }

    /// Returns the session's connection, creating it with `init` on first use.
    pub(crate) async fn connection_or_init<F, Fut>(&self, init: F) -> Result<Arc<dyn PeerConnection>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn PeerConnection>>>,
    {
        self.connection.get_or_try_init(init).await.cloned()
    }

    /// Moves the state forward. Fails once the session is closed.
    pub(crate) fn transition(&self, next: NegotiationState) -> Result<NegotiationState> {
        let mut inner = self.inner.lock();
        if inner.state.is_closed() {
            return Err(Error::session_not_found(&self.peer_id));
        }
        let prev = inner.state;
        inner.state = prev.advance(next);
        if inner.state != prev {
            debug!("session {}: {} -> {}", self.peer_id, prev, inner.state);
        }
        Ok(inner.state)
    }

    pub(crate) fn record_local_description(&self, desc: SessionDescription) -> Result<()> {
        let observer = {
            let mut inner = self.inner.lock();
            if inner.state.is_closed() {
                return Err(Error::session_not_found(&self.peer_id));
            }
            inner.local_description = Some(desc.clone());
            inner.refresh_state();
            debug!("session {}: local {} set, state {}", self.peer_id, desc.sdp_type, inner.state);
            match &inner.delivery {
                CandidateDelivery::Push(obs) => Some(obs.clone()),
                CandidateDelivery::Pull(_) => None,
            }
        };
        if let Some(obs) = observer {
            obs.on_local_description(&self.peer_id, &desc);
        }
        Ok(())
    }

    /// Records the remote description and hands back the candidates that
    /// were waiting for it, in arrival order.
    pub(crate) fn record_remote_description(&self, desc: SessionDescription) -> Result<Vec<IceCandidate>> {
        let mut inner = self.inner.lock();
        if inner.state.is_closed() {
            return Err(Error::session_not_found(&self.peer_id));
        }
        inner.remote_description = Some(desc);
        inner.refresh_state();
        debug!("session {}: remote description set, state {}", self.peer_id, inner.state);
        Ok(std::mem::take(&mut inner.pending_remote))
    }

    /// Queues `candidate` unless a remote description is already set,
    /// in which case it is handed back to be applied right away.
    pub(crate) fn queue_remote_candidate(&self, candidate: IceCandidate) -> Result<Option<IceCandidate>> {
        let mut inner = self.inner.lock();
        if inner.state.is_closed() {
            return Err(Error::session_not_found(&self.peer_id));
        }
        if inner.remote_description.is_some() {
            return Ok(Some(candidate));
        }
        debug!("session {}: remote description not set yet, queuing candidate", self.peer_id);
        inner.pending_remote.push(candidate);
        Ok(None)
    }

    pub(crate) fn record_local_candidate(&self, candidate: IceCandidate) {
        let observer = {
            let mut inner = self.inner.lock();
            if inner.state.is_closed() {
                return;
            }
            match &mut inner.delivery {
                CandidateDelivery::Push(obs) => Some(obs.clone()),
                CandidateDelivery::Pull(buf) => {
                    buf.push(candidate.clone());
                    debug!("session {}: {} local candidates buffered", self.peer_id, buf.len());
                    None
                }
            }
        };
        if let Some(obs) = observer {
            obs.on_ice_candidate(&self.peer_id, &candidate);
        }
    }

    fn mark_gathering_complete(&self) {
        self.inner.lock().gathering_complete = true;
    }

    /// Returns true when the label was not attached yet.
    fn attach_label(&self, label: &str) -> bool {
        self.inner.lock().stream_labels.insert(label.to_string())
    }

    fn detach_label(&self, label: &str) -> bool {
        self.inner.lock().stream_labels.remove(label)
    }

    fn take_labels(&self) -> BTreeSet<String> {
        std::mem::take(&mut self.inner.lock().stream_labels)
    }

    /// Closes the session and returns the labels it referenced.
    fn close(&self) -> BTreeSet<String> {
        let labels = {
            let mut inner = self.inner.lock();
            inner.state = inner.state.advance(NegotiationState::Closed);
            inner.pending_remote.clear();
            std::mem::take(&mut inner.stream_labels)
        };
        self.closed_tx.send_replace(true);
        labels
    }

    pub fn summary(&self, streams: &StreamRegistry) -> SessionSummary {
        let (state, local_description, labels, candidates) = {
            let inner = self.inner.lock();
            let candidates = match &inner.delivery {
                CandidateDelivery::Pull(buf) => buf.len(),
                CandidateDelivery::Push(_) => 0,
            };
            (
                inner.state,
                inner.local_description.clone(),
                inner.stream_labels.clone(),
                candidates,
            )
        };
        SessionSummary {
            peer_id: self.peer_id.clone(),
            state,
            created_at: self.created_at,
            local_description,
            streams: labels
                .iter()
                .filter_map(|l| streams.get(l))
                .map(|s| s.summary())
                .collect(),
            buffered_candidates: candidates,
        }
    }
}

/// Routes connection events into the session without keeping it alive.
pub(crate) struct SessionEvents {
    session: Weak<Session>,
}

impl SessionEvents {
    pub(crate) fn new(session: &Arc<Session>) -> Self {
        Self {
            session: Arc::downgrade(session),
        }
    }
}

impl ConnectionEvents for SessionEvents {
    fn on_local_candidate(&self, candidate: IceCandidate) {
        if let Some(session) = self.session.upgrade() {
            session.record_local_candidate(candidate);
        }
    }

    fn on_gathering_complete(&self) {
        if let Some(session) = self.session.upgrade() {
            debug!("session {}: candidate gathering complete", session.peer_id());
            session.mark_gathering_complete();
        }
    }
}

/// Diagnostics view of one session.
#[derive(Serialize, Debug, Clone)]
pub struct SessionSummary {
    pub peer_id: String,
    pub state: NegotiationState,
    pub created_at: DateTime<Utc>,
    pub local_description: Option<SessionDescription>,
    pub streams: Vec<StreamSummary>,
    pub buffered_candidates: usize,
}

/// Authoritative peer id -> session table.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    streams: Arc<StreamRegistry>,
    // Written and read under the `sessions` lock.
    shut_down: AtomicBool,
}

impl SessionRegistry {
    pub fn new(streams: Arc<StreamRegistry>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            streams,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Returns the session for `peer_id`, creating a polling one if absent.
    pub fn create_or_get(&self, peer_id: &str) -> Result<Arc<Session>> {
        self.create_or_get_with(peer_id, None)
    }

    /// Like [`create_or_get`](Self::create_or_get); `observer` selects push
    /// delivery for a new session and is ignored for an existing one.
    pub fn create_or_get_with(
        &self,
        peer_id: &str,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> Result<Arc<Session>> {
        self.open(peer_id, observer).map(|(session, _)| session)
    }

    /// Returns the session and whether this call created it. Fails with
    /// `SessionNotFound` once [`shutdown`](Self::shutdown) has started.
    pub fn open(
        &self,
        peer_id: &str,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> Result<(Arc<Session>, bool)> {
        let mut sessions = self.sessions.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            debug!("registry shut down, refusing session {}", peer_id);
            return Err(Error::session_not_found(peer_id));
        }
        if let Some(existing) = sessions.get(peer_id) {
            return Ok((existing.clone(), false));
        }
        let delivery = CandidateDelivery::from_observer(observer);
        info!(
            "creating session {} ({} delivery)",
            peer_id,
            if delivery.is_push() { "push" } else { "pull" }
        );
        let session = Arc::new(Session::new(peer_id, delivery));
        sessions.insert(peer_id.to_string(), session.clone());
        Ok((session, true))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(peer_id).cloned()
    }

    pub fn require(&self, peer_id: &str) -> Result<Arc<Session>> {
        self.get(peer_id)
            .ok_or_else(|| Error::session_not_found(peer_id))
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.sessions.lock().contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// One summary per registered session, ordered by peer id.
    pub fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock();
        let mut list: Vec<SessionSummary> = sessions
            .values()
            .map(|s| s.summary(&self.streams))
            .collect();
        list.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        list
    }

    fn is_registered(table: &HashMap<String, Arc<Session>>, session: &Arc<Session>) -> bool {
        table
            .get(session.peer_id())
            .is_some_and(|s| Arc::ptr_eq(s, session))
    }

    /// Ensures the stream for `label` exists and records that `session`
    /// references it.
    ///
    /// The stream is built without the table lock held. Its claim keeps it
    /// from being evicted until the label is recorded under the table lock.
    /// Returns the stream and whether the label was newly attached.
    pub fn attach_stream<F>(
        &self,
        session: &Arc<Session>,
        label: &str,
        factory: F,
    ) -> Result<(StreamHandle, bool)>
    where
        F: FnOnce(&str) -> Result<Stream>,
    {
        session.ensure_open()?;
        let claim = self.streams.claim(label, factory)?;

        let sessions = self.sessions.lock();
        if !Self::is_registered(&sessions, session) {
            drop(claim);
            let snapshot: Vec<Arc<Session>> = sessions.values().cloned().collect();
            self.streams.release_unreferenced(&snapshot);
            return Err(Error::session_not_found(session.peer_id()));
        }
        let added = session.attach_label(label);
        if added {
            debug!("session {}: attached stream {}", session.peer_id(), label);
        }
        Ok((claim.stream(), added))
    }

    /// Drops one label from `session` and evicts the stream if unused.
    pub fn detach_stream(&self, session: &Arc<Session>, label: &str) -> BTreeSet<String> {
        let sessions = self.sessions.lock();
        if !session.detach_label(label) {
            return BTreeSet::new();
        }
        let snapshot: Vec<Arc<Session>> = sessions.values().cloned().collect();
        self.streams.release_unreferenced(&snapshot)
    }

    /// Drops every label from `session`. Returns (detached, evicted).
    pub fn detach_streams(&self, session: &Arc<Session>) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let sessions = self.sessions.lock();
        if !Self::is_registered(&sessions, session) {
            return Err(Error::session_not_found(session.peer_id()));
        }
        let detached = session.take_labels();
        let snapshot: Vec<Arc<Session>> = sessions.values().cloned().collect();
        let evicted = self.streams.release_unreferenced(&snapshot);
        Ok((detached, evicted))
    }

    /// Unregisters and closes the session, evicting streams nobody else
    /// references. With `expected` set, only that exact session is removed.
    /// Returns the removed session and the labels it held.
    fn unregister(
        &self,
        peer_id: &str,
        expected: Option<&Arc<Session>>,
    ) -> Option<(Arc<Session>, BTreeSet<String>)> {
        let mut sessions = self.sessions.lock();
        if let Some(expected) = expected {
            if !Self::is_registered(&sessions, expected) {
                return None;
            }
        }
        let session = sessions.remove(peer_id)?;
        let labels = session.close();
        let snapshot: Vec<Arc<Session>> = sessions.values().cloned().collect();
        let evicted = self.streams.release_unreferenced(&snapshot);
        info!(
            "removed session {} ({} streams detached, {} released)",
            peer_id,
            labels.len(),
            evicted.len()
        );
        Some((session, labels))
    }

    async fn teardown(session: Arc<Session>, labels: BTreeSet<String>) {
        let Some(conn) = session.connection() else {
            return;
        };
        for label in &labels {
            if let Err(e) = conn.remove_stream(label).await {
                warn!("session {}: removing stream {} failed: {}", session.peer_id(), label, e);
            }
        }
        if let Err(e) = conn.close().await {
            warn!("session {}: closing connection failed: {}", session.peer_id(), e);
        }
    }

    /// Hang-up. In-flight operations on the session fail with
    /// `SessionNotFound`. Returns false when `peer_id` was not registered.
    pub async fn remove(&self, peer_id: &str) -> bool {
        let Some((session, labels)) = self.unregister(peer_id, None) else {
            debug!("remove: no session for {}", peer_id);
            return false;
        };
        Self::teardown(session, labels).await;
        true
    }

    /// Removes `session` if it is still the one registered under its peer
    /// id. A newer session for the same peer is left alone.
    pub async fn discard(&self, session: &Arc<Session>) -> bool {
        let Some((session, labels)) = self.unregister(session.peer_id(), Some(session)) else {
            return false;
        };
        Self::teardown(session, labels).await;
        true
    }

    /// Removes every session and refuses new ones from then on. Returns how
    /// many were removed.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<String> = {
            let sessions = self.sessions.lock();
            self.shut_down.store(true, Ordering::SeqCst);
            sessions.keys().cloned().collect()
        };
        info!("shutting down {} sessions", ids.len());
        let mut removed = 0;
        for id in ids {
            if self.remove(&id).await {
                removed += 1;
            }
        }
        removed
    }
}
