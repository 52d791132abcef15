//! Interfaces of the transport and capture layers the manager drives.
//!
//! The manager never talks to a concrete peer connection: it asks a
//! [`ConnectionFactory`] for one per session and a [`TrackFactory`] for the
//! outbound tracks of each stream. [`crate::peer::rtc`] provides the
//! webrtc-rs backed implementations.

use crate::error::Result;
use crate::ice::IceServerDescriptor;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::stream::Stream;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use webrtc::track::track_local::TrackLocal;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => f.write_str("video"),
            TrackKind::Audio => f.write_str("audio"),
        }
    }
}

/// An outbound media track produced by the capture layer.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    /// RTP-level track to hand to a webrtc-rs connection, if this track has one.
    fn rtp_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

impl fmt::Debug for dyn MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Everything the capture layer needs to build one track.
#[derive(Debug, Clone, Copy)]
pub struct TrackSpec<'a> {
    pub source_id: &'a str,
    pub kind: TrackKind,
    pub track_id: &'a str,
    /// Wire-level stream id the track is announced under
    pub stream_label: &'a str,
    pub constraints: &'a BTreeMap<String, String>,
}

/// Capture/track factory. Construction may grab hardware, so the stream
/// registry calls it at most once per label.
pub trait TrackFactory: Send + Sync {
    fn create_track(&self, spec: &TrackSpec<'_>) -> Result<Arc<dyn MediaTrack>>;
}

/// Transport bitrate hint derived from a `bitrate=N` stream option.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateHint {
    pub min_bps: u32,
    pub current_bps: u32,
    pub max_bps: u32,
}

impl BitrateHint {
    /// target = N, floor = N/2, ceiling = 2N
    pub fn from_target(bps: u32) -> Self {
        Self {
            min_bps: bps / 2,
            current_bps: bps,
            max_bps: bps.saturating_mul(2),
        }
    }
}

/// Sink for events raised by a connection after creation.
pub trait ConnectionEvents: Send + Sync {
    /// A locally gathered candidate is ready for signaling.
    fn on_local_candidate(&self, candidate: IceCandidate);

    /// Candidate gathering finished.
    fn on_gathering_complete(&self) {}
}

/// One transport-level peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Fails with `CandidateRejected` when the transport declines it.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    async fn add_stream(&self, stream: &Stream) -> Result<()>;

    async fn remove_stream(&self, label: &str) -> Result<()>;

    fn set_bitrate(&self, hint: BitrateHint);

    async fn close(&self) -> Result<()>;
}

/// Builds a connection per session.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(
        &self,
        peer_id: &str,
        ice_servers: &[IceServerDescriptor],
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Arc<dyn PeerConnection>>;

    /// Rejects a description this backend could never apply. Called before
    /// any session is created or touched for it.
    fn check_description(&self, _desc: &SessionDescription) -> Result<()> {
        Ok(())
    }
}
