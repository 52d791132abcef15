pub mod connection;
pub mod rtc;
pub mod state;
pub mod types;

pub use connection::{
    BitrateHint, ConnectionEvents, ConnectionFactory, MediaTrack, PeerConnection, TrackFactory,
    TrackKind, TrackSpec,
};
pub use rtc::{RtcConnectionFactory, RtcPeerConnection, RtcTrack, RtcTrackFactory};
pub use state::NegotiationState;
pub use types::{IceCandidate, SdpType, SessionDescription};
