//! Multi-peer WebRTC session manager.
//!
//! Sessions are keyed by a caller supplied peer id and negotiated through
//! [`PeerConnectionManager`]. Outbound streams are shared between sessions
//! asking for the same capture source and options.

pub mod config;
pub mod error;
pub mod ice;
pub mod logger;
pub mod manager;
pub mod negotiator;
pub mod peer;
pub mod session;
pub mod stream;

pub use config::ManagerConfig;
pub use error::{Error, Result};
pub use ice::{IceServerDescriptor, IceServerResolver, IceServersResponse};
pub use manager::PeerConnectionManager;
pub use peer::{IceCandidate, NegotiationState, SdpType, SessionDescription};
pub use session::{CandidateDelivery, Session, SessionObserver, SessionRegistry, SessionSummary};
pub use stream::{label_for, StreamOptions, StreamRegistry, StreamSummary};
