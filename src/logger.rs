use crate::peer::types::IceCandidate;
use tracing::{debug, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

/// Timestamp format of every log line.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn logging_enabled() -> bool {
    // in debug builds dev::ENABLE_LOGGING can switch it off as well
    crate::config::LOGGING_ENABLED && crate::config::dev::ENABLE_LOGGING
}

/// Installs the global subscriber. `RUST_LOG` overrides `default_level`.
///
/// Returns false when logging is disabled for this build or a subscriber
/// was already installed.
pub fn init_with_default(default_level: &str) -> bool {
    if !logging_enabled() {
        return false;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_target(true)
        .try_init()
        .is_ok()
}

pub fn init() -> bool {
    init_with_default("info")
}

/// Trickle trace of one candidate.
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index
    );
}

/// Candidate counts by type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateMix {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

pub fn candidate_mix(candidates: &[IceCandidate]) -> CandidateMix {
    let mut mix = CandidateMix::default();
    for c in candidates {
        match c.candidate_type() {
            Some("host") => mix.host += 1,
            Some("srflx") => mix.srflx += 1,
            Some("relay") => mix.relay += 1,
            _ => mix.other += 1,
        }
    }
    mix
}

pub fn analyze_candidates(peer_id: &str, candidates: &[IceCandidate]) -> CandidateMix {
    let mix = candidate_mix(candidates);
    debug!(
        "{}: candidate analysis: {} host, {} srflx, {} relay",
        peer_id, mix.host, mix.srflx, mix.relay
    );
    if !candidates.is_empty() && mix.relay == 0 {
        warn!("{}: no TURN relay candidates, connection through NAT may fail", peer_id);
    }
    mix
}
