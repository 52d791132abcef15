use serde::Serialize;
use std::fmt;

/// Negotiation progress of one session.
///
/// Variants are ordered: a session only ever moves to a later variant.
/// `Offering`/`Answering` share a rank since either may start a negotiation.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationState {
    /// No description set yet
    New,
    /// Local offer being created
    Offering,
    /// Remote offer received, local answer being created
    Answering,
    /// One description set, waiting for the other side
    Negotiating,
    /// Both descriptions set; candidates still trickle
    Stable,
    /// Hung up; terminal
    Closed,
}

impl NegotiationState {
    fn rank(self) -> u8 {
        match self {
            NegotiationState::New => 0,
            NegotiationState::Offering | NegotiationState::Answering => 1,
            NegotiationState::Negotiating => 2,
            NegotiationState::Stable => 3,
            NegotiationState::Closed => 4,
        }
    }

    /// Returns the state after attempting to move to `next`.
    /// Backward or sideways moves leave the state unchanged.
    pub fn advance(self, next: NegotiationState) -> NegotiationState {
        if next.rank() > self.rank() {
            next
        } else {
            self
        }
    }

    pub fn is_closed(self) -> bool {
        self == NegotiationState::Closed
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::New => "new",
            NegotiationState::Offering => "offering",
            NegotiationState::Answering => "answering",
            NegotiationState::Negotiating => "negotiating",
            NegotiationState::Stable => "stable",
            NegotiationState::Closed => "closed",
        };
        f.write_str(s)
    }
}
