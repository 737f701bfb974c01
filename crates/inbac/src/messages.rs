//! Wire messages exchanged between participants.
//!
//! The host transport carries two RPCs, one for the commit protocol proper
//! and one for the rescue election; both are type-discriminated on the
//! receiving side. Every message carries the transaction id so the receiver
//! can route it to the right instance, or queue it when the instance does
//! not exist yet.

use serde::{Deserialize, Serialize};

use crate::types::{InbacId, Rank, RankSet, Round};

/// Envelope for the two protocol RPCs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Inbac(InbacMessage),
    Election(ElectionMessage),
}

impl WireMessage {
    /// The transaction id this message belongs to.
    pub fn id(&self) -> InbacId {
        match self {
            WireMessage::Inbac(message) => message.id(),
            WireMessage::Election(message) => message.id(),
        }
    }
}

/// Messages of the two-phase vote exchange and the help protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InbacMessage {
    /// A first-phase vote (backup broadcast, or sent to the backups).
    Vote { id: InbacId, owner: Rank, vote: bool },
    /// A second-phase report: the sender's collected first-phase votes.
    /// `vote` is the conjunction over `owners`; `all` is whether the sender
    /// saw every participant's vote.
    Report { id: InbacId, owner: Rank, owners: RankSet, vote: bool, all: bool },
    /// Sent to followers when second-phase reports were insufficient.
    HelpRequest { id: InbacId, from: Rank },
    /// A follower's reply to a help request, carrying its vote collection
    /// and the conjunction over it.
    HelpResponse { id: InbacId, owners: RankSet, vote: bool },
}

impl InbacMessage {
    pub fn id(&self) -> InbacId {
        match self {
            InbacMessage::Vote { id, .. }
            | InbacMessage::Report { id, .. }
            | InbacMessage::HelpRequest { id, .. }
            | InbacMessage::HelpResponse { id, .. } => *id,
        }
    }
}

/// Messages of the randomized-timeout leader election.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionMessage {
    /// A candidate asking for this round's vote.
    VoteRequest { id: InbacId, round: Round, from: Rank },
    /// Reply to a vote request. Carries the round so stale replies from
    /// earlier rounds cannot inflate a later tally.
    VoteReply { id: InbacId, round: Round, granted: bool },
    /// Decision broadcast by the elected leader.
    Decision { id: InbacId, vote: bool, from: Rank },
    /// Acknowledgement of a received decision, sent back to the leader.
    DecisionAck { id: InbacId },
}

impl ElectionMessage {
    pub fn id(&self) -> InbacId {
        match self {
            ElectionMessage::VoteRequest { id, .. }
            | ElectionMessage::VoteReply { id, .. }
            | ElectionMessage::Decision { id, .. }
            | ElectionMessage::DecisionAck { id } => *id,
        }
    }
}
