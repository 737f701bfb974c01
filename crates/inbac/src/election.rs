//! Randomized-timeout leader election, the rescue consensus deciding the
//! outcome when the phase engine cannot conclude on its own.
//!
//! One instance exists per rescued transaction, keyed by the transaction id.
//! Instances are also created lazily on the responder side by incoming
//! election traffic; such instances never propose but grant round votes and
//! acknowledge decisions.
//!
//! Like the phase engine this is a pure state machine; the manager executes
//! sends, samples the random round delays, and routes `Decided` back into
//! the local phase engine.

#[cfg(test)]
#[path = "election_test.rs"]
mod election_test;

use std::collections::{HashSet, VecDeque};

use tracing::{debug, info, trace};

use crate::messages::ElectionMessage;
use crate::types::{InbacId, Rank, Round};

/// Events driving an election instance.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ElectionEvent {
    /// A rescue path of the phase engine proposes a value. A second proposal
    /// for the same id is absorbed by the already-running instance.
    Propose(bool),
    /// The random round timer fired.
    RoundTimeout,
    /// A candidate asks for this round's vote.
    VoteRequest { round: Round, from: Rank },
    /// A peer answered our vote request.
    VoteReply { round: Round, granted: bool },
    /// An elected leader broadcast its decision.
    PeerDecision { vote: bool, from: Rank },
    /// A peer acknowledged our decision broadcast.
    DecisionAck,
}

/// Requests an election instance sends to the manager for execution.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ElectionRequest {
    Send { to: Rank, message: ElectionMessage },
    /// Arm the round timer with a fresh uniform sample in [0, consensus_delay).
    ScheduleRound,
    /// The election concluded; deliver the outcome to the phase engine.
    Decided(bool),
}

#[derive(Debug)]
pub(crate) struct Election {
    id: InbacId,
    rank: Rank,
    n: u32,
    max_rounds: u32,

    round: Round,
    vote: bool,
    started: bool,
    acks: u32,
    trying_lead: bool,
    elected: bool,
    done: bool,
    /// Rounds for which this node already granted its vote to a candidate.
    granted: HashSet<Round>,
    decision_acks: u32,
}

impl Election {
    pub(crate) fn new(id: InbacId, rank: Rank, n: u32, max_rounds: u32) -> Self {
        Self {
            id,
            rank,
            n,
            max_rounds,
            round: 0,
            vote: false,
            started: false,
            acks: 0,
            trying_lead: false,
            elected: false,
            done: false,
            granted: HashSet::new(),
            decision_acks: 0,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    /// Whether nothing is left for this instance to do: the outcome is out
    /// and, if we led, every peer acknowledged the broadcast.
    pub(crate) fn can_delete(&self) -> bool {
        self.done && (!self.elected || self.decision_acks + 1 >= self.n)
    }

    pub(crate) fn handle_event(&mut self, event: ElectionEvent) -> VecDeque<ElectionRequest> {
        trace!(id = self.id, rank = self.rank, "processing election event: {:?}", event);
        match event {
            ElectionEvent::Propose(vote) => self.handle_propose(vote),
            ElectionEvent::RoundTimeout => self.handle_round_timeout(),
            ElectionEvent::VoteRequest { round, from } => self.handle_vote_request(round, from),
            ElectionEvent::VoteReply { round, granted } => self.handle_vote_reply(round, granted),
            ElectionEvent::PeerDecision { vote, from } => self.handle_peer_decision(vote, from),
            ElectionEvent::DecisionAck => self.handle_decision_ack(),
        }
    }

    fn handle_propose(&mut self, vote: bool) -> VecDeque<ElectionRequest> {
        if self.started {
            // A second rescue path fired for the same transaction; the
            // running election already covers it.
            debug!(id = self.id, rank = self.rank, "election already started, ignoring proposal");
            return VecDeque::new();
        }
        info!(id = self.id, rank = self.rank, "ELECTION: propose commit={vote}");
        self.started = true;
        self.vote = vote;
        VecDeque::from([ElectionRequest::ScheduleRound])
    }

    fn handle_round_timeout(&mut self) -> VecDeque<ElectionRequest> {
        if self.done {
            return VecDeque::new();
        }
        if self.round >= self.max_rounds {
            // Liveness fallback: give up on electing with the real proposal
            // and force the safe outcome.
            info!(id = self.id, rank = self.rank, "ELECTION: round cap reached, forcing abort");
            self.vote = false;
            return self.lead();
        }
        self.round += 1;
        self.acks = 0;
        self.trying_lead = true;
        // The candidate's own round vote goes to itself; the majority tally
        // counts it as the implicit +1.
        self.granted.insert(self.round);
        debug!(id = self.id, rank = self.rank, round = self.round, "asking for election votes");
        let mut output = VecDeque::new();
        for peer in 0..self.n {
            if peer != self.rank {
                output.push_back(ElectionRequest::Send {
                    to: peer,
                    message: ElectionMessage::VoteRequest {
                        id: self.id,
                        round: self.round,
                        from: self.rank,
                    },
                });
            }
        }
        output.push_back(ElectionRequest::ScheduleRound);
        output
    }

    fn handle_vote_request(&mut self, round: Round, from: Rank) -> VecDeque<ElectionRequest> {
        if self.done {
            // A laggard candidate missed the outcome; deny and repeat the
            // decision so it defers instead of racing on.
            return VecDeque::from([
                ElectionRequest::Send {
                    to: from,
                    message: ElectionMessage::VoteReply { id: self.id, round, granted: false },
                },
                ElectionRequest::Send {
                    to: from,
                    message: ElectionMessage::Decision {
                        id: self.id,
                        vote: self.vote,
                        from: self.rank,
                    },
                },
            ]);
        }
        // At most one grant per round, regardless of the candidate.
        let granted = self.granted.insert(round);
        VecDeque::from([ElectionRequest::Send {
            to: from,
            message: ElectionMessage::VoteReply { id: self.id, round, granted },
        }])
    }

    fn handle_vote_reply(&mut self, round: Round, granted: bool) -> VecDeque<ElectionRequest> {
        if !granted || self.done || !self.trying_lead || round != self.round {
            return VecDeque::new();
        }
        self.acks += 1;
        // Strict majority, counting our own vote.
        if 2 * (self.acks + 1) > self.n {
            return self.lead();
        }
        VecDeque::new()
    }

    fn handle_peer_decision(&mut self, vote: bool, from: Rank) -> VecDeque<ElectionRequest> {
        let mut output = VecDeque::new();
        if !self.done {
            info!(id = self.id, rank = self.rank, "ELECTION: peer {from} decided commit={vote}");
            self.done = true;
            self.trying_lead = false;
            // Adopt the decided value so later vote requests can be answered
            // with it.
            self.vote = vote;
            output.push_back(ElectionRequest::Decided(vote));
        }
        // Always acknowledged, so every leader of a contended election can
        // complete its tally.
        output.push_back(ElectionRequest::Send {
            to: from,
            message: ElectionMessage::DecisionAck { id: self.id },
        });
        output
    }

    fn handle_decision_ack(&mut self) -> VecDeque<ElectionRequest> {
        self.decision_acks += 1;
        VecDeque::new()
    }

    fn lead(&mut self) -> VecDeque<ElectionRequest> {
        if self.done {
            return VecDeque::new();
        }
        info!(
            id = self.id,
            rank = self.rank,
            round = self.round,
            "ELECTION: elected, deciding commit={}",
            self.vote
        );
        self.done = true;
        self.elected = true;
        self.trying_lead = false;
        let mut output = VecDeque::new();
        let message = ElectionMessage::Decision { id: self.id, vote: self.vote, from: self.rank };
        for peer in 0..self.n {
            if peer != self.rank {
                output.push_back(ElectionRequest::Send { to: peer, message: message.clone() });
            }
        }
        output.push_back(ElectionRequest::Decided(self.vote));
        output
    }
}
