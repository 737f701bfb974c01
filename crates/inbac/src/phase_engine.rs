//! Per-transaction state machine for the two-phase vote exchange, its
//! deliver shortcuts, and the help protocol.
//!
//! The engine is pure: it consumes [`EngineEvent`]s and returns
//! [`EngineRequest`]s for the manager to execute (sends, timer arming, the
//! rescue election, and the final decision). All IO and all randomness live
//! in the manager.

#[cfg(test)]
#[path = "phase_engine_test.rs"]
mod phase_engine_test;

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::messages::InbacMessage;
use crate::types::{InbacId, Rank, RankSet, Role};
use crate::vote_collector::{HelpCollection, Report, ReportCollection, VoteCollection};

/// Protocol phase. Monotonically non-decreasing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Phase {
    /// Phase 0: first-phase vote exchange.
    Votes,
    /// Phase 1: backup report exchange.
    Reports,
    /// Phase 2: decided, or handed over to the rescue election.
    Closed,
}

/// The two per-instance one-shot timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// t0: closes the vote exchange.
    Vote,
    /// t1: closes the report exchange.
    Report,
}

/// Lifecycle of a one-shot timer whose body may be run early by a deliver
/// shortcut. The scheduled firing still arrives afterwards; the instance may
/// only be destroyed once no firing is outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerState {
    Unarmed,
    Armed,
    /// A shortcut ran the body; the scheduled firing is still in flight.
    FiredEarly,
    /// The scheduled firing arrived; nothing outstanding.
    FiredLate,
}

impl TimerState {
    /// Whether no scheduled firing can still reach this timer.
    pub(crate) fn quiescent(&self) -> bool {
        matches!(self, TimerState::Unarmed | TimerState::FiredLate)
    }
}

/// Events driving the engine.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum EngineEvent {
    /// The host hands in the local vote.
    Propose(bool),
    /// A first-phase vote from a peer.
    Vote { owner: Rank, vote: bool },
    /// A second-phase report from a peer.
    Report { owner: Rank, owners: RankSet, vote: bool, all: bool },
    /// A peer in help mode asks for our vote collection.
    HelpRequest { from: Rank },
    /// A follower's answer to our help request.
    HelpResponse { owners: RankSet, vote: bool },
    /// A scheduled timer fired.
    Timeout(TimerKind),
    /// The rescue election decided the outcome.
    ElectionDecided(bool),
}

/// Requests the engine sends to the manager for execution.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum EngineRequest {
    /// Send a protocol message to the peer at `to`.
    Send { to: Rank, message: InbacMessage },
    /// Arm a one-shot timer.
    Schedule { kind: TimerKind, after: Duration },
    /// Invoke the rescue election with the given proposal.
    StartElection { proposal: bool },
    /// The outcome is decided; apply the commit callback.
    Decide(bool),
}

/// The per-participant INBAC state machine for one transaction.
#[derive(Debug)]
pub(crate) struct PhaseEngine {
    id: InbacId,
    rank: Rank,
    n: u32,
    f: u32,
    msg_delay: Duration,

    phase: Phase,
    val: bool,
    votes: VoteCollection,
    reports: ReportCollection,
    help: HelpCollection,
    vote_timer: TimerState,
    report_timer: TimerState,
    waiting: bool,
    proposed: bool,
    decided: bool,
    decision: Option<bool>,
}

impl PhaseEngine {
    /// `f` must already be clamped to `min(max_crashed, n - 1)`.
    pub(crate) fn new(id: InbacId, rank: Rank, n: u32, f: u32, msg_delay: Duration) -> Self {
        assert!(rank < n, "local rank must be a member of the server set");
        assert!(f < n, "crash bound must leave at least one participant");
        Self {
            id,
            rank,
            n,
            f,
            msg_delay,
            phase: Phase::Votes,
            val: false,
            votes: VoteCollection::new(),
            reports: ReportCollection::new(f),
            help: HelpCollection::new(),
            vote_timer: TimerState::Unarmed,
            report_timer: TimerState::Unarmed,
            waiting: false,
            proposed: false,
            decided: false,
            decision: None,
        }
    }

    pub(crate) fn role(&self) -> Role {
        Role::of(self.rank, self.f)
    }

    pub(crate) fn decision(&self) -> Option<bool> {
        self.decision
    }

    /// The instance may be destroyed only once the outcome was delivered and
    /// neither timer has a firing still in flight.
    pub(crate) fn is_deletable(&self) -> bool {
        self.decided && self.vote_timer.quiescent() && self.report_timer.quiescent()
    }

    /// Process one event. Returns requests for the manager to execute, in
    /// order.
    pub(crate) fn handle_event(&mut self, event: EngineEvent) -> VecDeque<EngineRequest> {
        trace!(id = self.id, rank = self.rank, "processing event: {:?}", event);
        match event {
            EngineEvent::Propose(vote) => self.handle_propose(vote),
            EngineEvent::Vote { owner, vote } => self.handle_vote(owner, vote),
            EngineEvent::Report { owner, owners, vote, all } => {
                self.handle_report(owner, owners, vote, all)
            }
            EngineEvent::HelpRequest { from } => self.handle_help_request(from),
            EngineEvent::HelpResponse { owners, vote } => self.handle_help_response(owners, vote),
            EngineEvent::Timeout(kind) => self.handle_timeout(kind),
            EngineEvent::ElectionDecided(vote) => self.decide(vote),
        }
    }

    fn handle_propose(&mut self, vote: bool) -> VecDeque<EngineRequest> {
        assert!(
            self.votes.ranks().is_empty() && !self.decided,
            "propose must be the first event of an instance"
        );
        info!(
            id = self.id,
            rank = self.rank,
            "PROPOSE: vote={vote}, role={:?}, n={}, f={}",
            self.role(),
            self.n,
            self.f
        );
        self.val = vote;
        let mut output = VecDeque::new();
        let message = InbacMessage::Vote { id: self.id, owner: self.rank, vote };
        // Backups broadcast their vote; everyone else sends it to the
        // backups only.
        let fan_out = if self.rank < self.f { self.n } else { self.f };
        for peer in 0..fan_out {
            if peer != self.rank {
                output.push_back(EngineRequest::Send { to: peer, message: message.clone() });
            }
        }
        self.votes.insert(self.rank, vote);
        if self.role() == Role::Follower {
            // Followers skip the vote exchange: one longer timer covers both
            // message delays, and they enter the report phase directly.
            self.phase = Phase::Reports;
            self.report_timer = TimerState::Armed;
            output.push_back(EngineRequest::Schedule {
                kind: TimerKind::Report,
                after: 2 * self.msg_delay,
            });
        } else {
            self.vote_timer = TimerState::Armed;
            output
                .push_back(EngineRequest::Schedule { kind: TimerKind::Vote, after: self.msg_delay });
        }
        output
    }

    fn handle_vote(&mut self, owner: Rank, vote: bool) -> VecDeque<EngineRequest> {
        if self.decided || self.proposed {
            debug!(id = self.id, rank = self.rank, "dropping late vote from {owner}");
            return VecDeque::new();
        }
        self.votes.insert(owner, vote);
        if self.phase == Phase::Votes
            && self.vote_timer == TimerState::Armed
            && self.vote_complement_full()
        {
            // Waiting longer cannot grow the collection; close the exchange
            // now and let the scheduled firing only unlatch deletion.
            debug!(id = self.id, rank = self.rank, "vote exchange complete, firing t0 early");
            self.vote_timer = TimerState::FiredEarly;
            return self.vote_timer_body();
        }
        VecDeque::new()
    }

    fn vote_complement_full(&self) -> bool {
        match self.role() {
            Role::Backup => self.votes.len() == self.n,
            Role::Coordinator => self.votes.ranks().is_superset_of(RankSet::first(self.f)),
            Role::Follower => false,
        }
    }

    /// Body of t0: broadcast the collected votes and open the report phase.
    fn vote_timer_body(&mut self) -> VecDeque<EngineRequest> {
        if self.decided {
            // A peer's election settled the outcome before our own exchange
            // closed; there is nothing left to broadcast.
            return VecDeque::new();
        }
        let mut output = VecDeque::new();
        let owners = self.votes.ranks();
        let vote = self.votes.conjunction();
        let all = self.votes.len() == self.n;
        let message =
            InbacMessage::Report { id: self.id, owner: self.rank, owners, vote, all };
        for peer in 0..self.n {
            if peer != self.rank {
                output.push_back(EngineRequest::Send { to: peer, message: message.clone() });
            }
        }
        if self.rank < self.f {
            // A backup's own report participates in its decide rule.
            self.reports.insert(Report { reporter: self.rank, owners, vote, all });
        }
        self.phase = Phase::Reports;
        self.report_timer = TimerState::Armed;
        output.push_back(EngineRequest::Schedule { kind: TimerKind::Report, after: self.msg_delay });
        // Reports may already have raced in during the vote exchange.
        if self.report_complement_full() {
            self.report_timer = TimerState::FiredEarly;
            output.extend(self.report_timer_body());
        }
        output
    }

    fn handle_report(
        &mut self,
        owner: Rank,
        owners: RankSet,
        vote: bool,
        all: bool,
    ) -> VecDeque<EngineRequest> {
        if self.decided || self.proposed {
            debug!(id = self.id, rank = self.rank, "dropping late report from {owner}");
            return VecDeque::new();
        }
        let added = self.reports.insert(Report { reporter: owner, owners, vote, all });
        if self.waiting {
            // The fold of t1 already ran; keep the collection in sync so
            // help answers and the decide value reflect this report too.
            if added {
                self.votes.fold_report(owners, vote);
            }
            return self.help_check();
        }
        if self.report_timer == TimerState::Armed && self.report_complement_full() {
            debug!(id = self.id, rank = self.rank, "report exchange complete, firing t1 early");
            self.report_timer = TimerState::FiredEarly;
            return self.report_timer_body();
        }
        VecDeque::new()
    }

    /// Whether every report this role can expect has arrived. Backups also
    /// wait for the coordinator's report; it takes part in their decide rule.
    fn report_complement_full(&self) -> bool {
        match self.role() {
            Role::Backup => {
                self.reports.backup_count() == self.f && self.reports.has_coordinator_report()
            }
            Role::Coordinator | Role::Follower => self.reports.backup_count() == self.f,
        }
    }

    fn handle_timeout(&mut self, kind: TimerKind) -> VecDeque<EngineRequest> {
        let timer = match kind {
            TimerKind::Vote => &mut self.vote_timer,
            TimerKind::Report => &mut self.report_timer,
        };
        match *timer {
            TimerState::Armed => {
                *timer = TimerState::FiredLate;
                match kind {
                    TimerKind::Vote => self.vote_timer_body(),
                    TimerKind::Report => self.report_timer_body(),
                }
            }
            TimerState::FiredEarly => {
                // The body already ran through a shortcut; this firing only
                // releases the deletion gate.
                *timer = TimerState::FiredLate;
                VecDeque::new()
            }
            TimerState::Unarmed | TimerState::FiredLate => {
                warn!(id = self.id, rank = self.rank, "spurious {kind:?} timer firing");
                VecDeque::new()
            }
        }
    }

    /// Body of t1: decide on the fast path, or pick a rescue.
    fn report_timer_body(&mut self) -> VecDeque<EngineRequest> {
        if self.decided || self.proposed {
            return VecDeque::new();
        }
        self.phase = Phase::Closed;
        match self.role() {
            Role::Backup => {
                if self.fast_decision_ready() {
                    let decision = self.fast_decision_value();
                    self.decide(decision)
                } else {
                    self.rescue_from_reports()
                }
            }
            Role::Coordinator | Role::Follower => {
                // Fold every report and the own vote into the collection;
                // help responses are answered from the folded view.
                let folds: Vec<(RankSet, bool)> =
                    self.reports.iter().map(|report| (report.owners, report.vote)).collect();
                for (owners, vote) in folds {
                    self.votes.fold_report(owners, vote);
                }
                self.votes.insert(self.rank, self.val);
                if self.fast_decision_ready() {
                    let decision = self.fast_decision_value();
                    self.decide(decision)
                } else if self.reports.count() >= 1 {
                    self.rescue_from_reports()
                } else {
                    self.enter_help_mode()
                }
            }
        }
    }

    /// The fast-path outcome: the conjunction over the backup reports, each
    /// of which saw every first-phase vote. Degenerates to the own vote when
    /// the crash bound leaves no backups at all.
    fn fast_decision_value(&self) -> bool {
        if self.f == 0 {
            self.val
        } else {
            self.reports.backup_conjunction()
        }
    }

    /// The fast-path decide rule: a full complement of backup reports, each
    /// of which saw every first-phase vote. Backups additionally require the
    /// coordinator's report to cover every backup rank.
    fn fast_decision_ready(&self) -> bool {
        let backups_full =
            self.reports.backup_count() == self.f && self.reports.all_backups_complete();
        match self.role() {
            Role::Backup => backups_full && self.reports.coordinator_covers_backups(),
            Role::Coordinator | Role::Follower => backups_full,
        }
    }

    fn handle_help_request(&mut self, from: Rank) -> VecDeque<EngineRequest> {
        // Answered from any phase; the collection only ever grows, so a late
        // answer is at least as informative as an early one.
        debug!(id = self.id, rank = self.rank, "answering help request from {from}");
        VecDeque::from([EngineRequest::Send {
            to: from,
            message: InbacMessage::HelpResponse {
                id: self.id,
                owners: self.votes.ranks(),
                vote: self.votes.conjunction(),
            },
        }])
    }

    fn handle_help_response(&mut self, owners: RankSet, vote: bool) -> VecDeque<EngineRequest> {
        if !self.waiting {
            debug!(id = self.id, rank = self.rank, "dropping help response, not waiting");
            return VecDeque::new();
        }
        self.help.merge(owners, vote);
        self.help_check()
    }

    fn enter_help_mode(&mut self) -> VecDeque<EngineRequest> {
        info!(id = self.id, rank = self.rank, "HELP: no reports at t1, asking followers");
        self.waiting = true;
        let mut output = VecDeque::new();
        for peer in (self.f + 1)..self.n {
            if peer != self.rank {
                output.push_back(EngineRequest::Send {
                    to: peer,
                    message: InbacMessage::HelpRequest { id: self.id, from: self.rank },
                });
            }
        }
        if self.role() == Role::Coordinator {
            // The coordinator answers its own request: its folded collection
            // counts as one response.
            self.help.merge(self.votes.ranks(), self.votes.conjunction());
        }
        output.extend(self.help_check());
        output
    }

    fn help_check(&mut self) -> VecDeque<EngineRequest> {
        if !self.waiting {
            return VecDeque::new();
        }
        if self.reports.count() + self.help.responses() < self.n - self.f {
            return VecDeque::new();
        }
        self.waiting = false;
        if self.fast_decision_ready() {
            let decision = self.fast_decision_value();
            self.decide(decision)
        } else if self.reports.count() >= 1 {
            self.rescue_from_reports()
        } else {
            self.rescue_from_help()
        }
    }

    /// Rescue with second-phase evidence: propose the conjunction when the
    /// reports jointly cover every participant, otherwise abort is the only
    /// safe proposal.
    fn rescue_from_reports(&mut self) -> VecDeque<EngineRequest> {
        self.proposed = true;
        let covered = self.reports.union().len() == self.n;
        let proposal = if covered { self.reports.conjunction() } else { false };
        info!(
            id = self.id,
            rank = self.rank,
            "RESCUE: election from reports, covered={covered}, proposal={proposal}"
        );
        VecDeque::from([EngineRequest::StartElection { proposal }])
    }

    /// Rescue with help evidence only.
    fn rescue_from_help(&mut self) -> VecDeque<EngineRequest> {
        self.proposed = true;
        let covered = self.help.owners().len() == self.n;
        let proposal = if covered { self.help.conjunction() } else { false };
        info!(
            id = self.id,
            rank = self.rank,
            "RESCUE: election from help responses, covered={covered}, proposal={proposal}"
        );
        VecDeque::from([EngineRequest::StartElection { proposal }])
    }

    /// Idempotent: the first call wins, later calls are absorbed.
    fn decide(&mut self, decision: bool) -> VecDeque<EngineRequest> {
        if self.decided {
            return VecDeque::new();
        }
        self.decided = true;
        self.phase = Phase::Closed;
        self.decision = Some(decision);
        info!(id = self.id, rank = self.rank, "DECISION_REACHED: commit={decision}");
        VecDeque::from([EngineRequest::Decide(decision)])
    }
}
