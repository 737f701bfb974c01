use assert_matches::assert_matches;
use test_case::test_case;

use super::{EngineEvent, EngineRequest, PhaseEngine, TimerKind};
use crate::messages::InbacMessage;
use crate::test_utils::{ranks, report, vote, EngineHarness, MSG_DELAY, TEST_ID};
use crate::types::Role;

// N = 3, F = 1: backups = {0}, coordinator = 1, follower = 2.
const N: u32 = 3;
const F: u32 = 1;

#[test_case(0, Role::Backup; "backup")]
#[test_case(1, Role::Coordinator; "coordinator")]
#[test_case(2, Role::Follower; "follower")]
fn roles_follow_rank(rank: u32, expected: Role) {
    let engine = PhaseEngine::new(TEST_ID, rank, N, F, MSG_DELAY);
    assert_eq!(engine.role(), expected);
}

#[test]
fn backup_fast_path_all_commit() {
    let mut wrapper = EngineHarness::new(0, N, F);
    wrapper.send(EngineEvent::Propose(true));
    // Backups broadcast their vote to everyone.
    assert_matches!(
        wrapper.next_request(),
        Some(EngineRequest::Send {
            to: 1,
            message: InbacMessage::Vote { id: TEST_ID, owner: 0, vote: true },
        })
    );
    assert_matches!(
        wrapper.next_request(),
        Some(EngineRequest::Send {
            to: 2,
            message: InbacMessage::Vote { id: TEST_ID, owner: 0, vote: true },
        })
    );
    assert_matches!(
        wrapper.next_request(),
        Some(EngineRequest::Schedule { kind: TimerKind::Vote, after }) if after == MSG_DELAY
    );
    assert!(wrapper.next_request().is_none());

    wrapper.send(vote(1, true));
    assert!(wrapper.next_request().is_none());
    // The last vote completes the exchange; t0 fires early and the report
    // goes out.
    wrapper.send(vote(2, true));
    let expected_owners = ranks(&[0, 1, 2]);
    for peer in [1, 2] {
        assert_matches!(
            wrapper.next_request(),
            Some(EngineRequest::Send {
                to,
                message: InbacMessage::Report { id: TEST_ID, owner: 0, owners, vote: true, all: true },
            }) if to == peer && owners == expected_owners
        );
    }
    assert_matches!(
        wrapper.next_request(),
        Some(EngineRequest::Schedule { kind: TimerKind::Report, after }) if after == MSG_DELAY
    );
    assert!(wrapper.next_request().is_none());

    // The coordinator's report completes the backup's complement: decide.
    wrapper.send(report(1, &[0, 1], true, false));
    assert_matches!(wrapper.next_request(), Some(EngineRequest::Decide(true)));
    assert!(wrapper.next_request().is_none());

    // Both timers fired through shortcuts; the instance is only released
    // once the scheduled firings arrive.
    assert!(!wrapper.engine.is_deletable());
    wrapper.send(EngineEvent::Timeout(TimerKind::Vote));
    assert!(wrapper.next_request().is_none());
    assert!(!wrapper.engine.is_deletable());
    wrapper.send(EngineEvent::Timeout(TimerKind::Report));
    assert!(wrapper.next_request().is_none());
    assert!(wrapper.engine.is_deletable());
    assert_eq!(wrapper.engine.decision(), Some(true));
}

#[test]
fn coordinator_fast_path_all_commit() {
    let mut wrapper = EngineHarness::new(1, N, F);
    wrapper.send(EngineEvent::Propose(true));
    // The coordinator sends its vote to the backups only.
    assert_matches!(
        wrapper.next_request(),
        Some(EngineRequest::Send {
            to: 0,
            message: InbacMessage::Vote { id: TEST_ID, owner: 1, vote: true },
        })
    );
    assert_matches!(
        wrapper.next_request(),
        Some(EngineRequest::Schedule { kind: TimerKind::Vote, after }) if after == MSG_DELAY
    );
    assert!(wrapper.next_request().is_none());

    // All backup votes held: t0 fires early and the report is broadcast.
    wrapper.send(vote(0, true));
    let expected_owners = ranks(&[0, 1]);
    for peer in [0, 2] {
        assert_matches!(
            wrapper.next_request(),
            Some(EngineRequest::Send {
                to,
                message:
                    InbacMessage::Report { id: TEST_ID, owner: 1, owners, vote: true, all: false },
            }) if to == peer && owners == expected_owners
        );
    }
    assert_matches!(
        wrapper.next_request(),
        Some(EngineRequest::Schedule { kind: TimerKind::Report, .. })
    );
    assert!(wrapper.next_request().is_none());

    wrapper.send(report(0, &[0, 1, 2], true, true));
    assert_matches!(wrapper.next_request(), Some(EngineRequest::Decide(true)));
    assert!(wrapper.next_request().is_none());
}

#[test]
fn follower_fast_path_all_commit() {
    let mut wrapper = EngineHarness::new(2, N, F);
    wrapper.send(EngineEvent::Propose(true));
    assert_matches!(
        wrapper.next_request(),
        Some(EngineRequest::Send {
            to: 0,
            message: InbacMessage::Vote { id: TEST_ID, owner: 2, vote: true },
        })
    );
    // Followers skip the vote exchange: a single timer at twice the delay.
    assert_matches!(
        wrapper.next_request(),
        Some(EngineRequest::Schedule { kind: TimerKind::Report, after }) if after == 2 * MSG_DELAY
    );
    assert!(wrapper.next_request().is_none());

    // A backup's phase-0 vote still lands in the collection.
    wrapper.send(vote(0, true));
    assert!(wrapper.next_request().is_none());

    wrapper.send(report(0, &[0, 1, 2], true, true));
    assert_matches!(wrapper.next_request(), Some(EngineRequest::Decide(true)));
    assert!(wrapper.next_request().is_none());

    wrapper.send(EngineEvent::Timeout(TimerKind::Report));
    assert!(wrapper.next_request().is_none());
    assert!(wrapper.engine.is_deletable());
}

#[test]
fn abort_vote_forces_abort() {
    let mut wrapper = EngineHarness::new(2, N, F);
    wrapper.send(EngineEvent::Propose(true));
    wrapper.drain();
    // A complete report carrying a false conjunction decides abort.
    wrapper.send(report(0, &[0, 1, 2], false, true));
    assert_matches!(wrapper.next_request(), Some(EngineRequest::Decide(false)));
}

#[test]
fn incomplete_report_rescues_with_abort_bias() {
    let mut wrapper = EngineHarness::new(2, N, F);
    wrapper.send(EngineEvent::Propose(true));
    wrapper.drain();
    // The backup's report misses rank 2: evidence of a lost vote, so the
    // rescue proposes abort.
    wrapper.send(report(0, &[0, 1], true, false));
    assert_matches!(wrapper.next_request(), Some(EngineRequest::StartElection { proposal: false }));
    assert!(wrapper.next_request().is_none());

    wrapper.send(EngineEvent::ElectionDecided(false));
    assert_matches!(wrapper.next_request(), Some(EngineRequest::Decide(false)));

    wrapper.send(EngineEvent::Timeout(TimerKind::Report));
    assert!(wrapper.engine.is_deletable());
    assert_eq!(wrapper.engine.decision(), Some(false));
}

#[test]
fn coordinator_with_incomplete_report_rescues() {
    let mut wrapper = EngineHarness::new(1, N, F);
    wrapper.send(EngineEvent::Propose(true));
    wrapper.send(vote(0, true));
    wrapper.drain();
    // cnt = F but the backup saw only {0, 1}: no fast decision, rescue with
    // the abort bias.
    wrapper.send(report(0, &[0, 1], true, false));
    assert_matches!(wrapper.next_request(), Some(EngineRequest::StartElection { proposal: false }));
}

#[test]
fn coordinator_asks_followers_for_help() {
    let mut wrapper = EngineHarness::new(1, N, F);
    wrapper.send(EngineEvent::Propose(true));
    wrapper.send(vote(0, true));
    wrapper.drain();

    // No reports by t1: ask the followers.
    wrapper.send(EngineEvent::Timeout(TimerKind::Report));
    assert_matches!(
        wrapper.next_request(),
        Some(EngineRequest::Send { to: 2, message: InbacMessage::HelpRequest { id: TEST_ID, from: 1 } })
    );
    assert!(wrapper.next_request().is_none());

    // The follower saw everyone: together with the coordinator's own
    // self-response the help evidence covers all ranks.
    wrapper.send(EngineEvent::HelpResponse { owners: ranks(&[0, 1, 2]), vote: true });
    assert_matches!(wrapper.next_request(), Some(EngineRequest::StartElection { proposal: true }));
    assert!(wrapper.next_request().is_none());
}

#[test]
fn help_concludes_with_partial_evidence_as_abort() {
    let mut wrapper = EngineHarness::new(1, N, F);
    wrapper.send(EngineEvent::Propose(true));
    wrapper.drain();
    wrapper.send(EngineEvent::Timeout(TimerKind::Vote));
    wrapper.drain();
    wrapper.send(EngineEvent::Timeout(TimerKind::Report));
    wrapper.drain();

    // The follower only ever saw itself; the union misses the backup.
    wrapper.send(EngineEvent::HelpResponse { owners: ranks(&[2]), vote: true });
    assert_matches!(wrapper.next_request(), Some(EngineRequest::StartElection { proposal: false }));
}

#[test]
fn late_report_during_help_enables_fast_decision() {
    let mut wrapper = EngineHarness::new(1, N, F);
    wrapper.send(EngineEvent::Propose(true));
    wrapper.send(vote(0, true));
    wrapper.drain();
    wrapper.send(EngineEvent::Timeout(TimerKind::Report));
    wrapper.drain();

    // A delayed complete backup report arrives while waiting for help: the
    // fast decide rule applies after all.
    wrapper.send(report(0, &[0, 1, 2], true, true));
    assert_matches!(wrapper.next_request(), Some(EngineRequest::Decide(true)));
    assert!(wrapper.next_request().is_none());
}

#[test]
fn help_requests_are_answered_in_any_phase() {
    let mut wrapper = EngineHarness::new(2, N, F);
    wrapper.send(EngineEvent::Propose(true));
    wrapper.drain();
    wrapper.send(report(0, &[0, 1, 2], true, true));
    assert_matches!(wrapper.next_request(), Some(EngineRequest::Decide(true)));

    // Even after deciding, the folded collection is served to laggards.
    wrapper.send(EngineEvent::HelpRequest { from: 1 });
    let expected_owners = ranks(&[0, 1, 2]);
    assert_matches!(
        wrapper.next_request(),
        Some(EngineRequest::Send {
            to: 1,
            message: InbacMessage::HelpResponse { id: TEST_ID, owners, vote: true },
        }) if owners == expected_owners
    );
}

#[test]
fn decide_happens_at_most_once() {
    let mut wrapper = EngineHarness::new(2, N, F);
    wrapper.send(EngineEvent::Propose(true));
    wrapper.drain();
    wrapper.send(report(0, &[0, 1], true, false));
    assert_matches!(wrapper.next_request(), Some(EngineRequest::StartElection { .. }));

    wrapper.send(EngineEvent::ElectionDecided(true));
    assert_matches!(wrapper.next_request(), Some(EngineRequest::Decide(true)));
    // A second decision (e.g. from a contended election) is absorbed.
    wrapper.send(EngineEvent::ElectionDecided(true));
    assert!(wrapper.next_request().is_none());
    assert_eq!(wrapper.engine.decision(), Some(true));
}

#[test]
fn exchange_messages_are_dropped_once_rescued() {
    let mut wrapper = EngineHarness::new(2, N, F);
    wrapper.send(EngineEvent::Propose(true));
    wrapper.drain();
    wrapper.send(report(0, &[0, 1], true, false));
    assert_matches!(wrapper.next_request(), Some(EngineRequest::StartElection { .. }));

    wrapper.send(vote(0, true));
    assert!(wrapper.next_request().is_none());
    wrapper.send(report(1, &[0, 1], true, false));
    assert!(wrapper.next_request().is_none());
}

#[test]
fn reports_racing_ahead_of_the_vote_exchange_are_kept() {
    let mut wrapper = EngineHarness::new(0, N, F);
    wrapper.send(EngineEvent::Propose(true));
    wrapper.drain();
    // The coordinator's report overtakes the peer votes.
    wrapper.send(report(1, &[0, 1], true, false));
    assert!(wrapper.next_request().is_none());

    // Closing the vote exchange immediately completes the report phase too.
    wrapper.send(vote(1, true));
    wrapper.send(vote(2, true));
    let requests = wrapper.drain();
    assert_matches!(requests.last(), Some(EngineRequest::Decide(true)));
}

#[test]
fn duplicate_votes_are_absorbed() {
    let mut wrapper = EngineHarness::new(0, N, F);
    wrapper.send(EngineEvent::Propose(true));
    wrapper.drain();
    wrapper.send(vote(1, true));
    // A conflicting replay of an already-seen vote does not touch the
    // conjunction or the count.
    wrapper.send(vote(1, false));
    assert!(wrapper.next_request().is_none());
    wrapper.send(vote(2, true));
    assert_matches!(
        wrapper.next_request(),
        Some(EngineRequest::Send {
            message: InbacMessage::Report { vote: true, all: true, .. },
            ..
        })
    );
}

#[test]
fn single_participant_decides_its_own_vote() {
    // N = 1 leaves no backups; the coordinator concludes alone through the
    // help check, deciding its own vote.
    for own_vote in [true, false] {
        let mut wrapper = EngineHarness::new(0, 1, 0);
        wrapper.send(EngineEvent::Propose(own_vote));
        assert_matches!(
            wrapper.next_request(),
            Some(EngineRequest::Schedule { kind: TimerKind::Vote, .. })
        );
        wrapper.send(EngineEvent::Timeout(TimerKind::Vote));
        let requests = wrapper.drain();
        assert!(requests.contains(&EngineRequest::Decide(own_vote)), "requests: {requests:?}");
    }
}
