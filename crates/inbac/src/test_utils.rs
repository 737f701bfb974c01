//! Helpers shared by the unit and simulation tests.
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;

use crate::messages::WireMessage;
use crate::phase_engine::{EngineEvent, EngineRequest, PhaseEngine};
use crate::types::{
    CommitResponse,
    HostContext,
    InbacError,
    InbacId,
    NodeId,
    Rank,
    RankSet,
};

pub(crate) const TEST_ID: InbacId = 7;
pub(crate) const MSG_DELAY: Duration = Duration::from_millis(50);
pub(crate) const COMMIT_STATUS: i32 = 0;
pub(crate) const COMMIT_TIMESTAMP: u64 = 42;

pub(crate) fn ranks(items: &[Rank]) -> RankSet {
    items.iter().copied().collect()
}

pub(crate) fn vote(owner: Rank, vote: bool) -> EngineEvent {
    EngineEvent::Vote { owner, vote }
}

pub(crate) fn report(owner: Rank, owners: &[Rank], vote: bool, all: bool) -> EngineEvent {
    EngineEvent::Report { owner, owners: ranks(owners), vote, all }
}

/// Runs a phase engine and keeps its requests queued for assertions.
pub(crate) struct EngineHarness {
    pub(crate) engine: PhaseEngine,
    pub(crate) requests: VecDeque<EngineRequest>,
}

impl EngineHarness {
    pub(crate) fn new(rank: Rank, n: u32, f: u32) -> Self {
        Self {
            engine: PhaseEngine::new(TEST_ID, rank, n, f, MSG_DELAY),
            requests: VecDeque::new(),
        }
    }

    pub(crate) fn send(&mut self, event: EngineEvent) {
        self.requests.append(&mut self.engine.handle_event(event));
    }

    pub(crate) fn next_request(&mut self) -> Option<EngineRequest> {
        self.requests.pop_front()
    }

    pub(crate) fn drain(&mut self) -> Vec<EngineRequest> {
        self.requests.drain(..).collect()
    }
}

/// A host context that records outbound traffic and commit invocations and
/// answers commits with a fixed response.
#[derive(Debug)]
pub(crate) struct RecordingContext {
    sent: mpsc::UnboundedSender<(NodeId, WireMessage)>,
    commits: mpsc::UnboundedSender<(InbacId, bool)>,
}

pub(crate) fn recording_context() -> (
    RecordingContext,
    mpsc::UnboundedReceiver<(NodeId, WireMessage)>,
    mpsc::UnboundedReceiver<(InbacId, bool)>,
) {
    let (sent, sent_receiver) = mpsc::unbounded();
    let (commits, commits_receiver) = mpsc::unbounded();
    (RecordingContext { sent, commits }, sent_receiver, commits_receiver)
}

#[async_trait]
impl HostContext for RecordingContext {
    async fn send(&mut self, to: NodeId, message: WireMessage) -> Result<(), InbacError> {
        let _ = self.sent.unbounded_send((to, message));
        Ok(())
    }

    async fn commit(&mut self, id: InbacId, commit: bool) -> Result<CommitResponse, InbacError> {
        let _ = self.commits.unbounded_send((id, commit));
        Ok(CommitResponse { status: COMMIT_STATUS, timestamp: COMMIT_TIMESTAMP })
    }
}
