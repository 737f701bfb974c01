//! Top level of the commit core: one manager task per host, multiplexing
//! host requests, network messages, and timer firings over every live
//! transaction instance.
//!
//! [`InbacManager::run`] is the primary entrypoint. All per-instance state
//! transitions happen on this single task, so handlers are mutually
//! exclusive on an instance and no per-instance locking exists.

#[cfg(test)]
#[path = "manager_test.rs"]
mod manager_test;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use lru::LruCache;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use crate::config::InbacConfig;
use crate::election::{Election, ElectionEvent, ElectionRequest};
use crate::messages::{ElectionMessage, InbacMessage, WireMessage};
use crate::phase_engine::{EngineEvent, EngineRequest, PhaseEngine, TimerKind};
use crate::types::{
    CommitRequest,
    CommitResponse,
    HostContext,
    InbacError,
    InbacId,
    NodeId,
    Rank,
    MAX_SERVERS,
};

/// Payload of a fired one-shot timer.
#[derive(Clone, Copy, Debug)]
enum TimerEvent {
    Engine { id: InbacId, kind: TimerKind },
    ElectionRound { id: InbacId },
    ElectionCleanup { id: InbacId },
}

type TimerStream = FuturesUnordered<BoxFuture<'static, TimerEvent>>;

/// A unit of protocol work; the dispatch loop drains these so that a state
/// machine's requests can feed events back into the other machine without
/// recursion.
enum Action {
    Engine(InbacId, EngineEvent),
    Election(InbacId, ElectionEvent),
}

#[derive(Debug)]
struct Instance {
    engine: PhaseEngine,
    servers: Vec<NodeId>,
    rank: Rank,
    reply: Option<oneshot::Sender<CommitResponse>>,
}

#[derive(Debug)]
struct ElectionSlot {
    election: Election,
    // Kept separately so the slot can still route messages after its
    // transaction instance was destroyed.
    servers: Vec<NodeId>,
    cleanup_scheduled: bool,
}

/// Runs the commit core for one host endpoint.
#[derive(Debug)]
pub struct InbacManager<ContextT: HostContext> {
    config: InbacConfig,
    local: NodeId,
    context: ContextT,
    rng: StdRng,
    instances: HashMap<InbacId, Instance>,
    elections: HashMap<InbacId, ElectionSlot>,
    /// Messages that arrived before their instance was constructed, replayed
    /// in arrival order at propose.
    pending: HashMap<InbacId, VecDeque<WireMessage>>,
    /// Recently completed transactions; late traffic for them is dropped
    /// instead of queued.
    completed: LruCache<InbacId, ()>,
}

impl<ContextT: HostContext> InbacManager<ContextT> {
    /// Create the commit core for the endpoint identified by `local`.
    pub fn new(
        config: InbacConfig,
        local: NodeId,
        context: ContextT,
    ) -> Result<Self, InbacError> {
        config.validate().map_err(|err| InbacError::InvalidConfig(err.to_string()))?;
        Ok(Self {
            completed: LruCache::new(config.completed_cache_size),
            config,
            local,
            context,
            rng: StdRng::from_entropy(),
            instances: HashMap::new(),
            elections: HashMap::new(),
            pending: HashMap::new(),
        })
    }

    /// Run the commit core until the host request channel closes.
    ///
    /// Inputs:
    /// - `requests`: transactions handed in by the host transaction engine.
    /// - `network`: protocol messages delivered by the host transport.
    #[instrument(skip_all, fields(local = %self.local), level = "error")]
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<CommitRequest>,
        mut network: mpsc::Receiver<WireMessage>,
    ) -> Result<(), InbacError> {
        info!("Running the commit core, config: {:?}", self.config);
        let mut timers: TimerStream = FuturesUnordered::new();

        enum Input {
            Request(Option<CommitRequest>),
            Message(Option<WireMessage>),
            Timer(TimerEvent),
        }

        loop {
            let input = tokio::select! {
                request = requests.next() => Input::Request(request),
                message = network.next() => Input::Message(message),
                Some(timer) = timers.next() => Input::Timer(timer),
            };
            match input {
                Input::Request(Some(request)) => self.handle_request(request, &mut timers).await?,
                Input::Request(None) => {
                    info!("Host request channel closed; shutting down the commit core.");
                    return Ok(());
                }
                Input::Message(Some(message)) => self.handle_message(message, &mut timers).await?,
                Input::Message(None) => {
                    return Err(InbacError::InternalNetworkError(
                        "network receiver should never be closed".to_string(),
                    ));
                }
                Input::Timer(timer) => self.handle_timer(timer, &mut timers).await?,
            }
        }
    }

    /// Spawn the instance for a transaction, run its propose, then replay
    /// any messages that arrived early for it.
    #[instrument(skip_all, fields(id = request.id))]
    async fn handle_request(
        &mut self,
        request: CommitRequest,
        timers: &mut TimerStream,
    ) -> Result<(), InbacError> {
        let CommitRequest { id, servers, vote, reply } = request;
        if self.instances.contains_key(&id) || self.completed.contains(&id) {
            warn!("Duplicate commit request for transaction {id}; dropping.");
            return Ok(());
        }
        if servers.is_empty() || servers.len() > MAX_SERVERS {
            warn!("Unsupported server set of size {} for transaction {id}.", servers.len());
            return Ok(());
        }
        let Some(position) = servers.iter().position(|node| *node == self.local) else {
            warn!("Local endpoint {} is not in the server set of transaction {id}.", self.local);
            return Ok(());
        };
        let rank = u32::try_from(position).expect("server set size bounded");
        let n = u32::try_from(servers.len()).expect("server set size bounded");
        let f = self.config.max_crashed.min(n - 1);
        let engine = PhaseEngine::new(id, rank, n, f, self.config.timers.msg_delay);
        self.instances.insert(id, Instance { engine, servers, rank, reply: Some(reply) });

        self.dispatch(Action::Engine(id, EngineEvent::Propose(vote)), timers).await?;

        // Replay messages that arrived before construction, in queue order.
        if let Some(queue) = self.pending.remove(&id) {
            debug!("Replaying {} early messages for transaction {id}.", queue.len());
            for message in queue {
                self.handle_message(message, timers).await?;
            }
        }
        Ok(())
    }

    /// Route one network message into the owning state machine, or queue it
    /// when the instance does not exist yet.
    async fn handle_message(
        &mut self,
        message: WireMessage,
        timers: &mut TimerStream,
    ) -> Result<(), InbacError> {
        let id = message.id();
        match message {
            WireMessage::Inbac(message) => {
                if self.instances.contains_key(&id) {
                    self.dispatch(Action::Engine(id, engine_event(message)), timers).await
                } else {
                    self.enqueue_pending(id, WireMessage::Inbac(message));
                    Ok(())
                }
            }
            WireMessage::Election(message) => {
                if !self.elections.contains_key(&id) {
                    // Requests and decisions create responder-side election
                    // state; stray replies and acks have nothing to update.
                    let creates_slot = matches!(
                        message,
                        ElectionMessage::VoteRequest { .. } | ElectionMessage::Decision { .. }
                    );
                    match self.instances.get(&id) {
                        Some(instance) if creates_slot => {
                            let n = u32::try_from(instance.servers.len())
                                .expect("server set size bounded");
                            self.elections.insert(
                                id,
                                ElectionSlot {
                                    election: Election::new(
                                        id,
                                        instance.rank,
                                        n,
                                        self.config.max_election_rounds,
                                    ),
                                    servers: instance.servers.clone(),
                                    cleanup_scheduled: false,
                                },
                            );
                        }
                        Some(_) => {
                            debug!("Dropping election reply for transaction {id} with no election.");
                            return Ok(());
                        }
                        None => {
                            self.enqueue_pending(id, WireMessage::Election(message));
                            return Ok(());
                        }
                    }
                }
                self.dispatch(Action::Election(id, election_event(message)), timers).await
            }
        }
    }

    async fn handle_timer(
        &mut self,
        timer: TimerEvent,
        timers: &mut TimerStream,
    ) -> Result<(), InbacError> {
        match timer {
            TimerEvent::Engine { id, kind } => {
                self.dispatch(Action::Engine(id, EngineEvent::Timeout(kind)), timers).await
            }
            TimerEvent::ElectionRound { id } => {
                if self.elections.contains_key(&id) {
                    self.dispatch(Action::Election(id, ElectionEvent::RoundTimeout), timers).await
                } else {
                    debug!("Round timer fired for a finished election of transaction {id}.");
                    Ok(())
                }
            }
            TimerEvent::ElectionCleanup { id } => {
                if let Some(slot) = self.elections.get_mut(&id) {
                    slot.cleanup_scheduled = false;
                    if slot.election.is_done() {
                        debug!("Election state for transaction {id} released.");
                        self.elections.remove(&id);
                    }
                }
                Ok(())
            }
        }
    }

    /// Drain protocol work to quiescence. Requests of one machine may queue
    /// events for the other (rescue invocation, election decision).
    async fn dispatch(&mut self, action: Action, timers: &mut TimerStream) -> Result<(), InbacError> {
        let mut actions = VecDeque::from([action]);
        while let Some(action) = actions.pop_front() {
            match action {
                Action::Engine(id, event) => {
                    let Some(instance) = self.instances.get_mut(&id) else {
                        debug!("Dropping event for unknown or completed transaction {id}.");
                        continue;
                    };
                    let requests = instance.engine.handle_event(event);
                    self.execute_engine_requests(id, requests, &mut actions, timers).await?;
                    self.try_remove_instance(id, timers);
                }
                Action::Election(id, event) => {
                    let Some(slot) = self.elections.get_mut(&id) else {
                        debug!("Dropping election event for transaction {id}.");
                        continue;
                    };
                    let requests = slot.election.handle_event(event);
                    self.execute_election_requests(id, requests, &mut actions, timers).await?;
                    self.maybe_schedule_election_cleanup(id, timers);
                }
            }
        }
        Ok(())
    }

    async fn execute_engine_requests(
        &mut self,
        id: InbacId,
        requests: VecDeque<EngineRequest>,
        actions: &mut VecDeque<Action>,
        timers: &mut TimerStream,
    ) -> Result<(), InbacError> {
        for request in requests {
            match request {
                EngineRequest::Send { to, message } => {
                    self.send_to_rank(id, to, WireMessage::Inbac(message)).await;
                }
                EngineRequest::Schedule { kind, after } => {
                    schedule(timers, after, TimerEvent::Engine { id, kind });
                }
                EngineRequest::StartElection { proposal } => {
                    self.ensure_election(id);
                    actions.push_back(Action::Election(id, ElectionEvent::Propose(proposal)));
                }
                EngineRequest::Decide(decision) => {
                    let response = self.context.commit(id, decision).await?;
                    info!(
                        "COMMIT_APPLIED: transaction {id} decided commit={decision}, status={}, \
                         timestamp={}.",
                        response.status, response.timestamp
                    );
                    let instance =
                        self.instances.get_mut(&id).expect("decide comes from a live instance");
                    if let Some(reply) = instance.reply.take() {
                        if reply.send(response).is_err() {
                            debug!("Client reply channel for transaction {id} was dropped.");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn execute_election_requests(
        &mut self,
        id: InbacId,
        requests: VecDeque<ElectionRequest>,
        actions: &mut VecDeque<Action>,
        timers: &mut TimerStream,
    ) -> Result<(), InbacError> {
        for request in requests {
            match request {
                ElectionRequest::Send { to, message } => {
                    self.send_election_to_rank(id, to, message).await;
                }
                ElectionRequest::ScheduleRound => {
                    let after = self.sample_round_delay();
                    schedule(timers, after, TimerEvent::ElectionRound { id });
                }
                ElectionRequest::Decided(vote) => {
                    actions.push_back(Action::Engine(id, EngineEvent::ElectionDecided(vote)));
                }
            }
        }
        Ok(())
    }

    /// Transport failures are logged and dropped; the timers restore
    /// liveness and the evidence checks preserve safety.
    async fn send_to_rank(&mut self, id: InbacId, to: Rank, message: WireMessage) {
        let Some(instance) = self.instances.get(&id) else {
            return;
        };
        let node = instance.servers[usize::try_from(to).expect("rank bounded")];
        if let Err(err) = self.context.send(node, message).await {
            warn!("Unable to send to {node} for transaction {id}: {err}");
        }
    }

    async fn send_election_to_rank(&mut self, id: InbacId, to: Rank, message: ElectionMessage) {
        let Some(slot) = self.elections.get(&id) else {
            return;
        };
        let node = slot.servers[usize::try_from(to).expect("rank bounded")];
        if let Err(err) = self.context.send(node, WireMessage::Election(message)).await {
            warn!("Unable to send to {node} for election {id}: {err}");
        }
    }

    /// A second rescue path for the same transaction reuses the running
    /// election rather than spawning a divergent parallel one.
    fn ensure_election(&mut self, id: InbacId) {
        if self.elections.contains_key(&id) {
            return;
        }
        let instance = self.instances.get(&id).expect("rescue comes from a live instance");
        let n = u32::try_from(instance.servers.len()).expect("server set size bounded");
        self.elections.insert(
            id,
            ElectionSlot {
                election: Election::new(id, instance.rank, n, self.config.max_election_rounds),
                servers: instance.servers.clone(),
                cleanup_scheduled: false,
            },
        );
    }

    /// Destroys an instance once the outcome was delivered and no timer
    /// firing is outstanding.
    fn try_remove_instance(&mut self, id: InbacId, timers: &mut TimerStream) {
        let Some(instance) = self.instances.get(&id) else {
            return;
        };
        if !instance.engine.is_deletable() {
            return;
        }
        self.instances.remove(&id);
        self.pending.remove(&id);
        self.completed.put(id, ());
        debug!("Instance for transaction {id} released.");
        self.maybe_schedule_election_cleanup(id, timers);
    }

    /// Election state is released with a message-delay grace so in-flight
    /// traffic can drain first.
    fn maybe_schedule_election_cleanup(&mut self, id: InbacId, timers: &mut TimerStream) {
        let Some(slot) = self.elections.get_mut(&id) else {
            return;
        };
        if slot.cleanup_scheduled || !slot.election.is_done() {
            return;
        }
        if slot.election.can_delete() || !self.instances.contains_key(&id) {
            slot.cleanup_scheduled = true;
            schedule(timers, self.config.timers.msg_delay, TimerEvent::ElectionCleanup { id });
        }
    }

    fn enqueue_pending(&mut self, id: InbacId, message: WireMessage) {
        if self.completed.contains(&id) {
            debug!("Dropping message for completed transaction {id}.");
            return;
        }
        let queue = self.pending.entry(id).or_default();
        if queue.len() >= self.config.early_queue_limit {
            warn!(
                "Early message queue for transaction {id} is full ({} entries); dropping.",
                queue.len()
            );
            return;
        }
        queue.push_back(message);
    }

    fn sample_round_delay(&mut self) -> Duration {
        let bound = u64::try_from(self.config.timers.consensus_delay.as_micros())
            .expect("consensus delay overflows u64 microseconds")
            .max(1);
        Duration::from_micros(self.rng.gen_range(0..bound))
    }
}

fn schedule(timers: &mut TimerStream, after: Duration, event: TimerEvent) {
    timers.push(
        async move {
            tokio::time::sleep(after).await;
            event
        }
        .boxed(),
    );
}

fn engine_event(message: InbacMessage) -> EngineEvent {
    match message {
        InbacMessage::Vote { owner, vote, .. } => EngineEvent::Vote { owner, vote },
        InbacMessage::Report { owner, owners, vote, all, .. } => {
            EngineEvent::Report { owner, owners, vote, all }
        }
        InbacMessage::HelpRequest { from, .. } => EngineEvent::HelpRequest { from },
        InbacMessage::HelpResponse { owners, vote, .. } => {
            EngineEvent::HelpResponse { owners, vote }
        }
    }
}

fn election_event(message: ElectionMessage) -> ElectionEvent {
    match message {
        ElectionMessage::VoteRequest { round, from, .. } => {
            ElectionEvent::VoteRequest { round, from }
        }
        ElectionMessage::VoteReply { round, granted, .. } => {
            ElectionEvent::VoteReply { round, granted }
        }
        ElectionMessage::Decision { vote, from, .. } => ElectionEvent::PeerDecision { vote, from },
        ElectionMessage::DecisionAck { .. } => ElectionEvent::DecisionAck,
    }
}
