//! Types for interfacing between the commit core and the host storage server.
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::messages::WireMessage;

/// The 64-bit transaction identifier shared by every participant of one
/// distributed transaction. Also keys the rescue election for that
/// transaction.
pub type InbacId = u64;

/// A participant's position in the ordered server set (0..N-1).
///
/// The first F ranks are backups, rank F is the coordinator, ranks above F
/// are followers.
pub type Rank = u32;

/// An election round counter.
pub type Round = u32;

/// Identifies a host endpoint. The host transport is responsible for mapping
/// this to an actual address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// The maximum supported server-set size; rank sets are fixed-width bitmasks.
pub const MAX_SERVERS: usize = 64;

/// A set of participant ranks, encoded as a fixed-width bitmask.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankSet {
    bits: u64,
}

impl RankSet {
    pub fn new() -> Self {
        Self { bits: 0 }
    }

    /// The set holding every rank below `n`.
    pub fn first(n: u32) -> Self {
        assert!(usize::try_from(n).expect("rank overflow") <= MAX_SERVERS);
        if n == 0 {
            return Self::new();
        }
        Self { bits: u64::MAX >> (64 - n) }
    }

    /// Inserts a rank. Returns whether the rank was newly added.
    pub fn insert(&mut self, rank: Rank) -> bool {
        assert!(usize::try_from(rank).expect("rank overflow") < MAX_SERVERS);
        let bit = 1u64 << rank;
        let added = self.bits & bit == 0;
        self.bits |= bit;
        added
    }

    pub fn contains(&self, rank: Rank) -> bool {
        usize::try_from(rank).expect("rank overflow") < MAX_SERVERS
            && self.bits & (1u64 << rank) != 0
    }

    pub fn len(&self) -> u32 {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Merges `other` into `self`.
    pub fn union_with(&mut self, other: Self) {
        self.bits |= other.bits;
    }

    pub fn is_superset_of(&self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    pub fn iter(&self) -> impl Iterator<Item = Rank> + '_ {
        (0..u32::try_from(MAX_SERVERS).expect("const fits")).filter(|rank| self.contains(*rank))
    }
}

impl FromIterator<Rank> for RankSet {
    fn from_iter<I: IntoIterator<Item = Rank>>(iter: I) -> Self {
        let mut set = Self::new();
        for rank in iter {
            set.insert(rank);
        }
        set
    }
}

impl fmt::Debug for RankSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// The protocol role derived from a participant's rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Rank < F. Broadcasts its vote in phase 0 and its collection in phase 1.
    Backup,
    /// Rank F. Exchanges with backups and coordinates the help protocol.
    Coordinator,
    /// Rank > F. Starts directly in phase 1 and answers help requests.
    Follower,
}

impl Role {
    pub fn of(rank: Rank, f: u32) -> Self {
        match rank.cmp(&f) {
            std::cmp::Ordering::Less => Role::Backup,
            std::cmp::Ordering::Equal => Role::Coordinator,
            std::cmp::Ordering::Greater => Role::Follower,
        }
    }
}

/// Response of the host commit procedure, relayed verbatim into the
/// client-facing reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitResponse {
    /// Host status code for the commit/abort application.
    pub status: i32,
    /// Commit timestamp assigned by the host.
    pub timestamp: u64,
}

/// A host request to decide one transaction.
///
/// `servers` is the ordered server set shared by all participants; the local
/// endpoint must be a member and its position defines the local rank.
#[derive(Debug)]
pub struct CommitRequest {
    pub id: InbacId,
    pub servers: Vec<NodeId>,
    /// The local vote: true to commit, false to abort.
    pub vote: bool,
    /// Signaled with the commit outcome once the decision has been applied.
    pub reply: oneshot::Sender<CommitResponse>,
}

/// Interface for the commit core to call out to the host.
///
/// Sends are fire-and-forget point-to-point messages; the transport is
/// assumed to deliver in order between non-crashed endpoints but may fail.
#[async_trait]
pub trait HostContext: Send {
    /// Sends a protocol message to a peer.
    async fn send(&mut self, to: NodeId, message: WireMessage) -> Result<(), InbacError>;

    /// Applies the decided outcome through the host commit procedure.
    /// Invoked exactly once per transaction.
    async fn commit(&mut self, id: InbacId, commit: bool) -> Result<CommitResponse, InbacError>;
}

#[derive(thiserror::Error, PartialEq, Debug)]
pub enum InbacError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    // Indicates an error in communication between the core and the host's
    // networking component. As opposed to an error between this node and
    // peer nodes.
    #[error("{0}")]
    InternalNetworkError(String),
    #[error("commit procedure failed: {0}")]
    CommitError(String),
}
