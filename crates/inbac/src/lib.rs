#![warn(missing_docs)]
//! An indulgent non-blocking atomic commit (INBAC) core for distributed
//! transactions.
//!
//! For each transaction a fixed set of N participants decides a single
//! binary outcome (commit / abort) such that every non-faulty participant
//! that decides decides the same value, any abort vote forces abort, a
//! unanimous commit vote without crashes yields commit, and no participant
//! blocks under the assumed crash bound.
//!
//! The protocol is tuned for the fault-free path: a decision is reached in
//! two message delays through point-to-point exchanges among a small backup
//! subgroup. Only when evidence of failure appears does a participant fall
//! back to a randomized-timeout leader election that decides the outcome for
//! everyone.
//!
//! The core is an active component driven by its own timers; it reaches out
//! to the host through the [`HostContext`](types::HostContext) API for
//! message delivery and for the commit procedure that persists the outcome.
//! Host requests and network traffic are handed in over channels to the
//! [`InbacManager`] event loop; all per-instance state transitions run on
//! that single task.

pub mod config;
#[allow(missing_docs)]
pub mod messages;
#[allow(missing_docs)]
pub mod types;
pub use manager::InbacManager;

mod election;
mod manager;
#[allow(missing_docs)]
mod phase_engine;
mod vote_collector;

#[cfg(test)]
pub(crate) mod test_utils;
