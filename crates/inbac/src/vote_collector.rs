//! Vote collections for the two exchange phases and the help protocol.
//!
//! All three collections are monotone: inserts are idempotent (keyed by the
//! contributing rank) and the tracked conjunctions only ever move from true
//! to false.

#[cfg(test)]
#[path = "vote_collector_test.rs"]
mod vote_collector_test;

use crate::types::{Rank, RankSet};

/// First-phase votes observed by this participant, directly or folded in
/// from second-phase reports.
#[derive(Clone, Debug)]
pub(crate) struct VoteCollection {
    ranks: RankSet,
    conjunction: bool,
}

impl VoteCollection {
    pub(crate) fn new() -> Self {
        Self { ranks: RankSet::new(), conjunction: true }
    }

    /// Records a vote for `owner`. Replays of an already-seen rank are
    /// absorbed without touching the conjunction.
    pub(crate) fn insert(&mut self, owner: Rank, vote: bool) -> bool {
        let added = self.ranks.insert(owner);
        if added {
            self.conjunction &= vote;
        }
        added
    }

    /// Folds a report into the collection: its owner set is unioned in and
    /// its conjoined vote is ANDed. Sound because the report's vote is the
    /// conjunction over exactly the ranks it contributes.
    pub(crate) fn fold_report(&mut self, owners: RankSet, vote: bool) {
        self.ranks.union_with(owners);
        self.conjunction &= vote;
    }

    pub(crate) fn ranks(&self) -> RankSet {
        self.ranks
    }

    pub(crate) fn len(&self) -> u32 {
        self.ranks.len()
    }

    pub(crate) fn conjunction(&self) -> bool {
        self.conjunction
    }
}

/// One second-phase report: a peer's view of the first-phase votes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Report {
    pub(crate) reporter: Rank,
    pub(crate) owners: RankSet,
    pub(crate) vote: bool,
    pub(crate) all: bool,
}

/// The second-phase report multiset. Each report is retained separately;
/// a report's identity is its origin rank, so duplicate deliveries collapse.
#[derive(Clone, Debug)]
pub(crate) struct ReportCollection {
    reports: Vec<Report>,
    f: u32,
}

impl ReportCollection {
    pub(crate) fn new(f: u32) -> Self {
        Self { reports: Vec::new(), f }
    }

    /// Adds a report unless one from the same reporter is already held.
    pub(crate) fn insert(&mut self, report: Report) -> bool {
        if self.reports.iter().any(|held| held.reporter == report.reporter) {
            return false;
        }
        self.reports.push(report);
        true
    }

    /// Total reports held, any origin.
    pub(crate) fn count(&self) -> u32 {
        u32::try_from(self.reports.len()).expect("report count bounded by the server set")
    }

    /// Reports originating from backup ranks (< F).
    pub(crate) fn backup_count(&self) -> u32 {
        u32::try_from(self.backup_reports().count())
            .expect("report count bounded by the server set")
    }

    /// Whether every held backup report saw all N first-phase votes.
    pub(crate) fn all_backups_complete(&self) -> bool {
        self.backup_reports().all(|report| report.all)
    }

    /// Conjunction of the backup reports' conjoined votes.
    pub(crate) fn backup_conjunction(&self) -> bool {
        self.backup_reports().all(|report| report.vote)
    }

    /// Conjunction over every held report, any origin.
    pub(crate) fn conjunction(&self) -> bool {
        self.reports.iter().all(|report| report.vote)
    }

    /// Union of the owner sets of every held report.
    pub(crate) fn union(&self) -> RankSet {
        let mut union = RankSet::new();
        for report in &self.reports {
            union.union_with(report.owners);
        }
        union
    }

    /// Whether the coordinator's report is held and covers every backup
    /// rank. The coordinator can never have seen all N first-phase votes,
    /// so this stands in for its `all` flag in the backup decide rule.
    pub(crate) fn coordinator_covers_backups(&self) -> bool {
        self.reports
            .iter()
            .any(|report| report.reporter == self.f && report.owners.is_superset_of(RankSet::first(self.f)))
    }

    pub(crate) fn has_coordinator_report(&self) -> bool {
        self.reports.iter().any(|report| report.reporter == self.f)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Report> {
        self.reports.iter()
    }

    fn backup_reports(&self) -> impl Iterator<Item = &Report> {
        self.reports.iter().filter(|report| report.reporter < self.f)
    }
}

/// Votes learned through help responses.
#[derive(Clone, Debug)]
pub(crate) struct HelpCollection {
    owners: RankSet,
    conjunction: bool,
    responses: u32,
}

impl HelpCollection {
    pub(crate) fn new() -> Self {
        Self { owners: RankSet::new(), conjunction: true, responses: 0 }
    }

    /// Merges one help response into the collection.
    pub(crate) fn merge(&mut self, owners: RankSet, vote: bool) {
        self.owners.union_with(owners);
        self.conjunction &= vote;
        self.responses += 1;
    }

    pub(crate) fn owners(&self) -> RankSet {
        self.owners
    }

    pub(crate) fn conjunction(&self) -> bool {
        self.conjunction
    }

    pub(crate) fn responses(&self) -> u32 {
        self.responses
    }
}
