//! Core domain model for ALW: ladder rows, canonical snapshots, the
//! normalizer, and the bounded dedup history window.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "alw-core";

/// Default cap applied to a normalized ladder; entries past this depth are
/// dropped after ranks are assigned.
pub const DEFAULT_TOP_N: usize = 4000;

/// Default number of accepted snapshots retained for dedup comparison.
pub const DEFAULT_WINDOW_CAPACITY: usize = 10;

/// One ranked ladder entry. `rank` is always assigned by normalization;
/// whatever numbering the remote source supplies is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub name: String,
    pub realm: String,
    pub rating: i32,
    pub season_wins: u32,
    pub season_losses: u32,
    pub weekly_wins: u32,
    pub weekly_losses: u32,
    pub rank: u32,
}

impl PlayerEntry {
    /// Identity key used for dedup comparisons. Ratings and win/loss
    /// counters are deliberately excluded.
    pub fn identity(&self) -> (&str, &str) {
        (self.name.as_str(), self.realm.as_str())
    }

    pub fn total_games(&self) -> u32 {
        self.season_wins + self.season_losses
    }
}

/// One row as delivered by the remote leaderboard payload. Field names
/// follow the wire format; `ranking` is accepted but never trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLadderRow {
    pub name: String,
    #[serde(alias = "realmslug", alias = "realmSlug")]
    pub realm: String,
    pub rating: i32,
    #[serde(default, alias = "seasonWins")]
    pub season_wins: u32,
    #[serde(default, alias = "seasonLosses")]
    pub season_losses: u32,
    #[serde(default, alias = "weeklyWins")]
    pub weekly_wins: u32,
    #[serde(default, alias = "weeklyLosses")]
    pub weekly_losses: u32,
    #[serde(default)]
    pub ranking: Option<u32>,
}

/// Raw, pre-normalization leaderboard response: unordered rows, no ranks,
/// no timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLadder {
    pub rows: Vec<RawLadderRow>,
}

/// Canonical point-in-time ladder capture. Invariant: `rows` are sorted by
/// (rating desc, name asc, realm asc) and `rows[i].rank == i + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LadderSnapshot {
    pub rows: Vec<PlayerEntry>,
    pub captured_at: DateTime<Utc>,
    pub rank_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    /// Distinct from a transport failure: the fetch succeeded but the
    /// payload cannot yield a ranked snapshot.
    #[error("ladder payload contains no rows")]
    EmptyLadder,
}

/// Normalize a raw leaderboard response into a canonical ranked snapshot.
///
/// Rows are sorted by descending rating, with ties broken by ascending
/// player name and then ascending realm, so ordering is deterministic for
/// any input. Ranks are reassigned as 1-based positions in that order;
/// truncation to `top_n` happens after ranking and never renumbers the
/// retained entries. `captured_at` is supplied by the caller (normalization
/// time, not request time), which keeps this a pure function.
pub fn normalize_at(
    raw: RawLadder,
    top_n: Option<usize>,
    captured_at: DateTime<Utc>,
) -> Result<LadderSnapshot, NormalizeError> {
    if raw.rows.is_empty() {
        return Err(NormalizeError::EmptyLadder);
    }

    let mut sorted = raw.rows;
    sorted.sort_by(|a, b| {
        b.rating
            .cmp(&a.rating)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.realm.cmp(&b.realm))
    });

    let mut rows: Vec<PlayerEntry> = sorted
        .into_iter()
        .enumerate()
        .map(|(idx, row)| PlayerEntry {
            name: row.name,
            realm: row.realm,
            rating: row.rating,
            season_wins: row.season_wins,
            season_losses: row.season_losses,
            weekly_wins: row.weekly_wins,
            weekly_losses: row.weekly_losses,
            rank: (idx + 1) as u32,
        })
        .collect();

    if let Some(limit) = top_n {
        rows.truncate(limit.max(1));
    }

    let rank_count = rows.len();
    Ok(LadderSnapshot {
        rows,
        captured_at,
        rank_count,
    })
}

/// Outcome of offering a candidate snapshot to the history window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First observation into an empty window: admitted to establish the
    /// dedup baseline, but not a reportable update.
    Baseline,
    /// Identity-equal to some window member; dropped.
    Duplicate,
    /// Genuinely new roster order; admitted.
    Novel,
}

/// Bounded FIFO of recently accepted snapshots. Owned by exactly one
/// pipeline consumer; check-then-admit happens through [`HistoryWindow::observe`]
/// so it is atomic per candidate.
#[derive(Debug)]
pub struct HistoryWindow {
    snapshots: VecDeque<LadderSnapshot>,
    capacity: usize,
}

impl HistoryWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            snapshots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Seed the baseline from a previously persisted snapshot at startup.
    pub fn seed(&mut self, snapshot: LadderSnapshot) {
        self.admit(snapshot);
    }

    /// A candidate is a duplicate if it matches ANY member, not only the
    /// most recent: concurrent fetches complete out of issue order, so the
    /// latest accepted snapshot alone is an insufficient baseline.
    pub fn is_duplicate(&self, candidate: &LadderSnapshot) -> bool {
        self.snapshots
            .iter()
            .any(|member| roster_matches(candidate, member))
    }

    /// Append a snapshot, evicting the oldest entry once past capacity.
    pub fn admit(&mut self, snapshot: LadderSnapshot) {
        self.snapshots.push_back(snapshot);
        while self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
        }
    }

    /// Atomic check-then-admit for one candidate.
    pub fn observe(&mut self, candidate: &LadderSnapshot) -> Observation {
        if self.snapshots.is_empty() {
            self.admit(candidate.clone());
            return Observation::Baseline;
        }
        if self.is_duplicate(candidate) {
            return Observation::Duplicate;
        }
        self.admit(candidate.clone());
        Observation::Novel
    }

    pub fn iter(&self) -> impl Iterator<Item = &LadderSnapshot> {
        self.snapshots.iter()
    }
}

/// Positional identity-key equality, compared over the candidate's own
/// length. A candidate longer than the member cannot match it; a shorter
/// candidate whose rows all match the member's prefix is treated as equal,
/// which under-detects changes deeper in the roster (see the
/// `shorter_candidate_*` test).
fn roster_matches(candidate: &LadderSnapshot, member: &LadderSnapshot) -> bool {
    if candidate.rows.len() > member.rows.len() {
        return false;
    }
    candidate
        .rows
        .iter()
        .zip(member.rows.iter())
        .all(|(a, b)| a.identity() == b.identity())
}
