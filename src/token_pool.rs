// token_pool.rs — Bounded-memory dependency resolution for pipelined issue.
//
// WORK ITEMS AND THE HAZARD RULE
// ──────────────────────────────
// A work item (s, n) is stage `s` applied to input `n`. Stage `s` writes a
// buffer that stage `s + 1` reads, and the same physical buffer is reused
// for every input. Issuing (s, n) therefore has to wait for:
//
//   (s - 1, n)      data:   its own input must have been produced
//   (s + 1, n - 1)  hazard: the previous input's reader of the buffer we
//                           are about to overwrite must be finished
//
// with the edges trimmed at the borders of the grid:
//
//   (0, 0)          nothing
//   (s, 0)          (s - 1, 0)              no earlier input, no hazard
//   (0, n)          (1, n - 1)              input comes from outside
//   (S - 1, n)      (S - 2, n)              nobody reads the last output
//   S == 1          nothing                 single stage, no boundary
//
//   stage →   0       1       2       3
//   n = 0     ● ────▶ ● ────▶ ● ────▶ ●
//                   ╱       ╱       ╱
//                 ╱       ╱       ╱
//   n = 1     ● ────▶ ● ────▶ ● ────▶ ●
//
//   (every diagonal edge points from (s + 1, n - 1) down-left to (s, n))
//
// DIAGONAL INDEXING
// ─────────────────
// Both prerequisites of (s, n) sit on the anti-diagonal `s + 2n - 1`, so we
// group items into clusters keyed by `s + 2n`. Within one cluster the
// stages step by 2, so `min((S - 1 - s) / 2, n)` gives each member a
// distinct slot in `0..ceil(S / 2)`.
//
// Items are issued input-major, and at any moment the only tokens that a
// not-yet-issued item can still reference live in a band of fewer than S
// consecutive clusters. The pool is a ring of `S + 1` clusters: pushing a
// token into cluster c reuses the storage of cluster `c - (S + 1)`, whose
// tokens nothing can reference any more. That is `(S + 1)·ceil(S / 2)`
// slots: quadratic in S, independent of how many inputs flow through.
//
// Every slot stores the work item next to the token, so a lookup that
// lands on a slot recycled for a different item is detected and reported
// as `PoolError::Missing` instead of returning the wrong token.
//
// NEW RUST CONCEPTS:
// - `impl Ord` by hand so `WorkItem` sorts by (sequence, stage) even though
//   the fields are declared (stage, sequence).
// - `impl IntoIterator` for a small inline container, letting callers write
//   `wait.extend(deps)` without allocating.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// One unit of device work: `stage` applied to input number `sequence`.
///
/// Ordered by `(sequence, stage)`, the order the scheduler issues them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WorkItem {
    pub stage: usize,
    pub sequence: usize,
}

impl WorkItem {
    pub const fn new(stage: usize, sequence: usize) -> Self {
        WorkItem { stage, sequence }
    }
}

impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.sequence, self.stage).cmp(&(other.sequence, other.stage))
    }
}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(stage {}, input {})", self.stage, self.sequence)
    }
}

// ---------------------------------------------------------------------------
// Dependencies — at most two entries, held inline
// ---------------------------------------------------------------------------

/// A list of zero, one or two entries.
///
/// Every work item has at most two prerequisites, so the list never needs
/// heap storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependencies<T> {
    first: Option<T>,
    second: Option<T>,
}

impl<T> Dependencies<T> {
    pub const fn none() -> Self {
        Dependencies { first: None, second: None }
    }

    pub fn one(a: T) -> Self {
        Dependencies { first: Some(a), second: None }
    }

    pub fn two(a: T, b: T) -> Self {
        Dependencies { first: Some(a), second: Some(b) }
    }

    pub fn len(&self) -> usize {
        self.first.is_some() as usize + self.second.is_some() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.first.iter().chain(self.second.iter())
    }

    fn try_map<U, E>(self, mut f: impl FnMut(T) -> Result<U, E>) -> Result<Dependencies<U>, E> {
        Ok(Dependencies {
            first: self.first.map(&mut f).transpose()?,
            second: self.second.map(&mut f).transpose()?,
        })
    }
}

impl<T> IntoIterator for Dependencies<T> {
    type Item = T;
    type IntoIter = std::iter::Chain<std::option::IntoIter<T>, std::option::IntoIter<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.first.into_iter().chain(self.second)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A dependency lookup that the hazard rule says must succeed did not.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("token for {missing} (needed by {needed_by}) is not in the pool")]
    Missing { missing: WorkItem, needed_by: WorkItem },

    #[error("{item} is outside a {stages}-stage pipeline")]
    StageOutOfRange { item: WorkItem, stages: usize },
}

// ---------------------------------------------------------------------------
// DependencyTokenPool
// ---------------------------------------------------------------------------

/// Sliding-window store of completion tokens, indexed by anti-diagonal.
///
/// Generic over the token type so it can hold wgpu submission indices,
/// host-queue tokens, or plain integers in tests.
#[derive(Debug, Clone)]
pub struct DependencyTokenPool<T> {
    stages: usize,
    slots_per_cluster: usize,
    clusters: usize,
    slots: Vec<Option<(WorkItem, T)>>,
}

impl<T: Clone> DependencyTokenPool<T> {
    /// Create a pool for a pipeline of `stages` stages.
    ///
    /// # Panics
    /// Panics if `stages == 0`.
    pub fn new(stages: usize) -> Self {
        assert!(stages >= 1, "a pipeline has at least one stage");
        let slots_per_cluster = (stages + 1) / 2;
        let clusters = stages + 1;
        DependencyTokenPool {
            stages,
            slots_per_cluster,
            clusters,
            slots: vec![None; slots_per_cluster * clusters],
        }
    }

    pub fn stages(&self) -> usize {
        self.stages
    }

    /// Number of token slots. Fixed at construction; depends only on the
    /// stage count.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Forget every stored token.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    /// Anti-diagonal key of `item` (unbounded; the ring position is this
    /// value modulo the cluster count).
    #[inline]
    pub fn cluster_of(&self, item: WorkItem) -> usize {
        item.stage + 2 * item.sequence
    }

    /// Slot of `item` within its cluster.
    #[inline]
    pub fn slot_of(&self, item: WorkItem) -> usize {
        ((self.stages - 1 - item.stage) / 2).min(item.sequence)
    }

    #[inline]
    fn position(&self, item: WorkItem) -> usize {
        (self.cluster_of(item) % self.clusters) * self.slots_per_cluster + self.slot_of(item)
    }

    fn check_stage(&self, item: WorkItem) -> Result<(), PoolError> {
        if item.stage < self.stages {
            Ok(())
        } else {
            Err(PoolError::StageOutOfRange { item, stages: self.stages })
        }
    }

    /// The work items `item` must wait for, per the hazard rule.
    pub fn dependencies(&self, item: WorkItem) -> Result<Dependencies<WorkItem>, PoolError> {
        self.check_stage(item)?;
        let WorkItem { stage: s, sequence: n } = item;
        let last = self.stages - 1;

        let deps = if s == 0 && n == 0 {
            Dependencies::none()
        } else if n == 0 {
            Dependencies::one(WorkItem::new(s - 1, 0))
        } else if self.stages == 1 {
            Dependencies::none()
        } else if s == 0 {
            Dependencies::one(WorkItem::new(1, n - 1))
        } else if s == last {
            Dependencies::one(WorkItem::new(last - 1, n))
        } else {
            Dependencies::two(WorkItem::new(s - 1, n), WorkItem::new(s + 1, n - 1))
        };
        Ok(deps)
    }

    /// Look up the tokens `item` must wait for.
    ///
    /// Every prerequisite must have been pushed already; issuing items in
    /// `(sequence, stage)` order guarantees that.
    pub fn resolve(&self, item: WorkItem) -> Result<Dependencies<T>, PoolError> {
        self.dependencies(item)?.try_map(|dep| {
            self.get(dep)
                .cloned()
                .ok_or(PoolError::Missing { missing: dep, needed_by: item })
        })
    }

    /// Token stored for `item`, if its slot has not been recycled.
    pub fn get(&self, item: WorkItem) -> Option<&T> {
        if item.stage >= self.stages {
            return None;
        }
        match &self.slots[self.position(item)] {
            Some((stored, token)) if *stored == item => Some(token),
            _ => None,
        }
    }

    /// Store the token produced by issuing `item`.
    ///
    /// Returns whatever the slot held before, which is either `None` or a
    /// token that no later item depends on.
    pub fn push(&mut self, item: WorkItem, token: T) -> Result<Option<(WorkItem, T)>, PoolError> {
        self.check_stage(item)?;
        let pos = self.position(item);
        Ok(self.slots[pos].replace((item, token)))
    }

    /// Live tokens in canonical `(sequence, stage)` order, independent of
    /// the ring layout.
    pub fn sort(&self) -> Vec<(WorkItem, T)> {
        let mut live: Vec<(WorkItem, T)> = self.slots.iter().flatten().cloned().collect();
        live.sort_by_key(|(item, _)| *item);
        live
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
