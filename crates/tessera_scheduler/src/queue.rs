//! # Task Priority Queue
//!
//! Pending work bucketed by level, FIFO inside a bucket, with a hard cap
//! on how many cells may be in flight at once.
//!
//! ## Layout
//!
//! ```text
//! level:   0     1     2   ...  max_level
//!        [ ]   [c7]  [c2 c9]     [ ]
//!               ^ first_non_empty (lower bound, advanced lazily)
//! ```
//!
//! Each bucket is ordered by a monotonically increasing sequence number
//! assigned when a cell enters it, so FIFO order survives removals from
//! the middle (resorts).
//!
//! `Saturated` and `Empty` are ordinary outcomes of [`TaskQueue::pop`].

use std::collections::{BTreeMap, HashMap, HashSet};

use tessera_shared::{CellCoord, Level};

/// One pending slot of a cell.
#[derive(Debug)]
pub enum TaskSlot<T> {
    /// Runnable work.
    Work(T),
    /// Placeholder: acquire the cell without running anything.
    Hold,
}

/// What [`TaskQueue::pop`] hands to a worker.
#[derive(Debug)]
pub struct TaskBatch<T> {
    /// The acquired cell.
    pub cell: CellCoord,
    /// Level the cell was queued at.
    pub level: Level,
    /// Runnable work, in submission order.
    pub tasks: Vec<T>,
    /// Number of hold placeholders. Non-zero means the cell stays
    /// acquired until [`TaskQueue::release`] is called explicitly.
    pub holds: usize,
}

/// Result of [`TaskQueue::pop`].
#[derive(Debug)]
pub enum Pop<T> {
    /// A cell was acquired.
    Ready(TaskBatch<T>),
    /// `max_concurrent` cells are already in flight.
    Saturated,
    /// No queued cell can start (nothing queued, or only cells in flight).
    Empty,
}

#[derive(Debug)]
struct Entry<T> {
    level: Level,
    seq: u64,
    slots: Vec<TaskSlot<T>>,
}

/// Level-bucketed work queue with an in-flight ceiling.
#[derive(Debug)]
pub struct TaskQueue<T> {
    buckets: Vec<BTreeMap<u64, CellCoord>>,
    entries: HashMap<CellCoord, Entry<T>>,
    first_non_empty: usize,
    in_flight: HashSet<CellCoord>,
    max_concurrent: usize,
    next_seq: u64,
}

impl<T> TaskQueue<T> {
    /// Creates a queue with buckets for levels `0..=max_level`.
    ///
    /// # Panics
    ///
    /// Panics if `max_concurrent` is zero.
    #[must_use]
    pub fn new(max_level: Level, max_concurrent: usize) -> Self {
        assert!(max_concurrent >= 1, "max_concurrent must be at least 1");
        let level_count = usize::from(max_level) + 1;
        Self {
            buckets: (0..level_count).map(|_| BTreeMap::new()).collect(),
            entries: HashMap::new(),
            first_non_empty: level_count,
            in_flight: HashSet::new(),
            max_concurrent,
            next_seq: 0,
        }
    }

    /// Number of buckets (`max_level + 1`).
    #[inline]
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.buckets.len()
    }

    /// The in-flight ceiling.
    #[inline]
    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Lower bound on the lowest non-empty bucket (`level_count` when empty).
    #[inline]
    #[must_use]
    pub const fn first_non_empty(&self) -> usize {
        self.first_non_empty
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn check_level(&self, level: Level) {
        assert!(
            usize::from(level) < self.level_count(),
            "level {level} outside queue range 0..{}",
            self.level_count()
        );
    }

    /// Appends a slot to the cell's pending list.
    ///
    /// A new cell enters the bucket for `level`. A cell already queued keeps
    /// one entry at the lower of its current level and `level`.
    ///
    /// # Panics
    ///
    /// Panics if `level` is above the queue's max level.
    pub fn submit(&mut self, slot: TaskSlot<T>, cell: CellCoord, level: Level) {
        self.check_level(level);
        if let Some(entry) = self.entries.get_mut(&cell) {
            entry.slots.push(slot);
            let old = entry.level;
            if level < old {
                self.move_entry(cell, old, level);
            }
            return;
        }
        let seq = self.next_seq();
        self.buckets[usize::from(level)].insert(seq, cell);
        self.entries.insert(
            cell,
            Entry {
                level,
                seq,
                slots: vec![slot],
            },
        );
        self.first_non_empty = self.first_non_empty.min(usize::from(level));
    }

    /// Moves a queued cell's whole pending list from `old` to `new`.
    ///
    /// # Panics
    ///
    /// Panics if the cell is not queued, is queued at a level other than
    /// `old`, or `new` is above the max level.
    pub fn resort(&mut self, cell: CellCoord, old: Level, new: Level) {
        self.check_level(new);
        let Some(entry) = self.entries.get(&cell) else {
            panic!("resort of unknown cell {cell}");
        };
        assert_eq!(
            entry.level, old,
            "resort of cell {cell} from level {old}, queued at {}",
            entry.level
        );
        if old != new {
            self.move_entry(cell, old, new);
        }
    }

    fn move_entry(&mut self, cell: CellCoord, old: Level, new: Level) {
        let seq = self.next_seq();
        let Some(entry) = self.entries.get_mut(&cell) else {
            return;
        };
        self.buckets[usize::from(old)].remove(&entry.seq);
        entry.level = new;
        entry.seq = seq;
        self.buckets[usize::from(new)].insert(seq, cell);
        self.advance();
        self.first_non_empty = self.first_non_empty.min(usize::from(new));
    }

    /// Oldest queued cell of the lowest level that is not in flight.
    fn next_startable(&self) -> Option<(usize, u64, CellCoord)> {
        self.buckets
            .iter()
            .enumerate()
            .skip(self.first_non_empty)
            .flat_map(|(level, bucket)| bucket.iter().map(move |(seq, cell)| (level, *seq, *cell)))
            .find(|(_, _, cell)| !self.in_flight.contains(cell))
    }

    /// Moves `first_non_empty` past empty buckets.
    fn advance(&mut self) {
        while self.first_non_empty < self.buckets.len()
            && self.buckets[self.first_non_empty].is_empty()
        {
            self.first_non_empty += 1;
        }
    }

    /// Acquires the oldest cell of the lowest non-empty bucket.
    ///
    /// Cells already in flight are skipped and keep their place, so a cell
    /// occupies at most one slot. `Empty` also covers the case where every
    /// queued cell is in flight.
    pub fn pop(&mut self) -> Pop<T> {
        if self.in_flight.len() >= self.max_concurrent {
            return Pop::Saturated;
        }
        self.advance();
        let Some((level, seq, cell)) = self.next_startable() else {
            return Pop::Empty;
        };
        self.buckets[level].remove(&seq);
        let Some(entry) = self.entries.remove(&cell) else {
            return Pop::Empty;
        };
        self.in_flight.insert(cell);

        let mut tasks = Vec::with_capacity(entry.slots.len());
        let mut holds = 0;
        for slot in entry.slots {
            match slot {
                TaskSlot::Work(task) => tasks.push(task),
                TaskSlot::Hold => holds += 1,
            }
        }
        Pop::Ready(TaskBatch {
            cell,
            level: entry.level,
            tasks,
            holds,
        })
    }

    /// Releases a cell: removes it from the in-flight set and prunes its
    /// pending slots. `full_clear` drops everything; otherwise only holds
    /// are dropped and queued work stays. Returns the dropped slots.
    pub fn release(&mut self, cell: CellCoord, full_clear: bool) -> Vec<TaskSlot<T>> {
        self.in_flight.remove(&cell);
        let Some(entry) = self.entries.get_mut(&cell) else {
            return Vec::new();
        };
        let dropped = if full_clear {
            std::mem::take(&mut entry.slots)
        } else {
            let (holds, work): (Vec<_>, Vec<_>) = std::mem::take(&mut entry.slots)
                .into_iter()
                .partition(|slot| matches!(slot, TaskSlot::Hold));
            entry.slots = work;
            holds
        };
        if entry.slots.is_empty() {
            let (level, seq) = (entry.level, entry.seq);
            self.entries.remove(&cell);
            self.buckets[usize::from(level)].remove(&seq);
        }
        dropped
    }

    /// Whether the cell has pending slots.
    #[must_use]
    pub fn contains(&self, cell: CellCoord) -> bool {
        self.entries.contains_key(&cell)
    }

    /// Level the cell is queued at.
    #[must_use]
    pub fn level_of(&self, cell: CellCoord) -> Option<Level> {
        self.entries.get(&cell).map(|e| e.level)
    }

    /// Number of queued cells.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.entries.len()
    }

    /// Number of in-flight cells.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether the cell is in flight.
    #[must_use]
    pub fn is_in_flight(&self, cell: CellCoord) -> bool {
        self.in_flight.contains(&cell)
    }
}
