//! # Level Graph
//!
//! Multi-source distance propagation over the cell grid.
//!
//! Every cell's level is the minimum of its own source level (if it is a
//! source) and `1 + level` of any of its eight neighbors. Levels above
//! `max_level` are not stored: such a cell is absent (`max_level + 1`).
//!
//! ## Updates
//!
//! - **Decreasing** (a source improved or appeared): the new level is set
//!   and relaxed outward through a min-heap until no neighbor improves.
//! - **Increasing** (a contribution was withdrawn): every cell that could
//!   have been supported by the withdrawn level is cleared, then re-seeded
//!   from the remaining sources and the untouched border, and relaxed again.
//!   Work stays proportional to the affected region.
//!
//! Net changes are reported once per cell after the update settles.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use tessera_shared::{CellCoord, Level, MAX_LEVEL};

/// Where source levels come from (for example, the ticket map).
pub trait LevelSource {
    /// The level a cell holds on its own, if it is a source.
    fn source_level(&self, cell: CellCoord) -> Option<Level>;
}

/// Receives net level changes.
pub trait LevelListener {
    /// Called once per changed cell after an update settles.
    fn on_level_changed(&mut self, cell: CellCoord, old: Level, new: Level);
}

impl LevelListener for () {
    fn on_level_changed(&mut self, _cell: CellCoord, _old: Level, _new: Level) {}
}

impl LevelListener for Vec<(CellCoord, Level, Level)> {
    fn on_level_changed(&mut self, cell: CellCoord, old: Level, new: Level) {
        self.push((cell, old, new));
    }
}

impl LevelSource for HashMap<CellCoord, Level> {
    fn source_level(&self, cell: CellCoord) -> Option<Level> {
        self.get(&cell).copied()
    }
}

/// Old levels of every cell an update touched, in first-touch order.
#[derive(Default)]
struct Touched {
    order: Vec<CellCoord>,
    old: HashMap<CellCoord, Level>,
}

impl Touched {
    fn note(&mut self, cell: CellCoord, old: Level) {
        if !self.old.contains_key(&cell) {
            self.old.insert(cell, old);
            self.order.push(cell);
        }
    }
}

/// Sparse map of cell levels.
#[derive(Debug, Clone)]
pub struct LevelGraph {
    levels: HashMap<CellCoord, Level>,
    max_level: Level,
}

impl Default for LevelGraph {
    fn default() -> Self {
        Self::new(MAX_LEVEL)
    }
}

impl LevelGraph {
    /// Creates an empty graph whose finite levels are `0..=max_level`.
    ///
    /// # Panics
    ///
    /// Panics if `max_level` leaves no room for the absent level.
    #[must_use]
    pub fn new(max_level: Level) -> Self {
        assert!(max_level < Level::MAX, "max_level {max_level} leaves no absent level");
        Self {
            levels: HashMap::new(),
            max_level,
        }
    }

    /// Highest finite level.
    #[inline]
    #[must_use]
    pub const fn max_level(&self) -> Level {
        self.max_level
    }

    /// The level meaning "no requirement".
    #[inline]
    #[must_use]
    pub const fn absent_level(&self) -> Level {
        self.max_level + 1
    }

    /// Current level of a cell (absent level if none).
    #[inline]
    #[must_use]
    pub fn level(&self, cell: CellCoord) -> Level {
        self.levels.get(&cell).copied().unwrap_or(self.absent_level())
    }

    /// Number of cells with a finite level.
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Whether no cell has a finite level.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Iterates cells with a finite level, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (CellCoord, Level)> + '_ {
        self.levels.iter().map(|(c, l)| (*c, *l))
    }

    /// Applies a source change at `cell`.
    ///
    /// `source` must already reflect the change. With `is_decreasing` the
    /// cell can now reach `level`; otherwise a contribution at `level` was
    /// withdrawn and the affected region is re-derived. A withdrawal at any
    /// level other than the cell's current one changes nothing.
    ///
    /// # Panics
    ///
    /// Panics if a decreasing update names a level above `max_level`.
    pub fn update(
        &mut self,
        cell: CellCoord,
        level: Level,
        is_decreasing: bool,
        source: &impl LevelSource,
        listener: &mut impl LevelListener,
    ) {
        let mut touched = Touched::default();
        if is_decreasing {
            assert!(
                level <= self.max_level,
                "source level {level} above max level {}",
                self.max_level
            );
            let current = self.level(cell);
            if level >= current {
                return;
            }
            touched.note(cell, current);
            self.levels.insert(cell, level);
            let mut heap = BinaryHeap::new();
            heap.push(Reverse((level, cell.key())));
            self.propagate(heap, &mut touched);
        } else {
            // Only the contribution the cell currently rests on matters.
            let current = self.level(cell);
            if current > self.max_level || level != current {
                return;
            }
            let region = self.invalidate(cell, &mut touched);
            let mut heap = BinaryHeap::new();
            for &c in &region {
                let derived = self.derive(c, source);
                if derived <= self.max_level {
                    self.levels.insert(c, derived);
                    heap.push(Reverse((derived, c.key())));
                }
            }
            self.propagate(heap, &mut touched);
        }
        self.emit(touched, listener);
    }

    /// Relaxes neighbors outward until nothing improves.
    fn propagate(&mut self, mut heap: BinaryHeap<Reverse<(Level, u64)>>, touched: &mut Touched) {
        while let Some(Reverse((level, key))) = heap.pop() {
            let cell = CellCoord::from_key(key);
            if self.level(cell) != level {
                continue;
            }
            self.check_neighbors_after_update(cell, level, &mut heap, touched);
        }
    }

    fn check_neighbors_after_update(
        &mut self,
        from: CellCoord,
        level: Level,
        heap: &mut BinaryHeap<Reverse<(Level, u64)>>,
        touched: &mut Touched,
    ) {
        for to in from.neighbors() {
            if let Some(next) = self.check_edge(to, level) {
                touched.note(to, self.level(to));
                self.levels.insert(to, next);
                heap.push(Reverse((next, to.key())));
            }
        }
    }

    /// The improved level `to` reaches through a neighbor at `from_level`.
    #[inline]
    fn check_edge(&self, to: CellCoord, from_level: Level) -> Option<Level> {
        let candidate = from_level + 1;
        (candidate <= self.max_level && candidate < self.level(to)).then_some(candidate)
    }

    /// Clears every cell whose level may rest on `cell`; returns them.
    fn invalidate(&mut self, cell: CellCoord, touched: &mut Touched) -> Vec<CellCoord> {
        let mut region = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        seen.insert(cell);
        queue.push_back(cell);

        while let Some(c) = queue.pop_front() {
            let Some(level) = self.levels.remove(&c) else {
                continue;
            };
            touched.note(c, level);
            region.push(c);
            for n in c.neighbors() {
                if !seen.contains(&n) && self.levels.get(&n) == Some(&(level + 1)) {
                    seen.insert(n);
                    queue.push_back(n);
                }
            }
        }
        region
    }

    /// Best level a cell can justify from its source and current neighbors.
    fn derive(&self, cell: CellCoord, source: &impl LevelSource) -> Level {
        let absent = self.absent_level();
        let own = source.source_level(cell).unwrap_or(absent).min(absent);
        let best = cell
            .neighbors()
            .iter()
            .filter_map(|n| self.levels.get(n))
            .map(|l| l + 1)
            .fold(own, Level::min);
        best.min(absent)
    }

    fn emit(&self, touched: Touched, listener: &mut impl LevelListener) {
        for cell in touched.order {
            let old = touched.old[&cell];
            let new = self.level(cell);
            if old != new {
                listener.on_level_changed(cell, old, new);
            }
        }
    }

    /// Checks the fixed point over stored cells, their neighbors and `sources`.
    ///
    /// Every checked cell must equal the minimum of its source level and its
    /// best neighbor plus one.
    #[must_use]
    pub fn is_fixed_point(
        &self,
        source: &impl LevelSource,
        sources: impl IntoIterator<Item = CellCoord>,
    ) -> bool {
        let mut cells: HashSet<CellCoord> = sources.into_iter().collect();
        for cell in self.levels.keys() {
            cells.insert(*cell);
            cells.extend(cell.neighbors());
        }
        cells
            .into_iter()
            .all(|cell| self.level(cell) == self.derive(cell, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(
        graph: &mut LevelGraph,
        sources: &mut HashMap<CellCoord, Level>,
        cell: CellCoord,
        level: Level,
    ) -> Vec<(CellCoord, Level, Level)> {
        sources.insert(cell, level);
        let mut changes = Vec::new();
        graph.update(cell, level, true, &*sources, &mut changes);
        changes
    }

    fn remove(
        graph: &mut LevelGraph,
        sources: &mut HashMap<CellCoord, Level>,
        cell: CellCoord,
    ) -> Vec<(CellCoord, Level, Level)> {
        let level = sources.remove(&cell).unwrap();
        let mut changes = Vec::new();
        graph.update(cell, level, false, &*sources, &mut changes);
        changes
    }

    #[test]
    fn test_single_source_spreads() {
        let mut graph = LevelGraph::new(10);
        let mut sources = HashMap::new();
        let changes = add(&mut graph, &mut sources, CellCoord::ORIGIN, 7);

        assert_eq!(graph.level(CellCoord::ORIGIN), 7);
        assert_eq!(graph.level(CellCoord::new(1, -1)), 8);
        assert_eq!(graph.level(CellCoord::new(3, 0)), 10);
        assert_eq!(graph.level(CellCoord::new(4, 0)), 11);
        // 7x7 square of finite levels
        assert_eq!(graph.len(), 49);
        assert_eq!(changes.len(), 49);
        assert_eq!(changes[0], (CellCoord::ORIGIN, 11, 7));
        assert!(graph.is_fixed_point(&sources, sources.keys().copied()));
    }

    #[test]
    fn test_weaker_source_is_ignored() {
        let mut graph = LevelGraph::new(10);
        let mut sources = HashMap::new();
        add(&mut graph, &mut sources, CellCoord::ORIGIN, 5);
        let changes = add(&mut graph, &mut sources, CellCoord::new(1, 0), 9);
        assert!(changes.is_empty());
        assert_eq!(graph.level(CellCoord::new(1, 0)), 6);
    }

    #[test]
    fn test_two_sources_take_minimum() {
        let mut graph = LevelGraph::new(12);
        let mut sources = HashMap::new();
        add(&mut graph, &mut sources, CellCoord::new(0, 0), 8);
        add(&mut graph, &mut sources, CellCoord::new(6, 0), 6);

        assert_eq!(graph.level(CellCoord::new(3, 0)), 9);
        assert_eq!(graph.level(CellCoord::new(4, 0)), 8);
        assert_eq!(graph.level(CellCoord::new(1, 0)), 9);
        assert!(graph.is_fixed_point(&sources, sources.keys().copied()));
    }

    #[test]
    fn test_removal_rederives_locally() {
        let mut graph = LevelGraph::new(12);
        let mut sources = HashMap::new();
        let a = CellCoord::new(0, 0);
        let b = CellCoord::new(4, 0);
        add(&mut graph, &mut sources, a, 8);
        add(&mut graph, &mut sources, b, 8);
        assert_eq!(graph.level(CellCoord::new(2, 0)), 10);

        let changes = remove(&mut graph, &mut sources, a);
        assert_eq!(graph.level(a), 12);
        assert_eq!(graph.level(CellCoord::new(2, 0)), 10);
        assert_eq!(graph.level(CellCoord::new(-1, 0)), 13);
        assert!(graph.is_fixed_point(&sources, sources.keys().copied()));
        // Cells far from `a` never appear in the change list.
        assert!(changes.iter().all(|(c, _, _)| c.chebyshev_distance(a) <= 4));
        assert!(changes.iter().all(|(_, old, new)| new > old));
    }

    #[test]
    fn test_removing_last_source_clears_graph() {
        let mut graph = LevelGraph::new(3);
        let mut sources = HashMap::new();
        add(&mut graph, &mut sources, CellCoord::ORIGIN, 1);
        assert_eq!(graph.len(), 25);

        let changes = remove(&mut graph, &mut sources, CellCoord::ORIGIN);
        assert!(graph.is_empty());
        assert_eq!(changes.len(), 25);
        assert!(changes.iter().all(|(_, _, new)| *new == 4));
    }

    #[test]
    fn test_withdrawal_of_non_minimal_contribution() {
        let mut graph = LevelGraph::new(10);
        let mut sources = HashMap::new();
        add(&mut graph, &mut sources, CellCoord::ORIGIN, 4);
        let mut changes = Vec::new();
        graph.update(CellCoord::new(1, 0), 9, false, &sources, &mut changes);
        assert!(changes.is_empty());
        assert_eq!(graph.level(CellCoord::new(1, 0)), 5);
    }

    #[test]
    fn test_withdrawal_below_current_level_is_ignored() {
        let mut graph = LevelGraph::new(10);
        let mut sources = HashMap::new();
        add(&mut graph, &mut sources, CellCoord::ORIGIN, 4);
        let before: HashMap<CellCoord, Level> = graph.iter().collect();

        // (2, 0) sits at 6; a stale withdrawal at 2 must not touch the region.
        let mut changes = Vec::new();
        graph.update(CellCoord::new(2, 0), 2, false, &sources, &mut changes);
        assert!(changes.is_empty());
        assert_eq!(graph.iter().collect::<HashMap<_, _>>(), before);
    }

    #[test]
    #[should_panic(expected = "above max level")]
    fn test_source_above_max_panics() {
        let mut graph = LevelGraph::new(4);
        graph.update(CellCoord::ORIGIN, 5, true, &HashMap::<CellCoord, Level>::new(), &mut ());
    }
}
