//! # Cells & Views
//!
//! A [`Cell`] is the unit of generated world data. Its payload is opaque to
//! the scheduler; only the stage it reached and the heightmaps it carries
//! are interpreted here.
//!
//! ## Views
//!
//! Stage work receives a [`NeighborWindow`]: the center cell is mutable
//! ([`CellViewMut`]), every neighbor is read-only ([`CellView`] through
//! [`ReadOnlyCell`]). Read access and write access are separate traits, so
//! a neighbor simply has no mutators to call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tessera_shared::{CellCoord, CELL_AREA, CELL_SIZE};

use crate::stage::StageId;

/// Derived per-column summaries a stage can promise to leave behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum HeightmapKind {
    /// Highest non-air column during generation.
    WorldSurfaceWg = 0,
    /// Highest solid column during generation.
    OceanFloorWg = 1,
    /// Highest non-air column.
    WorldSurface = 2,
    /// Highest solid column.
    OceanFloor = 3,
    /// Highest motion-blocking column.
    MotionBlocking = 4,
    /// Highest motion-blocking column, leaves excluded.
    MotionBlockingNoLeaves = 5,
}

impl HeightmapKind {
    /// Every kind, in id order.
    pub const ALL: [Self; 6] = [
        Self::WorldSurfaceWg,
        Self::OceanFloorWg,
        Self::WorldSurface,
        Self::OceanFloor,
        Self::MotionBlocking,
        Self::MotionBlockingNoLeaves,
    ];

    /// Converts from the stored id.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(usize::from(v)).copied()
    }

    #[inline]
    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// A small set of [`HeightmapKind`]s (one bit per kind).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HeightmapSet(u8);

impl HeightmapSet {
    /// No heightmaps.
    pub const EMPTY: Self = Self(0);

    /// Heightmaps maintained while terrain is still being shaped.
    pub const WORLDGEN: Self = Self::EMPTY
        .with(HeightmapKind::WorldSurfaceWg)
        .with(HeightmapKind::OceanFloorWg);

    /// Heightmaps of a finished cell.
    pub const FINAL: Self = Self::EMPTY
        .with(HeightmapKind::WorldSurface)
        .with(HeightmapKind::OceanFloor)
        .with(HeightmapKind::MotionBlocking)
        .with(HeightmapKind::MotionBlockingNoLeaves);

    /// Returns the set with `kind` added.
    #[must_use]
    pub const fn with(self, kind: HeightmapKind) -> Self {
        Self(self.0 | kind.bit())
    }

    /// Whether `kind` is in the set.
    #[inline]
    #[must_use]
    pub const fn contains(self, kind: HeightmapKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Whether the set is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of kinds in the set.
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates the kinds in id order.
    pub fn iter(self) -> impl Iterator<Item = HeightmapKind> {
        HeightmapKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl FromIterator<HeightmapKind> for HeightmapSet {
    fn from_iter<I: IntoIterator<Item = HeightmapKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, Self::with)
    }
}

/// One height value per column, indexed as `[z][x]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Heightmap {
    values: Box<[u16]>,
}

impl Default for Heightmap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heightmap {
    /// A heightmap of zeros.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: vec![0; CELL_AREA].into_boxed_slice(),
        }
    }

    /// Wraps raw values; `None` unless exactly one value per column.
    #[must_use]
    pub fn from_values(values: Vec<u16>) -> Option<Self> {
        (values.len() == CELL_AREA).then(|| Self {
            values: values.into_boxed_slice(),
        })
    }

    /// Height of a column (0 outside the cell).
    #[inline]
    #[must_use]
    pub fn get(&self, x: usize, z: usize) -> u16 {
        if x < CELL_SIZE && z < CELL_SIZE {
            self.values[z * CELL_SIZE + x]
        } else {
            0
        }
    }

    /// Sets the height of a column. Out-of-cell writes are ignored.
    #[inline]
    pub fn set(&mut self, x: usize, z: usize, height: u16) {
        if x < CELL_SIZE && z < CELL_SIZE {
            self.values[z * CELL_SIZE + x] = height;
        }
    }

    /// Raw values, `[z][x]` order.
    #[must_use]
    pub fn as_slice(&self) -> &[u16] {
        &self.values
    }
}

/// Read capability over a cell.
pub trait CellView {
    /// Cell position.
    fn coord(&self) -> CellCoord;
    /// Stage the cell has reached.
    fn stage(&self) -> StageId;
    /// Opaque generated data.
    fn payload(&self) -> &[u8];
    /// A heightmap, if present.
    fn heightmap(&self, kind: HeightmapKind) -> Option<&Heightmap>;
    /// Kinds of heightmap present.
    fn heightmaps(&self) -> HeightmapSet;
}

/// Write capability over a cell. Only the center of a window has it.
pub trait CellViewMut: CellView {
    /// Mutable access to the payload.
    fn payload_mut(&mut self) -> &mut Vec<u8>;
    /// Mutable access to a heightmap, created zeroed if missing.
    fn heightmap_mut(&mut self, kind: HeightmapKind) -> &mut Heightmap;
}

/// A unit of generated world data.
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    coord: CellCoord,
    stage: StageId,
    payload: Vec<u8>,
    heightmaps: BTreeMap<HeightmapKind, Heightmap>,
}

impl Cell {
    /// A cell at the root stage with no data.
    #[must_use]
    pub fn empty(coord: CellCoord) -> Self {
        Self {
            coord,
            stage: StageId::ROOT,
            payload: Vec::new(),
            heightmaps: BTreeMap::new(),
        }
    }

    /// Rebuilds a cell from stored parts.
    #[must_use]
    pub fn from_parts(
        coord: CellCoord,
        stage: StageId,
        payload: Vec<u8>,
        heightmaps: BTreeMap<HeightmapKind, Heightmap>,
    ) -> Self {
        Self {
            coord,
            stage,
            payload,
            heightmaps,
        }
    }

    /// Iterates the heightmaps in kind order.
    pub fn iter_heightmaps(&self) -> impl Iterator<Item = (HeightmapKind, &Heightmap)> {
        self.heightmaps.iter().map(|(k, h)| (*k, h))
    }

    pub(crate) fn set_stage(&mut self, stage: StageId) {
        self.stage = stage;
    }

    /// Creates any heightmap in `required` the cell does not have yet.
    pub(crate) fn prime_heightmaps(&mut self, required: HeightmapSet) {
        for kind in required.iter() {
            self.heightmaps.entry(kind).or_default();
        }
    }
}

impl CellView for Cell {
    fn coord(&self) -> CellCoord {
        self.coord
    }

    fn stage(&self) -> StageId {
        self.stage
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn heightmap(&self, kind: HeightmapKind) -> Option<&Heightmap> {
        self.heightmaps.get(&kind)
    }

    fn heightmaps(&self) -> HeightmapSet {
        self.heightmaps.keys().copied().collect()
    }
}

impl CellViewMut for Cell {
    fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }

    fn heightmap_mut(&mut self, kind: HeightmapKind) -> &mut Heightmap {
        self.heightmaps.entry(kind).or_default()
    }
}

/// Read-only view of a neighbor cell.
#[derive(Clone, Copy, Debug)]
pub struct ReadOnlyCell<'a> {
    inner: &'a Cell,
}

impl CellView for ReadOnlyCell<'_> {
    fn coord(&self) -> CellCoord {
        self.inner.coord
    }

    fn stage(&self) -> StageId {
        self.inner.stage
    }

    fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    fn heightmap(&self, kind: HeightmapKind) -> Option<&Heightmap> {
        self.inner.heightmaps.get(&kind)
    }

    fn heightmaps(&self) -> HeightmapSet {
        self.inner.heightmaps()
    }
}

/// What a stage sees: a mutable center and the read-only ring around it.
#[derive(Debug)]
pub struct NeighborWindow {
    center: Cell,
    neighbors: HashMap<CellCoord, Arc<Cell>>,
    target: StageId,
    radius: u32,
}

impl NeighborWindow {
    pub(crate) fn new(
        center: Cell,
        neighbors: HashMap<CellCoord, Arc<Cell>>,
        target: StageId,
        radius: u32,
    ) -> Self {
        Self {
            center,
            neighbors,
            target,
            radius,
        }
    }

    /// Center cell position.
    #[must_use]
    pub fn coord(&self) -> CellCoord {
        self.center.coord
    }

    /// The stage being produced.
    #[must_use]
    pub const fn target_stage(&self) -> StageId {
        self.target
    }

    /// Radius of the window.
    #[must_use]
    pub const fn radius(&self) -> u32 {
        self.radius
    }

    /// The center cell.
    #[must_use]
    pub const fn center(&self) -> &Cell {
        &self.center
    }

    /// The center cell, writable.
    pub fn center_mut(&mut self) -> &mut impl CellViewMut {
        &mut self.center
    }

    /// A cell of the window; the center comes back read-only too.
    #[must_use]
    pub fn get(&self, coord: CellCoord) -> Option<ReadOnlyCell<'_>> {
        if coord == self.center.coord {
            return Some(ReadOnlyCell {
                inner: &self.center,
            });
        }
        self.neighbors
            .get(&coord)
            .map(|cell| ReadOnlyCell { inner: cell })
    }

    /// Every neighbor (center excluded), in no particular order.
    pub fn neighbors(&self) -> impl Iterator<Item = ReadOnlyCell<'_>> {
        self.neighbors.values().map(|cell| ReadOnlyCell { inner: cell })
    }

    /// Number of neighbors (center excluded).
    #[must_use]
    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    /// Takes the center cell back out.
    #[must_use]
    pub fn into_center(self) -> Cell {
        self.center
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heightmap_set() {
        assert_eq!(HeightmapSet::WORLDGEN.len(), 2);
        assert_eq!(HeightmapSet::FINAL.len(), 4);
        assert!(HeightmapSet::FINAL.contains(HeightmapKind::MotionBlocking));
        assert!(!HeightmapSet::FINAL.contains(HeightmapKind::OceanFloorWg));
        let kinds: Vec<_> = HeightmapSet::WORLDGEN.iter().collect();
        assert_eq!(kinds, vec![HeightmapKind::WorldSurfaceWg, HeightmapKind::OceanFloorWg]);
        assert!(HeightmapSet::EMPTY.is_empty());
    }

    #[test]
    fn test_heightmap_bounds() {
        let mut map = Heightmap::new();
        map.set(3, 4, 70);
        map.set(CELL_SIZE, 0, 99);
        assert_eq!(map.get(3, 4), 70);
        assert_eq!(map.get(CELL_SIZE, 0), 0);
        assert!(Heightmap::from_values(vec![0; 3]).is_none());
    }

    #[test]
    fn test_prime_heightmaps_keeps_existing() {
        let mut cell = Cell::empty(CellCoord::new(1, 2));
        cell.heightmap_mut(HeightmapKind::WorldSurfaceWg).set(0, 0, 12);
        cell.prime_heightmaps(HeightmapSet::WORLDGEN);
        assert_eq!(cell.heightmaps(), HeightmapSet::WORLDGEN);
        assert_eq!(
            cell.heightmap(HeightmapKind::WorldSurfaceWg).unwrap().get(0, 0),
            12
        );
    }

    #[test]
    fn test_window_views() {
        let center = CellCoord::new(0, 0);
        let east = CellCoord::new(1, 0);
        let mut neighbor = Cell::empty(east);
        neighbor.payload_mut().extend_from_slice(b"east");
        let mut neighbors = HashMap::new();
        neighbors.insert(east, Arc::new(neighbor));

        let mut window = NeighborWindow::new(Cell::empty(center), neighbors, StageId::new(1), 1);
        window.center_mut().payload_mut().push(7);

        assert_eq!(window.get(east).unwrap().payload(), b"east");
        assert_eq!(window.get(center).unwrap().payload(), &[7]);
        assert!(window.get(CellCoord::new(5, 5)).is_none());
        assert_eq!(window.neighbor_count(), 1);
        assert_eq!(window.into_center().payload(), &[7]);
    }
}
