//! # Demo Terrain
//!
//! A deterministic stand-in for a real world generator, shaped to the
//! standard stage chain.
//!
//! ## Determinism Guarantee
//!
//! Every stage draws from a `ChaCha8Rng` seeded from the world seed, the
//! cell and the stage. The same seed produces the same cell regardless of
//! worker count or the order cells were scheduled in.
//!
//! ## What Each Stage Leaves Behind
//!
//! | Stage      | Effect                                                  |
//! |------------|---------------------------------------------------------|
//! | `noise`    | raw heights into the worldgen heightmaps                |
//! | `features` | smooths heights against the 3x3 neighborhood            |
//! | others     | one marker byte in the payload                          |

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tessera_scheduler::{
    CellView, CellViewMut, HeightmapKind, HeightmapSet, LightingHook, NeighborWindow, StageFuture,
    StageId, StageWork,
};
use tessera_shared::{CellCoord, CELL_SIZE};

/// Index of the stage that first shapes terrain.
const NOISE_STAGE: StageId = StageId::new(2);
/// Index of the first stage with a neighbor range.
const FEATURES_STAGE: StageId = StageId::new(5);

/// Lowest height the demo produces.
const BASE_HEIGHT: u16 = 48;
/// Spread of heights above the base.
const HEIGHT_SPREAD: u16 = 64;

/// World seed for the demo terrain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DemoSeed(u64);

impl DemoSeed {
    /// Creates a seed.
    #[inline]
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Raw value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Derives an independent sub-seed.
    #[inline]
    #[must_use]
    pub const fn derive(self, purpose: u64) -> Self {
        let mut hash = self.0;
        hash ^= purpose;
        hash = hash.wrapping_mul(0x517c_c1b7_2722_0a95);
        hash ^= hash >> 32;
        Self(hash)
    }
}

impl Default for DemoSeed {
    fn default() -> Self {
        Self(0x7E55_E4A0_D15C_0001)
    }
}

/// Deterministic terrain for the standard chain.
#[derive(Debug, Default)]
pub struct DemoTerrain {
    seed: DemoSeed,
    invocations: AtomicU64,
}

impl DemoTerrain {
    /// Terrain for `seed`.
    #[must_use]
    pub const fn new(seed: DemoSeed) -> Self {
        Self {
            seed,
            invocations: AtomicU64::new(0),
        }
    }

    /// The world seed.
    #[inline]
    #[must_use]
    pub const fn seed(&self) -> DemoSeed {
        self.seed
    }

    /// Stage invocations so far, loads excluded.
    #[must_use]
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    fn rng(&self, cell: CellCoord, stage: StageId) -> ChaCha8Rng {
        let seed = self.seed.derive(cell.key()).derive(u64::from(stage.index()));
        ChaCha8Rng::seed_from_u64(seed.value())
    }

    /// Writes raw heights into the worldgen heightmaps.
    fn shape(rng: &mut ChaCha8Rng, window: &mut NeighborWindow) {
        let center = window.center_mut();
        for kind in HeightmapSet::WORLDGEN.iter() {
            let map = center.heightmap_mut(kind);
            for z in 0..CELL_SIZE {
                for x in 0..CELL_SIZE {
                    map.set(x, z, BASE_HEIGHT + rng.gen_range(0..HEIGHT_SPREAD));
                }
            }
        }
    }

    /// Averages each column's surface with the same column of every
    /// neighbor, then fills the final heightmaps from it.
    fn smooth(window: &mut NeighborWindow) {
        let surface = HeightmapKind::WorldSurfaceWg;
        let mut smoothed = vec![0u16; CELL_SIZE * CELL_SIZE];
        for z in 0..CELL_SIZE {
            for x in 0..CELL_SIZE {
                let own = window
                    .center()
                    .heightmap(surface)
                    .map_or(BASE_HEIGHT, |h| h.get(x, z));
                let (sum, count) = window
                    .neighbors()
                    .filter_map(|n| n.heightmap(surface).map(|h| u32::from(h.get(x, z))))
                    .fold((u32::from(own), 1u32), |(s, c), h| (s + h, c + 1));
                smoothed[z * CELL_SIZE + x] = u16::try_from(sum / count).unwrap_or(u16::MAX);
            }
        }

        let center = window.center_mut();
        for kind in HeightmapSet::FINAL.iter() {
            let map = center.heightmap_mut(kind);
            for z in 0..CELL_SIZE {
                for x in 0..CELL_SIZE {
                    map.set(x, z, smoothed[z * CELL_SIZE + x]);
                }
            }
        }
    }
}

impl StageWork for DemoTerrain {
    fn generate(&self, mut window: NeighborWindow) -> StageFuture<'_> {
        Box::pin(async move {
            let stage = window.target_stage();
            let mut rng = self.rng(window.coord(), stage);
            if stage == NOISE_STAGE {
                Self::shape(&mut rng, &mut window);
            } else if stage == FEATURES_STAGE {
                Self::smooth(&mut window);
            }
            let marker: u8 = rng.gen();
            window.center_mut().payload_mut().push(marker);
            self.invocations.fetch_add(1, Ordering::Relaxed);
            Ok(window.into_center())
        })
    }
}

/// Lighting hook that only records which cells asked for light.
#[derive(Debug, Default)]
pub struct LitCells {
    cells: Mutex<HashSet<CellCoord>>,
}

impl LitCells {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `cell` was scheduled for lighting.
    #[must_use]
    pub fn contains(&self, cell: CellCoord) -> bool {
        self.cells.lock().contains(&cell)
    }

    /// Cells scheduled so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    /// Whether nothing was scheduled yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.lock().is_empty()
    }
}

impl LightingHook for LitCells {
    fn schedule_lighting(&self, cell: CellCoord, stage: StageId) {
        tracing::trace!("Lighting scheduled for {} at stage {}", cell, stage);
        self.cells.lock().insert(cell);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_derive_is_stable() {
        let seed = DemoSeed::new(42);
        assert_eq!(seed.derive(7), seed.derive(7));
        assert_ne!(seed.derive(7), seed.derive(8));
    }

    #[test]
    fn test_rng_depends_on_cell_and_stage() {
        let terrain = DemoTerrain::new(DemoSeed::new(1));
        let a: u64 = terrain.rng(CellCoord::ORIGIN, StageId::new(2)).gen();
        let b: u64 = terrain.rng(CellCoord::ORIGIN, StageId::new(2)).gen();
        let c: u64 = terrain.rng(CellCoord::new(1, 0), StageId::new(2)).gen();
        let d: u64 = terrain.rng(CellCoord::ORIGIN, StageId::new(3)).gen();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_lit_cells_dedupes() {
        let lit = LitCells::new();
        assert!(lit.is_empty());
        lit.schedule_lighting(CellCoord::ORIGIN, StageId::new(6));
        lit.schedule_lighting(CellCoord::ORIGIN, StageId::new(6));
        assert_eq!(lit.len(), 1);
        assert!(lit.contains(CellCoord::ORIGIN));
    }
}
