//! # Cell Coordinates
//!
//! The world is an effectively infinite 2-D grid of cells. A cell is
//! addressed by `(x, z)`; both halves are packed into one `u64` key so
//! coordinates hash and compare in a single word.
//!
//! ## Neighborhoods
//!
//! All distances are Chebyshev (8-neighborhood). [`CellCoord::ring`] yields
//! the `8r` cells at exactly distance `r`; [`CellCoord::within`] yields the
//! `(2r+1)²` cells at distance `<= r`, ring by ring starting at the center.

use std::hash::{Hash, Hasher};

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Cell coordinate (identifies a cell in the world grid).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct CellCoord {
    /// X coordinate (in cells).
    pub x: i32,
    /// Z coordinate (in cells).
    pub z: i32,
}

impl CellCoord {
    /// The origin cell.
    pub const ORIGIN: Self = Self::new(0, 0);

    /// Creates a new cell coordinate.
    #[inline]
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Packs the coordinate into a single key: `x` low, `z` high.
    #[inline]
    #[must_use]
    pub const fn key(self) -> u64 {
        (self.x as u32 as u64) | ((self.z as u32 as u64) << 32)
    }

    /// Unpacks a key produced by [`CellCoord::key`].
    #[inline]
    #[must_use]
    pub const fn from_key(key: u64) -> Self {
        Self {
            x: key as u32 as i32,
            z: (key >> 32) as u32 as i32,
        }
    }

    /// Returns the coordinate shifted by `(dx, dz)`.
    #[inline]
    #[must_use]
    pub const fn offset(self, dx: i32, dz: i32) -> Self {
        Self::new(self.x.wrapping_add(dx), self.z.wrapping_add(dz))
    }

    /// Chebyshev distance between two cells.
    #[inline]
    #[must_use]
    pub const fn chebyshev_distance(self, other: Self) -> u32 {
        let dx = self.x.abs_diff(other.x);
        let dz = self.z.abs_diff(other.z);
        if dx > dz {
            dx
        } else {
            dz
        }
    }

    /// The eight cells at distance 1.
    #[must_use]
    pub const fn neighbors(self) -> [Self; 8] {
        [
            self.offset(-1, -1),
            self.offset(0, -1),
            self.offset(1, -1),
            self.offset(-1, 0),
            self.offset(1, 0),
            self.offset(-1, 1),
            self.offset(0, 1),
            self.offset(1, 1),
        ]
    }

    /// Cells at exactly `radius`, row-major. Radius 0 yields the cell itself.
    pub fn ring(self, radius: u32) -> impl Iterator<Item = Self> {
        let r = radius as i32;
        (-r..=r).flat_map(move |dz| {
            // Interior rows only contribute their two edge cells.
            let step = if dz == -r || dz == r {
                1
            } else {
                (2 * r) as usize
            };
            (-r..=r).step_by(step).map(move |dx| self.offset(dx, dz))
        })
    }

    /// Cells at distance `<= radius`, center first, then ring by ring.
    pub fn within(self, radius: u32) -> impl Iterator<Item = Self> {
        (0..=radius).flat_map(move |r| self.ring(r))
    }
}

impl Hash for CellCoord {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.key());
    }
}

impl From<(i32, i32)> for CellCoord {
    fn from((x, z): (i32, i32)) -> Self {
        Self::new(x, z)
    }
}

impl std::fmt::Display for CellCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}
