//! # Level & Cell Constants
//!
//! The level scale is shared by the level graph (which computes levels)
//! and the task queue (which buckets work by level).
//!
//! ```text
//! 0 ............ FULL_LEVEL ............ MAX_LEVEL   ABSENT_LEVEL
//! |  terminal stage required  |  lower stages  |   no requirement
//! ```

/// Scheduling priority. Lower is more urgent.
pub type Level = u8;

/// Cells at or below this level must reach the terminal stage.
pub const FULL_LEVEL: Level = 33;

/// Highest level that still carries a requirement.
pub const MAX_LEVEL: Level = 44;

/// Sentinel: no requirement reaches the cell.
pub const ABSENT_LEVEL: Level = MAX_LEVEL + 1;

/// Default cap on cells held by workers at the same time.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Cell width/depth in columns.
pub const CELL_SIZE: usize = 16;

/// Columns per cell (one heightmap entry each).
pub const CELL_AREA: usize = CELL_SIZE * CELL_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_scale_ordering() {
        assert!(FULL_LEVEL < MAX_LEVEL);
        assert_eq!(ABSENT_LEVEL, MAX_LEVEL + 1);
    }
}
