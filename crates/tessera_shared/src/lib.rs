//! # TESSERA Shared
//!
//! Common types used by every TESSERA crate.
//!
//! ## Contents
//!
//! - [`CellCoord`]: the 2-D cell key, packed into a single `u64`
//! - Level constants: the priority scale shared by the level graph and the
//!   task queue

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod constants;
pub mod coord;

pub use constants::{
    Level, ABSENT_LEVEL, CELL_AREA, CELL_SIZE, DEFAULT_MAX_CONCURRENT, FULL_LEVEL, MAX_LEVEL,
};
pub use coord::CellCoord;
