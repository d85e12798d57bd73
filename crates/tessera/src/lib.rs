//! # TESSERA
//!
//! Staged world generation for infinite, reproducible worlds.
//!
//! This crate ties the pieces together:
//!
//! - [`scheduler`]: the scheduler itself, re-exported whole
//! - [`shared`]: coordinates and the level scale
//! - [`demo`]: a deterministic terrain for the standard chain
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera::demo::{DemoSeed, DemoTerrain};
//! use tessera::prelude::*;
//!
//! let registry = StageRegistry::standard(Arc::new(DemoTerrain::new(DemoSeed::new(7))));
//! let scheduler = Scheduler::builder(Arc::new(registry)).build()?;
//! let workers = scheduler.spawn_workers();
//! scheduler.add_ticket(CellCoord::ORIGIN, Ticket::player(4, FULL_LEVEL));
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod demo;

pub use tessera_scheduler as scheduler;
pub use tessera_shared as shared;

/// Everything a typical embedder touches.
pub mod prelude {
    pub use tessera_scheduler::{
        Cell, CellView, CellViewMut, NeighborWindow, Scheduler, SchedulerConfig, SchedulerError,
        StageFuture, StageId, StageRegistry, StageSpec, StageWork, Ticket,
    };
    pub use tessera_shared::{CellCoord, Level, FULL_LEVEL, MAX_LEVEL};
}
