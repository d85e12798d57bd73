//! # TESSERA Scheduler
//!
//! Staged world generation over an effectively infinite grid of cells.
//!
//! ## What It Decides
//!
//! Only *when* and *in what order* work on cells happens:
//!
//! 1. **Sequencing**: cells move through a linear chain of stages, one step
//!    at a time, and a stage may only run once every cell within its range
//!    has reached the previous stage
//! 2. **Priority**: tickets seed levels that spread outward; lower levels
//!    are served first
//! 3. **Admission**: a hard cap on cells in flight
//!
//! What a stage actually computes is opaque ([`StageWork`]).
//!
//! ## Core Components
//!
//! - `StageRegistry`: the immutable stage chain
//! - `LevelGraph`: multi-source level propagation
//! - `TaskQueue`: level buckets with an in-flight ceiling
//! - `PipelineDriver`: per-cell advancement with neighbor ranges
//! - `Scheduler`: tickets, queue and pipeline behind one handle
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_scheduler::{Scheduler, SchedulerConfig, StageRegistry, Ticket};
//!
//! let registry = Arc::new(StageRegistry::standard(Arc::new(MyTerrain::new(seed))));
//! let scheduler = Scheduler::builder(registry).config(SchedulerConfig::production()).build()?;
//! let workers = scheduler.spawn_workers();
//!
//! scheduler.add_ticket(CellCoord::ORIGIN, Ticket::player(8, FULL_LEVEL));
//! let cell = scheduler.wait_for_terminal(CellCoord::ORIGIN).await?;
//! workers.shutdown().await;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod cell;
pub mod completion;
pub mod config;
pub mod error;
pub mod level_graph;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod stage;
pub mod store;
pub mod tickets;
pub mod worker;

pub use cell::{Cell, CellView, CellViewMut, Heightmap, HeightmapKind, HeightmapSet, NeighborWindow, ReadOnlyCell};
pub use completion::{Completion, CompletionHub, LightingHook};
pub use config::SchedulerConfig;
pub use error::{
    ConfigError, ConfigResult, RegistryError, SchedulerError, SchedulerResult, StageError, StageResult,
    StoreError, StoreResult,
};
pub use level_graph::{LevelGraph, LevelListener, LevelSource};
pub use pipeline::{
    CellArena, CellFuture, CellHolder, DirectDispatcher, PipelineDriver, PipelineSnapshot, PipelineStats,
    StageDispatcher, StageJob,
};
pub use queue::{Pop, TaskBatch, TaskQueue, TaskSlot};
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerStats};
pub use stage::{StageDescriptor, StageFuture, StageId, StageRegistry, StageRegistryBuilder, StageSpec, StageWork};
pub use store::{CellStore, CompressedCellStore, MemoryCellStore, NullStore};
pub use tickets::{Ticket, TicketKind, TicketMap, TicketTracker};
pub use worker::WorkerPool;
