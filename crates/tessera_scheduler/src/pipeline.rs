//! # Pipeline Driver
//!
//! Walks a single cell forward through the stage chain, one stage per step.
//!
//! ## One Step (`S -> S.next`)
//!
//! 1. Take the cell's async advance lock, re-read its stage. Terminal is a
//!    fixed point.
//! 2. Bring every cell within `range(next)` to `parent(next)`, recursively.
//!    Neighbors already there are read without any lock.
//! 3. Ask the store (once per cell) for persisted data.
//! 4. Hand a [`StageJob`] to the dispatcher: `load` if the persisted stage
//!    reaches `next`, `generate` otherwise. Await its reply.
//! 5. On success publish the new cell and stage; on failure the recorded
//!    stage is unchanged.
//!
//! Dependencies always target a strictly lower stage than the one being
//! produced, and a neighbor at or past that stage is never locked, so a
//! chain of waiting cells cannot close into a cycle.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tessera_shared::{CellCoord, Level};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::cell::{Cell, CellView, NeighborWindow};
use crate::completion::{Completion, CompletionHub, LightingHook};
use crate::error::{SchedulerError, SchedulerResult, StageError, StageResult};
use crate::stage::{StageId, StageRegistry, StageWork};
use crate::store::CellStore;

/// Future returned by [`PipelineDriver::ensure_stage`].
pub type CellFuture = Pin<Box<dyn Future<Output = SchedulerResult<Arc<Cell>>> + Send>>;

/// Completion stream capacity of a driver built with [`PipelineDriver::new`].
const DEFAULT_COMPLETION_CAPACITY: usize = 1024;

enum Persisted {
    Unchecked,
    Missing,
    Found(Arc<Cell>),
}

/// Per-cell state shared by every task touching the cell.
pub struct CellHolder {
    coord: CellCoord,
    stage: AtomicU32,
    cell: RwLock<Arc<Cell>>,
    persisted: Mutex<Persisted>,
    advance: tokio::sync::Mutex<()>,
}

impl CellHolder {
    fn new(coord: CellCoord) -> Self {
        Self {
            coord,
            stage: AtomicU32::new(StageId::ROOT.index()),
            cell: RwLock::new(Arc::new(Cell::empty(coord))),
            persisted: Mutex::new(Persisted::Unchecked),
            advance: tokio::sync::Mutex::new(()),
        }
    }

    /// Cell position.
    #[must_use]
    pub const fn coord(&self) -> CellCoord {
        self.coord
    }

    /// Stage the cell has reached.
    #[must_use]
    pub fn stage(&self) -> StageId {
        StageId::new(self.stage.load(Ordering::Acquire))
    }

    /// Latest cell data.
    #[must_use]
    pub fn cell(&self) -> Arc<Cell> {
        Arc::clone(&self.cell.read())
    }

    fn commit(&self, cell: Arc<Cell>, stage: StageId) {
        *self.cell.write() = cell;
        self.stage.store(stage.index(), Ordering::Release);
    }
}

/// Every cell the driver currently tracks.
#[derive(Default)]
pub struct CellArena {
    holders: Mutex<HashMap<CellCoord, Arc<CellHolder>>>,
}

impl CellArena {
    /// The holder for `coord`, created at the root stage if missing.
    pub fn get_or_create(&self, coord: CellCoord) -> Arc<CellHolder> {
        Arc::clone(
            self.holders
                .lock()
                .entry(coord)
                .or_insert_with(|| Arc::new(CellHolder::new(coord))),
        )
    }

    /// The holder for `coord`, if tracked.
    #[must_use]
    pub fn get(&self, coord: CellCoord) -> Option<Arc<CellHolder>> {
        self.holders.lock().get(&coord).cloned()
    }

    /// Stops tracking `coord`.
    pub fn remove(&self, coord: CellCoord) -> Option<Arc<CellHolder>> {
        self.holders.lock().remove(&coord)
    }

    /// Stage of a tracked cell.
    #[must_use]
    pub fn stage_of(&self, coord: CellCoord) -> Option<StageId> {
        self.holders.lock().get(&coord).map(|h| h.stage())
    }

    /// Tracked positions, in no particular order.
    #[must_use]
    pub fn coords(&self) -> Vec<CellCoord> {
        self.holders.lock().keys().copied().collect()
    }

    /// Number of tracked cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.holders.lock().len()
    }

    /// Whether no cell is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holders.lock().is_empty()
    }
}

enum StageOp {
    Generate,
    Load(Cell),
}

/// One stage invocation waiting to run.
///
/// Dropping a job without running it cancels it: the waiting step fails
/// with [`SchedulerError::Cancelled`].
pub struct StageJob {
    cell: CellCoord,
    stage: StageId,
    op: StageOp,
    work: Arc<dyn StageWork>,
    window: NeighborWindow,
    reply: oneshot::Sender<StageResult<Cell>>,
}

impl StageJob {
    /// The cell being advanced.
    #[must_use]
    pub const fn cell(&self) -> CellCoord {
        self.cell
    }

    /// The stage being produced.
    #[must_use]
    pub const fn stage(&self) -> StageId {
        self.stage
    }

    /// Whether this job loads persisted data rather than generating.
    #[must_use]
    pub const fn is_load(&self) -> bool {
        matches!(self.op, StageOp::Load(_))
    }

    /// Runs the stage work and replies to the waiting step.
    pub async fn run(self) {
        let Self {
            op,
            work,
            window,
            reply,
            ..
        } = self;
        let result = match op {
            StageOp::Generate => work.generate(window).await,
            StageOp::Load(persisted) => work.load(window, persisted).await,
        };
        // The step may have been abandoned.
        let _ = reply.send(result);
    }
}

impl std::fmt::Debug for StageJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageJob")
            .field("cell", &self.cell)
            .field("stage", &self.stage)
            .field("load", &self.is_load())
            .finish_non_exhaustive()
    }
}

/// Decides where and when a [`StageJob`] runs.
pub trait StageDispatcher: Send + Sync {
    /// Takes ownership of a job. `level_hint` is the requester's priority
    /// for cells that have no level of their own.
    fn dispatch(&self, job: StageJob, level_hint: Level);
}

/// Runs every job immediately on its own tokio task.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDispatcher;

impl StageDispatcher for DirectDispatcher {
    fn dispatch(&self, job: StageJob, _level_hint: Level) {
        drop(tokio::spawn(job.run()));
    }
}

/// Transition counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    generated: AtomicU64,
    loaded: AtomicU64,
    failed: AtomicU64,
    unloaded: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    /// Stages produced by `generate`.
    pub generated: u64,
    /// Stages produced by `load`.
    pub loaded: u64,
    /// Stage invocations that failed.
    pub failed: u64,
    /// Cells dropped from the arena.
    pub unloaded: u64,
}

impl PipelineStats {
    /// Reads every counter.
    #[must_use]
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            generated: self.generated.load(Ordering::Relaxed),
            loaded: self.loaded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unloaded: self.unloaded.load(Ordering::Relaxed),
        }
    }
}

/// Advances cells through the stage chain.
pub struct PipelineDriver {
    registry: Arc<StageRegistry>,
    store: Arc<dyn CellStore>,
    dispatcher: Arc<dyn StageDispatcher>,
    arena: CellArena,
    hub: Arc<CompletionHub>,
    lighting: Option<Arc<dyn LightingHook>>,
    stats: PipelineStats,
}

impl PipelineDriver {
    /// Creates a driver with its own completion hub and no lighting hook.
    #[must_use]
    pub fn new(
        registry: Arc<StageRegistry>,
        store: Arc<dyn CellStore>,
        dispatcher: Arc<dyn StageDispatcher>,
    ) -> Self {
        let hub = Arc::new(CompletionHub::new(
            registry.terminal(),
            DEFAULT_COMPLETION_CAPACITY,
        ));
        Self {
            registry,
            store,
            dispatcher,
            arena: CellArena::default(),
            hub,
            lighting: None,
            stats: PipelineStats::default(),
        }
    }

    /// Replaces the completion hub.
    #[must_use]
    pub fn with_completions(mut self, hub: Arc<CompletionHub>) -> Self {
        self.hub = hub;
        self
    }

    /// Installs a lighting hook.
    #[must_use]
    pub fn with_lighting(mut self, hook: Arc<dyn LightingHook>) -> Self {
        self.lighting = Some(hook);
        self
    }

    /// The stage chain.
    #[must_use]
    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    /// The completion hub.
    #[must_use]
    pub fn completions(&self) -> &Arc<CompletionHub> {
        &self.hub
    }

    /// Tracked cells.
    #[must_use]
    pub const fn arena(&self) -> &CellArena {
        &self.arena
    }

    /// Transition counters.
    #[must_use]
    pub const fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Latest data of a tracked cell.
    #[must_use]
    pub fn cell(&self, coord: CellCoord) -> Option<Arc<Cell>> {
        self.arena.get(coord).map(|h| h.cell())
    }

    /// Advances `coord` step by step until it reaches `target` (clamped to
    /// the terminal stage).
    ///
    /// The returned future is `'static` so neighbor requests can recurse
    /// through it on separate tasks.
    pub fn ensure_stage(self: &Arc<Self>, coord: CellCoord, target: StageId, hint: Level) -> CellFuture {
        let driver = Arc::clone(self);
        Box::pin(async move {
            let target = target.min(driver.registry.terminal());
            let holder = driver.arena.get_or_create(coord);
            loop {
                if holder.stage() >= target {
                    return Ok(holder.cell());
                }
                driver.advance_holder(&holder, hint).await?;
            }
        })
    }

    /// Advances `coord` by exactly one stage. A terminal cell is returned
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns error if a neighbor cannot be brought to the parent stage,
    /// the store fails, the stage work fails, or the work was cancelled.
    pub async fn advance(self: &Arc<Self>, coord: CellCoord, hint: Level) -> SchedulerResult<Arc<Cell>> {
        let holder = self.arena.get_or_create(coord);
        self.advance_holder(&holder, hint).await
    }

    async fn advance_holder(self: &Arc<Self>, holder: &Arc<CellHolder>, hint: Level) -> SchedulerResult<Arc<Cell>> {
        let _guard = holder.advance.lock().await;
        let coord = holder.coord();
        let Some(next) = self.registry.next(holder.stage()) else {
            return Ok(holder.cell());
        };
        let descriptor = self.registry.get(next);
        let Some(work) = descriptor.work() else {
            return Ok(holder.cell());
        };

        let neighbors = self
            .satisfy_range(coord, descriptor.parent(), descriptor.range(), hint)
            .await?;

        let op = match self.persisted(holder)? {
            Some(persisted) if persisted.stage() >= next => StageOp::Load((*persisted).clone()),
            _ => StageOp::Generate,
        };
        let center = (*holder.cell()).clone();
        let (reply, response) = oneshot::channel();
        let job = StageJob {
            cell: coord,
            stage: next,
            op,
            work: Arc::clone(work),
            window: NeighborWindow::new(center, neighbors, next, descriptor.range()),
            reply,
        };
        let loaded = job.is_load();
        tracing::trace!("dispatching {} for {} (load: {})", descriptor.name(), coord, loaded);
        self.dispatcher.dispatch(job, hint);

        let result = response
            .await
            .map_err(|_| SchedulerError::Cancelled { cell: coord, stage: next })?;
        let mut produced = match result {
            Ok(cell) if cell.coord() == coord => cell,
            Ok(cell) => {
                return Err(self.failure(
                    coord,
                    next,
                    StageError::InvalidInput {
                        cell: coord,
                        reason: format!("stage returned cell {}", cell.coord()),
                    },
                ));
            }
            Err(source) => return Err(self.failure(coord, next, source)),
        };

        produced.set_stage(next);
        produced.prime_heightmaps(descriptor.heightmaps_after());
        let produced = Arc::new(produced);
        holder.commit(Arc::clone(&produced), next);

        let counter = if loaded { &self.stats.loaded } else { &self.stats.generated };
        counter.fetch_add(1, Ordering::Relaxed);
        self.hub.publish(
            &produced,
            Completion {
                cell: coord,
                stage: next,
                loaded,
            },
        );
        if descriptor.schedules_lighting() {
            if let Some(hook) = &self.lighting {
                hook.schedule_lighting(coord, next);
            }
        }
        Ok(produced)
    }

    fn failure(&self, cell: CellCoord, stage: StageId, source: StageError) -> SchedulerError {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("stage {} failed for {}: {}", stage, cell, source);
        SchedulerError::GenerationFailure { cell, stage, source }
    }

    /// Brings every cell within `range` of `center` to `parent`.
    async fn satisfy_range(
        self: &Arc<Self>,
        center: CellCoord,
        parent: StageId,
        range: u32,
        hint: Level,
    ) -> SchedulerResult<HashMap<CellCoord, Arc<Cell>>> {
        let mut neighbors = HashMap::new();
        let mut pending = JoinSet::new();
        for coord in center.within(range).skip(1) {
            match self.arena.get(coord) {
                Some(holder) if holder.stage() >= parent => {
                    neighbors.insert(coord, holder.cell());
                }
                _ => {
                    let request = self.ensure_stage(coord, parent, hint.saturating_add(1));
                    pending.spawn(async move { (coord, request.await) });
                }
            }
        }

        let mut first_error = None;
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok((coord, Ok(cell))) => {
                    neighbors.insert(coord, cell);
                }
                Ok((coord, Err(source))) => {
                    first_error.get_or_insert(SchedulerError::DependencyUnavailable {
                        cell: center,
                        dependency: coord,
                        stage: parent,
                        source: Box::new(source),
                    });
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => {
                    first_error.get_or_insert(SchedulerError::Cancelled {
                        cell: center,
                        stage: parent,
                    });
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(neighbors),
        }
    }

    /// Persisted data for the holder's cell, read from the store once.
    fn persisted(&self, holder: &CellHolder) -> SchedulerResult<Option<Arc<Cell>>> {
        let mut state = holder.persisted.lock();
        if matches!(*state, Persisted::Unchecked) {
            *state = match self.store.load(holder.coord())? {
                Some(cell) => Persisted::Found(Arc::new(cell)),
                None => Persisted::Missing,
            };
        }
        Ok(match &*state {
            Persisted::Found(cell) => Some(Arc::clone(cell)),
            Persisted::Unchecked | Persisted::Missing => None,
        })
    }

    /// Stops tracking `coord`, writing it back to the store if it got past
    /// the root stage. Waiters on the cell are dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the store write fails; the cell is untracked anyway.
    pub fn unload(&self, coord: CellCoord) -> SchedulerResult<Option<Arc<Cell>>> {
        self.hub.forget(coord);
        let Some(holder) = self.arena.remove(coord) else {
            return Ok(None);
        };
        self.stats.unloaded.fetch_add(1, Ordering::Relaxed);
        let cell = holder.cell();
        if cell.stage() > StageId::ROOT {
            self.store.store(&cell)?;
        }
        Ok(Some(cell))
    }

    /// Writes every tracked cell past the root stage to the store.
    ///
    /// # Errors
    ///
    /// Returns error on the first failed write.
    pub fn flush(&self) -> SchedulerResult<usize> {
        let mut written = 0;
        for coord in self.arena.coords() {
            let Some(holder) = self.arena.get(coord) else {
                continue;
            };
            let cell = holder.cell();
            if cell.stage() > StageId::ROOT {
                self.store.store(&cell)?;
                written += 1;
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellViewMut;
    use crate::stage::{StageFuture, StageSpec};
    use crate::store::{MemoryCellStore, NullStore};

    struct Tag(u8);

    impl StageWork for Tag {
        fn generate(&self, mut window: NeighborWindow) -> StageFuture<'_> {
            Box::pin(async move {
                window.center_mut().payload_mut().push(self.0);
                Ok(window.into_center())
            })
        }
    }

    fn registry() -> Arc<StageRegistry> {
        Arc::new(
            StageRegistry::builder("empty")
                .stage(StageSpec::new("a", Arc::new(Tag(1))))
                .stage(StageSpec::new("b", Arc::new(Tag(2))).range(1))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_ensure_stage_walks_chain() {
        let driver = Arc::new(PipelineDriver::new(registry(), Arc::new(NullStore), Arc::new(DirectDispatcher)));
        let cell = driver.ensure_stage(CellCoord::ORIGIN, StageId::new(2), 0).await.unwrap();
        assert_eq!(cell.stage(), StageId::new(2));
        assert_eq!(cell.payload(), &[1, 2]);
        // Centre plus its eight neighbors at stage a.
        assert_eq!(driver.arena().len(), 9);
        assert_eq!(driver.stats().snapshot().generated, 10);
    }

    #[tokio::test]
    async fn test_store_data_is_loaded() {
        let store = Arc::new(MemoryCellStore::new());
        let mut persisted = Cell::empty(CellCoord::ORIGIN);
        persisted.payload_mut().push(42);
        persisted.set_stage(StageId::new(1));
        store.store(&persisted).unwrap();

        let driver = Arc::new(PipelineDriver::new(registry(), store, Arc::new(DirectDispatcher)));
        let cell = driver.advance(CellCoord::ORIGIN, 0).await.unwrap();
        assert_eq!(cell.payload(), &[42]);
        let snapshot = driver.stats().snapshot();
        assert_eq!((snapshot.loaded, snapshot.generated), (1, 0));
    }

    #[tokio::test]
    async fn test_unload_writes_back() {
        let store = Arc::new(MemoryCellStore::new());
        let driver = Arc::new(PipelineDriver::new(registry(), store.clone(), Arc::new(DirectDispatcher)));
        driver.advance(CellCoord::new(5, 5), 0).await.unwrap();
        driver.arena().get_or_create(CellCoord::new(9, 9));

        assert_eq!(driver.flush().unwrap(), 1);
        assert!(driver.unload(CellCoord::new(5, 5)).unwrap().is_some());
        assert!(driver.unload(CellCoord::new(5, 5)).unwrap().is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(driver.arena().len(), 1);
    }
}
