//! # Scheduler
//!
//! Ties the components together:
//!
//! ```text
//! tickets ─▶ LevelGraph ─▶ LevelSync ─▶ TaskQueue.resort / release
//!                                            ▲
//! PipelineDriver ── StageJob ─▶ QueueDispatcher   (submit at the cell's level)
//!                                            │
//! workers ◀──────────── pop() ───────────────┘
//! ```
//!
//! Tickets, the level graph and the queue share one lock, so a level update
//! and the resorts it causes are atomic with respect to `pop()`. Stage work
//! always runs after the lock is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tessera_shared::{CellCoord, Level};

use crate::cell::Cell;
use crate::completion::{Completion, CompletionHub, LightingHook};
use crate::config::SchedulerConfig;
use crate::error::{ConfigResult, SchedulerError, SchedulerResult};
use crate::level_graph::LevelListener;
use crate::pipeline::{CellFuture, PipelineDriver, PipelineSnapshot, StageDispatcher, StageJob};
use crate::queue::{Pop, TaskBatch, TaskQueue, TaskSlot};
use crate::stage::{StageId, StageRegistry};
use crate::store::{CellStore, NullStore};
use crate::tickets::{Ticket, TicketTracker};
use crate::worker::WorkerPool;

/// State guarded by the scheduler lock.
struct SchedulerCore {
    tickets: TicketTracker,
    queue: TaskQueue<StageJob>,
}

/// Forwards level changes into the queue while the lock is held.
struct LevelSync<'a> {
    queue: &'a mut TaskQueue<StageJob>,
    max_level: Level,
    changes: Vec<(CellCoord, Level, Level)>,
    cancelled: usize,
}

impl LevelListener for LevelSync<'_> {
    fn on_level_changed(&mut self, cell: CellCoord, old: Level, new: Level) {
        if new > self.max_level {
            self.cancelled += self.queue.release(cell, true).len();
        } else if let Some(queued) = self.queue.level_of(cell) {
            self.queue.resort(cell, queued, new);
        }
        self.changes.push((cell, old, new));
    }
}

/// Queues stage jobs at their cell's level.
struct QueueDispatcher {
    core: Arc<Mutex<SchedulerCore>>,
    max_level: Level,
}

impl StageDispatcher for QueueDispatcher {
    fn dispatch(&self, job: StageJob, level_hint: Level) {
        let cell = job.cell();
        let mut core = self.core.lock();
        let level = core.tickets.level(cell);
        let level = if level <= self.max_level {
            level
        } else {
            level_hint.min(self.max_level)
        };
        core.queue.submit(TaskSlot::Work(job), cell, level);
    }
}

/// Counters and sizes at one point in time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Transition counters from the pipeline.
    pub pipeline: PipelineSnapshot,
    /// Cells with queued work.
    pub pending: usize,
    /// Cells acquired by workers.
    pub in_flight: usize,
    /// Cells with a finite level.
    pub leveled: usize,
    /// Cells tracked by the pipeline.
    pub tracked: usize,
    /// Tickets over all cells.
    pub tickets: usize,
    /// Batches whose stage work panicked.
    pub panicked: u64,
}

struct Shared {
    config: SchedulerConfig,
    core: Arc<Mutex<SchedulerCore>>,
    driver: Arc<PipelineDriver>,
    panicked: AtomicU64,
}

/// Builds a [`Scheduler`].
pub struct SchedulerBuilder {
    registry: Arc<StageRegistry>,
    config: SchedulerConfig,
    store: Arc<dyn CellStore>,
    lighting: Option<Arc<dyn LightingHook>>,
}

impl SchedulerBuilder {
    /// Replaces the default configuration.
    #[must_use]
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Persists and reloads cells through `store` (default: nothing is kept).
    #[must_use]
    pub fn store(mut self, store: Arc<dyn CellStore>) -> Self {
        self.store = store;
        self
    }

    /// Installs a lighting hook.
    #[must_use]
    pub fn lighting(mut self, hook: Arc<dyn LightingHook>) -> Self {
        self.lighting = Some(hook);
        self
    }

    /// Validates the configuration and assembles the scheduler. Forced
    /// cells from the configuration get their tickets here.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is inconsistent with the registry.
    pub fn build(self) -> ConfigResult<Scheduler> {
        let Self {
            registry,
            config,
            store,
            lighting,
        } = self;
        config.validate(&registry)?;

        let core = Arc::new(Mutex::new(SchedulerCore {
            tickets: TicketTracker::new(config.max_level),
            queue: TaskQueue::new(config.max_level, config.max_concurrent),
        }));
        let dispatcher = Arc::new(QueueDispatcher {
            core: Arc::clone(&core),
            max_level: config.max_level,
        });
        let hub = Arc::new(CompletionHub::new(registry.terminal(), config.completion_capacity));
        let mut driver = PipelineDriver::new(Arc::clone(&registry), store, dispatcher).with_completions(hub);
        if let Some(hook) = lighting {
            driver = driver.with_lighting(hook);
        }

        tracing::info!(
            "scheduler ready: {} stages, max level {}, full level {}, max concurrent {}",
            registry.len(),
            config.max_level,
            config.full_level,
            config.max_concurrent
        );

        let forced = config.forced_cells.clone();
        let full_level = config.full_level;
        let scheduler = Scheduler {
            shared: Arc::new(Shared {
                config,
                core,
                driver: Arc::new(driver),
                panicked: AtomicU64::new(0),
            }),
        };
        for cell in forced {
            scheduler.add_ticket(cell, Ticket::forced(full_level));
        }
        Ok(scheduler)
    }
}

/// The staged world-generation scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Starts building a scheduler over `registry`.
    #[must_use]
    pub fn builder(registry: Arc<StageRegistry>) -> SchedulerBuilder {
        SchedulerBuilder {
            registry,
            config: SchedulerConfig::default(),
            store: Arc::new(NullStore),
            lighting: None,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// The stage chain.
    #[must_use]
    pub fn registry(&self) -> &Arc<StageRegistry> {
        self.shared.driver.registry()
    }

    /// The pipeline driver.
    #[must_use]
    pub fn driver(&self) -> &Arc<PipelineDriver> {
        &self.shared.driver
    }

    /// Adds a ticket and applies the resulting level changes.
    ///
    /// # Panics
    ///
    /// Panics if the ticket's level is above `max_level`.
    pub fn add_ticket(&self, cell: CellCoord, ticket: Ticket) {
        let changes = self.with_level_sync(|tickets, sync| tickets.add_ticket(cell, ticket, sync));
        self.apply(changes);
    }

    /// Removes one matching ticket. Returns false if there was none.
    pub fn remove_ticket(&self, cell: CellCoord, ticket: Ticket) -> bool {
        let mut found = false;
        let changes = self.with_level_sync(|tickets, sync| {
            found = tickets.remove_ticket(cell, ticket, sync);
        });
        self.apply(changes);
        found
    }

    fn with_level_sync(&self, f: impl FnOnce(&mut TicketTracker, &mut LevelSync<'_>)) -> Vec<(CellCoord, Level, Level)> {
        let mut guard = self.shared.core.lock();
        let core = &mut *guard;
        let mut sync = LevelSync {
            queue: &mut core.queue,
            max_level: self.shared.config.max_level,
            changes: Vec::new(),
            cancelled: 0,
        };
        f(&mut core.tickets, &mut sync);
        if sync.cancelled > 0 {
            tracing::debug!("level update cancelled {} queued jobs", sync.cancelled);
        }
        sync.changes
    }

    /// Reacts to level changes outside the lock: unloads cells that became
    /// absent and, with `auto_request`, asks for the stage each new level needs.
    fn apply(&self, changes: Vec<(CellCoord, Level, Level)>) {
        let config = &self.shared.config;
        let driver = &self.shared.driver;
        for (cell, _old, new) in changes {
            if new > config.max_level {
                match driver.unload(cell) {
                    Ok(Some(_)) => tracing::trace!("unloaded {}", cell),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("failed to save {} on unload: {}", cell, e),
                }
                continue;
            }
            if !config.auto_request {
                continue;
            }
            let Some(target) = self.registry().stage_for_level(new, config.full_level) else {
                continue;
            };
            if driver.arena().stage_of(cell).is_some_and(|s| s >= target) {
                continue;
            }
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                tracing::debug!("no runtime, skipping request for {}", cell);
                continue;
            };
            let request = driver.ensure_stage(cell, target, new);
            drop(runtime.spawn(async move {
                if let Err(e) = request.await {
                    tracing::debug!("request for {} stopped: {}", cell, e);
                }
            }));
        }
    }

    /// Current level of a cell.
    #[must_use]
    pub fn level(&self, cell: CellCoord) -> Level {
        self.shared.core.lock().tickets.level(cell)
    }

    /// The stage a cell's current level requires, if any.
    #[must_use]
    pub fn required_stage(&self, cell: CellCoord) -> Option<StageId> {
        let level = self.level(cell);
        if level > self.shared.config.max_level {
            return None;
        }
        self.registry().stage_for_level(level, self.shared.config.full_level)
    }

    fn hint(&self, cell: CellCoord) -> Level {
        self.level(cell).min(self.shared.config.max_level)
    }

    /// Advances `cell` until it reaches `target`. Stage work only runs when a
    /// worker pops it.
    pub fn request(&self, cell: CellCoord, target: StageId) -> CellFuture {
        self.shared.driver.ensure_stage(cell, target, self.hint(cell))
    }

    /// Advances `cell` by one stage.
    ///
    /// # Errors
    ///
    /// Returns error if the step fails; see [`PipelineDriver::advance`].
    pub async fn advance(&self, cell: CellCoord) -> SchedulerResult<Arc<Cell>> {
        let hint = self.hint(cell);
        self.shared.driver.advance(cell, hint).await
    }

    /// Resolves once `cell` is at the terminal stage. Does not request it.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Cancelled`] if the cell is unloaded first.
    pub async fn wait_for_terminal(&self, cell: CellCoord) -> SchedulerResult<Arc<Cell>> {
        let terminal = self.registry().terminal();
        let waiter = self.shared.driver.completions().subscribe(cell);
        if let Some(holder) = self.shared.driver.arena().get(cell) {
            if holder.stage() >= terminal {
                return Ok(holder.cell());
            }
        }
        waiter.await.map_err(|_| SchedulerError::Cancelled {
            cell,
            stage: terminal,
        })
    }

    /// Stream of every stage transition.
    #[must_use]
    pub fn completions(&self) -> crossbeam_channel::Receiver<Completion> {
        self.shared.driver.completions().completions()
    }

    /// Latest data of a tracked cell.
    #[must_use]
    pub fn cell(&self, cell: CellCoord) -> Option<Arc<Cell>> {
        self.shared.driver.cell(cell)
    }

    /// Stage of a tracked cell.
    #[must_use]
    pub fn stage_of(&self, cell: CellCoord) -> Option<StageId> {
        self.shared.driver.arena().stage_of(cell)
    }

    /// Queues a hold for `cell`. Once popped the cell stays acquired until
    /// [`Scheduler::release_reservation`].
    pub fn reserve(&self, cell: CellCoord) {
        let level = self.hint(cell);
        self.shared.core.lock().queue.submit(TaskSlot::Hold, cell, level);
    }

    /// Drops pending holds of `cell` and frees its in-flight slot.
    pub fn release_reservation(&self, cell: CellCoord) {
        self.shared.core.lock().queue.release(cell, false);
    }

    /// Pops one batch and runs its jobs. Returns false if nothing was ready
    /// (queue empty or saturated).
    ///
    /// Jobs run on their own task, so a panicking stage only cancels the
    /// rest of its batch; the cell's slot is released either way.
    pub async fn run_once(&self) -> bool {
        let batch = match self.shared.core.lock().queue.pop() {
            Pop::Ready(batch) => batch,
            Pop::Saturated | Pop::Empty => return false,
        };
        let TaskBatch { cell, tasks, holds, .. } = batch;
        if !tasks.is_empty() {
            let outcome = tokio::spawn(async move {
                for job in tasks {
                    job.run().await;
                }
            })
            .await;
            match outcome {
                Err(e) if e.is_panic() => {
                    self.shared.panicked.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("stage work for {} panicked: {}", cell, e);
                }
                Err(e) => tracing::warn!("stage work for {} did not finish: {}", cell, e),
                Ok(()) => {}
            }
        }
        if holds == 0 {
            self.shared.core.lock().queue.release(cell, false);
        }
        true
    }

    /// Spawns `config.workers` worker tasks on the current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn spawn_workers(&self) -> WorkerPool {
        WorkerPool::spawn(self.clone(), self.shared.config.workers, self.shared.config.poll_interval())
    }

    /// Counters and sizes.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let (pending, in_flight, leveled, tickets) = {
            let core = self.shared.core.lock();
            (
                core.queue.pending_len(),
                core.queue.in_flight_len(),
                core.tickets.graph().len(),
                core.tickets.ticket_count(),
            )
        };
        SchedulerStats {
            pipeline: self.shared.driver.stats().snapshot(),
            pending,
            in_flight,
            leveled,
            tracked: self.shared.driver.arena().len(),
            tickets,
            panicked: self.shared.panicked.load(Ordering::Relaxed),
        }
    }

    /// Writes every tracked cell to the store.
    ///
    /// # Errors
    ///
    /// Returns error on the first failed write.
    pub fn flush(&self) -> SchedulerResult<usize> {
        self.shared.driver.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::NeighborWindow;
    use crate::stage::{StageFuture, StageSpec, StageWork};

    struct Noop;

    impl StageWork for Noop {
        fn generate(&self, window: NeighborWindow) -> StageFuture<'_> {
            Box::pin(async move { Ok(window.into_center()) })
        }
    }

    fn scheduler(config: SchedulerConfig) -> Scheduler {
        let registry = StageRegistry::builder("empty")
            .stage(StageSpec::new("base", Arc::new(Noop)))
            .stage(StageSpec::new("decorate", Arc::new(Noop)).range(1))
            .build()
            .unwrap();
        Scheduler::builder(Arc::new(registry)).config(config).build().unwrap()
    }

    #[test]
    fn test_forced_cells_get_tickets() {
        let config = SchedulerConfig {
            forced_cells: vec![CellCoord::new(2, 2)],
            ..SchedulerConfig::test()
        };
        let scheduler = scheduler(config);
        assert_eq!(scheduler.level(CellCoord::new(2, 2)), 2);
        assert_eq!(scheduler.level(CellCoord::new(4, 2)), 4);
        assert_eq!(scheduler.stats().tickets, 1);
        assert_eq!(scheduler.required_stage(CellCoord::new(2, 2)), Some(StageId::new(2)));
        assert_eq!(scheduler.required_stage(CellCoord::new(3, 3)), Some(StageId::new(1)));
        assert_eq!(scheduler.required_stage(CellCoord::new(4, 4)), None);
        assert_eq!(scheduler.required_stage(CellCoord::new(9, 9)), None);
    }

    #[test]
    fn test_level_change_resorts_queued_cell() {
        let scheduler = scheduler(SchedulerConfig::test());
        let cell = CellCoord::new(1, 0);
        scheduler.reserve(cell);
        assert_eq!(scheduler.shared.core.lock().queue.level_of(cell), Some(4));

        scheduler.add_ticket(CellCoord::ORIGIN, Ticket::custom(0));
        assert_eq!(scheduler.shared.core.lock().queue.level_of(cell), Some(1));

        assert!(scheduler.remove_ticket(CellCoord::ORIGIN, Ticket::custom(0)));
        assert!(!scheduler.shared.core.lock().queue.contains(cell));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let registry = StageRegistry::standard(Arc::new(Noop));
        let config = SchedulerConfig {
            max_level: 3,
            full_level: 2,
            ..SchedulerConfig::test()
        };
        assert!(Scheduler::builder(Arc::new(registry)).config(config).build().is_err());
    }
}
