//! # Pipeline Integration Test
//!
//! Neighbor ranges, terminal fixed point, failures and the lighting hook.

use std::sync::Arc;

use parking_lot::Mutex;
use tessera_scheduler::{
    CellView, CellViewMut, DirectDispatcher, LightingHook, MemoryCellStore, NeighborWindow,
    PipelineDriver, SchedulerError, StageError, StageFuture, StageId, StageRegistry, StageSpec,
    StageWork,
};
use tessera_shared::CellCoord;

/// Records what each invocation saw.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(CellCoord, StageId, Vec<(CellCoord, StageId)>)>>,
    fail_at: Option<CellCoord>,
}

impl StageWork for Recorder {
    fn generate(&self, mut window: NeighborWindow) -> StageFuture<'_> {
        Box::pin(async move {
            let coord = window.coord();
            if self.fail_at == Some(coord) {
                return Err(StageError::Synthesis(format!("refusing {coord}")));
            }
            let target = window.target_stage();
            let neighbors = window.neighbors().map(|n| (n.coord(), n.stage())).collect();
            self.seen.lock().push((coord, target, neighbors));
            window.center_mut().payload_mut().push(target.index() as u8);
            Ok(window.into_center())
        })
    }
}

#[derive(Default)]
struct LightLog(Mutex<Vec<(CellCoord, StageId)>>);

impl LightingHook for LightLog {
    fn schedule_lighting(&self, cell: CellCoord, stage: StageId) {
        self.0.lock().push((cell, stage));
    }
}

fn chain(work: &Arc<Recorder>) -> Arc<StageRegistry> {
    Arc::new(
        StageRegistry::builder("empty")
            .stage(StageSpec::new("base", work.clone()))
            .stage(StageSpec::new("decorate", work.clone()).range(1).lighting())
            .build()
            .unwrap(),
    )
}

fn driver(work: &Arc<Recorder>) -> Arc<PipelineDriver> {
    Arc::new(PipelineDriver::new(
        chain(work),
        Arc::new(MemoryCellStore::new()),
        Arc::new(DirectDispatcher),
    ))
}

/// Test: before "decorate" runs at the origin, all 9 cells are at "base".
#[tokio::test]
async fn test_range_one_sees_full_square_at_parent() {
    let work = Arc::new(Recorder::default());
    let driver = driver(&work);
    let base = StageId::new(1);
    let decorate = StageId::new(2);

    let cell = driver.ensure_stage(CellCoord::ORIGIN, decorate, 0).await.unwrap();
    assert_eq!(cell.stage(), decorate);
    assert_eq!(cell.payload(), &[1, 2]);

    let seen = work.seen.lock();
    let (_, stage, neighbors) = seen
        .iter()
        .find(|(c, s, _)| *c == CellCoord::ORIGIN && *s == decorate)
        .unwrap();
    assert_eq!(*stage, decorate);
    assert_eq!(neighbors.len(), 8);
    assert!(neighbors.iter().all(|(_, s)| *s >= base));
    for n in CellCoord::ORIGIN.ring(1) {
        assert!(neighbors.iter().any(|(c, _)| *c == n), "missing {n}");
    }
    // 9 cells at base plus the origin at decorate; nothing else ran.
    assert_eq!(seen.len(), 10);
}

/// Test: advancing a terminal cell changes nothing.
#[tokio::test]
async fn test_terminal_is_fixed_point() {
    let work = Arc::new(Recorder::default());
    let driver = driver(&work);
    let done = driver.ensure_stage(CellCoord::ORIGIN, StageId::new(2), 0).await.unwrap();
    let before = driver.stats().snapshot();

    let again = driver.advance(CellCoord::ORIGIN, 0).await.unwrap();
    assert!(Arc::ptr_eq(&done, &again));
    assert_eq!(driver.stats().snapshot(), before);

    // Targets past the terminal clamp to it.
    let clamped = driver.ensure_stage(CellCoord::ORIGIN, StageId::new(99), 0).await.unwrap();
    assert!(Arc::ptr_eq(&done, &clamped));
}

/// Test: a failing neighbor surfaces as DependencyUnavailable and leaves the
/// center at its previous stage.
#[tokio::test]
async fn test_dependency_failure() {
    let failing = CellCoord::new(1, 0);
    let work = Arc::new(Recorder {
        fail_at: Some(failing),
        ..Recorder::default()
    });
    let driver = driver(&work);

    let err = driver
        .ensure_stage(CellCoord::ORIGIN, StageId::new(2), 0)
        .await
        .unwrap_err();
    match &err {
        SchedulerError::DependencyUnavailable {
            cell,
            dependency,
            stage,
            source,
        } => {
            assert_eq!(*cell, CellCoord::ORIGIN);
            assert_eq!(*dependency, failing);
            assert_eq!(*stage, StageId::new(1));
            assert!(matches!(**source, SchedulerError::GenerationFailure { .. }));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(err.origin(), failing);
    assert_eq!(driver.arena().stage_of(CellCoord::ORIGIN), Some(StageId::new(1)));
    assert_eq!(driver.arena().stage_of(failing), Some(StageId::ROOT));
    assert_eq!(driver.stats().snapshot().failed, 1);
}

/// Test: stages flagged for lighting call the hook once per cell.
#[tokio::test]
async fn test_lighting_hook() {
    let work = Arc::new(Recorder::default());
    let lights = Arc::new(LightLog::default());
    let driver = Arc::new(
        PipelineDriver::new(chain(&work), Arc::new(MemoryCellStore::new()), Arc::new(DirectDispatcher))
            .with_lighting(lights.clone()),
    );
    driver.ensure_stage(CellCoord::new(3, 3), StageId::new(2), 0).await.unwrap();
    assert_eq!(*lights.0.lock(), vec![(CellCoord::new(3, 3), StageId::new(2))]);
}

/// Test: every transition shows up on the completion stream.
#[tokio::test]
async fn test_completion_stream() {
    let work = Arc::new(Recorder::default());
    let driver = driver(&work);
    let stream = driver.completions().completions();
    driver.ensure_stage(CellCoord::ORIGIN, StageId::new(2), 0).await.unwrap();

    let events: Vec<_> = stream.try_iter().collect();
    assert_eq!(events.len(), 10);
    assert_eq!(events.iter().filter(|e| e.stage == StageId::new(2)).count(), 1);
    assert!(events.iter().all(|e| !e.loaded));
}
