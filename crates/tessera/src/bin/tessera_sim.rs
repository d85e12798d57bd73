//! # TESSERA Simulation
//!
//! Headless run of the full scheduler over the demo terrain.
//!
//! A player ticket sits at the origin until every cell in view is terminal,
//! then walks east one view distance and waits again.
//!
//! ```bash
//! # Defaults, in-memory store
//! ./tessera_sim
//!
//! # Custom config, cells persisted under ./world
//! ./tessera_sim tessera.toml ./world
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tessera::demo::{DemoSeed, DemoTerrain, LitCells};
use tessera::scheduler::{
    CellStore, CompressedCellStore, MemoryCellStore, Scheduler, SchedulerConfig, StageRegistry, Ticket,
};
use tessera::shared::CellCoord;

/// Player view distance in cells.
const VIEW_DISTANCE: u8 = 4;
/// Columns of cells the player walks east.
const WALK: i32 = 4;
/// Give up waiting for a position after this long.
const POSITION_TIMEOUT: Duration = Duration::from_secs(60);

fn fail(what: &str, err: &dyn std::fmt::Display) -> ! {
    eprintln!("   ✗ FATAL: {what}: {err}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let config_path = args.next();
    let store_dir = args.next();

    println!("═══════════════════════════════════════════════════════════════════");
    println!("                    TESSERA SIMULATION v0.1.0");
    println!("═══════════════════════════════════════════════════════════════════");

    let config = match &config_path {
        Some(path) => SchedulerConfig::load(path).unwrap_or_else(|e| fail("config", &e)),
        None => SchedulerConfig::production(),
    };
    let store: Arc<dyn CellStore> = match &store_dir {
        Some(dir) => Arc::new(CompressedCellStore::open(dir).unwrap_or_else(|e| fail("store", &e))),
        None => Arc::new(MemoryCellStore::new()),
    };
    println!("  Config:   {}", config_path.as_deref().unwrap_or("production defaults"));
    println!("  Store:    {}", store_dir.as_deref().unwrap_or("memory"));
    println!("  Workers:  {}", config.workers);
    println!("  In flight: {}", config.max_concurrent);
    println!();

    let terrain = Arc::new(DemoTerrain::new(DemoSeed::default()));
    let lit = Arc::new(LitCells::new());
    let registry = Arc::new(StageRegistry::standard(terrain.clone()));
    let full_level = config.full_level;
    let scheduler = Scheduler::builder(registry)
        .config(config)
        .store(store)
        .lighting(lit.clone())
        .build()
        .unwrap_or_else(|e| fail("scheduler", &e));
    let workers = scheduler.spawn_workers();

    let ticket = Ticket::player(VIEW_DISTANCE, full_level);
    let mut position = CellCoord::ORIGIN;
    scheduler.add_ticket(position, ticket);
    settle(&scheduler, position).await;

    let next = position.offset(WALK, 0);
    println!("🚶 Walking {position} → {next}");
    scheduler.add_ticket(next, ticket);
    scheduler.remove_ticket(position, ticket);
    position = next;
    settle(&scheduler, position).await;

    workers.shutdown().await;
    let written = scheduler.flush().unwrap_or_else(|e| fail("flush", &e));
    let stats = scheduler.stats();
    println!();
    println!("📊 Stage invocations: {}", terrain.invocations());
    println!("   Generated:         {}", stats.pipeline.generated);
    println!("   Loaded:            {}", stats.pipeline.loaded);
    println!("   Unloaded:          {}", stats.pipeline.unloaded);
    println!("   Lit cells:         {}", lit.len());
    println!("   Cells flushed:     {written}");
}

/// Waits until every cell in view of `position` is terminal.
async fn settle(scheduler: &Scheduler, position: CellCoord) {
    let started = Instant::now();
    let terminal = scheduler.registry().terminal();
    let in_view: Vec<CellCoord> = position.within(u32::from(VIEW_DISTANCE)).collect();
    let completions = scheduler.completions();

    loop {
        let done = in_view
            .iter()
            .filter(|c| scheduler.stage_of(**c) == Some(terminal))
            .count();
        let events = completions.try_iter().count();
        let stats = scheduler.stats();
        println!(
            "   {:>4}/{} terminal | +{:<5} transitions | pending {:<4} in flight {}",
            done,
            in_view.len(),
            events,
            stats.pending,
            stats.in_flight
        );
        if done == in_view.len() {
            println!("   ✓ {position} settled in {:?}", started.elapsed());
            return;
        }
        if started.elapsed() > POSITION_TIMEOUT {
            fail("settle", &format!("{position} still incomplete"));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
