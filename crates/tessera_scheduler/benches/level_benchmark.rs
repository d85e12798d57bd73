//! Benchmark for level propagation.
//!
//! Run with: cargo bench --package tessera_scheduler --bench level_benchmark

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tessera_scheduler::{Ticket, TicketTracker};
use tessera_shared::{CellCoord, FULL_LEVEL, MAX_LEVEL};

fn benchmark_player_ticket(c: &mut Criterion) {
    c.bench_function("player_ticket_add_remove", |b| {
        let mut tracker = TicketTracker::new(MAX_LEVEL);
        let ticket = Ticket::player(10, FULL_LEVEL);
        b.iter(|| {
            tracker.add_ticket(CellCoord::ORIGIN, ticket, &mut ());
            tracker.remove_ticket(CellCoord::ORIGIN, ticket, &mut ());
            black_box(tracker.graph().len())
        });
    });
}

fn benchmark_walking_player(c: &mut Criterion) {
    c.bench_function("player_walk_64_cells", |b| {
        let ticket = Ticket::player(8, FULL_LEVEL);
        b.iter(|| {
            let mut tracker = TicketTracker::new(MAX_LEVEL);
            let mut changes = Vec::new();
            tracker.add_ticket(CellCoord::ORIGIN, ticket, &mut changes);
            for x in 1..64 {
                tracker.add_ticket(CellCoord::new(x, 0), ticket, &mut changes);
                tracker.remove_ticket(CellCoord::new(x - 1, 0), ticket, &mut changes);
            }
            black_box(changes.len())
        });
    });
}

criterion_group!(benches, benchmark_player_ticket, benchmark_walking_player);
criterion_main!(benches);
