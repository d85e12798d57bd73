//! # Level Propagation Integration Test
//!
//! Random ticket churn must always leave the graph at its fixed point.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera_scheduler::{LevelGraph, Ticket, TicketTracker};
use tessera_shared::{CellCoord, Level};

const MAX: Level = 12;

/// Test: 400 random add/remove operations, fixed point checked after each.
#[test]
fn test_random_churn_stays_consistent() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut tracker = TicketTracker::new(MAX);
    let mut live: Vec<(CellCoord, Ticket)> = Vec::new();

    for step in 0..400 {
        if live.is_empty() || rng.gen_bool(0.55) {
            let cell = CellCoord::new(rng.gen_range(-8..=8), rng.gen_range(-8..=8));
            let ticket = Ticket::custom(rng.gen_range(0..=MAX));
            tracker.add_ticket(cell, ticket, &mut ());
            live.push((cell, ticket));
        } else {
            let (cell, ticket) = live.swap_remove(rng.gen_range(0..live.len()));
            assert!(tracker.remove_ticket(cell, ticket, &mut ()));
        }
        assert!(
            tracker.graph().is_fixed_point(tracker.tickets(), tracker.ticketed_cells()),
            "not a fixed point after step {step}"
        );
    }

    for (cell, ticket) in live.drain(..) {
        tracker.remove_ticket(cell, ticket, &mut ());
    }
    assert!(tracker.graph().is_empty());
}

/// Test: removing one of two sources only touches cells the removed one supported.
#[test]
fn test_removal_is_local() {
    let mut tracker = TicketTracker::new(MAX);
    let near = CellCoord::new(0, 0);
    let far = CellCoord::new(20, 0);
    tracker.add_ticket(near, Ticket::custom(8), &mut ());
    tracker.add_ticket(far, Ticket::custom(8), &mut ());

    let mut changes = Vec::new();
    tracker.remove_ticket(near, Ticket::custom(8), &mut changes);

    assert_eq!(changes.len(), 81);
    assert!(changes.iter().all(|(c, _, new)| c.chebyshev_distance(near) <= 4 && *new == MAX + 1));
    assert_eq!(tracker.level(far), 8);
    assert_eq!(tracker.level(CellCoord::new(16, 0)), 12);
}

/// Test: the graph is usable on its own with a plain map as the source.
#[test]
fn test_graph_with_map_source() {
    let mut graph = LevelGraph::new(3);
    let mut sources: std::collections::HashMap<CellCoord, Level> = std::collections::HashMap::new();
    sources.insert(CellCoord::ORIGIN, 3);
    graph.update(CellCoord::ORIGIN, 3, true, &sources, &mut ());
    assert_eq!(graph.len(), 1);
    assert_eq!(graph.level(CellCoord::new(1, 1)), graph.absent_level());
}
