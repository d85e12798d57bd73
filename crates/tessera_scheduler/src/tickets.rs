//! # Tickets
//!
//! A ticket is one reason to keep a cell loaded. Each cell holds a
//! multiset of tickets; its source level is the lowest among them. The
//! tracker feeds source changes into the [`LevelGraph`].

use std::collections::HashMap;

use tessera_shared::{CellCoord, Level};

use crate::level_graph::{LevelGraph, LevelListener, LevelSource};

/// Why a ticket exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TicketKind {
    /// A player is nearby.
    Player,
    /// The cell was pinned by configuration or an operator.
    Forced,
    /// Any other caller-defined reason.
    Custom,
}

/// One source contribution at a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ticket {
    /// Why the ticket exists.
    pub kind: TicketKind,
    /// Source level it contributes.
    pub level: Level,
}

impl Ticket {
    /// A player ticket: terminal stage within `view_distance` cells.
    #[must_use]
    pub const fn player(view_distance: u8, full_level: Level) -> Self {
        Self {
            kind: TicketKind::Player,
            level: full_level.saturating_sub(view_distance),
        }
    }

    /// A forced ticket: the cell itself reaches the terminal stage.
    #[must_use]
    pub const fn forced(full_level: Level) -> Self {
        Self {
            kind: TicketKind::Forced,
            level: full_level,
        }
    }

    /// A ticket at an arbitrary level.
    #[must_use]
    pub const fn custom(level: Level) -> Self {
        Self {
            kind: TicketKind::Custom,
            level,
        }
    }
}

/// Tickets per cell.
#[derive(Debug, Default)]
pub struct TicketMap {
    tickets: HashMap<CellCoord, Vec<Ticket>>,
}

impl TicketMap {
    fn min_level(&self, cell: CellCoord) -> Option<Level> {
        self.tickets
            .get(&cell)
            .and_then(|t| t.iter().map(|t| t.level).min())
    }
}

impl LevelSource for TicketMap {
    fn source_level(&self, cell: CellCoord) -> Option<Level> {
        self.min_level(cell)
    }
}

/// Ticket bookkeeping plus the level graph it drives.
#[derive(Debug)]
pub struct TicketTracker {
    tickets: TicketMap,
    graph: LevelGraph,
}

impl TicketTracker {
    /// Creates a tracker with an empty graph of `0..=max_level`.
    #[must_use]
    pub fn new(max_level: Level) -> Self {
        Self {
            tickets: TicketMap::default(),
            graph: LevelGraph::new(max_level),
        }
    }

    /// Adds a ticket, lowering levels if it beats the cell's current minimum.
    ///
    /// # Panics
    ///
    /// Panics if the ticket's level is above the graph's max level.
    pub fn add_ticket(&mut self, cell: CellCoord, ticket: Ticket, listener: &mut impl LevelListener) {
        let before = self.tickets.min_level(cell);
        self.tickets.tickets.entry(cell).or_default().push(ticket);
        if before.map_or(true, |b| ticket.level < b) {
            self.graph
                .update(cell, ticket.level, true, &self.tickets, listener);
        }
    }

    /// Removes one matching ticket. Returns false if the cell had none.
    ///
    /// Levels are only re-derived when the removed ticket was the cell's
    /// minimum and no other ticket holds that minimum.
    pub fn remove_ticket(
        &mut self,
        cell: CellCoord,
        ticket: Ticket,
        listener: &mut impl LevelListener,
    ) -> bool {
        let Some(list) = self.tickets.tickets.get_mut(&cell) else {
            return false;
        };
        let Some(index) = list.iter().position(|t| *t == ticket) else {
            return false;
        };
        let before = list.iter().map(|t| t.level).min();
        list.swap_remove(index);
        if list.is_empty() {
            self.tickets.tickets.remove(&cell);
        }
        let after = self.tickets.min_level(cell);
        if before == Some(ticket.level) && after != before {
            self.graph
                .update(cell, ticket.level, false, &self.tickets, listener);
        }
        true
    }

    /// Current level of a cell.
    #[must_use]
    pub fn level(&self, cell: CellCoord) -> Level {
        self.graph.level(cell)
    }

    /// The underlying graph.
    #[must_use]
    pub const fn graph(&self) -> &LevelGraph {
        &self.graph
    }

    /// The ticket map, usable as a [`LevelSource`].
    #[must_use]
    pub const fn tickets(&self) -> &TicketMap {
        &self.tickets
    }

    /// Total tickets over all cells.
    #[must_use]
    pub fn ticket_count(&self) -> usize {
        self.tickets.tickets.values().map(Vec::len).sum()
    }

    /// Cells holding at least one ticket.
    pub fn ticketed_cells(&self) -> impl Iterator<Item = CellCoord> + '_ {
        self.tickets.tickets.keys().copied()
    }
}
