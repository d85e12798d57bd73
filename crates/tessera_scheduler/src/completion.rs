//! # Completion Hub
//!
//! Fan-out for finished stage transitions:
//!
//! - one-shot waiters per cell, fired when the cell reaches the terminal stage
//! - a bounded stream of every transition for observers that poll
//!
//! The stream never blocks the publisher: when it is full the event is
//! dropped and only the waiters are served.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tessera_shared::CellCoord;
use tokio::sync::oneshot;

use crate::cell::Cell;
use crate::stage::StageId;

/// A finished stage transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    /// The cell that advanced.
    pub cell: CellCoord,
    /// The stage it reached.
    pub stage: StageId,
    /// Whether the stage was loaded from the store rather than generated.
    pub loaded: bool,
}

/// Called after a stage flagged for lighting completes.
pub trait LightingHook: Send + Sync {
    /// Schedules light propagation for `cell`, now at `stage`.
    fn schedule_lighting(&self, cell: CellCoord, stage: StageId);
}

/// Waiters and transition stream.
pub struct CompletionHub {
    terminal: StageId,
    waiters: Mutex<HashMap<CellCoord, Vec<oneshot::Sender<Arc<Cell>>>>>,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
}

impl CompletionHub {
    /// Creates a hub; the stream holds at most `capacity` unread events.
    #[must_use]
    pub fn new(terminal: StageId, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            terminal,
            waiters: Mutex::new(HashMap::new()),
            tx,
            rx,
        }
    }

    /// Returns a receiver that fires when `cell` next reaches the terminal stage.
    pub fn subscribe(&self, cell: CellCoord) -> oneshot::Receiver<Arc<Cell>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().entry(cell).or_default().push(tx);
        rx
    }

    /// A handle on the transition stream. Handles share one queue.
    #[must_use]
    pub fn completions(&self) -> Receiver<Completion> {
        self.rx.clone()
    }

    /// Records a transition.
    pub fn publish(&self, cell: &Arc<Cell>, completion: Completion) {
        match self.tx.try_send(completion) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!("completion stream full, dropped {}", completion.cell);
            }
        }
        if completion.stage != self.terminal {
            return;
        }
        let waiters = self.waiters.lock().remove(&completion.cell);
        for waiter in waiters.into_iter().flatten() {
            // The waiter may have given up.
            let _ = waiter.send(Arc::clone(cell));
        }
    }

    /// Drops every waiter of `cell`; their receivers observe a closed channel.
    pub fn forget(&self, cell: CellCoord) {
        self.waiters.lock().remove(&cell);
    }

    /// Number of cells with at least one waiter.
    #[must_use]
    pub fn waiting_cells(&self) -> usize {
        self.waiters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellView;

    #[test]
    fn test_waiters_fire_on_terminal_only() {
        let hub = CompletionHub::new(StageId::new(2), 8);
        let coord = CellCoord::new(4, -4);
        let mut rx = hub.subscribe(coord);
        let cell = Arc::new(Cell::empty(coord));

        hub.publish(&cell, Completion { cell: coord, stage: StageId::new(1), loaded: false });
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.waiting_cells(), 1);

        hub.publish(&cell, Completion { cell: coord, stage: StageId::new(2), loaded: true });
        assert_eq!(rx.try_recv().unwrap().coord(), coord);
        assert_eq!(hub.waiting_cells(), 0);

        let stream = hub.completions();
        assert_eq!(stream.try_recv().unwrap().stage, StageId::new(1));
        assert!(stream.try_recv().unwrap().loaded);
    }

    #[test]
    fn test_full_stream_drops_events() {
        let hub = CompletionHub::new(StageId::new(1), 1);
        let coord = CellCoord::ORIGIN;
        let cell = Arc::new(Cell::empty(coord));
        for _ in 0..3 {
            hub.publish(&cell, Completion { cell: coord, stage: StageId::new(1), loaded: false });
        }
        assert_eq!(hub.completions().len(), 1);
    }

    #[test]
    fn test_forget_closes_receivers() {
        let hub = CompletionHub::new(StageId::new(1), 1);
        let mut rx = hub.subscribe(CellCoord::ORIGIN);
        hub.forget(CellCoord::ORIGIN);
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }
}
