//! Ordered release of out-of-order completions.
//!
//! Inference calls for one session finish in whatever order the provider
//! returns them. [`ReorderBuffer`] holds early completions until everything
//! submitted before them has finished, so results leave in submission order.
//! The buffer is bounded: once the span of buffered tickets reaches the
//! window, the floor jumps past whatever is still outstanding and those
//! tickets are treated as stale when they finally arrive.

use std::collections::BTreeMap;

/// Outcome of feeding one completion into a [`ReorderBuffer`].
#[derive(Debug, PartialEq)]
pub enum Release<T> {
    /// The completion was accepted. `ready` holds every item that can now be
    /// delivered, in ticket order; `skipped` counts outstanding tickets the
    /// window gave up on.
    Ready { ready: Vec<T>, skipped: u64 },
    /// The ticket is below the floor; the completion must be discarded.
    Stale,
}

#[derive(Debug)]
pub struct ReorderBuffer<T> {
    floor: u64,
    window: u64,
    pending: BTreeMap<u64, Option<T>>,
}

impl<T> ReorderBuffer<T> {
    /// Creates a buffer expecting ticket `0` first. A zero window is treated
    /// as one.
    pub fn new(window: usize) -> Self {
        Self {
            floor: 0,
            window: window.max(1) as u64,
            pending: BTreeMap::new(),
        }
    }

    /// The lowest ticket still accepted.
    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Number of completions held back waiting for earlier tickets.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Records the completion of `ticket`. `None` marks a ticket that finished
    /// without producing anything; it still unblocks later tickets.
    pub fn push(&mut self, ticket: u64, item: Option<T>) -> Release<T> {
        if ticket < self.floor {
            return Release::Stale;
        }
        self.pending.insert(ticket, item);

        let mut ready = Vec::new();
        let mut skipped = 0;
        loop {
            self.drain_contiguous(&mut ready);
            let (Some((&first, _)), Some((&last, _))) =
                (self.pending.first_key_value(), self.pending.last_key_value())
            else {
                break;
            };
            if last - self.floor < self.window {
                break;
            }
            skipped += first - self.floor;
            self.floor = first;
        }

        Release::Ready { ready, skipped }
    }

    /// Drops everything buffered. The floor is kept so late completions are
    /// still recognised as stale.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn drain_contiguous(&mut self, ready: &mut Vec<T>) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.floor {
                break;
            }
            if let Some(item) = entry.remove() {
                ready.push(item);
            }
            self.floor += 1;
        }
    }
}
