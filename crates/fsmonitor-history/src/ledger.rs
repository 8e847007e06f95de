use std::sync::Arc;

use tracing::trace;

use crate::batch::{Batch, Batches};

/// Largest number of paths we will fold into an unsealed head batch before
/// starting a new one. Keeps a single batch from growing without bound during
/// a long burst of events.
pub const COMBINE_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The incoming batch had no paths.
    Empty,
    /// The incoming batch became the new head.
    Prepended { sequence: u64 },
    /// The incoming paths were appended to the existing head.
    Merged { sequence: u64 },
    /// The head is batch 0 and nobody can ever ask for changes after it, so
    /// the paths were dropped.
    Discarded { dropped: usize },
}

/// Newest-first chain of batches belonging to one token series.
///
/// The ledger always holds at least one batch. Only the head is ever
/// mutated, and only while it is unsealed.
#[derive(Debug)]
pub struct BatchLedger {
    head: Arc<Batch>,
    len: usize,
}

impl BatchLedger {
    /// Starts a ledger with an empty, unsealed batch 0.
    pub fn new() -> Self {
        Self {
            head: Arc::new(Batch::new()),
            len: 1,
        }
    }

    /// Starts a ledger whose batch 0 is already pinned, so that the very
    /// first published events are kept rather than discarded. Used when
    /// token ids are deterministic so fixtures can observe early events.
    pub fn new_pinned() -> Self {
        let ledger = Self::new();
        ledger.head.pin();
        ledger
    }

    pub fn head(&self) -> &Arc<Batch> {
        &self.head
    }

    pub fn head_sequence(&self) -> u64 {
        self.head.sequence()
    }

    /// Number of batches in the ledger.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Batch>> {
        Batches::new(&self.head)
    }

    /// Seals the head and hands out a reference to it. Everything reachable
    /// from the returned batch is immutable from here on.
    pub(crate) fn pin_head(&self) -> Arc<Batch> {
        self.head.pin();
        self.head.clone()
    }

    /// Merges a freshly collected batch into the ledger.
    ///
    /// Must be called with exclusive access to the ledger, once per drained
    /// burst of events.
    pub fn publish(&mut self, batch: Batch) -> PublishOutcome {
        if batch.is_empty() {
            return PublishOutcome::Empty;
        }

        let outcome = if self.head.is_sealed() {
            // Readers may be walking from this head right now, and earlier
            // replies named its sequence. It can only be prepended to.
            self.prepend(batch)
        } else if self.head.sequence() == 0 {
            PublishOutcome::Discarded {
                dropped: batch.len(),
            }
        } else if self.head.len() + batch.len() > COMBINE_LIMIT {
            self.prepend(batch)
        } else {
            let sequence = self.head.sequence();
            Arc::get_mut(&mut self.head)
                .expect("BUG: unsealed head batch is shared with a reader")
                .append(batch);
            PublishOutcome::Merged { sequence }
        };
        trace!("publish: {:?}", outcome);
        outcome
    }

    fn prepend(&mut self, mut batch: Batch) -> PublishOutcome {
        let sequence = self.head.sequence() + 1;
        batch.set_sequence(sequence);
        batch.next = Some(self.head.clone());
        self.head = Arc::new(batch);
        self.len += 1;
        PublishOutcome::Prepended { sequence }
    }
}

impl Default for BatchLedger {
    fn default() -> Self {
        Self::new()
    }
}
