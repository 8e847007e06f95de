use std::{
    fmt,
    sync::{Arc, OnceLock},
    time::SystemTime,
};

use crate::intern::InternedPath;

/// A set of changed paths, tagged with a sequence number once it is
/// published into a ledger.
///
/// A batch is mutable while it is the unsealed head of a ledger. Once it has
/// been pinned (handed to a client as the reference point of a reply) it is
/// frozen; the ledger only ever prepends in front of it.
pub struct Batch {
    sequence: u64,
    paths: Vec<InternedPath>,
    pinned_at: OnceLock<SystemTime>,
    pub(crate) next: Option<Arc<Batch>>,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            paths: Vec::new(),
            pinned_at: OnceLock::new(),
            next: None,
        }
    }

    pub fn with_paths(paths: impl IntoIterator<Item = InternedPath>) -> Self {
        let mut batch = Self::new();
        batch.paths.extend(paths);
        batch
    }

    pub fn add_path(&mut self, path: InternedPath) {
        self.paths.push(path);
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn paths(&self) -> &[InternedPath] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.pinned_at.get().is_some()
    }

    /// When this batch became a client-visible reference point.
    pub fn pinned_at(&self) -> Option<SystemTime> {
        self.pinned_at.get().copied()
    }

    /// Seals the batch. Pinning an already pinned batch keeps the original
    /// time.
    pub(crate) fn pin(&self) {
        let _ = self.pinned_at.set(SystemTime::now());
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub(crate) fn append(&mut self, mut other: Batch) {
        self.paths.append(&mut other.paths);
    }

    pub fn older(&self) -> Option<&Arc<Batch>> {
        self.next.as_ref()
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("sequence", &self.sequence)
            .field("paths", &self.paths.len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

// Long ledgers would otherwise be freed recursively, one stack frame per
// batch.
impl Drop for Batch {
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(batch) = next {
            match Arc::try_unwrap(batch) {
                Ok(mut batch) => next = batch.next.take(),
                // someone else still holds the rest of the chain
                Err(_) => break,
            }
        }
    }
}

/// Iterator over a chain of batches, newest first.
pub(crate) struct Batches<'a> {
    current: Option<&'a Arc<Batch>>,
}

impl<'a> Batches<'a> {
    pub(crate) fn new(head: &'a Arc<Batch>) -> Self {
        Self {
            current: Some(head),
        }
    }
}

impl<'a> Iterator for Batches<'a> {
    type Item = &'a Arc<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        self.current = current.next.as_ref();
        Some(current)
    }
}
