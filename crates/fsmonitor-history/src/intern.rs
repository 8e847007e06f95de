use std::{borrow::Borrow, fmt, ops::Deref, sync::Arc};

use dashmap::DashSet;

/// A path string owned by a [`PathInterner`].
///
/// Cloning is a reference count bump; equal paths interned through the same
/// interner share one allocation.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InternedPath(Arc<str>);

impl InternedPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` and `other` point at the same interned allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for InternedPath {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for InternedPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InternedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for InternedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deduplicating string pool for changed paths.
///
/// The same handful of paths tend to change over and over while the daemon
/// runs, so batches store handles into this pool rather than owned strings.
/// Entries are never evicted.
#[derive(Debug, Default)]
pub struct PathInterner {
    paths: DashSet<Arc<str>>,
}

impl PathInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, path: &str) -> InternedPath {
        if let Some(existing) = self.paths.get(path) {
            return InternedPath(existing.key().clone());
        }
        let candidate: Arc<str> = Arc::from(path);
        if self.paths.insert(candidate.clone()) {
            return InternedPath(candidate);
        }
        // lost a race with another thread interning the same path
        match self.paths.get(path) {
            Some(existing) => InternedPath(existing.key().clone()),
            None => InternedPath(candidate),
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
