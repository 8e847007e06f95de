//! Token series management.
//!
//! The manager owns exactly one current series. The series pointer, the
//! current ledger and every series' reader count are only touched under a
//! single short-held mutex. Readers seal the head batch and take a reference
//! to it under that mutex, then release it and walk the (now immutable)
//! chain on their own.
//!
//! A resync swaps in a fresh series. The outgoing series and its batches stay
//! alive for as long as any reader still holds them, and are freed by
//! whichever of the resync or the last reader lets go last.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use tracing::{debug, info};

use crate::{
    batch::{Batch, Batches},
    intern::InternedPath,
    ledger::{BatchLedger, PublishOutcome},
    token::{ClientToken, TokenIdGenerator},
};

/// Identity of one unbroken span of observed history.
#[derive(Debug)]
pub struct TokenSeries {
    token_id: String,
    readers: AtomicUsize,
}

impl TokenSeries {
    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    /// Number of queries currently walking this series.
    pub fn active_readers(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }
}

impl Drop for TokenSeries {
    fn drop(&mut self) {
        debug!("released token series {}", self.token_id);
    }
}

struct Current {
    series: Arc<TokenSeries>,
    ledger: BatchLedger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Changes {
    /// The client's token cannot be resolved; everything may have changed.
    Trivial,
    /// Sorted, de-duplicated paths changed since the client's token.
    Paths(Vec<InternedPath>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    /// The token the client should present next time.
    pub token: ClientToken,
    pub changes: Changes,
}

impl QueryResult {
    pub fn is_trivial(&self) -> bool {
        matches!(self.changes, Changes::Trivial)
    }
}

/// How a client token resolved against the current series.
#[derive(Debug)]
pub enum Resolution {
    Trivial(ClientToken),
    Incremental(SeriesReader),
}

/// An in-flight read of a series. Counts as an active reader until dropped.
#[derive(Debug)]
pub struct SeriesReader {
    series: Arc<TokenSeries>,
    head: Arc<Batch>,
    since: u64,
    token: ClientToken,
}

impl SeriesReader {
    fn new(series: Arc<TokenSeries>, head: Arc<Batch>, since: u64) -> Self {
        series.readers.fetch_add(1, Ordering::SeqCst);
        let token = ClientToken::builtin(series.token_id(), head.sequence());
        Self {
            series,
            head,
            since,
            token,
        }
    }

    pub fn series(&self) -> &Arc<TokenSeries> {
        &self.series
    }

    pub fn token(&self) -> &ClientToken {
        &self.token
    }

    /// Walks every batch newer than the client's sequence.
    pub fn collect(self) -> QueryResult {
        let mut paths = BTreeSet::new();
        for batch in Batches::new(&self.head) {
            if batch.sequence() <= self.since {
                break;
            }
            paths.extend(batch.paths().iter().cloned());
        }
        QueryResult {
            token: self.token.clone(),
            changes: Changes::Paths(paths.into_iter().collect()),
        }
    }
}

impl Drop for SeriesReader {
    fn drop(&mut self) {
        self.series.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesStatus {
    pub token_id: String,
    pub head_sequence: u64,
    pub batches: usize,
    pub active_readers: usize,
}

pub struct TokenSeriesManager {
    ids: TokenIdGenerator,
    current: Mutex<Current>,
}

impl TokenSeriesManager {
    pub fn new(ids: TokenIdGenerator) -> Self {
        let current = Self::new_series(&ids);
        Self {
            ids,
            current: Mutex::new(current),
        }
    }

    fn new_series(ids: &TokenIdGenerator) -> Current {
        let token_id = ids.next_id();
        // With deterministic ids batch 0 is pinned so that fixtures see the
        // earliest events instead of having them discarded.
        let ledger = if ids.is_deterministic() {
            BatchLedger::new_pinned()
        } else {
            BatchLedger::new()
        };
        debug!("created token series {}", token_id);
        Current {
            series: Arc::new(TokenSeries {
                token_id,
                readers: AtomicUsize::new(0),
            }),
            ledger,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Current> {
        self.current.lock().expect("mutex poisoned")
    }

    pub fn token_id(&self) -> String {
        self.lock().series.token_id.clone()
    }

    pub fn current_series(&self) -> Arc<TokenSeries> {
        self.lock().series.clone()
    }

    pub fn status(&self) -> SeriesStatus {
        let current = self.lock();
        SeriesStatus {
            token_id: current.series.token_id.clone(),
            head_sequence: current.ledger.head_sequence(),
            batches: current.ledger.len(),
            active_readers: current.series.active_readers(),
        }
    }

    /// Starts a new series, abandoning all history recorded so far.
    ///
    /// Returns the new token id.
    pub fn force_resync(&self) -> String {
        let mut current = self.lock();
        let fresh = Self::new_series(&self.ids);
        let token_id = fresh.series.token_id.clone();
        let outgoing = std::mem::replace(&mut *current, fresh);
        drop(current);

        let readers = outgoing.series.active_readers();
        if readers > 0 {
            debug!(
                "deferring release of token series {} to {} active readers",
                outgoing.series.token_id, readers
            );
        }
        info!(
            "resync: token series {} replaced by {}",
            outgoing.series.token_id, token_id
        );
        token_id
    }

    pub fn publish(&self, batch: Batch) -> PublishOutcome {
        self.lock().ledger.publish(batch)
    }

    /// Resolves a client token against the current series.
    ///
    /// Either way the current head is pinned, since its sequence is about to
    /// be handed to a client as a future reference point.
    pub fn resolve(&self, since: Option<&ClientToken>) -> Resolution {
        let current = self.lock();
        let head = current.ledger.pin_head();
        let head_sequence = head.sequence();
        match since {
            Some(token)
                if token.token_id() == current.series.token_id
                    && token.sequence() <= head_sequence =>
            {
                Resolution::Incremental(SeriesReader::new(
                    current.series.clone(),
                    head,
                    token.sequence(),
                ))
            }
            _ => Resolution::Trivial(ClientToken::builtin(
                current.series.token_id.clone(),
                head_sequence,
            )),
        }
    }

    pub fn query(&self, since: Option<&ClientToken>) -> QueryResult {
        match self.resolve(since) {
            Resolution::Trivial(token) => QueryResult {
                token,
                changes: Changes::Trivial,
            },
            Resolution::Incremental(reader) => reader.collect(),
        }
    }
}

impl std::fmt::Debug for TokenSeriesManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSeriesManager")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::{Changes, Resolution, TokenSeriesManager};
    use crate::{Batch, ClientToken, PathInterner, PublishOutcome, TokenIdGenerator};

    fn publish(manager: &TokenSeriesManager, interner: &PathInterner, paths: &[&str]) {
        manager.publish(Batch::with_paths(paths.iter().map(|p| interner.intern(p))));
    }

    fn paths(changes: &Changes) -> Vec<&str> {
        match changes {
            Changes::Trivial => panic!("expected paths, got a trivial response"),
            Changes::Paths(paths) => paths.iter().map(|p| p.as_str()).collect(),
        }
    }

    #[test]
    fn test_unknown_token_is_trivial() {
        let manager = TokenSeriesManager::new(TokenIdGenerator::deterministic());
        let stale: ClientToken = "builtin:OLD-ID:5".parse().unwrap();

        let result = manager.query(Some(&stale));

        assert!(result.is_trivial());
        assert_eq!(result.token.to_string(), "builtin:test_00000001:0");
    }

    #[test]
    fn test_missing_token_is_trivial() {
        let manager = TokenSeriesManager::new(TokenIdGenerator::clock());
        let result = manager.query(None);
        assert!(result.is_trivial());
        assert_eq!(result.token.token_id(), manager.token_id());
    }

    #[test]
    fn test_incremental_query() {
        let interner = PathInterner::new();
        let manager = TokenSeriesManager::new(TokenIdGenerator::clock());

        // nobody can see batch 0, so this is dropped
        publish(&manager, &interner, &["ignored.txt"]);
        let first = manager.query(None);
        assert!(first.is_trivial());
        assert_eq!(first.token.sequence(), 0);

        publish(&manager, &interner, &["b.txt", "a.txt"]);
        publish(&manager, &interner, &["a.txt", "c/d.txt"]);

        let second = manager.query(Some(&first.token));
        assert_eq!(paths(&second.changes), vec!["a.txt", "b.txt", "c/d.txt"]);
        assert_eq!(second.token.sequence(), 1);

        let third = manager.query(Some(&second.token));
        assert_eq!(paths(&third.changes), Vec::<&str>::new());
        assert_eq!(third.token, second.token);

        publish(&manager, &interner, &["e.txt"]);
        let fourth = manager.query(Some(&third.token));
        assert_eq!(paths(&fourth.changes), vec!["e.txt"]);
        assert_eq!(fourth.token.sequence(), 2);

        // an older token still sees everything since then
        let replay = manager.query(Some(&first.token));
        assert_eq!(
            paths(&replay.changes),
            vec!["a.txt", "b.txt", "c/d.txt", "e.txt"]
        );
    }

    #[test]
    fn test_future_sequence_is_trivial() {
        let manager = TokenSeriesManager::new(TokenIdGenerator::deterministic());
        let token = ClientToken::builtin(manager.token_id(), 99);
        assert!(manager.query(Some(&token)).is_trivial());
    }

    #[test]
    fn test_resync_invalidates_tokens() {
        let interner = PathInterner::new();
        let manager = TokenSeriesManager::new(TokenIdGenerator::deterministic());
        publish(&manager, &interner, &["a"]);
        let before = manager.query(None).token;

        let new_id = manager.force_resync();

        assert_eq!(new_id, "test_00000002");
        for sequence in [0, 1, 2, 1000] {
            let stale = ClientToken::builtin(before.token_id(), sequence);
            let result = manager.query(Some(&stale));
            assert!(result.is_trivial());
            assert_eq!(result.token.token_id(), "test_00000002");
        }
    }

    #[test]
    fn test_reader_keeps_series_alive_across_resync() {
        let interner = PathInterner::new();
        let manager = TokenSeriesManager::new(TokenIdGenerator::deterministic());
        let start = manager.query(None).token;
        publish(&manager, &interner, &["kept.txt"]);

        let reader = match manager.resolve(Some(&start)) {
            Resolution::Incremental(reader) => reader,
            Resolution::Trivial(_) => panic!("expected an incremental read"),
        };
        let old_series = Arc::downgrade(reader.series());
        assert_eq!(manager.status().active_readers, 1);

        manager.force_resync();
        assert_eq!(manager.status().active_readers, 0);
        assert_eq!(old_series.upgrade().unwrap().active_readers(), 1);

        let result = reader.collect();
        assert_eq!(paths(&result.changes), vec!["kept.txt"]);
        assert!(old_series.upgrade().is_none());
    }

    #[test]
    fn test_query_seals_head() {
        let interner = PathInterner::new();
        let manager = TokenSeriesManager::new(TokenIdGenerator::deterministic());
        publish(&manager, &interner, &["a"]);
        let token = manager.query(None).token;
        assert_eq!(token.sequence(), 1);

        let outcome =
            manager.publish(Batch::with_paths([interner.intern("b")]));
        assert_eq!(outcome, PublishOutcome::Prepended { sequence: 2 });

        let status = manager.status();
        assert_eq!(status.head_sequence, 2);
        assert_eq!(status.batches, 3);
        assert_matches!(manager.resolve(Some(&token)), Resolution::Incremental(_));
    }
}
