use std::time::{Duration, Instant};

use fsmonitor_filewatch::{CookieJar, WatchRoots};
use fsmonitor_history::{PathInterner, TokenIdGenerator, TokenSeriesManager};
use tokio_util::sync::CancellationToken;

use crate::{config::DaemonOpts, repo::RepoPaths};

/// Everything the listener bridge and the request handlers share.
///
/// Built once per daemon run and handed around behind an `Arc`.
pub struct DaemonState {
    paths: RepoPaths,
    roots: WatchRoots,
    opts: DaemonOpts,
    series: TokenSeriesManager,
    interner: PathInterner,
    cookies: CookieJar,
    shutdown: CancellationToken,
    start_time: Instant,
}

impl DaemonState {
    /// Creates the state, including the first token series.
    pub fn new(paths: RepoPaths, opts: DaemonOpts) -> Self {
        let ids = if opts.test_tokens {
            TokenIdGenerator::deterministic()
        } else {
            TokenIdGenerator::clock()
        };
        let roots = paths.watch_roots();
        let cookies = CookieJar::new(paths.metadata_dir(), opts.cookie_timeout);
        Self {
            roots,
            opts,
            series: TokenSeriesManager::new(ids),
            interner: PathInterner::new(),
            cookies,
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
            paths,
        }
    }

    pub fn paths(&self) -> &RepoPaths {
        &self.paths
    }

    pub fn roots(&self) -> &WatchRoots {
        &self.roots
    }

    pub fn opts(&self) -> &DaemonOpts {
        &self.opts
    }

    pub fn series(&self) -> &TokenSeriesManager {
        &self.series
    }

    pub fn interner(&self) -> &PathInterner {
        &self.interner
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Asks the server and the listener to wind down. Idempotent.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

impl std::fmt::Debug for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonState")
            .field("worktree", &self.paths.worktree())
            .field("metadata_dir", &self.paths.metadata_dir())
            .field("series", &self.series)
            .finish()
    }
}
