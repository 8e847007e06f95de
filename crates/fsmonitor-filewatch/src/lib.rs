//! Filesystem-facing pieces of the fsmonitor daemon.
//!
//! - [`WatchRoots`] classifies absolute paths reported by the OS relative to
//!   the watched working tree and metadata directory.
//! - [`EventSource`] is the seam to the OS notification backend. Two
//!   implementations live here: [`NotifySource`], backed by the `notify`
//!   crate, and [`ManualSource`], which is fed by hand.
//! - [`CookieJar`] turns the asynchronous event stream into a rendezvous
//!   point by writing marker files and waiting to see them come back.

mod classify;
mod cookie_jar;
mod manual;
mod notify_source;

use std::{path::PathBuf, time::Duration};

pub use classify::{wire_path, PathKind, WatchRoots, COOKIE_PREFIX, DOT_GIT};
pub use cookie_jar::{CookieError, CookieJar, WatchError};
pub use manual::{ManualSource, ManualSourceHandle};
pub use notify_source::NotifySource;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// Something at this absolute path was created, modified or removed.
    Changed(PathBuf),
    /// The backend lost events. Recorded history is no longer complete.
    Overflow,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("filewatching backend error: {0}")]
    Notify(#[from] notify::Error),
    #[error("filewatching stopped")]
    Closed,
    #[error("event source was not started")]
    NotStarted,
}

/// A platform backend delivering raw change notifications.
pub trait EventSource: Send {
    /// Begins watching every root. Called once, before any other method.
    fn start(&mut self, roots: &WatchRoots) -> Result<(), SourceError>;

    /// Waits up to `timeout` for events and returns everything that has
    /// arrived since the last call. An empty burst means the wait timed out.
    fn next_burst(&mut self, timeout: Duration) -> Result<Vec<SourceEvent>, SourceError>;

    /// Releases backend resources. Further bursts report `Closed`.
    fn stop(&mut self);
}
