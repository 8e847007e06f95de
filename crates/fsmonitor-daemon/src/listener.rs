//! The listener bridge.
//!
//! A single dedicated thread drains bursts of raw notifications from the
//! event source, turns the interesting ones into a batch, publishes it and
//! then releases any cookie waiters whose cookie arrived in that burst.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use camino::Utf8PathBuf;
use fsmonitor_filewatch::{wire_path, EventSource, PathKind, SourceError, SourceEvent};
use fsmonitor_history::{Batch, PublishOutcome};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::state::DaemonState;

const THREAD_NAME: &str = "fsm-listen";

/// How long a single wait for events may block before checking for
/// shutdown again.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerExit {
    /// Shutdown was requested.
    Shutdown,
    /// The event source went away on its own.
    SourceClosed,
    SourceFailed(String),
}

/// Summary of one processed burst.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BurstSummary {
    pub recorded: usize,
    pub cookies: usize,
    pub resyncs: usize,
    pub publish: Option<PublishOutcome>,
}

pub struct ListenerBridge<S> {
    state: Arc<DaemonState>,
    source: S,
}

pub struct ListenerHandle {
    thread: JoinHandle<ListenerExit>,
    exited: oneshot::Receiver<()>,
}

impl ListenerHandle {
    /// Resolves once the listener thread has left its loop.
    pub async fn exited(&mut self) {
        // an error means the thread is gone without signalling, which is
        // just as final
        let _ = (&mut self.exited).await;
    }

    pub fn join(self) -> ListenerExit {
        self.thread
            .join()
            .unwrap_or_else(|_| ListenerExit::SourceFailed("listener thread panicked".into()))
    }
}

impl<S: EventSource + 'static> ListenerBridge<S> {
    /// The source must already have been started.
    pub fn new(state: Arc<DaemonState>, source: S) -> Self {
        Self { state, source }
    }

    pub fn spawn(self) -> std::io::Result<ListenerHandle> {
        let (tx, rx) = oneshot::channel();
        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let exit = self.run();
                let _ = tx.send(());
                exit
            })?;
        Ok(ListenerHandle {
            thread,
            exited: rx,
        })
    }

    pub fn run(mut self) -> ListenerExit {
        info!("listening for changes under {}", self.state.roots().worktree());
        let exit = loop {
            if self.state.is_shutting_down() {
                break ListenerExit::Shutdown;
            }
            match self.source.next_burst(POLL_INTERVAL) {
                Ok(events) if events.is_empty() => continue,
                Ok(events) => {
                    let summary = self.handle_burst(events);
                    trace!("burst: {:?}", summary);
                }
                Err(SourceError::Closed) => break ListenerExit::SourceClosed,
                Err(err) => {
                    warn!("event source failed: {}", err);
                    break ListenerExit::SourceFailed(err.to_string());
                }
            }
        };
        self.source.stop();
        // nothing will ever mark a cookie again
        self.state.cookies().close();
        info!("listener exiting: {:?}", exit);
        exit
    }

    pub(crate) fn handle_burst(&self, events: Vec<SourceEvent>) -> BurstSummary {
        let roots = self.state.roots();
        let mut summary = BurstSummary::default();
        let mut batch = Batch::new();
        let mut cookies = Vec::new();

        for event in events {
            let path = match event {
                SourceEvent::Overflow => {
                    self.resync(&mut batch, "event source overflowed");
                    summary.resyncs += 1;
                    continue;
                }
                SourceEvent::Changed(path) => path,
            };
            let path = match Utf8PathBuf::from_path_buf(path) {
                Ok(path) => path,
                Err(path) => {
                    debug!("non UTF-8 path {}", path.display());
                    self.resync(&mut batch, "path cannot be represented");
                    summary.resyncs += 1;
                    continue;
                }
            };

            match roots.classify(&path) {
                PathKind::WorkdirPath => {
                    let Some(rel) = roots
                        .worktree_relative(&path)
                        .filter(|rel| !rel.as_str().is_empty())
                    else {
                        continue;
                    };
                    trace!("changed: {}", rel);
                    batch.add_path(self.state.interner().intern(&wire_path(rel)));
                }
                PathKind::InsideMetadataDirCookie => {
                    if let Some(name) = path.file_name() {
                        cookies.push(name.to_owned());
                    }
                }
                PathKind::OutsideCone
                | PathKind::MetadataDir
                | PathKind::InsideMetadataDir
                | PathKind::InsideWorkdirDotGitCookie
                | PathKind::InsideWorkdirDotGitOther => {}
            }
        }

        summary.recorded = batch.len();
        if !batch.is_empty() {
            let outcome = self.state.series().publish(batch);
            debug!("published {} paths: {:?}", summary.recorded, outcome);
            summary.publish = Some(outcome);
        }

        // only after publishing, so a woken waiter sees everything that
        // happened before its cookie
        summary.cookies = cookies.len();
        for name in cookies {
            self.state.cookies().mark_seen(&name);
        }
        summary
    }

    fn resync(&self, batch: &mut Batch, reason: &str) {
        warn!("{}, forcing resync", reason);
        *batch = Batch::new();
        self.state.series().force_resync();
        self.state.cookies().abort_all();
    }
}
