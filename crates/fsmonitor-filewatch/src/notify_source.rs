use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::{EventSource, SourceError, SourceEvent, WatchRoots};

type NotifyResult = Result<Event, notify::Error>;

/// The platform's recommended `notify` backend, watching every root
/// recursively.
#[derive(Default)]
pub struct NotifySource {
    watcher: Option<RecommendedWatcher>,
    events: Option<Receiver<NotifyResult>>,
}

impl NotifySource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSource for NotifySource {
    fn start(&mut self, roots: &WatchRoots) -> Result<(), SourceError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watcher = notify::recommended_watcher(move |res: NotifyResult| {
            // It's ok if we fail to send, it means we're shutting down
            let _ = tx.send(res);
        })?;
        for root in roots.watch_paths() {
            debug!("watching {}", root);
            watcher.watch(root.as_std_path(), RecursiveMode::Recursive)?;
        }
        self.watcher = Some(watcher);
        self.events = Some(rx);
        Ok(())
    }

    fn next_burst(&mut self, timeout: Duration) -> Result<Vec<SourceEvent>, SourceError> {
        let events = self.events.as_ref().ok_or(SourceError::NotStarted)?;
        let first = match events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => return Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => return Err(SourceError::Closed),
        };

        let mut burst = Vec::new();
        for result in std::iter::once(first).chain(events.try_iter()) {
            translate(result, &mut burst);
        }
        Ok(burst)
    }

    fn stop(&mut self) {
        // dropping the watcher drops the sending half of the channel
        self.watcher = None;
        self.events = None;
    }
}

fn translate(result: NotifyResult, burst: &mut Vec<SourceEvent>) {
    match result {
        Ok(event) if event.need_rescan() => {
            debug!("backend requested a rescan: {:?}", event);
            burst.push(SourceEvent::Overflow);
        }
        // reads don't change anything
        Ok(Event {
            kind: EventKind::Access(_),
            ..
        }) => {}
        Ok(event) => burst.extend(event.paths.into_iter().map(SourceEvent::Changed)),
        Err(err) => {
            // we can no longer vouch for the event stream being complete
            warn!("filewatching error, treating as overflow: {}", err);
            burst.push(SourceEvent::Overflow);
        }
    }
}
