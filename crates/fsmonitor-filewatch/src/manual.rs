use std::{path::PathBuf, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::{EventSource, SourceError, SourceEvent, WatchRoots};

/// An event source driven by hand through a [`ManualSourceHandle`].
///
/// Used where no OS backend is wanted, e.g. for exercising the listener and
/// the server without touching real filesystem notifications.
pub struct ManualSource {
    events: Receiver<SourceEvent>,
    started: bool,
    stopped: bool,
}

#[derive(Clone)]
pub struct ManualSourceHandle {
    events: Sender<SourceEvent>,
}

impl ManualSource {
    pub fn new() -> (Self, ManualSourceHandle) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            Self {
                events: rx,
                started: false,
                stopped: false,
            },
            ManualSourceHandle { events: tx },
        )
    }
}

impl ManualSourceHandle {
    /// Reports the given absolute paths as changed, as a single burst.
    ///
    /// Returns false if the source has gone away.
    pub fn send_paths<I, P>(&self, paths: I) -> bool
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        paths
            .into_iter()
            .all(|path| self.events.send(SourceEvent::Changed(path.into())).is_ok())
    }

    pub fn overflow(&self) -> bool {
        self.events.send(SourceEvent::Overflow).is_ok()
    }
}

impl EventSource for ManualSource {
    fn start(&mut self, _roots: &WatchRoots) -> Result<(), SourceError> {
        self.started = true;
        Ok(())
    }

    fn next_burst(&mut self, timeout: Duration) -> Result<Vec<SourceEvent>, SourceError> {
        if !self.started {
            return Err(SourceError::NotStarted);
        }
        if self.stopped {
            return Err(SourceError::Closed);
        }
        let first = match self.events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => return Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => return Err(SourceError::Closed),
        };
        let mut burst = vec![first];
        burst.extend(self.events.try_iter());
        Ok(burst)
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}
