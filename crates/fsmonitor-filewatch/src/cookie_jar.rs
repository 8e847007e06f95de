use std::{
    collections::HashMap,
    fs::OpenOptions,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::{sync::oneshot, time::error::Elapsed};
use tracing::{debug, trace};

use crate::classify::COOKIE_PREFIX;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("filewatching lost events, cookie was abandoned")]
    Aborted,
    #[error("filewatching has closed, cannot watch cookies")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CookieError {
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("cookie timeout expired")]
    Timeout(#[from] Elapsed),
    #[error("failed to receive cookie notification: {0}")]
    RecvError(#[from] oneshot::error::RecvError),
    #[error("failed to write cookie file at {path}: {io_err}")]
    IO {
        io_err: std::io::Error,
        path: Utf8PathBuf,
    },
}

type CookieResponse = Result<(), WatchError>;

/// Rendezvous between request handlers and the listener thread.
///
/// A waiter writes a uniquely named file into the metadata directory and
/// parks until the listener reports having seen that file come back through
/// the event stream. At that point every event that happened before the
/// cookie was written has been published.
pub struct CookieJar {
    dir: Utf8PathBuf,
    serial: AtomicUsize,
    timeout: Duration,
    watches: Mutex<Watches>,
}

#[derive(Default)]
struct Watches {
    closed: bool,
    cookies: HashMap<String, oneshot::Sender<CookieResponse>>,
}

impl CookieJar {
    pub fn new(dir: &Utf8Path, timeout: Duration) -> Self {
        Self {
            dir: dir.to_owned(),
            serial: AtomicUsize::new(0),
            timeout,
            watches: Mutex::new(Watches::default()),
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of cookies currently waiting to be observed.
    pub fn pending(&self) -> usize {
        self.watches.lock().expect("mutex poisoned").cookies.len()
    }

    pub async fn wait_for_cookie(&self) -> Result<(), CookieError> {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}{}-{}", COOKIE_PREFIX, std::process::id(), serial);
        let cookie_path = self.dir.join(&name);
        let (tx, rx) = oneshot::channel();
        {
            let mut watches = self.watches.lock().expect("mutex poisoned");
            if watches.closed {
                return Err(CookieError::Watch(WatchError::Closed));
            }
            watches.cookies.insert(name.clone(), tx);
        }

        let mut opts = OpenOptions::new();
        opts.truncate(true).create(true).write(true);
        trace!("writing cookie {}", cookie_path);
        // dropping the resulting file closes the handle
        if let Err(io_err) = opts.open(&cookie_path) {
            self.forget(&name);
            return Err(CookieError::IO {
                io_err,
                path: cookie_path,
            });
        }

        let result = tokio::time::timeout(self.timeout, rx).await;
        self.forget(&name);
        if let Err(err) = std::fs::remove_file(&cookie_path) {
            debug!("failed to remove cookie {}: {}", cookie_path, err);
        }
        // ??? -> timeout, recv failure, actual cookie failure
        result???;
        Ok(())
    }

    /// Called by the listener once per observed cookie file name.
    pub fn mark_seen(&self, name: &str) {
        let mut watches = self.watches.lock().expect("mutex poisoned");
        if let Some(responder) = watches.cookies.remove(name) {
            trace!("saw cookie: {}", name);
            if responder.send(Ok(())).is_err() {
                // the waiter already gave up
                debug!("failed to notify cookie waiter of cookie success");
            }
        }
    }

    /// Fails every outstanding cookie. New cookies can still be waited on.
    pub fn abort_all(&self) {
        let mut watches = self.watches.lock().expect("mutex poisoned");
        respond_all(&mut watches, WatchError::Aborted);
    }

    /// Fails every outstanding cookie and refuses new ones.
    pub fn close(&self) {
        let mut watches = self.watches.lock().expect("mutex poisoned");
        watches.closed = true;
        respond_all(&mut watches, WatchError::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.watches.lock().expect("mutex poisoned").closed
    }

    fn forget(&self, name: &str) {
        self.watches
            .lock()
            .expect("mutex poisoned")
            .cookies
            .remove(name);
    }
}

fn respond_all(watches: &mut Watches, err: WatchError) {
    for (name, sender) in watches.cookies.drain() {
        if sender.send(Err(err.clone())).is_err() {
            debug!("failed to notify cookie waiter {} of error: {}", name, err);
        }
    }
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieJar")
            .field("dir", &self.dir)
            .field("timeout", &self.timeout)
            .finish()
    }
}
