use std::{
    ffi::OsString,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use camino::Utf8PathBuf;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use thiserror::Error;
use tracing::{debug, info};

use crate::endpoint::{get_state, IpcState};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum StartError {
    #[error("fsmonitor-daemon is already running at {0}")]
    AlreadyRunning(Utf8PathBuf),
    #[error("unable to spawn daemon: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("daemon terminated ({0})")]
    Terminated(ExitStatus),
    #[error("daemon failed to start")]
    FailedToStart,
    #[error("daemon not online yet")]
    NotOnline,
}

/// Starts a daemon in the background and waits for it to come online.
#[derive(Debug, Clone)]
pub struct DaemonConnector {
    /// Where the daemon will listen once it is ready.
    pub socket: Utf8PathBuf,
    pub start_timeout: Duration,
    /// Binary to run, usually the current executable.
    pub binary: PathBuf,
    /// Arguments that make the binary run the daemon in the foreground.
    pub args: Vec<OsString>,
}

impl DaemonConnector {
    #[tracing::instrument(skip(self), fields(socket = %self.socket))]
    pub async fn start(&self) -> Result<(), StartError> {
        if get_state(&self.socket).await == IpcState::Listening {
            return Err(StartError::AlreadyRunning(self.socket.clone()));
        }

        // a new process group, detached from our stdio, that outlives us
        let mut child = tokio::process::Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .group()
            .kill_on_drop(false)
            .spawn()?;
        debug!("spawned daemon with pid {:?}", child.inner().id());

        self.wait_until_online(&mut child).await
    }

    async fn wait_until_online(&self, child: &mut AsyncGroupChild) -> Result<(), StartError> {
        let start = Instant::now();
        loop {
            match get_state(&self.socket).await {
                IpcState::Listening => {
                    info!("daemon online after {:?}", start.elapsed());
                    return Ok(());
                }
                IpcState::InvalidPath | IpcState::OtherError => {
                    return Err(StartError::FailedToStart)
                }
                IpcState::NotListening | IpcState::PathNotFound => {}
            }
            if let Some(status) = child.try_wait()? {
                return Err(StartError::Terminated(status));
            }
            if start.elapsed() >= self.start_timeout {
                return Err(StartError::NotOnline);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
