use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use futures::SinkExt;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info};

use crate::{
    endpoint::{self, get_state, EndpointError, IpcState},
    protocol::{Command, CommandCodec, DaemonStatus, ProtocolError, QueryReply, ERROR_PREFIX},
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// A daemon that accepted `quit` always gets this long to close its socket.
const MIN_STOP_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("fsmonitor-daemon is not running")]
    NotRunning,
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("daemon replied with an error: {0}")]
    Server(String),
    #[error("invalid status reply: {0}")]
    Status(#[from] serde_json::Error),
    #[error("daemon did not stop within {0:?}")]
    StopTimeout(Duration),
}

/// Talks to a daemon over its IPC endpoint. Every request uses a fresh
/// connection.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket: Utf8PathBuf,
}

impl DaemonClient {
    pub fn new(socket: &Utf8Path) -> Self {
        Self {
            socket: socket.to_owned(),
        }
    }

    pub fn socket(&self) -> &Utf8Path {
        &self.socket
    }

    pub async fn state(&self) -> IpcState {
        get_state(&self.socket).await
    }

    pub async fn is_listening(&self) -> bool {
        self.state().await == IpcState::Listening
    }

    /// Sends one command and returns the raw reply.
    pub async fn send_command(&self, command: &Command) -> Result<Vec<u8>, ClientError> {
        let stream = match endpoint::connect(&self.socket).await {
            Ok(stream) => stream,
            Err(EndpointError::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                return Err(ClientError::NotRunning)
            }
            Err(err) => return Err(err.into()),
        };
        debug!("sending '{}'", command);
        let mut framed = FramedWrite::new(stream, CommandCodec::default());
        framed.send(command).await?;
        let mut stream = framed.into_inner();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        if let Some(message) = reply.strip_prefix(ERROR_PREFIX.as_bytes()) {
            return Err(ClientError::Server(
                String::from_utf8_lossy(message).into_owned(),
            ));
        }
        Ok(reply)
    }

    pub async fn query(&self, token: Option<&str>) -> Result<QueryReply, ClientError> {
        let reply = self
            .send_command(&Command::Query(token.map(str::to_string)))
            .await?;
        Ok(QueryReply::decode(&reply)?)
    }

    pub async fn flush(&self) -> Result<(), ClientError> {
        self.send_command(&Command::Flush).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<DaemonStatus, ClientError> {
        let reply = self.send_command(&Command::Status).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Asks the daemon to quit and waits for the endpoint to go quiet.
    ///
    /// Fails with `NotRunning` if there was no daemon to stop. `timeout` is
    /// raised to one second if shorter.
    pub async fn stop(&self, timeout: Duration) -> Result<(), ClientError> {
        let timeout = timeout.max(MIN_STOP_WAIT);
        if !self.is_listening().await {
            return Err(ClientError::NotRunning);
        }
        info!("Stopping daemon");
        match self.send_command(&Command::Quit).await {
            // it may already be on its way out
            Ok(_) | Err(ClientError::NotRunning) => {}
            Err(err) => return Err(err),
        }

        let start = Instant::now();
        while self.is_listening().await {
            if start.elapsed() > timeout {
                return Err(ClientError::StopTimeout(timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }
}
