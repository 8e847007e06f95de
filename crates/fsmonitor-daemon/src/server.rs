//! Daemon Server
//!
//! The server owns the lifecycle of a running daemon:
//!
//! 1. start the event source, failing before any thread is spawned
//! 2. bind the IPC endpoint, refusing to start if another daemon answers
//! 3. spawn the listener bridge thread
//! 4. accept connections, holding at most `ipcThreads` of them at a time
//!
//! It stops when a client sends `quit`, on Ctrl-C, or when the listener
//! thread ends because the event source went away. In-flight requests are
//! always answered before the listener is joined and the socket removed.

use std::sync::Arc;

use fsmonitor_filewatch::{EventSource, SourceError};
use futures::StreamExt;
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    select,
    signal::ctrl_c,
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, trace, warn};

use crate::{
    dispatch::dispatch,
    endpoint::{listen_socket, EndpointError, IpcStream},
    listener::ListenerBridge,
    protocol::{encode_error, Command, CommandCodec, ProtocolError},
    state::DaemonState,
};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("unable to start filewatching: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("unable to spawn listener thread: {0}")]
    ListenerSpawn(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Shutdown,
    Interrupt,
    ListenerExited,
}

pub struct DaemonServer<S> {
    state: Arc<DaemonState>,
    source: S,
}

impl<S: EventSource + 'static> DaemonServer<S> {
    pub fn new(state: Arc<DaemonState>, source: S) -> Self {
        Self { state, source }
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    #[tracing::instrument(skip(self), fields(worktree = %self.state.paths().worktree()))]
    pub async fn serve(self) -> Result<CloseReason, DaemonError> {
        let Self { state, mut source } = self;

        source.start(state.roots())?;
        let socket_path = state.paths().socket_path();
        let listener = match listen_socket(&socket_path).await {
            Ok(listener) => listener,
            Err(err) => {
                source.stop();
                return Err(err.into());
            }
        };
        trace!("acquired connection stream for socket");

        let mut watcher = ListenerBridge::new(state.clone(), source)
            .spawn()
            .map_err(DaemonError::ListenerSpawn)?;

        // a connection is only accepted once a permit for it is held
        let permits = Arc::new(Semaphore::new(state.opts().ipc_threads));
        let mut permit: Option<OwnedSemaphorePermit> = None;
        let mut connections = JoinSet::new();
        let shutdown = state.shutdown_token().clone();
        let interrupt = ctrl_c();
        tokio::pin!(interrupt);
        info!("listening on {}", socket_path);

        let reason = loop {
            select! {
                biased;
                _ = shutdown.cancelled() => break CloseReason::Shutdown,
                _ = &mut interrupt => break CloseReason::Interrupt,
                _ = watcher.exited() => break CloseReason::ListenerExited,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        error!("connection handler failed: {}", err);
                    }
                }
                acquired = permits.clone().acquire_owned(), if permit.is_none() => match acquired {
                    Ok(acquired) => permit = Some(acquired),
                    Err(_) => break CloseReason::Shutdown,
                },
                accepted = listener.accept(), if permit.is_some() => match accepted {
                    Ok((stream, _)) => {
                        trace!("accepted connection");
                        let state = state.clone();
                        let held = permit.take();
                        connections.spawn(async move {
                            let _permit = held;
                            if let Err(err) = handle_connection(&state, stream).await {
                                debug!("connection error: {}", err);
                            }
                        });
                    }
                    Err(err) => warn!("failed to accept connection: {}", err),
                },
            }
        };
        info!("shutting down: {:?}", reason);

        // stop accepting, let in-flight requests finish, then stop the
        // listener
        drop(listener);
        state.request_shutdown();
        while let Some(joined) = connections.join_next().await {
            if let Err(err) = joined {
                error!("connection handler failed: {}", err);
            }
        }
        match tokio::task::spawn_blocking(move || watcher.join()).await {
            Ok(exit) => debug!("listener joined: {:?}", exit),
            Err(err) => error!("failed to join listener: {}", err),
        }
        if let Err(err) = std::fs::remove_file(&socket_path) {
            debug!("failed to remove socket {}: {}", socket_path, err);
        }

        Ok(reason)
    }
}

async fn handle_connection(state: &DaemonState, stream: IpcStream) -> Result<(), ProtocolError> {
    let mut framed = FramedRead::new(stream, CommandCodec::default());
    let reply = match framed.next().await {
        // the client hung up without asking anything
        None => return Ok(()),
        Some(Ok(line)) => dispatch(state, Command::parse(&line)).await,
        Some(Err(ProtocolError::Io(err))) => return Err(err.into()),
        Some(Err(err)) => encode_error(&err),
    };
    let mut stream = framed.into_inner();
    stream.write_all(&reply).await?;
    stream.shutdown().await?;
    Ok(())
}
