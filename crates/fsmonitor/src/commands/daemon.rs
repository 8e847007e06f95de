use std::sync::Arc;

use anyhow::{bail, Result};
use fsmonitor_daemon::{
    ClientError, DaemonConnector, DaemonServer, DaemonState, StartError, LOG_FILE_NAME,
};
use fsmonitor_filewatch::NotifySource;
use tracing::{error, info};

use super::CommandBase;
use crate::tracing::FsmonitorSubscriber;

/// Runs the daemon in the foreground until it is told to quit.
pub async fn run(base: &CommandBase, logger: &FsmonitorSubscriber) -> Result<i32> {
    let worktree = base.paths.worktree();
    if base.client().is_listening().await {
        bail!("fsmonitor-daemon is already watching '{}'", worktree);
    }

    let appender = tracing_appender::rolling::daily(base.paths.metadata_dir(), LOG_FILE_NAME);
    logger.set_daemon_logger(appender)?;

    let state = Arc::new(DaemonState::new(base.paths.clone(), base.opts.clone()));
    let server = DaemonServer::new(state, NotifySource::new());
    match server.serve().await {
        Ok(reason) => {
            info!("fsmonitor-daemon stopped: {:?}", reason);
            Ok(0)
        }
        Err(err) => {
            error!("fsmonitor-daemon failed: {}", err);
            Err(err.into())
        }
    }
}

/// Starts the daemon in the background and waits until it answers.
pub async fn start(base: &CommandBase) -> Result<i32> {
    let worktree = base.paths.worktree();
    let connector = DaemonConnector {
        socket: base.paths.socket_path(),
        start_timeout: base.opts.start_timeout,
        binary: std::env::current_exe()?,
        args: base
            .args
            .daemon_args(worktree, base.paths.metadata_dir())
            .into_iter()
            .map(Into::into)
            .collect(),
    };
    match connector.start().await {
        Ok(()) => {
            println!("fsmonitor-daemon is watching '{}'", worktree);
            Ok(0)
        }
        Err(StartError::AlreadyRunning(_)) => {
            bail!("fsmonitor-daemon is already watching '{}'", worktree)
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn stop(base: &CommandBase) -> Result<i32> {
    match base.client().stop(base.opts.start_timeout).await {
        Ok(()) => {
            println!("fsmonitor-daemon stopped");
            Ok(0)
        }
        Err(ClientError::NotRunning) => {
            println!(
                "fsmonitor-daemon is not watching '{}'",
                base.paths.worktree()
            );
            Ok(0)
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn status(base: &CommandBase, json: bool) -> Result<i32> {
    let client = base.client();
    let worktree = base.paths.worktree();
    if !client.is_listening().await {
        println!("fsmonitor-daemon is not watching '{}'", worktree);
        return Ok(1);
    }
    if json {
        let status = client.status().await?;
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("fsmonitor-daemon is watching '{}'", worktree);
    }
    Ok(0)
}
