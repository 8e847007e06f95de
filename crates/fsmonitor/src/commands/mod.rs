use anyhow::Result;
use fsmonitor_daemon::{current_dir, DaemonClient, DaemonConfigBuilder, DaemonOpts, RepoPaths};

use crate::{
    cli::{Args, Command},
    tracing::FsmonitorSubscriber,
};

mod daemon;
mod query;

/// What every command needs: the resolved repository and options.
pub struct CommandBase {
    pub args: Args,
    pub paths: RepoPaths,
    pub opts: DaemonOpts,
}

impl CommandBase {
    pub fn new(args: Args) -> Result<Self> {
        let cwd = match &args.cwd {
            Some(cwd) => cwd.clone(),
            None => current_dir()?,
        };
        let paths = match &args.metadata_dir {
            Some(metadata_dir) => RepoPaths::with_metadata_dir(&cwd, metadata_dir)?,
            None => RepoPaths::discover(&cwd)?,
        };
        let opts = DaemonConfigBuilder::new(paths.metadata_dir())
            .with_ipc_threads(args.ipc_threads)
            .with_start_timeout(args.start_timeout)
            .with_test_tokens(args.test_tokens.then_some(true))
            .build()?;
        Ok(Self { args, paths, opts })
    }

    pub fn client(&self) -> DaemonClient {
        DaemonClient::new(&self.paths.socket_path())
    }
}

/// Runs the parsed command, returning the process exit code.
pub async fn run(args: Args, logger: &FsmonitorSubscriber) -> Result<i32> {
    let command = args.command.clone();
    let base = CommandBase::new(args)?;
    match command {
        Command::Run => daemon::run(&base, logger).await,
        Command::Start => daemon::start(&base).await,
        Command::Stop => daemon::stop(&base).await,
        Command::Status { json } => daemon::status(&base, json).await,
        Command::Query { token } => query::query(&base, token.as_deref()).await,
        Command::QueryIndex => query::query_index(&base).await,
        Command::Flush => query::flush(&base).await,
    }
}
