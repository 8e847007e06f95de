use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};

use crate::{commands, tracing::FsmonitorSubscriber};

#[derive(Parser, Clone, Debug, PartialEq)]
#[clap(author, about = "Watches a git working tree and reports what changed", long_about = None)]
#[clap(disable_help_subcommand = true)]
#[command(name = "fsmonitor")]
pub struct Args {
    /// The directory in which to look for the working tree
    #[clap(long, global = true, value_parser)]
    pub cwd: Option<Utf8PathBuf>,
    /// Use this metadata directory instead of the one found from `.git`
    #[clap(long, global = true, value_parser)]
    pub metadata_dir: Option<Utf8PathBuf>,
    /// Number of requests the daemon answers concurrently
    #[clap(long, global = true, allow_negative_numbers = true)]
    pub ipc_threads: Option<i64>,
    /// Seconds to wait for a background daemon to come online
    #[clap(long, global = true, allow_negative_numbers = true)]
    pub start_timeout: Option<i64>,
    /// Hand out predictable token ids
    #[clap(long, global = true, hide = true)]
    pub test_tokens: bool,
    #[clap(flatten)]
    pub verbosity: Verbosity,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Parser, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verbosity {
    #[clap(
        long = "verbosity",
        global = true,
        conflicts_with = "v",
        value_name = "COUNT"
    )]
    /// Verbosity level
    pub verbosity: Option<u8>,
    #[clap(
        short = 'v',
        action = clap::ArgAction::Count,
        global = true,
        hide = true,
        conflicts_with = "verbosity"
    )]
    pub v: u8,
}

impl From<Verbosity> for u8 {
    fn from(val: Verbosity) -> Self {
        let Verbosity { verbosity, v } = val;
        verbosity.unwrap_or(v)
    }
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum Command {
    /// Runs the daemon in the foreground
    Run,
    /// Starts the daemon in the background
    Start,
    /// Stops a running daemon
    Stop,
    /// Reports whether a daemon is watching the working tree
    Status {
        /// Also print the daemon's own status report as JSON
        #[clap(long)]
        json: bool,
    },
    /// Prints a new token and the paths changed since the given one
    Query {
        /// A token from an earlier query; without one the reply is trivial
        token: Option<String>,
    },
    /// Like `query`, using and updating the token kept in the metadata
    /// directory
    QueryIndex,
    /// Drops all history; every existing token becomes stale
    Flush,
}

impl Args {
    /// Arguments that make a spawned copy of this binary run the daemon for
    /// the same working tree with the same overrides.
    pub fn daemon_args(&self, worktree: &Utf8Path, metadata_dir: &Utf8Path) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--cwd".to_string(),
            worktree.to_string(),
            "--metadata-dir".to_string(),
            metadata_dir.to_string(),
        ];
        if let Some(ipc_threads) = self.ipc_threads {
            args.push(format!("--ipc-threads={ipc_threads}"));
        }
        if self.test_tokens {
            args.push("--test-tokens".to_string());
        }
        args
    }
}

/// Parses the command line, runs the command and returns the exit code.
pub fn run() -> anyhow::Result<i32> {
    let args = Args::parse();
    let subscriber = FsmonitorSubscriber::new_with_verbosity(args.verbosity.into());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(commands::run(args, &subscriber))
}
