//! The fsmonitor daemon.
//!
//! A [`DaemonServer`] watches one repository through an
//! [`EventSource`](fsmonitor_filewatch::EventSource), records changed paths
//! into a token series on a dedicated listener thread, and answers `query`,
//! `flush`, `status` and `quit` requests over a local socket.
//! [`DaemonClient`] and [`DaemonConnector`] are the client side.

#![deny(clippy::all)]

mod client;
mod config;
mod connector;
mod dispatch;
mod endpoint;
mod listener;
mod protocol;
mod repo;
mod server;
mod state;

pub use client::{ClientError, DaemonClient};
pub use config::{ConfigError, DaemonConfigBuilder, DaemonOpts};
pub use connector::{DaemonConnector, StartError};
pub use dispatch::dispatch;
pub use endpoint::{get_state, EndpointError, IpcState, SOCKET_NAME};
pub use listener::{ListenerBridge, ListenerExit, ListenerHandle};
pub use protocol::{Command, DaemonStatus, ProtocolError, QueryReply, TRIVIAL_MARKER};
pub use repo::{current_dir, RepoError, RepoPaths, LOG_FILE_NAME, TOKEN_FILE_NAME};
pub use server::{CloseReason, DaemonError, DaemonServer};
pub use state::DaemonState;
