//! Wire format.
//!
//! A client opens a connection, writes one command terminated by NUL or a
//! newline, and reads the reply until the daemon closes the connection.
//!
//! A query reply is the new token followed by either the trivial marker or
//! the changed paths, each NUL terminated:
//!
//! ```text
//! builtin:<token_id>:<seq>\0/\0
//! builtin:<token_id>:<seq>\0src/a.rs\0src/b.rs\0
//! ```

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use fsmonitor_history::{Changes, QueryResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Longest command we will buffer before giving up on a client.
pub const MAX_COMMAND_LEN: usize = 64 * 1024;

/// Path entry that marks a trivial query reply.
pub const TRIVIAL_MARKER: &str = "/";

pub const ERROR_PREFIX: &str = "error: ";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command exceeds {MAX_COMMAND_LEN} bytes")]
    CommandTooLong,
    #[error("command is not valid UTF-8")]
    InvalidUtf8,
    #[error("reply is missing a token")]
    MissingToken,
    #[error("reply is not valid UTF-8")]
    InvalidReply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    Flush,
    Status,
    /// The raw token, if any. Parsing is left to the dispatcher so that a
    /// malformed token can still be answered.
    Query(Option<String>),
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        match verb {
            "quit" => Command::Quit,
            "flush" => Command::Flush,
            "status" => Command::Status,
            "query" if rest.is_empty() => Command::Query(None),
            "query" => Command::Query(Some(rest.to_string())),
            other => Command::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Quit => f.write_str("quit"),
            Command::Flush => f.write_str("flush"),
            Command::Status => f.write_str("status"),
            Command::Query(None) => f.write_str("query"),
            Command::Query(Some(token)) => write!(f, "query {token}"),
            Command::Unknown(verb) => f.write_str(verb),
        }
    }
}

/// Frames NUL or newline terminated commands.
#[derive(Debug, Default)]
pub struct CommandCodec {
    // bytes already searched for a terminator
    scanned: usize,
}

impl CommandCodec {
    fn take_line(&mut self, src: &mut BytesMut, len: usize) -> Result<String, ProtocolError> {
        let line = src.split_to(len);
        self.scanned = 0;
        String::from_utf8(line.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

impl Decoder for CommandCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let terminator = src[self.scanned..]
            .iter()
            .position(|b| *b == b'\0' || *b == b'\n')
            .map(|offset| self.scanned + offset);
        match terminator {
            Some(end) => {
                let line = self.take_line(src, end)?;
                src.advance(1);
                Ok(Some(line))
            }
            None if src.len() > MAX_COMMAND_LEN => Err(ProtocolError::CommandTooLong),
            None => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                let len = src.len();
                self.take_line(src, len).map(Some)
            }
        }
    }
}

impl Encoder<&Command> for CommandCodec {
    type Error = ProtocolError;

    fn encode(&mut self, command: &Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let command = command.to_string();
        dst.reserve(command.len() + 1);
        dst.put_slice(command.as_bytes());
        dst.put_u8(b'\0');
        Ok(())
    }
}

pub fn encode_query_reply(result: &QueryResult) -> Vec<u8> {
    let mut reply = Vec::new();
    let mut push = |entry: &str| {
        reply.extend_from_slice(entry.as_bytes());
        reply.push(b'\0');
    };
    push(&result.token.to_string());
    match &result.changes {
        Changes::Trivial => push(TRIVIAL_MARKER),
        Changes::Paths(paths) => paths.iter().for_each(|path| push(path.as_str())),
    }
    reply
}

pub fn encode_error(message: impl fmt::Display) -> Vec<u8> {
    format!("{ERROR_PREFIX}{message}").into_bytes()
}

/// A query reply as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryReply {
    pub token: String,
    /// `None` for a trivial reply.
    pub paths: Option<Vec<String>>,
}

impl QueryReply {
    pub fn is_trivial(&self) -> bool {
        self.paths.is_none()
    }

    pub fn decode(reply: &[u8]) -> Result<Self, ProtocolError> {
        let reply = std::str::from_utf8(reply).map_err(|_| ProtocolError::InvalidReply)?;
        let mut entries = reply.split_terminator('\0');
        let token = entries
            .next()
            .filter(|token| !token.is_empty())
            .ok_or(ProtocolError::MissingToken)?
            .to_string();
        let rest: Vec<&str> = entries.collect();
        let paths = match rest.as_slice() {
            [TRIVIAL_MARKER] => None,
            paths => Some(paths.iter().map(|path| path.to_string()).collect()),
        };
        Ok(Self { token, paths })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub worktree: String,
    pub metadata_dir: String,
    pub token_id: String,
    pub head_sequence: u64,
    pub batches: usize,
    pub active_readers: usize,
    pub uptime_ms: u64,
    pub ipc_threads: usize,
}
