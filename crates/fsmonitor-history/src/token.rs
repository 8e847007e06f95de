use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use thiserror::Error;

/// Namespace prefix that distinguishes our tokens from other providers'.
pub const BUILTIN_NAMESPACE: &str = "builtin";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is empty")]
    Empty,
    #[error("token '{0}' is missing a namespace")]
    MissingNamespace(String),
    #[error("token namespace '{0}' is not supported")]
    UnknownNamespace(String),
    #[error("token '{0}' is missing a sequence number")]
    MissingSequence(String),
    #[error("token '{token}' has an invalid sequence number: {source}")]
    InvalidSequence {
        token: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// The `<namespace>:<token_id>:<sequence>` triple a client presents.
///
/// The token id is opaque to clients. A token always prints back out exactly
/// as it was parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientToken {
    namespace: String,
    token_id: String,
    sequence: u64,
}

impl ClientToken {
    pub fn builtin(token_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            namespace: BUILTIN_NAMESPACE.to_string(),
            token_id: token_id.into(),
            sequence,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl FromStr for ClientToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TokenError::Empty);
        }
        let (namespace, rest) = s
            .split_once(':')
            .ok_or_else(|| TokenError::MissingNamespace(s.to_string()))?;
        if namespace != BUILTIN_NAMESPACE {
            return Err(TokenError::UnknownNamespace(namespace.to_string()));
        }
        // token ids are opaque and may themselves contain ':'
        let (token_id, sequence) = rest
            .rsplit_once(':')
            .filter(|(token_id, _)| !token_id.is_empty())
            .ok_or_else(|| TokenError::MissingSequence(s.to_string()))?;
        let sequence = sequence
            .parse()
            .map_err(|source| TokenError::InvalidSequence {
                token: s.to_string(),
                source,
            })?;
        Ok(Self {
            namespace: namespace.to_string(),
            token_id: token_id.to_string(),
            sequence,
        })
    }
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.token_id, self.sequence)
    }
}

/// Produces token ids for new series.
///
/// Ids are never reused within a process. Outside of tests they combine a
/// per-process flush counter, the pid and a microsecond UTC timestamp, so
/// they are also unique across daemon restarts.
#[derive(Debug)]
pub enum TokenIdGenerator {
    Clock { flush_count: AtomicU64 },
    Deterministic { next: AtomicU64 },
}

impl TokenIdGenerator {
    pub fn clock() -> Self {
        Self::Clock {
            flush_count: AtomicU64::new(0),
        }
    }

    /// Sequential `test_00000001`, `test_00000002`, ... ids.
    pub fn deterministic() -> Self {
        Self::Deterministic {
            next: AtomicU64::new(1),
        }
    }

    pub fn is_deterministic(&self) -> bool {
        matches!(self, Self::Deterministic { .. })
    }

    pub fn next_id(&self) -> String {
        match self {
            Self::Clock { flush_count } => {
                let count = flush_count.fetch_add(1, Ordering::SeqCst);
                format!(
                    "{}.{}.{}",
                    count,
                    std::process::id(),
                    Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
                )
            }
            Self::Deterministic { next } => {
                format!("test_{:08x}", next.fetch_add(1, Ordering::SeqCst))
            }
        }
    }
}
