//! Event history for the fsmonitor daemon.
//!
//! History is organised as a series of *epochs*, each named by an opaque
//! token id. An epoch owns a ledger of batches, newest first, where every
//! batch carries a sequence number that only ever grows within the epoch.
//! Clients hold a `builtin:<token_id>:<sequence>` token and ask for every
//! path that changed in batches newer than that sequence.
//!
//! Batches that have been handed out to a client are sealed. Sealed batches
//! are never mutated again, which lets readers walk them without holding the
//! series lock.

mod batch;
mod intern;
mod ledger;
mod series;
mod token;

pub use batch::Batch;
pub use intern::{InternedPath, PathInterner};
pub use ledger::{BatchLedger, PublishOutcome, COMBINE_LIMIT};
pub use series::{
    Changes, QueryResult, Resolution, SeriesReader, SeriesStatus, TokenSeries, TokenSeriesManager,
};
pub use token::{ClientToken, TokenError, TokenIdGenerator, BUILTIN_NAMESPACE};
