//! Split and scatter the target keyspace of a restore before any data is loaded into it.
//!
//! A restore arrives as an ordered list of [`Chunk`]s of [`RestoreSpanEntry`] values. Before the
//! bulk load starts, this crate:
//!
//! 1. splits the keyspace at the start of each chunk and scatters the chunk's leading range to a
//!    randomly chosen leaseholder (see [`RangePreparer`]),
//! 2. splits the keyspace again between every pair of entries within a chunk, and
//! 3. emits every entry, encoded, alongside a routing key derived from the node its chunk was
//!    scattered to (see [`routing_span_for_node`]), so a downstream router can hand the entry to
//!    a worker running on that node.
//!
//! The [`SplitAndScatterProcessor`] drives the whole pipeline: one task walks the chunks in
//! order, a small pool of workers splits within chunks, and the caller's task emits rows to a
//! [`RowReceiver`]. The first failure cancels everything else and is the only error reported.
//!
//! [`Chunk`]: restore_types::Chunk
//! [`RestoreSpanEntry`]: restore_types::RestoreSpanEntry

use restore_types::Key;
use thiserror::Error;

pub mod client;
pub mod cluster;
mod dispatcher;
mod group;
pub mod key_rewrite;
pub mod output;
mod pipeline;
pub mod preparer;
pub mod processor;
pub mod routing;
mod worker;

pub use client::{AdminClient, ClientError};
pub use cluster::InMemoryCluster;
pub use key_rewrite::{KeyRewriter, PrefixRewriter, RewriteError};
pub use output::{
    ChannelRowReceiver, CollectingReceiver, ConsumerStatus, ProducerMessage, RoutedRow,
    RowReceiver,
};
pub use preparer::{ClusterPreparer, NoopPreparer, RangePreparer};
pub use processor::SplitAndScatterProcessor;
pub use routing::{RangeRouter, RoutingSpan, RoutingSpanCache, routing_span_for_node};

#[derive(Debug, Error)]
pub enum Error {
    #[error("split and scatter misconfigured: {0}")]
    Configuration(&'static str),

    #[error("invalid rekeys: {0}")]
    InvalidRekeys(#[source] RewriteError),

    #[error("rewriting key {key}: {source}")]
    KeyRewrite { key: Key, source: RewriteError },

    #[error("splitting key {key}: {source}")]
    Split { key: Key, source: ClientError },

    #[error("encoding restore entry: {0}")]
    Encode(#[from] restore_types::serialize::Error),

    #[error("split and scatter was cancelled")]
    Cancelled,

    #[error("split and scatter task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
