//! The downstream side of the processor: where routed rows and errors are pushed.

use crate::Error;
use async_trait::async_trait;
use bytes::Bytes;
use observability_deps::tracing::warn;
use std::fmt::Debug;
use tokio::sync::mpsc;

/// A single output row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedRow {
    /// Start of the destination node's routing span.
    pub routing_key: Bytes,
    /// The encoded restore entry.
    pub entry: Bytes,
}

/// What the consumer wants after accepting a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    NeedMoreRows,
    /// No further rows will be accepted; the producer should stop.
    ConsumerClosed,
}

/// Receives the output of a [`SplitAndScatterProcessor`](crate::SplitAndScatterProcessor).
///
/// A run pushes zero or more rows, then at most one error, then calls
/// [`producer_done`](Self::producer_done) exactly once.
#[async_trait]
pub trait RowReceiver: Debug + Send {
    async fn push(&mut self, row: RoutedRow) -> ConsumerStatus;

    async fn push_error(&mut self, error: Error);

    fn producer_done(&mut self);
}

#[derive(Debug)]
pub enum ProducerMessage {
    Row(RoutedRow),
    Error(Error),
}

/// Forwards output over a channel. The channel closes once the producer is done.
#[derive(Debug)]
pub struct ChannelRowReceiver {
    tx: Option<mpsc::Sender<ProducerMessage>>,
}

impl ChannelRowReceiver {
    pub fn new(tx: mpsc::Sender<ProducerMessage>) -> Self {
        Self { tx: Some(tx) }
    }
}

#[async_trait]
impl RowReceiver for ChannelRowReceiver {
    async fn push(&mut self, row: RoutedRow) -> ConsumerStatus {
        let Some(tx) = &self.tx else {
            return ConsumerStatus::ConsumerClosed;
        };
        match tx.send(ProducerMessage::Row(row)).await {
            Ok(()) => ConsumerStatus::NeedMoreRows,
            Err(_) => ConsumerStatus::ConsumerClosed,
        }
    }

    async fn push_error(&mut self, error: Error) {
        let Some(tx) = &self.tx else {
            warn!(%error, "producer already done, dropping error");
            return;
        };
        if let Err(mpsc::error::SendError(msg)) = tx.send(ProducerMessage::Error(error)).await {
            warn!(?msg, "consumer went away before the error could be delivered");
        }
    }

    fn producer_done(&mut self) {
        self.tx = None;
    }
}

/// Keeps all output in memory.
#[derive(Debug, Default)]
pub struct CollectingReceiver {
    pub rows: Vec<RoutedRow>,
    pub errors: Vec<Error>,
    /// Number of times `producer_done` was called.
    pub done_calls: usize,
    row_limit: Option<usize>,
}

impl CollectingReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report [`ConsumerStatus::ConsumerClosed`] once `limit` rows have been collected.
    pub fn with_row_limit(limit: usize) -> Self {
        Self {
            row_limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn is_done(&self) -> bool {
        self.done_calls > 0
    }
}

#[async_trait]
impl RowReceiver for CollectingReceiver {
    async fn push(&mut self, row: RoutedRow) -> ConsumerStatus {
        self.rows.push(row);
        match self.row_limit {
            Some(limit) if self.rows.len() >= limit => ConsumerStatus::ConsumerClosed,
            _ => ConsumerStatus::NeedMoreRows,
        }
    }

    async fn push_error(&mut self, error: Error) {
        self.errors.push(error);
    }

    fn producer_done(&mut self) {
        self.done_calls += 1;
    }
}
