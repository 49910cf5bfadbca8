//! The processor tying the range preparation pipeline to its downstream consumer.

use crate::client::AdminClient;
use crate::key_rewrite::PrefixRewriter;
use crate::output::{ConsumerStatus, RoutedRow, RowReceiver};
use crate::pipeline::run_split_and_scatter;
use crate::preparer::{ClusterPreparer, NoopPreparer, RangePreparer};
use crate::routing::RoutingSpanCache;
use crate::worker::EntryNode;
use crate::{Error, Result};
use iox_time::TimeProvider;
use observability_deps::tracing::{Instrument, Span, debug, error, info, info_span};
use restore_clap_blocks::split_scatter::SplitScatterConfig;
use restore_types::SplitAndScatterSpec;
use restore_types::serialize::{ChecksummedJsonEncoder, EntryEncoder};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Distributes the spans of a restore across the cluster and emits each entry, encoded, along
/// with the routing key of the node its span was scattered to.
#[derive(Debug)]
pub struct SplitAndScatterProcessor {
    spec: SplitAndScatterSpec,
    preparer: Arc<dyn RangePreparer>,
    encoder: Arc<dyn EntryEncoder>,
    config: SplitScatterConfig,
}

impl SplitAndScatterProcessor {
    /// Create a processor issuing splits and scatters through `client`, with keys rewritten by
    /// the rekeys of `spec`.
    ///
    /// If scattering is disabled in `config`, the keyspace is left untouched and every entry is
    /// routed to the unknown node.
    pub fn new(
        spec: SplitAndScatterSpec,
        client: Option<Arc<dyn AdminClient>>,
        time_provider: Arc<dyn TimeProvider>,
        config: SplitScatterConfig,
    ) -> Result<Self> {
        let preparer: Arc<dyn RangePreparer> = if config.disable_scatter {
            Arc::new(NoopPreparer)
        } else {
            let rewriter = PrefixRewriter::try_new(&spec.rekeys).map_err(Error::InvalidRekeys)?;
            Arc::new(
                ClusterPreparer::new(client, Some(Arc::new(rewriter)), time_provider)
                    .with_split_expiration(config.split_expiration),
            )
        };

        Ok(Self {
            spec,
            preparer,
            encoder: Arc::new(ChecksummedJsonEncoder),
            config,
        })
    }

    pub fn with_preparer(mut self, preparer: Arc<dyn RangePreparer>) -> Self {
        self.preparer = preparer;
        self
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn EntryEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn num_entries(&self) -> usize {
        self.spec.num_entries()
    }

    /// Run the processor to completion, pushing rows and at most one error to `output`.
    ///
    /// Cancelling `cancel` stops the run; the cancellation is reported as an error unless some
    /// other failure happened first.
    pub async fn run<R: RowReceiver>(self, output: &mut R, cancel: &CancellationToken) {
        let span = info_span!(
            "split_and_scatter_processor",
            chunks = self.spec.chunks.len(),
            entries = self.spec.num_entries(),
        );
        self.run_inner(output, cancel).instrument(span).await
    }

    async fn run_inner<R: RowReceiver>(self, output: &mut R, cancel: &CancellationToken) {
        let Self {
            spec,
            preparer,
            encoder,
            config,
        } = self;

        let num_entries = spec.num_entries();
        info!(
            chunks = spec.chunks.len(),
            entries = num_entries,
            workers = config.workers.get(),
            "starting split and scatter"
        );

        // Large enough so that it never blocks.
        let (done_tx, mut done_rx) = mpsc::channel(num_entries.max(1));

        let split_and_scatter_cancel = cancel.child_token();
        let background = tokio::spawn({
            let cancel = split_and_scatter_cancel.clone();
            async move {
                let res =
                    run_split_and_scatter(spec.chunks, preparer, config.workers, done_tx, cancel)
                        .await;
                match &res {
                    Err(e) if e.is_cancelled() => debug!("split and scatter cancelled"),
                    Err(e) => error!(error = %e, "error while running split and scatter"),
                    Ok(()) => {}
                }
                res
            }
            .instrument(Span::current())
        });

        // only one routing span is derived per node
        let mut routing_spans = RoutingSpanCache::default();
        let mut emitted = 0;
        let mut stopped = false;

        while let Some(EntryNode { entry, node }) = done_rx.recv().await {
            let entry_bytes = match encoder.encode(&entry) {
                Ok(b) => b,
                Err(e) => {
                    output.push_error(e.into()).await;
                    stopped = true;
                    break;
                }
            };

            let row = RoutedRow {
                routing_key: routing_spans.get(node).start.clone(),
                entry: entry_bytes,
            };
            emitted += 1;
            if output.push(row).await == ConsumerStatus::ConsumerClosed {
                debug!(emitted, "consumer closed, stopping split and scatter");
                stopped = true;
                break;
            }
        }

        // Whatever is still queued is abandoned once the emitter stops early; cancelling makes
        // sure nothing keeps splitting behind its back.
        if stopped {
            split_and_scatter_cancel.cancel();
        }
        drop(done_rx);

        let res = background.await;
        split_and_scatter_cancel.cancel();
        if !stopped {
            match res {
                Ok(Ok(())) => {
                    info!(emitted, nodes = routing_spans.len(), "split and scatter finished")
                }
                Ok(Err(e)) => output.push_error(e).await,
                Err(e) => output.push_error(Error::TaskJoin(e)).await,
            }
        }

        output.producer_done();
    }
}
