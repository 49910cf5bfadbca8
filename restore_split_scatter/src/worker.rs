use crate::dispatcher::ScatteredChunk;
use crate::group::or_cancelled;
use crate::preparer::RangePreparer;
use crate::{Error, Result};
use observability_deps::tracing::trace;
use restore_types::{NodeId, RestoreSpanEntry};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// An entry paired with the node it has been routed to.
#[derive(Debug)]
pub(crate) struct EntryNode {
    pub(crate) entry: RestoreSpanEntry,
    pub(crate) node: NodeId,
}

/// Take scattered chunks off the work queue until it closes, splitting between consecutive
/// entries and publishing every entry with its chunk's destination.
pub(crate) async fn process_chunks(
    worker: usize,
    chunks_rx: Arc<Mutex<mpsc::Receiver<ScatteredChunk>>>,
    preparer: Arc<dyn RangePreparer>,
    done_tx: mpsc::Sender<EntryNode>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let next = or_cancelled(&cancel, async {
            Ok::<_, Error>(chunks_rx.lock().await.recv().await)
        })
        .await?;
        let Some(ScatteredChunk {
            destination,
            entries,
        }) = next
        else {
            trace!(worker, "work queue closed");
            return Ok(());
        };

        let mut entries = entries.into_iter().peekable();
        while let Some(entry) = entries.next() {
            trace!(worker, span = %entry.span, "processing a span");
            if let Some(next) = entries.peek() {
                // Split at the next entry.
                or_cancelled(&cancel, preparer.split(next.start_key())).await?;
            }

            let scattered = EntryNode {
                entry,
                node: destination,
            };
            or_cancelled(&cancel, async {
                done_tx.send(scattered).await.map_err(|_| Error::Cancelled)
            })
            .await?;
        }
    }
}
