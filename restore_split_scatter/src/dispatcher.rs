use crate::group::or_cancelled;
use crate::preparer::RangePreparer;
use crate::{Error, Result};
use observability_deps::tracing::debug;
use restore_types::{Chunk, NodeId, RestoreSpanEntry};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The entries of a chunk along with the node the chunk was scattered to.
#[derive(Debug)]
pub(crate) struct ScatteredChunk {
    pub(crate) destination: NodeId,
    pub(crate) entries: Vec<RestoreSpanEntry>,
}

/// Split and scatter `chunks` in order, handing each scattered chunk to the workers.
///
/// The work queue closes when this returns, whatever the outcome.
pub(crate) async fn dispatch_chunks(
    chunks: Vec<Chunk>,
    preparer: Arc<dyn RangePreparer>,
    chunks_tx: mpsc::Sender<ScatteredChunk>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut chunks = chunks.into_iter().peekable();
    while let Some(chunk) = chunks.next() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(next) = chunks.peek() {
            // Split at the start of the next chunk, to partition off a prefix of the space to
            // scatter.
            or_cancelled(&cancel, preparer.split(next.start_key())).await?;
        }
        let destination = or_cancelled(&cancel, preparer.scatter(chunk.start_key())).await?;
        debug!(
            key = %chunk.start_key(),
            entries = chunk.len(),
            %destination,
            "scattered chunk"
        );

        let scattered = ScatteredChunk {
            destination,
            entries: chunk.into_entries(),
        };
        or_cancelled(&cancel, async {
            chunks_tx
                .send(scattered)
                .await
                .map_err(|_| Error::Cancelled)
        })
        .await?;
    }

    Ok(())
}
