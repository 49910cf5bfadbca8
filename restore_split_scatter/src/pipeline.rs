use crate::Result;
use crate::dispatcher::dispatch_chunks;
use crate::group::TaskGroup;
use crate::preparer::RangePreparer;
use crate::worker::{EntryNode, process_chunks};
use restore_types::Chunk;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Run the chunk dispatcher and `workers` entry workers until all entries have been sent on
/// `done_tx` or one of them fails.
///
/// `done_tx` is closed once every task has finished.
pub(crate) async fn run_split_and_scatter(
    chunks: Vec<Chunk>,
    preparer: Arc<dyn RangePreparer>,
    workers: NonZeroUsize,
    done_tx: mpsc::Sender<EntryNode>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut group = TaskGroup::new(cancel.clone());

    // Chunks' leaseholders should be randomly placed throughout the cluster, so the dispatcher
    // should not run far ahead of the workers. tokio has no rendezvous channel: with one slot,
    // one chunk can sit queued while another waits to be sent, one more than an unbuffered queue.
    let (chunks_tx, chunks_rx) = mpsc::channel(1);
    group.spawn(dispatch_chunks(
        chunks,
        Arc::clone(&preparer),
        chunks_tx,
        cancel.clone(),
    ));

    let chunks_rx = Arc::new(Mutex::new(chunks_rx));
    for worker in 0..workers.get() {
        group.spawn(process_chunks(
            worker,
            Arc::clone(&chunks_rx),
            Arc::clone(&preparer),
            done_tx.clone(),
            cancel.clone(),
        ));
    }
    drop(done_tx);

    group.wait().await
}
