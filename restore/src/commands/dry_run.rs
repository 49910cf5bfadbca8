//! Plan the range layout of a restore against a simulated cluster.

use clap::Parser;
use iox_time::SystemProvider;
use observability_deps::tracing::{debug, info};
use restore_clap_blocks::split_scatter::SplitScatterConfig;
use restore_split_scatter::{
    ChannelRowReceiver, InMemoryCluster, ProducerMessage, RangeRouter, SplitAndScatterProcessor,
};
use restore_types::{NodeId, SplitAndScatterSpec, serialize::decode_entry};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trogging::cli::LoggingConfig;

/// Rows buffered between the processor and the printer.
const ROW_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("error reading restore plan {path:?}: {source}")]
    ReadPlan {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid restore plan: {0}")]
    InvalidPlan(#[source] serde_json::Error),

    #[error(transparent)]
    SplitScatter(#[from] restore_split_scatter::Error),

    #[error("invalid entry in output: {0}")]
    Decode(#[from] restore_types::serialize::Error),

    #[error("row with routing key {0} does not belong to any node")]
    Unrouted(String),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Parser)]
#[clap(visible_alias = "d")]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    /// File path of the restore plan to load
    ///
    /// The plan is a JSON document holding the ordered chunks of span entries and the rekeys
    /// to apply to them.
    #[clap(short = 'f', long = "file")]
    file_path: PathBuf,

    /// IDs of the nodes of the simulated cluster
    #[clap(
        long = "nodes",
        value_delimiter = ',',
        default_value = "1,2,3",
        value_parser = clap::value_parser!(u32).range(1..),
    )]
    nodes: Vec<u32>,

    /// Seed for the leaseholders chosen by the simulated cluster when scattering
    #[clap(long = "seed", default_value_t = 0)]
    seed: u64,

    #[clap(flatten)]
    split_scatter_config: SplitScatterConfig,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let Config {
        file_path,
        nodes,
        seed,
        split_scatter_config,
        ..
    } = config;

    let plan = tokio::fs::read(&file_path)
        .await
        .map_err(|source| Error::ReadPlan {
            path: file_path.clone(),
            source,
        })?;
    let spec: SplitAndScatterSpec = serde_json::from_slice(&plan).map_err(Error::InvalidPlan)?;

    let nodes = cluster_nodes(nodes);
    let cluster = Arc::new(InMemoryCluster::new(nodes.iter().copied(), seed));
    let processor = SplitAndScatterProcessor::new(
        spec,
        Some(Arc::clone(&cluster) as _),
        Arc::new(SystemProvider::new()),
        split_scatter_config,
    )?;
    info!(
        path = %file_path.display(),
        entries = processor.num_entries(),
        nodes = nodes.len(),
        "planning restore"
    );

    // stream 0 collects whatever could not be placed
    let streams: Vec<NodeId> = std::iter::once(NodeId::UNKNOWN)
        .chain(nodes.iter().copied())
        .collect();
    let router = RangeRouter::new(streams.iter().enumerate().map(|(i, n)| (*n, i)));

    let (tx, rx) = mpsc::channel(ROW_BUFFER);
    let cancel = CancellationToken::new();
    let producer = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let mut output = ChannelRowReceiver::new(tx);
            processor.run(&mut output, &cancel).await;
        }
    });

    let printed = print_rows(rx, &router, streams.len()).await;
    if printed.is_err() {
        cancel.cancel();
    }
    producer
        .await
        .map_err(restore_split_scatter::Error::TaskJoin)?;
    let counts = printed?;

    println!();
    for (node, count) in streams.iter().zip(counts) {
        if node.is_unknown() && count == 0 {
            continue;
        }
        println!("node {node}: {count} entries");
    }
    debug!(ranges = cluster.range_count(), "simulated cluster after restore planning");

    Ok(())
}

/// The distinct nodes of the simulated cluster, in ascending order.
fn cluster_nodes(mut nodes: Vec<u32>) -> Vec<NodeId> {
    nodes.sort_unstable();
    nodes.dedup();
    nodes.into_iter().map(NodeId::new).collect()
}

/// Print every row as it arrives, returning the number of rows routed to each stream.
async fn print_rows(
    mut rx: mpsc::Receiver<ProducerMessage>,
    router: &RangeRouter,
    num_streams: usize,
) -> Result<Vec<usize>> {
    let mut counts = vec![0; num_streams];
    while let Some(msg) = rx.recv().await {
        match msg {
            ProducerMessage::Row(row) => {
                let entry = decode_entry(&row.entry)?;
                let stream = router
                    .route(&row.routing_key)
                    .ok_or_else(|| Error::Unrouted(row.routing_key.escape_ascii().to_string()))?;
                counts[stream] += 1;
                println!("{}\t{}", row.routing_key.escape_ascii(), entry.span);
            }
            ProducerMessage::Error(e) => return Err(e.into()),
        }
    }
    Ok(counts)
}
