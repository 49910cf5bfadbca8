use async_trait::async_trait;
use hashbrown::HashMap;
use iox_time::{MockProvider, SystemProvider, Time, TimeProvider};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use restore_clap_blocks::split_scatter::SplitScatterConfig;
use restore_split_scatter::client::{Lease, RangeInfo, ScatterRequest, ScatterResponse};
use restore_split_scatter::{
    AdminClient, ClientError, CollectingReceiver, Error, InMemoryCluster, RangeRouter,
    SplitAndScatterProcessor, routing_span_for_node,
};
use restore_types::serialize::{self, EntryEncoder, decode_entry};
use restore_types::{Chunk, Key, NodeId, Rekey, RestoreSpanEntry, Span, SplitAndScatterSpec};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::timeout::FutureTimeout;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

fn backup_key(chunk: usize, entry: usize) -> Key {
    Key::new(format!("/backup/{chunk}/{entry}"))
}

fn restore_key(chunk: usize, entry: usize) -> Key {
    Key::new(format!("/restore/{chunk}/{entry}"))
}

/// A restore plan with one chunk per element of `layout`, each holding that many contiguous
/// entries.
fn spec(layout: &[usize]) -> SplitAndScatterSpec {
    let chunks = layout
        .iter()
        .enumerate()
        .map(|(c, &len)| {
            let entries = (0..len)
                .map(|e| {
                    let end = if e + 1 < len {
                        backup_key(c, e + 1)
                    } else {
                        backup_key(c + 1, 0)
                    };
                    RestoreSpanEntry::new(Span {
                        start: backup_key(c, e),
                        end,
                    })
                })
                .collect();
            Chunk::new(entries).unwrap()
        })
        .collect();

    SplitAndScatterSpec {
        chunks,
        rekeys: vec![Rekey::new("/backup/", "/restore/")],
    }
}

fn processor(
    spec: SplitAndScatterSpec,
    client: Arc<dyn AdminClient>,
    config: SplitScatterConfig,
) -> SplitAndScatterProcessor {
    SplitAndScatterProcessor::new(spec, Some(client), Arc::new(SystemProvider::new()), config)
        .unwrap()
}

async fn run(processor: SplitAndScatterProcessor) -> CollectingReceiver {
    let mut output = CollectingReceiver::new();
    processor
        .run(&mut output, &CancellationToken::new())
        .with_timeout(TIMEOUT)
        .await
        .expect("run finished in time");
    assert_eq!(output.done_calls, 1, "producer_done called exactly once");
    output
}

/// The start keys of the emitted entries, each paired with the node its routing key belongs to.
fn emitted(output: &CollectingReceiver, nodes: &[NodeId]) -> Vec<(Key, NodeId)> {
    let router = RangeRouter::new(nodes.iter().copied().enumerate().map(|(i, n)| (n, i)));
    let mut out: Vec<_> = output
        .rows
        .iter()
        .map(|row| {
            let entry = decode_entry(&row.entry).expect("valid entry");
            let stream = router
                .route(&row.routing_key)
                .expect("routing key belongs to a known node");
            (entry.span.start, nodes[stream])
        })
        .collect();
    out.sort();
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Split(Key),
    Scatter(Key),
}

/// An admin client answering scatters from a fixed table and failing on request.
#[derive(Debug, Default)]
struct ScriptedClient {
    calls: Mutex<Vec<Call>>,
    destinations: HashMap<Key, NodeId>,
    fail_split_call: Option<usize>,
    fail_scatters: bool,
}

impl ScriptedClient {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn position(&self, call: &Call) -> usize {
        self.calls()
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("{call:?} was never issued"))
    }
}

#[async_trait]
impl AdminClient for ScriptedClient {
    async fn admin_split(&self, key: &Key, _expiration: Time) -> Result<(), ClientError> {
        let mut calls = self.calls.lock();
        calls.push(Call::Split(key.clone()));
        let split_calls = calls
            .iter()
            .filter(|c| matches!(c, Call::Split(_)))
            .count();
        if Some(split_calls) == self.fail_split_call {
            return Err(ClientError::Rejected(format!("split #{split_calls} refused")));
        }
        Ok(())
    }

    async fn admin_scatter(&self, request: ScatterRequest) -> Result<ScatterResponse, ClientError> {
        self.calls
            .lock()
            .push(Call::Scatter(request.span.start.clone()));
        if self.fail_scatters {
            return Err(ClientError::Unavailable("scatter timed out".to_string()));
        }

        let lease = self
            .destinations
            .get(&request.span.start)
            .map(|&node_id| Lease { node_id });
        Ok(ScatterResponse {
            range_infos: vec![RangeInfo {
                range_id: 1,
                span: request.span,
                lease,
            }],
        })
    }
}

#[derive(Debug)]
struct FailingEncoder;

impl EntryEncoder for FailingEncoder {
    fn encode(&self, _entry: &RestoreSpanEntry) -> serialize::Result<bytes::Bytes> {
        Err(serialize::Error::InvalidIdentifier)
    }
}

#[test_log::test(tokio::test)]
async fn noop_preparer_routes_everything_to_unknown_node() {
    let spec = spec(&[2, 2, 2]);
    let processor = SplitAndScatterProcessor::new(
        spec,
        None,
        Arc::new(SystemProvider::new()),
        SplitScatterConfig {
            disable_scatter: true,
            ..Default::default()
        },
    )
    .unwrap();

    let output = run(processor).await;

    assert!(output.errors.is_empty());
    assert_eq!(output.rows.len(), 6);
    let node0 = routing_span_for_node(NodeId::UNKNOWN);
    for row in &output.rows {
        assert_eq!(row.routing_key, node0.start);
    }

    let expected: Vec<_> = (0..3)
        .flat_map(|c| (0..2).map(move |e| (backup_key(c, e), NodeId::UNKNOWN)))
        .collect();
    assert_eq!(emitted(&output, &[NodeId::UNKNOWN]), expected);
}

#[test_log::test(tokio::test)]
async fn chunks_follow_their_scatter_destination() {
    let client = Arc::new(ScriptedClient {
        destinations: [
            (restore_key(0, 0), NodeId::new(5)),
            (restore_key(1, 0), NodeId::new(7)),
            (restore_key(2, 0), NodeId::new(7)),
        ]
        .into_iter()
        .collect(),
        ..Default::default()
    });

    let output = run(processor(
        spec(&[2, 2, 2]),
        Arc::clone(&client) as _,
        SplitScatterConfig::default(),
    ))
    .await;

    assert!(output.errors.is_empty(), "{:?}", output.errors);
    let (n5, n7) = (NodeId::new(5), NodeId::new(7));
    assert_eq!(
        emitted(&output, &[n5, n7]),
        vec![
            (backup_key(0, 0), n5),
            (backup_key(0, 1), n5),
            (backup_key(1, 0), n7),
            (backup_key(1, 1), n7),
            (backup_key(2, 0), n7),
            (backup_key(2, 1), n7),
        ]
    );

    // the next chunk is split off before the current one is scattered
    assert!(
        client.position(&Call::Split(restore_key(1, 0)))
            < client.position(&Call::Scatter(restore_key(0, 0)))
    );
    assert!(
        client.position(&Call::Split(restore_key(2, 0)))
            < client.position(&Call::Scatter(restore_key(1, 0)))
    );
    // only the leading key of each chunk is scattered
    let scatters: Vec<_> = client
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Scatter(_)))
        .collect();
    assert_eq!(
        scatters,
        vec![
            Call::Scatter(restore_key(0, 0)),
            Call::Scatter(restore_key(1, 0)),
            Call::Scatter(restore_key(2, 0)),
        ]
    );
    // and every entry boundary within a chunk is split
    for c in 0..3 {
        client.position(&Call::Split(restore_key(c, 1)));
    }
    assert_eq!(client.calls().len(), 3 + 2 + 3);
}

#[test_log::test(tokio::test)]
async fn failed_scatter_routes_chunk_to_unknown_node() {
    let client = Arc::new(ScriptedClient {
        fail_scatters: true,
        ..Default::default()
    });

    let output = run(processor(
        spec(&[3, 1]),
        Arc::clone(&client) as _,
        SplitScatterConfig::default(),
    ))
    .await;

    assert!(output.errors.is_empty(), "{:?}", output.errors);
    let emitted = emitted(&output, &[NodeId::UNKNOWN]);
    assert_eq!(emitted.len(), 4);
    assert!(emitted.iter().all(|(_, n)| *n == NodeId::UNKNOWN));
}

#[test_log::test(tokio::test)]
async fn split_failure_in_dispatcher_reports_one_error() {
    // single entry chunks: every split is issued by the dispatcher, so the second split is the
    // one carving off the third chunk
    let client = Arc::new(ScriptedClient {
        fail_split_call: Some(2),
        ..Default::default()
    });

    let output = run(processor(
        spec(&[1, 1, 1]),
        Arc::clone(&client) as _,
        SplitScatterConfig::default(),
    ))
    .await;

    assert_eq!(output.errors.len(), 1);
    match &output.errors[0] {
        Error::Split { key, .. } => assert_eq!(key, &restore_key(2, 0)),
        other => panic!("unexpected error: {other}"),
    }

    // nothing past chunk 0 was ever dispatched
    let emitted = emitted(&output, &[NodeId::UNKNOWN]);
    assert!(emitted.iter().all(|(k, _)| k == &backup_key(0, 0)), "{emitted:?}");
    assert!(!client.calls().contains(&Call::Scatter(restore_key(1, 0))));
    assert!(!client.calls().contains(&Call::Scatter(restore_key(2, 0))));
}

#[test_log::test(tokio::test)]
async fn split_failure_in_worker_reports_one_error() {
    let cluster = Arc::new(InMemoryCluster::new([NodeId::new(1)], 0));
    cluster.fail_splits_at(restore_key(1, 2));

    let output = run(processor(
        spec(&[3, 3]),
        Arc::clone(&cluster) as _,
        SplitScatterConfig::default(),
    ))
    .await;

    assert_eq!(output.errors.len(), 1);
    assert!(
        matches!(&output.errors[0], Error::Split { key, .. } if key == &restore_key(1, 2)),
        "{}",
        output.errors[0]
    );
    // the entry in front of the failed boundary is never emitted
    let emitted = emitted(&output, &[NodeId::new(1)]);
    assert!(!emitted.iter().any(|(k, _)| k == &backup_key(1, 1)), "{emitted:?}");
    assert!(!emitted.iter().any(|(k, _)| k == &backup_key(1, 2)), "{emitted:?}");
}

#[test_log::test(tokio::test)]
async fn concurrent_split_failures_report_one_error() {
    // the dispatcher fails carving off chunk 2 while a worker fails inside chunk 0
    let cluster = Arc::new(InMemoryCluster::new([NodeId::new(1)], 0));
    cluster.fail_splits_at(restore_key(2, 0));
    cluster.fail_splits_at(restore_key(0, 1));

    let output = run(processor(
        spec(&[2, 2, 2]),
        Arc::clone(&cluster) as _,
        SplitScatterConfig::default(),
    ))
    .await;

    assert_eq!(output.errors.len(), 1, "{:?}", output.errors);
    match &output.errors[0] {
        Error::Split { key, .. } => {
            assert!(key == &restore_key(2, 0) || key == &restore_key(0, 1), "{key}")
        }
        other => panic!("unexpected error: {other}"),
    }
    let emitted = emitted(&output, &[NodeId::new(1)]);
    assert!(!emitted.iter().any(|(k, _)| k == &backup_key(0, 1)), "{emitted:?}");
    assert!(!emitted.iter().any(|(k, _)| k == &backup_key(2, 0)), "{emitted:?}");
}

#[test_log::test(tokio::test)]
async fn encoding_failure_stops_the_run() {
    let client = Arc::new(ScriptedClient::default());
    let processor = processor(
        spec(&[2, 2]),
        Arc::clone(&client) as _,
        SplitScatterConfig::default(),
    )
    .with_encoder(Arc::new(FailingEncoder));

    let output = run(processor).await;

    assert!(output.rows.is_empty());
    assert_eq!(output.errors.len(), 1);
    assert!(matches!(output.errors[0], Error::Encode(_)));
}

#[test_log::test(tokio::test)]
async fn closed_consumer_stops_the_run_without_error() {
    let mut output = CollectingReceiver::with_row_limit(1);
    processor(
        spec(&[4, 4, 4]),
        Arc::new(ScriptedClient::default()),
        SplitScatterConfig::default(),
    )
    .run(&mut output, &CancellationToken::new())
    .with_timeout(TIMEOUT)
    .await
    .expect("run finished in time");

    assert_eq!(output.rows.len(), 1);
    assert!(output.errors.is_empty());
    assert_eq!(output.done_calls, 1);
}

#[test_log::test(tokio::test)]
async fn cluster_is_presplit_and_scattered() {
    let nodes: Vec<_> = (1..=4).map(NodeId::new).collect();
    let cluster = Arc::new(InMemoryCluster::new(nodes.clone(), 1234));
    let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));

    let processor = SplitAndScatterProcessor::new(
        spec(&[3, 2, 4]),
        Some(Arc::clone(&cluster) as _),
        Arc::clone(&time_provider) as _,
        SplitScatterConfig {
            workers: NonZeroUsize::new(3).unwrap(),
            ..Default::default()
        },
    )
    .unwrap();
    let output = run(processor).await;
    assert!(output.errors.is_empty(), "{:?}", output.errors);

    // every entry start except the very first is a range boundary
    let mut split_keys = cluster.split_keys();
    split_keys.sort();
    let mut expected: Vec<_> = [(0, 1), (0, 2), (1, 0), (1, 1), (2, 0), (2, 1), (2, 2), (2, 3)]
        .into_iter()
        .map(|(c, e)| restore_key(c, e))
        .collect();
    expected.sort();
    assert_eq!(split_keys, expected);
    assert_eq!(cluster.range_count(), 1 + expected.len());
    assert_eq!(
        cluster.sticky_until(&restore_key(1, 0)),
        Some(time_provider.now() + Duration::from_secs(3600))
    );

    // the emitted destination of each chunk is where its leading range was leased
    let emitted = emitted(&output, &nodes);
    assert_eq!(emitted.len(), 9);
    for (c, len) in [3, 2, 4].into_iter().enumerate() {
        let chunk_node = cluster.leaseholder(&restore_key(c, 0));
        for e in 0..len {
            assert!(emitted.contains(&(backup_key(c, e), chunk_node)));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_entry_emitted_once_with_its_chunk_destination(
        layout in proptest::collection::vec(1usize..5, 0..8),
        seed in any::<u64>(),
        workers in 1usize..4,
    ) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let nodes: Vec<_> = (1..=3).map(NodeId::new).collect();
        let cluster = Arc::new(InMemoryCluster::new(nodes.clone(), seed));
        let config = SplitScatterConfig {
            workers: NonZeroUsize::new(workers).unwrap(),
            ..Default::default()
        };
        let output = rt.block_on(run(processor(spec(&layout), Arc::clone(&cluster) as _, config)));

        prop_assert!(output.errors.is_empty());
        let emitted = emitted(&output, &nodes);
        let expected: Vec<_> = layout
            .iter()
            .enumerate()
            .flat_map(|(c, &len)| {
                let node = cluster.leaseholder(&restore_key(c, 0));
                (0..len).map(move |e| (backup_key(c, e), node))
            })
            .collect();
        let mut expected = expected;
        expected.sort();
        prop_assert_eq!(emitted, expected);
    }
}
