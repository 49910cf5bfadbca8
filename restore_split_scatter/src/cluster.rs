//! An in-memory stand-in for a cluster's range placement, used for dry runs and tests.

use crate::client::{AdminClient, ClientError, Lease, RangeInfo, ScatterRequest, ScatterResponse};
use async_trait::async_trait;
use hashbrown::HashSet;
use iox_time::Time;
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use restore_types::{Key, NodeId, Span};
use std::collections::BTreeMap;

/// The end of the simulated keyspace.
const KEY_MAX: &[u8] = &[0xff, 0xff];

/// Tracks range boundaries and leaseholders for a set of nodes.
///
/// The keyspace starts out as a single range leased by the first node. Splits carve it into
/// more ranges, each inheriting its leaseholder from the range it was split from, and scatters
/// move leases to randomly chosen nodes.
#[derive(Debug)]
pub struct InMemoryCluster {
    nodes: Vec<NodeId>,
    state: Mutex<ClusterState>,
}

#[derive(Debug)]
struct ClusterState {
    /// Ranges keyed by their start key. Each range ends where the next one starts.
    ranges: BTreeMap<Key, RangeDesc>,
    next_range_id: u64,
    rng: StdRng,
    split_log: Vec<Key>,
    failing_splits: HashSet<Key>,
    fail_scatters: bool,
}

#[derive(Debug, Clone, Copy)]
struct RangeDesc {
    range_id: u64,
    leaseholder: NodeId,
    sticky_until: Option<Time>,
}

impl InMemoryCluster {
    /// Create a cluster of `nodes`, choosing scatter destinations with an RNG seeded by `seed`.
    ///
    /// With no nodes at all, ranges never have a lease.
    pub fn new(nodes: impl IntoIterator<Item = NodeId>, seed: u64) -> Self {
        let nodes: Vec<NodeId> = nodes.into_iter().collect();
        let first = RangeDesc {
            range_id: 1,
            leaseholder: nodes.first().copied().unwrap_or(NodeId::UNKNOWN),
            sticky_until: None,
        };

        Self {
            nodes,
            state: Mutex::new(ClusterState {
                ranges: BTreeMap::from([(Key::default(), first)]),
                next_range_id: 2,
                rng: StdRng::seed_from_u64(seed),
                split_log: vec![],
                failing_splits: HashSet::new(),
                fail_scatters: false,
            }),
        }
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Make every split at `key` fail.
    pub fn fail_splits_at(&self, key: Key) {
        self.state.lock().failing_splits.insert(key);
    }

    /// Make every scatter fail, or succeed again.
    pub fn fail_scatters(&self, fail: bool) {
        self.state.lock().fail_scatters = fail;
    }

    /// Keys of all successful split requests, in the order they were received.
    pub fn split_keys(&self) -> Vec<Key> {
        self.state.lock().split_log.clone()
    }

    pub fn range_count(&self) -> usize {
        self.state.lock().ranges.len()
    }

    /// The leaseholder of the range containing `key`.
    pub fn leaseholder(&self, key: &Key) -> NodeId {
        let state = self.state.lock();
        state.containing(key).1.leaseholder
    }

    /// The expiration of the split that created the range starting exactly at `key`.
    pub fn sticky_until(&self, key: &Key) -> Option<Time> {
        self.state
            .lock()
            .ranges
            .get(key)
            .and_then(|desc| desc.sticky_until)
    }
}

impl ClusterState {
    fn containing(&self, key: &Key) -> (&Key, &RangeDesc) {
        self.ranges
            .range(..=key.clone())
            .next_back()
            .expect("the first range starts at the empty key")
    }

    fn range_end(&self, start: &Key) -> Key {
        use std::ops::Bound::{Excluded, Unbounded};
        self.ranges
            .range((Excluded(start.clone()), Unbounded))
            .next()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| Key::new(KEY_MAX))
    }
}

#[async_trait]
impl AdminClient for InMemoryCluster {
    async fn admin_split(&self, key: &Key, expiration: Time) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if state.failing_splits.contains(key) {
            return Err(ClientError::Rejected(format!("split at {key} refused")));
        }
        if key.is_empty() || key.as_bytes() >= KEY_MAX {
            return Err(ClientError::Rejected(format!(
                "cannot split at {key}: outside of the splittable keyspace"
            )));
        }

        state.split_log.push(key.clone());
        if let Some(existing) = state.ranges.get_mut(key) {
            // already a boundary, only extend how long it sticks around
            existing.sticky_until = existing.sticky_until.max(Some(expiration));
            return Ok(());
        }

        let leaseholder = state.containing(key).1.leaseholder;
        let range_id = state.next_range_id;
        state.next_range_id += 1;
        state.ranges.insert(
            key.clone(),
            RangeDesc {
                range_id,
                leaseholder,
                sticky_until: Some(expiration),
            },
        );
        Ok(())
    }

    async fn admin_scatter(&self, request: ScatterRequest) -> Result<ScatterResponse, ClientError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.fail_scatters {
            return Err(ClientError::Unavailable("scatter failed".to_string()));
        }
        if request.span.start >= request.span.end {
            return Err(ClientError::Rejected(format!(
                "cannot scatter empty span {}",
                request.span
            )));
        }

        let first_start = state.containing(&request.span.start).0.clone();
        let starts: Vec<Key> = state
            .ranges
            .range(first_start..request.span.end.clone())
            .map(|(k, _)| k.clone())
            .collect();

        let mut range_infos = Vec::with_capacity(starts.len());
        for start in starts {
            let end = state.range_end(&start);
            let new_leaseholder = if request.randomize_leases {
                self.nodes.choose(&mut state.rng).copied()
            } else {
                None
            };

            let desc = state
                .ranges
                .get_mut(&start)
                .expect("range was just listed");
            if let Some(node) = new_leaseholder {
                desc.leaseholder = node;
            }

            range_infos.push(RangeInfo {
                range_id: desc.range_id,
                span: Span { start, end },
                lease: (!desc.leaseholder.is_unknown()).then_some(Lease {
                    node_id: desc.leaseholder,
                }),
            });
        }

        Ok(ScatterResponse { range_infos })
    }
}
