//! Routing keys that tell a range router which node an entry was scattered to.
//!
//! Each node owns the half-open span `["node<N>", "node<N>\0")` of an abstract routing keyspace.
//! The processor tags rows with the start of that span, and whoever configures the router must
//! derive its boundaries with [`routing_span_for_node`] as well, otherwise rows end up on the
//! wrong output stream.

use bytes::Bytes;
use hashbrown::HashMap;
use restore_types::{Key, NodeId};

const ROUTING_PREFIX: &str = "node";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingSpan {
    pub start: Bytes,
    pub end: Bytes,
}

impl RoutingSpan {
    pub fn contains(&self, key: &[u8]) -> bool {
        self.start.as_ref() <= key && key < self.end.as_ref()
    }
}

/// The routing span for `node_id`.
pub fn routing_span_for_node(node_id: NodeId) -> RoutingSpan {
    let start = Key::new(format!("{ROUTING_PREFIX}{node_id}"));
    let end = start.next();
    RoutingSpan {
        start: Bytes::from(start.into_bytes()),
        end: Bytes::from(end.into_bytes()),
    }
}

/// Computes each node's [`RoutingSpan`] at most once.
#[derive(Debug, Default)]
pub struct RoutingSpanCache {
    spans: HashMap<NodeId, RoutingSpan>,
}

impl RoutingSpanCache {
    pub fn get(&mut self, node_id: NodeId) -> &RoutingSpan {
        self.spans
            .entry(node_id)
            .or_insert_with(|| routing_span_for_node(node_id))
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Maps routing keys to output streams, the way the router of the consuming stage is set up.
#[derive(Debug, Clone)]
pub struct RangeRouter {
    /// Sorted by span start. Spans of distinct nodes never overlap.
    spans: Vec<(RoutingSpan, usize)>,
}

impl RangeRouter {
    /// Build a router sending each node's rows to its assigned stream.
    pub fn new(assignments: impl IntoIterator<Item = (NodeId, usize)>) -> Self {
        let mut spans: Vec<_> = assignments
            .into_iter()
            .map(|(node_id, stream)| (routing_span_for_node(node_id), stream))
            .collect();
        spans.sort_by(|a, b| a.0.start.cmp(&b.0.start));
        spans.dedup_by(|a, b| a.0 == b.0);
        Self { spans }
    }

    /// The stream for `routing_key`, if any node's span contains it.
    pub fn route(&self, routing_key: &[u8]) -> Option<usize> {
        let idx = self
            .spans
            .partition_point(|(span, _)| span.start.as_ref() <= routing_key);
        let (span, stream) = self.spans.get(idx.checked_sub(1)?)?;
        span.contains(routing_key).then_some(*stream)
    }

    pub fn spans(&self) -> impl Iterator<Item = &(RoutingSpan, usize)> {
        self.spans.iter()
    }
}
