//! The administrative cluster requests issued while preparing ranges for a restore.

use async_trait::async_trait;
use iox_time::Time;
use restore_types::{Key, NodeId, Span};
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Access to the cluster's administrative control plane.
///
/// Implementations are shared by every task of a split-and-scatter run and must be safe to call
/// concurrently.
#[async_trait]
pub trait AdminClient: Debug + Send + Sync + 'static {
    /// Create a range boundary at `key`. The boundary may be merged away again by the cluster
    /// after `expiration`.
    async fn admin_split(&self, key: &Key, expiration: Time) -> Result<(), ClientError>;

    /// Ask the cluster to relocate the ranges overlapping the request span.
    async fn admin_scatter(&self, request: ScatterRequest) -> Result<ScatterResponse, ClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScatterRequest {
    pub span: Span,
    /// Move leases to randomly chosen nodes rather than balancing them across the whole cluster.
    pub randomize_leases: bool,
}

/// One [`RangeInfo`] per range that was scattered, in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScatterResponse {
    pub range_infos: Vec<RangeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeInfo {
    pub range_id: u64,
    pub span: Span,
    /// Not populated by nodes running an older protocol version.
    pub lease: Option<Lease>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub node_id: NodeId,
}
