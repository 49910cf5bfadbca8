//! Splitting and scattering of individual keys.

use crate::client::{AdminClient, ScatterRequest, ScatterResponse};
use crate::key_rewrite::KeyRewriter;
use crate::{Error, Result};
use async_trait::async_trait;
use iox_time::TimeProvider;
use observability_deps::tracing::{debug, error};
use restore_clap_blocks::split_scatter::DEFAULT_SPLIT_EXPIRATION;
use restore_types::{Key, NodeId, Span};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Prepares the ranges of the restore keyspace.
#[async_trait]
pub trait RangePreparer: Debug + Send + Sync + 'static {
    /// Issue a split at `key`, which may be rewritten into the restore keyspace first.
    async fn split(&self, key: &Key) -> Result<()>;

    /// Issue a scatter at `key`, returning the node the range was scattered to.
    async fn scatter(&self, key: &Key) -> Result<NodeId>;
}

/// A [`RangePreparer`] that leaves the keyspace untouched and routes everything to
/// [`NodeId::UNKNOWN`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPreparer;

#[async_trait]
impl RangePreparer for NoopPreparer {
    async fn split(&self, _key: &Key) -> Result<()> {
        Ok(())
    }

    async fn scatter(&self, _key: &Key) -> Result<NodeId> {
        Ok(NodeId::UNKNOWN)
    }
}

/// The production [`RangePreparer`], issuing admin requests against the cluster.
#[derive(Debug)]
pub struct ClusterPreparer {
    client: Option<Arc<dyn AdminClient>>,
    rewriter: Option<Arc<dyn KeyRewriter>>,
    time_provider: Arc<dyn TimeProvider>,
    split_expiration: Duration,
}

impl ClusterPreparer {
    /// Both `client` and `rewriter` must be set for any request to succeed; a missing one is
    /// reported as [`Error::Configuration`] on every call.
    pub fn new(
        client: Option<Arc<dyn AdminClient>>,
        rewriter: Option<Arc<dyn KeyRewriter>>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            client,
            rewriter,
            time_provider,
            split_expiration: DEFAULT_SPLIT_EXPIRATION,
        }
    }

    pub fn with_split_expiration(mut self, split_expiration: Duration) -> Self {
        self.split_expiration = split_expiration;
        self
    }

    fn parts(&self) -> Result<(&dyn AdminClient, &dyn KeyRewriter)> {
        let rewriter = self.rewriter.as_deref().ok_or(Error::Configuration(
            "key rewriter was not set when expected to be",
        ))?;
        let client = self.client.as_deref().ok_or(Error::Configuration(
            "admin client was not set when expected to be",
        ))?;
        Ok((client, rewriter))
    }
}

fn rewrite(rewriter: &dyn KeyRewriter, key: &Key) -> Result<Key> {
    rewriter.rewrite(key).map_err(|source| Error::KeyRewrite {
        key: key.clone(),
        source,
    })
}

#[async_trait]
impl RangePreparer for ClusterPreparer {
    async fn split(&self, key: &Key) -> Result<()> {
        let (client, rewriter) = self.parts()?;

        let expiration = self.time_provider.now() + self.split_expiration;
        let key = rewrite(rewriter, key)?;
        debug!(%key, "presplitting new key");
        client
            .admin_split(&key, expiration)
            .await
            .map_err(|source| Error::Split { key, source })
    }

    async fn scatter(&self, key: &Key) -> Result<NodeId> {
        let (client, rewriter) = self.parts()?;

        let key = rewrite(rewriter, key)?;
        debug!(%key, "scattering new key");
        let span = Span::single_key(key);
        let request = ScatterRequest {
            span: span.clone(),
            randomize_leases: true,
        };

        match client.admin_scatter(request).await {
            Ok(response) => Ok(find_destination(&response)),
            Err(e) => {
                // not fatal, the chunk stays wherever its range already is
                error!(%span, error = %e, "failed to scatter span");
                Ok(NodeId::UNKNOWN)
            }
        }
    }
}

/// The leaseholder of the first scattered range, which contains the scattered key.
///
/// Older nodes do not report range infos; [`NodeId::UNKNOWN`] is returned then.
fn find_destination(response: &ScatterResponse) -> NodeId {
    response
        .range_infos
        .first()
        .and_then(|info| info.lease)
        .map(|lease| lease.node_id)
        .unwrap_or(NodeId::UNKNOWN)
}
