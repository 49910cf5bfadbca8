//! Config for the split-and-scatter stage of a restore.

use std::{num::NonZeroUsize, time::Duration};

/// Number of workers splitting entries within scattered chunks.
///
/// Roughly twice a conservative minimum, to cover for scatter not spreading ranges evenly.
pub const DEFAULT_WORKERS: NonZeroUsize = NonZeroUsize::new(2).unwrap();

/// How long a presplit stays sticky before the cluster may merge it away again.
pub const DEFAULT_SPLIT_EXPIRATION: Duration = Duration::from_secs(60 * 60);

/// Specifies how ranges are prepared before a restore loads data into them.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct SplitScatterConfig {
    /// Number of concurrent workers issuing splits between the entries of a chunk.
    #[clap(
        long = "split-scatter-workers",
        env = "RESTORE_SPLIT_SCATTER_WORKERS",
        default_value_t = DEFAULT_WORKERS,
        action
    )]
    pub workers: NonZeroUsize,

    /// Expiration applied to each presplit, relative to the cluster clock.
    #[clap(
        long = "split-expiration",
        env = "RESTORE_SPLIT_EXPIRATION",
        default_value = "1h",
        value_parser = humantime::parse_duration,
    )]
    pub split_expiration: Duration,

    /// Skip all splits and scatters, routing every entry to the unknown node.
    #[clap(long = "disable-scatter", env = "RESTORE_DISABLE_SCATTER", action)]
    pub disable_scatter: bool,
}

impl Default for SplitScatterConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            split_expiration: DEFAULT_SPLIT_EXPIRATION,
            disable_scatter: false,
        }
    }
}
