//! Rewriting of backup-time keys into the keyspace being restored into.

use restore_types::{Key, Rekey};
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error("rekey has an empty old prefix")]
    EmptyPrefix,

    #[error("more than one rekey for prefix {0}")]
    DuplicatePrefix(Key),

    #[error("no rekey matches key {0}")]
    NoMatchingRekey(Key),
}

pub trait KeyRewriter: Debug + Send + Sync + 'static {
    /// Map a key from the backup into the restore keyspace.
    fn rewrite(&self, key: &Key) -> Result<Key, RewriteError>;
}

/// Rewrites keys by replacing the longest matching old prefix with its new prefix.
#[derive(Debug, Clone)]
pub struct PrefixRewriter {
    /// Sorted by descending old prefix length so the first match is the longest.
    rekeys: Vec<Rekey>,
}

impl PrefixRewriter {
    pub fn try_new(rekeys: &[Rekey]) -> Result<Self, RewriteError> {
        let mut rekeys = rekeys.to_vec();
        if rekeys.iter().any(|r| r.old_prefix.is_empty()) {
            return Err(RewriteError::EmptyPrefix);
        }

        rekeys.sort_by(|a, b| {
            b.old_prefix
                .as_bytes()
                .len()
                .cmp(&a.old_prefix.as_bytes().len())
                .then_with(|| a.old_prefix.cmp(&b.old_prefix))
        });
        if let Some(dup) = rekeys
            .windows(2)
            .find(|w| w[0].old_prefix == w[1].old_prefix)
        {
            return Err(RewriteError::DuplicatePrefix(dup[0].old_prefix.clone()));
        }

        Ok(Self { rekeys })
    }
}

impl KeyRewriter for PrefixRewriter {
    fn rewrite(&self, key: &Key) -> Result<Key, RewriteError> {
        let rekey = self
            .rekeys
            .iter()
            .find(|r| key.starts_with(&r.old_prefix))
            .ok_or_else(|| RewriteError::NoMatchingRekey(key.clone()))?;

        let suffix = &key.as_bytes()[rekey.old_prefix.as_bytes().len()..];
        let mut rewritten = Vec::with_capacity(rekey.new_prefix.as_bytes().len() + suffix.len());
        rewritten.extend_from_slice(rekey.new_prefix.as_bytes());
        rewritten.extend_from_slice(suffix);
        Ok(Key::new(rewritten))
    }
}
