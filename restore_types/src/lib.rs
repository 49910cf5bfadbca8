//! Shared data model for the restore split-and-scatter stage.
//!
//! A restore is described as an ordered list of [`Chunk`]s, each holding one or more contiguous
//! [`RestoreSpanEntry`] values. Keys are plain byte strings ordered lexicographically, and
//! cluster nodes are identified by [`NodeId`].

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

pub mod serialize;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("a chunk must contain at least one entry")]
    EmptyChunk,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A key in the cluster's keyspace.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The immediate successor of this key: no key sorts strictly between `self` and the
    /// returned key.
    pub fn next(&self) -> Self {
        let mut next = Vec::with_capacity(self.0.len() + 1);
        next.extend_from_slice(&self.0);
        next.push(0);
        Self(next)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn starts_with(&self, prefix: &Key) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.escape_ascii())
    }
}

/// A half-open key range `[start, end)`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Key,
    pub end: Key,
}

impl Span {
    pub fn new(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The span covering exactly one key.
    pub fn single_key(key: Key) -> Self {
        let end = key.next();
        Self { start: key, end }
    }

    pub fn contains(&self, key: &Key) -> bool {
        &self.start <= key && key < &self.end
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{})", self.start, self.end)
    }
}

/// Identifies a node in the cluster.
///
/// [`NodeId::UNKNOWN`] is reserved for "no destination could be determined".
#[derive(
    Debug, Default, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash,
)]
pub struct NodeId(u32);

impl NodeId {
    pub const UNKNOWN: Self = Self(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reference to a backup data file that supplies the contents of a restored span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreFileRef {
    /// URI of the external storage holding the file.
    pub storage_uri: String,
    pub path: String,
}

/// A contiguous key range to restore along with the backup files that hold its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSpanEntry {
    pub span: Span,
    #[serde(default)]
    pub files: Vec<RestoreFileRef>,
    /// Position of this entry in the overall restore, used for progress tracking downstream.
    #[serde(default)]
    pub progress_idx: u64,
}

impl RestoreSpanEntry {
    pub fn new(span: Span) -> Self {
        Self {
            span,
            files: vec![],
            progress_idx: 0,
        }
    }

    pub fn with_files(mut self, files: Vec<RestoreFileRef>) -> Self {
        self.files = files;
        self
    }

    pub fn with_progress_idx(mut self, progress_idx: u64) -> Self {
        self.progress_idx = progress_idx;
        self
    }

    pub fn start_key(&self) -> &Key {
        &self.span.start
    }
}

/// A non-empty group of contiguous entries that share a single scatter destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<RestoreSpanEntry>", into = "Vec<RestoreSpanEntry>")]
pub struct Chunk {
    entries: Vec<RestoreSpanEntry>,
}

impl Chunk {
    pub fn new(entries: Vec<RestoreSpanEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::EmptyChunk);
        }
        Ok(Self { entries })
    }

    /// The start key of the first entry in the chunk.
    pub fn start_key(&self) -> &Key {
        self.entries[0].start_key()
    }

    pub fn entries(&self) -> &[RestoreSpanEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<RestoreSpanEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false; present so that `len` has its usual companion.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TryFrom<Vec<RestoreSpanEntry>> for Chunk {
    type Error = Error;

    fn try_from(entries: Vec<RestoreSpanEntry>) -> Result<Self> {
        Self::new(entries)
    }
}

impl From<Chunk> for Vec<RestoreSpanEntry> {
    fn from(chunk: Chunk) -> Self {
        chunk.entries
    }
}

/// Maps keys under `old_prefix` in the backup to keys under `new_prefix` in the restored
/// keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rekey {
    pub old_prefix: Key,
    pub new_prefix: Key,
}

impl Rekey {
    pub fn new(old_prefix: impl Into<Key>, new_prefix: impl Into<Key>) -> Self {
        Self {
            old_prefix: old_prefix.into(),
            new_prefix: new_prefix.into(),
        }
    }
}

/// Everything the split-and-scatter stage is given to work on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAndScatterSpec {
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub rekeys: Vec<Rekey>,
}

impl SplitAndScatterSpec {
    pub fn num_entries(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }
}
