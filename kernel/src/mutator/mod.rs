// Cache Mutation Contract
//
// Operations the metadata cache exposes to the event pipeline.
// Implementations own their locking and any refresh I/O.

use serde::Serialize;

use crate::event::{CacheKey, PartitionKey, PartitionMetadata, TableName, TableSchema};

mod memory;

pub use memory::{InMemoryMetadataCache, PartitionEntry, TableEntry};

/// Result of a single cache operation.
pub type MutationResult = Result<ApplyOutcome, TransientFailure>;

/// What an operation did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApplyOutcome {
    /// Cache state changed, or was re-marked stale.
    Applied,

    /// The key is not cached or already in the target state.
    NoOp,
}

/// A mutation that may succeed if retried, e.g. a concurrent structural
/// change detected mid-update or a refresh call that timed out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transient cache failure on {key}: {reason}")]
pub struct TransientFailure {
    pub key: CacheKey,
    pub reason: String,
}

impl TransientFailure {
    pub fn new(key: CacheKey, reason: impl Into<String>) -> Self {
        Self {
            key,
            reason: reason.into(),
        }
    }
}

/// Metadata cache operations, one per cache event variant.
///
/// Every operation must be idempotent: repeating it leaves the cache in the
/// same state as applying it once. Unknown keys are reported as
/// [`ApplyOutcome::NoOp`], never as an error.
pub trait CacheMutator: Send + Sync {
    /// Register an empty entry for a newly created table.
    fn register_table(&self, table: &TableName, schema: &TableSchema) -> MutationResult;

    /// Replace the cached schema snapshot and invalidate schema-derived
    /// state. Cached partitions are kept.
    fn refresh_table_schema(&self, table: &TableName, schema: &TableSchema) -> MutationResult;

    /// Remove a table and every partition cached under it.
    fn invalidate_table(&self, table: &TableName) -> MutationResult;

    /// Add a partition entry, or mark an existing one stale.
    fn add_partition(&self, key: &PartitionKey) -> MutationResult;

    /// Remove a single partition entry.
    fn invalidate_partition(&self, key: &PartitionKey) -> MutationResult;

    /// Invalidate one partition's cached metadata.
    fn refresh_partition(&self, key: &PartitionKey, metadata: &PartitionMetadata)
        -> MutationResult;

    /// Mark the file listing of a partition, or of an unpartitioned table,
    /// stale.
    fn invalidate_files(&self, key: &CacheKey) -> MutationResult;
}
