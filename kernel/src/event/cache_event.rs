// Cache Events
//
// Normalized, fully-resolved cache mutations derived from metastore
// notifications. One variant per supported change kind.

use serde::Serialize;

use super::{CacheKey, PartitionKey, PartitionMetadata, TableName, TableSchema};
use crate::mutator::{CacheMutator, MutationResult};

/// A single cache mutation.
///
/// Every variant carries the keys it affects already resolved, so applying
/// it never needs the originating notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheEvent {
    /// Table was created; register an empty entry.
    TableCreated { table: TableName, schema: TableSchema },

    /// Table definition changed; cached schema and stats are invalid.
    /// Cached partitions stay.
    TableAltered { table: TableName, schema: TableSchema },

    /// Table was dropped along with all of its partitions.
    TableDropped { table: TableName },

    /// One partition was added. Produced once per partition in the payload.
    PartitionsAdded { key: PartitionKey },

    PartitionDropped { key: PartitionKey },

    PartitionAltered {
        key: PartitionKey,
        metadata: PartitionMetadata,
    },

    /// New data files landed in a partition, or in an unpartitioned table.
    PartitionFileInsert { key: CacheKey },
}

impl CacheEvent {
    /// Apply this event through the matching mutator operation.
    pub fn apply(&self, mutator: &dyn CacheMutator) -> MutationResult {
        match self {
            CacheEvent::TableCreated { table, schema } => mutator.register_table(table, schema),
            CacheEvent::TableAltered { table, schema } => {
                mutator.refresh_table_schema(table, schema)
            }
            CacheEvent::TableDropped { table } => mutator.invalidate_table(table),
            CacheEvent::PartitionsAdded { key } => mutator.add_partition(key),
            CacheEvent::PartitionDropped { key } => mutator.invalidate_partition(key),
            CacheEvent::PartitionAltered { key, metadata } => {
                mutator.refresh_partition(key, metadata)
            }
            CacheEvent::PartitionFileInsert { key } => mutator.invalidate_files(key),
        }
    }

    /// Table whose cache entries this event touches.
    pub fn table(&self) -> &TableName {
        match self {
            CacheEvent::TableCreated { table, .. }
            | CacheEvent::TableAltered { table, .. }
            | CacheEvent::TableDropped { table } => table,
            CacheEvent::PartitionsAdded { key }
            | CacheEvent::PartitionDropped { key }
            | CacheEvent::PartitionAltered { key, .. } => &key.table,
            CacheEvent::PartitionFileInsert { key } => &key.table,
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        match self {
            CacheEvent::TableCreated { table, .. }
            | CacheEvent::TableAltered { table, .. }
            | CacheEvent::TableDropped { table } => CacheKey::table(table.clone()),
            CacheEvent::PartitionsAdded { key }
            | CacheEvent::PartitionDropped { key }
            | CacheEvent::PartitionAltered { key, .. } => CacheKey::from(key.clone()),
            CacheEvent::PartitionFileInsert { key } => key.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CacheEvent::TableCreated { .. } => "table_created",
            CacheEvent::TableAltered { .. } => "table_altered",
            CacheEvent::TableDropped { .. } => "table_dropped",
            CacheEvent::PartitionsAdded { .. } => "partitions_added",
            CacheEvent::PartitionDropped { .. } => "partition_dropped",
            CacheEvent::PartitionAltered { .. } => "partition_altered",
            CacheEvent::PartitionFileInsert { .. } => "partition_file_insert",
        }
    }
}
