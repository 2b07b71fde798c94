// In-Memory Metadata Cache
//
// Reference `CacheMutator` backed by an ordered map. Used by the CLI
// and by tests; production caches implement the trait themselves.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;

use super::{ApplyOutcome, CacheMutator, MutationResult};
use crate::event::{CacheKey, PartitionKey, PartitionMetadata, TableName, TableSchema};

/// Cached state of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionEntry {
    pub metadata: PartitionMetadata,
    pub metadata_stale: bool,
    pub files_stale: bool,
}

impl PartitionEntry {
    fn stale() -> Self {
        Self {
            metadata: PartitionMetadata::default(),
            metadata_stale: true,
            files_stale: true,
        }
    }
}

/// Cached state of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableEntry {
    pub schema: TableSchema,
    pub schema_stale: bool,
    pub files_stale: bool,
    /// Keyed by Hive partition name.
    pub partitions: BTreeMap<String, PartitionEntry>,
}

impl TableEntry {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMetadataCache {
    tables: RwLock<BTreeMap<TableName, TableEntry>>,
}

impl InMemoryMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, table: &TableName) -> Option<TableEntry> {
        self.tables.read().get(table).cloned()
    }

    pub fn contains_table(&self, table: &TableName) -> bool {
        self.tables.read().contains_key(table)
    }

    pub fn partition(&self, key: &PartitionKey) -> Option<PartitionEntry> {
        self.tables
            .read()
            .get(&key.table)
            .and_then(|entry| entry.partitions.get(&key.spec.partition_name()))
            .cloned()
    }

    /// Point-in-time copy of the cache, keyed by `db.table`.
    pub fn snapshot(&self) -> BTreeMap<String, TableEntry> {
        self.tables
            .read()
            .iter()
            .map(|(name, entry)| (name.to_string(), entry.clone()))
            .collect()
    }

    fn update_table<F>(&self, table: &TableName, f: F) -> MutationResult
    where
        F: FnOnce(&mut TableEntry) -> ApplyOutcome,
    {
        let mut tables = self.tables.write();
        match tables.get_mut(table) {
            Some(entry) => Ok(f(entry)),
            // Uncached tables are loaded lazily with fresh metadata.
            None => Ok(ApplyOutcome::NoOp),
        }
    }
}

fn outcome(changed: bool) -> ApplyOutcome {
    if changed {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::NoOp
    }
}

impl CacheMutator for InMemoryMetadataCache {
    fn register_table(&self, table: &TableName, schema: &TableSchema) -> MutationResult {
        let fresh = TableEntry::new(schema.clone());
        let previous = self.tables.write().insert(table.clone(), fresh.clone());
        Ok(outcome(previous.as_ref() != Some(&fresh)))
    }

    fn refresh_table_schema(&self, table: &TableName, schema: &TableSchema) -> MutationResult {
        self.update_table(table, |entry| {
            entry.schema = schema.clone();
            entry.schema_stale = true;
            ApplyOutcome::Applied
        })
    }

    fn invalidate_table(&self, table: &TableName) -> MutationResult {
        Ok(outcome(self.tables.write().remove(table).is_some()))
    }

    fn add_partition(&self, key: &PartitionKey) -> MutationResult {
        self.update_table(&key.table, |entry| {
            match entry.partitions.get_mut(&key.spec.partition_name()) {
                Some(partition) => {
                    let changed = !(partition.metadata_stale && partition.files_stale);
                    partition.metadata_stale = true;
                    partition.files_stale = true;
                    outcome(changed)
                }
                None => {
                    entry
                        .partitions
                        .insert(key.spec.partition_name(), PartitionEntry::stale());
                    ApplyOutcome::Applied
                }
            }
        })
    }

    fn invalidate_partition(&self, key: &PartitionKey) -> MutationResult {
        self.update_table(&key.table, |entry| {
            outcome(entry.partitions.remove(&key.spec.partition_name()).is_some())
        })
    }

    fn refresh_partition(
        &self,
        key: &PartitionKey,
        metadata: &PartitionMetadata,
    ) -> MutationResult {
        self.update_table(&key.table, |entry| {
            match entry.partitions.get_mut(&key.spec.partition_name()) {
                Some(partition) => {
                    partition.metadata = metadata.clone();
                    partition.metadata_stale = true;
                    ApplyOutcome::Applied
                }
                None => ApplyOutcome::NoOp,
            }
        })
    }

    fn invalidate_files(&self, key: &CacheKey) -> MutationResult {
        self.update_table(&key.table, |entry| match &key.partition {
            None => {
                entry.files_stale = true;
                ApplyOutcome::Applied
            }
            Some(spec) => match entry.partitions.get_mut(&spec.partition_name()) {
                Some(partition) => {
                    partition.files_stale = true;
                    ApplyOutcome::Applied
                }
                None => ApplyOutcome::NoOp,
            },
        })
    }
}
