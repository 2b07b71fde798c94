// Per-Table Mutation Locks
//
// Serializes cache mutation per table. A holder locks every table it
// touches at once; disjoint table sets proceed in parallel.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

use crate::event::TableName;

#[derive(Debug, Default)]
pub struct TableLocks {
    held: Mutex<HashSet<TableName>>,
    released: Condvar,
}

/// Releases its tables on drop.
#[derive(Debug)]
pub struct TableLockGuard<'a> {
    locks: &'a TableLocks,
    tables: Vec<TableName>,
}

impl TableLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every table in `tables` is free, then take them all.
    ///
    /// Acquisition is all-or-nothing, so overlapping holders cannot
    /// deadlock.
    pub fn acquire<'t>(
        &self,
        tables: impl IntoIterator<Item = &'t TableName>,
    ) -> TableLockGuard<'_> {
        let mut wanted: Vec<TableName> = tables.into_iter().cloned().collect();
        wanted.sort();
        wanted.dedup();

        let mut held = self.held.lock();
        while wanted.iter().any(|t| held.contains(t)) {
            self.released.wait(&mut held);
        }
        held.extend(wanted.iter().cloned());

        TableLockGuard {
            locks: self,
            tables: wanted,
        }
    }

    pub fn is_locked(&self, table: &TableName) -> bool {
        self.held.lock().contains(table)
    }
}

impl TableLockGuard<'_> {
    pub fn tables(&self) -> &[TableName] {
        &self.tables
    }
}

impl Drop for TableLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock();
        for table in &self.tables {
            held.remove(table);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
