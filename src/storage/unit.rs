use std::{
    fmt::{self, Debug},
    sync::Arc,
    time::Duration,
};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::{
    config::UnitConfig,
    error::{Error, Result},
    storage::{
        chain::{RecycleHorizon, ScanRecord, VersionChain, VersionView},
        ctx::{TxnCtx, Writer},
        iter::Entries,
        scn::Scn,
    },
};

/// Sorted multi-key state container.
///
/// Maps each key to its [`VersionChain`]. The container lock is only taken
/// exclusively to create a row for an unseen key, or through [`StateUnit::lock`];
/// row-level operations run without it.
///
/// Holding the guard from [`StateUnit::lock`] while calling `set` or `replay`
/// on the same container deadlocks.
pub struct StateUnit<K, V> {
    entries: RwLock<Entries<K, V>>,
    horizon: Arc<RecycleHorizon>,
    config: UnitConfig,
}

impl<K: Ord + Clone + Debug, V> Default for StateUnit<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> Debug for StateUnit<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // rows are None while a `lock` guard is held
        f.debug_struct("StateUnit")
            .field("rows", &self.entries.try_read().map(|entries| entries.len()))
            .field("recycle_scn", &self.horizon.get())
            .field("config", &self.config)
            .finish()
    }
}

impl<K: Ord + Clone + Debug, V> StateUnit<K, V> {
    pub fn new() -> Self {
        Self::with_config(UnitConfig::default())
    }

    pub fn with_config(config: UnitConfig) -> Self {
        Self {
            entries: RwLock::new(Entries::new()),
            horizon: Arc::new(RecycleHorizon::default()),
            config,
        }
    }

    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Announces the oldest snapshot still in use; versions superseded at or
    /// below it become recyclable once flushed
    pub fn set_recycle_scn(&self, scn: Scn) {
        self.horizon.advance(scn);
    }

    /// Shared guard for iteration; blocks row creation while held
    pub fn read(&self) -> RwLockReadGuard<'_, Entries<K, V>> {
        self.entries.read()
    }

    /// Exclusive guard for multi-key operations. Dropping it unlocks.
    pub fn lock(&self) -> RwLockWriteGuard<'_, Entries<K, V>> {
        self.entries.write()
    }

    pub fn set(
        &self,
        key: &K,
        value: V,
        ctx: &Arc<TxnCtx>,
        lock_timeout: Duration,
        is_remove: bool,
    ) -> Result<()> {
        self.row_or_insert(key).write(ctx, value, lock_timeout, is_remove)
    }

    pub fn replay(&self, key: &K, value: V, ctx: &TxnCtx, scn: Scn, is_remove: bool) -> Result<()> {
        self.row_or_insert(key).replay(ctx, value, scn, is_remove)
    }

    /// Visits every row in ascending key order under the shared lock and
    /// scans it. With `for_flush` the marker is clamped across all rows first,
    /// so every row is flushed up to the same scn. Every row stays pinned from
    /// the clamp to the end of its scan, so writers wait for the scan.
    ///
    /// Rows are only marked flushed once every row was visited; a consumer
    /// error leaves the container as it was.
    pub fn scan_all<F>(
        &self,
        mut consumer: F,
        flush_scn: &mut Scn,
        table_id: u8,
        unit_id: u8,
        for_flush: bool,
    ) -> Result<()>
    where
        F: FnMut(&K, &ScanRecord<'_, V>) -> Result<()>,
    {
        let entries = self.entries.read();
        {
            let readers: Vec<_> = entries.iter().map(|(key, row)| (key, row.reader())).collect();
            if for_flush {
                // transactions still active commit above anything committed so far
                let active_bound = readers
                    .iter()
                    .filter_map(|(_, reader)| reader.max_committed())
                    .max()
                    .unwrap_or(Scn::MIN);
                for (_, reader) in &readers {
                    reader.clamp_flush_scn(flush_scn, active_bound);
                }
            }
            let marker = *flush_scn;
            for (key, reader) in readers.iter().map(|(key, reader)| (*key, reader)) {
                let mut visit = |record: &ScanRecord<'_, V>| consumer(key, record);
                reader.scan(&mut visit, marker, table_id, unit_id, for_flush)?;
            }
        }

        let marker = *flush_scn;
        if for_flush {
            for (_, row) in entries.iter() {
                row.mark_flushed(marker);
            }
        }
        debug!(rows = entries.len(), %marker, table_id, unit_id, for_flush, "scanned unit");
        Ok(())
    }

    /// Ascending key order
    pub fn for_each_row<F>(&self, mut consumer: F) -> Result<()>
    where
        F: FnMut(&K, &VersionChain<V>) -> Result<()>,
    {
        let entries = self.entries.read();
        for (key, row) in entries.iter() {
            consumer(key, row)?;
        }
        Ok(())
    }

    pub fn for_each_node_on_row<F>(&self, mut consumer: F) -> Result<()>
    where
        F: FnMut(&K, &VersionView<'_, V>) -> Result<()>,
    {
        let entries = self.entries.read();
        for (key, row) in entries.iter() {
            row.for_each_node(|node: &VersionView<'_, V>| consumer(key, node))?;
        }
        Ok(())
    }

    fn row(&self, key: &K) -> Result<Arc<VersionChain<V>>> {
        self.entries.read().row(key).ok_or(Error::KeyNotFound)
    }

    fn row_or_insert(&self, key: &K) -> Arc<VersionChain<V>> {
        if let Some(row) = self.entries.read().row(key) {
            return row;
        }
        let mut entries = self.entries.write();
        if let Some(row) = entries.row(key) {
            return row;
        }
        debug!(?key, "create row");
        entries.insert(
            key.clone(),
            VersionChain::with_horizon(self.horizon.clone(), &self.config),
        )
    }
}

impl<K: Ord + Clone + Debug, V: Clone> StateUnit<K, V> {
    pub fn get_snapshot(
        &self,
        key: &K,
        snapshot: Scn,
        read_seq: u64,
        timeout: Duration,
    ) -> Result<Option<V>> {
        match self.row(key) {
            Ok(row) => row.read_snapshot(snapshot, read_seq, timeout),
            Err(Error::KeyNotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn get_by_writer(
        &self,
        key: &K,
        writer: &Writer,
        snapshot: Scn,
        read_seq: u64,
        timeout: Duration,
    ) -> Result<Option<V>> {
        match self.row(key) {
            Ok(row) => row.read_by_writer(writer, snapshot, read_seq, timeout),
            Err(Error::KeyNotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn get_latest(&self, key: &K, read_seq: u64) -> Option<V> {
        self.row(key).ok().and_then(|row| row.read_latest(read_seq))
    }
}

/// Single-row container for units whose key space is trivial.
///
/// A [`StateUnit`] keyed by `()` whose only row is created up front.
pub struct SingleUnit<V> {
    unit: StateUnit<(), V>,
    row: Arc<VersionChain<V>>,
}

impl<V> Debug for SingleUnit<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleUnit").field("row", &self.row).finish()
    }
}

impl<V> Default for SingleUnit<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SingleUnit<V> {
    pub fn new() -> Self {
        Self::with_config(UnitConfig::default())
    }

    pub fn with_config(config: UnitConfig) -> Self {
        let unit = StateUnit::with_config(config);
        let row = unit.row_or_insert(&());
        Self { unit, row }
    }

    pub fn unit(&self) -> &StateUnit<(), V> {
        &self.unit
    }

    pub fn row(&self) -> &VersionChain<V> {
        &self.row
    }

    /// Always 1
    pub fn len(&self) -> usize {
        self.unit.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn set_recycle_scn(&self, scn: Scn) {
        self.unit.set_recycle_scn(scn);
    }

    /// Shared guard over the one-row index, for cursor access
    pub fn read(&self) -> RwLockReadGuard<'_, Entries<(), V>> {
        self.unit.read()
    }

    pub fn lock(&self) -> RwLockWriteGuard<'_, Entries<(), V>> {
        self.unit.lock()
    }

    pub fn set(&self, value: V, ctx: &Arc<TxnCtx>, lock_timeout: Duration, is_remove: bool) -> Result<()> {
        self.row.write(ctx, value, lock_timeout, is_remove)
    }

    pub fn replay(&self, value: V, ctx: &TxnCtx, scn: Scn, is_remove: bool) -> Result<()> {
        self.row.replay(ctx, value, scn, is_remove)
    }

    pub fn scan<F>(
        &self,
        mut consumer: F,
        flush_scn: &mut Scn,
        table_id: u8,
        unit_id: u8,
        for_flush: bool,
    ) -> Result<()>
    where
        F: FnMut(&ScanRecord<'_, V>) -> Result<()>,
    {
        self.unit.scan_all(
            |_: &(), record: &ScanRecord<'_, V>| consumer(record),
            flush_scn,
            table_id,
            unit_id,
            for_flush,
        )
    }

    /// Hands the only row to `consumer`
    pub fn for_each_row<F>(&self, mut consumer: F) -> Result<()>
    where
        F: FnMut(&VersionChain<V>) -> Result<()>,
    {
        self.unit.for_each_row(|_, row| consumer(row))
    }

    pub fn for_each_node<F>(&self, consumer: F) -> Result<()>
    where
        F: FnMut(&VersionView<'_, V>) -> Result<()>,
    {
        let _guard = self.unit.read();
        self.row.for_each_node(consumer)
    }
}

impl<V: Clone> SingleUnit<V> {
    pub fn get_snapshot(&self, snapshot: Scn, read_seq: u64, timeout: Duration) -> Result<Option<V>> {
        self.row.read_snapshot(snapshot, read_seq, timeout)
    }

    pub fn get_by_writer(
        &self,
        writer: &Writer,
        snapshot: Scn,
        read_seq: u64,
        timeout: Duration,
    ) -> Result<Option<V>> {
        self.row.read_by_writer(writer, snapshot, read_seq, timeout)
    }

    pub fn get_latest(&self, read_seq: u64) -> Option<V> {
        self.row.read_latest(read_seq)
    }
}
