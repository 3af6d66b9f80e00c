use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, error, trace, warn};

use crate::{
    config::UnitConfig,
    error::{Error, Result},
    storage::{
        ctx::{TxnCtx, TxnState, Writer},
        scn::Scn,
    },
};

/// Read fence that makes every pending write visible
pub const READ_ALL: u64 = u64::MAX;

/// Oldest snapshot that may still be read, shared by a container and its rows.
/// Committed versions superseded at or below it are eligible for recycling.
#[derive(Debug, Default)]
pub struct RecycleHorizon(AtomicU64);

impl RecycleHorizon {
    pub fn get(&self) -> Scn {
        Scn::new(self.0.load(Ordering::Acquire))
    }

    /// Moves the horizon forward, never backward
    pub fn advance(&self, scn: Scn) {
        self.0.fetch_max(scn.as_u64(), Ordering::AcqRel);
    }
}

enum VersionState {
    /// Written by a live transaction, resolved through its context
    Pending(Arc<TxnCtx>),
    Committed(Scn),
}

struct Version<V> {
    value: V,
    is_remove: bool,
    writer: Writer,
    /// Writer's write sequence, 0 for replayed versions
    seq: u64,
    state: VersionState,
}

impl<V> Version<V> {
    fn resolve(&self) -> TxnState {
        match &self.state {
            VersionState::Pending(ctx) => ctx.state(),
            VersionState::Committed(scn) => TxnState::Committed(*scn),
        }
    }

    fn committed_scn(&self) -> Option<Scn> {
        match self.resolve() {
            TxnState::Committed(scn) => Some(scn),
            _ => None,
        }
    }

    fn view(&self, state: TxnState) -> VersionView<'_, V> {
        VersionView {
            value: &self.value,
            is_remove: self.is_remove,
            writer: self.writer,
            seq: self.seq,
            state,
        }
    }
}

/// Borrowed view of a single version with its resolved state
#[derive(Debug)]
pub struct VersionView<'a, V> {
    pub value: &'a V,
    pub is_remove: bool,
    pub writer: Writer,
    pub seq: u64,
    pub state: TxnState,
}

impl<'a, V> VersionView<'a, V> {
    /// Commit marker, `None` while pending
    pub fn scn(&self) -> Option<Scn> {
        match self.state {
            TxnState::Committed(scn) => Some(scn),
            _ => None,
        }
    }

    /// Value as seen by readers, `None` for tombstones
    pub fn visible_value(&self) -> Option<&'a V> {
        if self.is_remove { None } else { Some(self.value) }
    }
}

/// One version handed to a scan consumer
#[derive(Debug)]
pub struct ScanRecord<'a, V> {
    pub table_id: u8,
    pub unit_id: u8,
    pub version: VersionView<'a, V>,
}

enum Visible<'a, V> {
    Found(&'a Version<V>),
    /// A prepared version may still commit inside the snapshot
    Blocked(Arc<TxnCtx>),
    Missing,
}

struct ChainState<V> {
    versions: Vec<Version<V>>,
    last_replay_scn: Option<Scn>,
    flushed_scn: Scn,
    writes_since_gc: u32,
}

impl<V> ChainState<V> {
    /// Newest version of a writer other than `writer` that is still unresolved
    fn blocking_writer(&self, writer: Writer) -> Option<(Arc<TxnCtx>, bool)> {
        self.versions.iter().rev().find_map(|v| match &v.state {
            VersionState::Pending(owner)
                if owner.writer() != writer && !owner.state().is_resolved() =>
            {
                Some((owner.clone(), v.is_remove))
            }
            _ => None,
        })
    }

    fn visible(&self, reader: Option<&Writer>, snapshot: Scn, read_seq: u64) -> Visible<'_, V> {
        if let Some(reader) = reader {
            let own = self
                .versions
                .iter()
                .filter(|v| v.writer == *reader && v.seq <= read_seq)
                .filter(|v| matches!(v.resolve(), TxnState::Active | TxnState::Prepared(_)))
                .max_by_key(|v| v.seq);
            if let Some(own) = own {
                return Visible::Found(own);
            }
        }

        let mut best: Option<(Scn, u64, &Version<V>)> = None;
        for version in &self.versions {
            match version.resolve() {
                TxnState::Committed(scn) if scn <= snapshot => {
                    if best.is_none_or(|(s, q, _)| (scn, version.seq) > (s, q)) {
                        best = Some((scn, version.seq, version));
                    }
                }
                TxnState::Prepared(prepare) if prepare <= snapshot => {
                    if let VersionState::Pending(owner) = &version.state {
                        if reader != Some(&version.writer) {
                            return Visible::Blocked(owner.clone());
                        }
                    }
                }
                _ => {}
            }
        }
        best.map_or(Visible::Missing, |(_, _, v)| Visible::Found(v))
    }

    /// Versions in commit order: committed by (scn, seq) then, unless `bound`
    /// is given, pending ones by seq. Aborted versions are left out.
    fn ordered(&self, bound: Option<Scn>) -> Vec<(TxnState, &Version<V>)> {
        let mut committed = Vec::new();
        let mut pending = Vec::new();
        for version in &self.versions {
            match version.resolve() {
                TxnState::Committed(scn) => {
                    if bound.is_none_or(|b| scn <= b) {
                        committed.push((scn, version));
                    }
                }
                TxnState::Aborted => {}
                state => {
                    if bound.is_none() {
                        pending.push((state, version));
                    }
                }
            }
        }
        committed.sort_by_key(|(scn, v)| (*scn, v.seq));
        pending.sort_by_key(|(_, v)| v.seq);
        committed
            .into_iter()
            .map(|(scn, v)| (TxnState::Committed(scn), v))
            .chain(pending)
            .collect()
    }

    /// Drops aborted versions and committed versions superseded at or below
    /// min(flushed scn, horizon). Returns the number of versions removed.
    fn recycle(&mut self, horizon: Scn) -> usize {
        let before = self.versions.len();
        for version in self.versions.iter_mut() {
            if let VersionState::Pending(ctx) = &version.state {
                if let TxnState::Committed(scn) = ctx.state() {
                    version.state = VersionState::Committed(scn);
                }
            }
        }
        self.versions.retain(|v| v.resolve() != TxnState::Aborted);

        let bound = horizon.min(self.flushed_scn);
        let keep = self
            .versions
            .iter()
            .filter_map(|v| v.committed_scn().filter(|scn| *scn <= bound).map(|scn| (scn, v.seq)))
            .max();
        if let Some(keep) = keep {
            self.versions.retain(|v| match v.committed_scn() {
                Some(scn) => (scn, v.seq) >= keep,
                None => true,
            });
        }
        self.writes_since_gc = 0;
        before - self.versions.len()
    }
}

/// Version chain of a single key.
///
/// Holds every version of the key ordered by commit marker. Writers are
/// serialized per chain: a write waits (bounded) for another writer's pending
/// version to commit or abort. Reads never wait on writers, except a snapshot
/// read that meets a prepared version which may still commit inside the
/// snapshot.
pub struct VersionChain<V> {
    state: RwLock<ChainState<V>>,
    horizon: Arc<RecycleHorizon>,
    gc_write_interval: u32,
}

impl<V> fmt::Debug for VersionChain<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("VersionChain");
        match self.state.try_read() {
            Some(state) => out
                .field("versions", &state.versions.len())
                .field("flushed_scn", &state.flushed_scn)
                .field("last_replay_scn", &state.last_replay_scn),
            None => out.field("versions", &"<locked>"),
        };
        out.finish()
    }
}

impl<V> Default for VersionChain<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> VersionChain<V> {
    pub fn new() -> Self {
        Self::with_horizon(Arc::new(RecycleHorizon::default()), &UnitConfig::default())
    }

    pub(crate) fn with_horizon(horizon: Arc<RecycleHorizon>, cfg: &UnitConfig) -> Self {
        Self {
            state: RwLock::new(ChainState {
                versions: Vec::new(),
                last_replay_scn: None,
                flushed_scn: Scn::MIN,
                writes_since_gc: 0,
            }),
            horizon,
            gc_write_interval: cfg.gc_write_interval,
        }
    }

    /// Number of stored versions, including ones not yet recycled
    pub fn version_count(&self) -> usize {
        self.state.read().versions.len()
    }

    /// Highest scn captured by a completed flush scan
    pub fn flushed_scn(&self) -> Scn {
        self.state.read().flushed_scn
    }

    /// Appends a pending version owned by `ctx`.
    ///
    /// Waits up to `lock_timeout` while another writer holds a pending version.
    /// A timed-out write leaves the chain untouched.
    pub fn write(
        &self,
        ctx: &Arc<TxnCtx>,
        value: V,
        lock_timeout: Duration,
        is_remove: bool,
    ) -> Result<()> {
        let deadline = deadline_after(lock_timeout);
        let writer = ctx.writer();
        let mut waited_on: Option<(Arc<TxnCtx>, bool)> = None;
        loop {
            let mut state = self.state.write();
            if ctx.state() != TxnState::Active {
                warn!(?writer, state = ?ctx.state(), "write from a transaction that is no longer active");
                return Err(Error::Conflict(format!(
                    "writer {:?} is {:?}, expected Active",
                    writer,
                    ctx.state()
                )));
            }

            if let Some((owner, owner_removes)) = state.blocking_writer(writer) {
                drop(state);
                trace!(?writer, holder = ?owner.writer(), "waiting for pending version");
                if !owner.wait_resolved(deadline) {
                    warn!(?writer, holder = ?owner.writer(), ?lock_timeout, "lock timeout on row");
                    return Err(Error::LockTimeout);
                }
                waited_on = Some((owner, owner_removes));
                continue;
            }

            if is_remove {
                if let Some((owner, true)) = &waited_on {
                    if matches!(owner.state(), TxnState::Committed(_)) {
                        warn!(?writer, holder = ?owner.writer(), "remove raced with a committed remove");
                        return Err(Error::Conflict(format!(
                            "row already removed by {:?}",
                            owner.writer()
                        )));
                    }
                }
            }

            state.versions.push(Version {
                value,
                is_remove,
                writer,
                seq: ctx.next_seq(),
                state: VersionState::Pending(ctx.clone()),
            });
            state.writes_since_gc += 1;
            if self.gc_write_interval > 0 && state.writes_since_gc >= self.gc_write_interval {
                let removed = state.recycle(self.horizon.get());
                if removed > 0 {
                    debug!(removed, "recycled versions on write");
                }
            }
            return Ok(());
        }
    }

    /// Re-applies a logged write at its original commit marker. Markers must
    /// arrive in strictly increasing order.
    pub fn replay(&self, ctx: &TxnCtx, value: V, scn: Scn, is_remove: bool) -> Result<()> {
        let mut state = self.state.write();
        if let Some(last) = state.last_replay_scn {
            if scn <= last {
                error!(%last, got = %scn, writer = ?ctx.writer(), "replay out of order");
                return Err(Error::ReplayOutOfOrder { last, got: scn });
            }
        }
        debug!(%scn, is_remove, writer = ?ctx.writer(), "replay version");
        state.last_replay_scn = Some(scn);
        state.versions.push(Version {
            value,
            is_remove,
            writer: ctx.writer(),
            seq: 0,
            state: VersionState::Committed(scn),
        });
        Ok(())
    }

    /// Visits every non-aborted version in commit order, or with `for_flush`
    /// only committed versions up to `flush_scn`.
    ///
    /// For flushes `flush_scn` is first lowered below any prepared version that
    /// could still commit at or under it, and to the newest committed scn while
    /// an active version is pending. After a complete flush the row remembers
    /// the marker for recycling.
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
        {
            let reader = self.reader();
            if for_flush {
                let active_bound = reader.max_committed().unwrap_or(Scn::MIN);
                reader.clamp_flush_scn(flush_scn, active_bound);
            }
            reader.scan(&mut consumer, *flush_scn, table_id, unit_id, for_flush)?;
        }
        if for_flush {
            self.mark_flushed(*flush_scn);
        }
        Ok(())
    }

    /// Visits every stored version in storage order, aborted ones included
    pub fn for_each_node<F>(&self, mut consumer: F) -> Result<()>
    where
        F: FnMut(&VersionView<'_, V>) -> Result<()>,
    {
        let state = self.state.read();
        for version in &state.versions {
            consumer(&version.view(version.resolve()))?;
        }
        Ok(())
    }

    /// Runs garbage collection now
    pub fn recycle(&self) -> usize {
        let horizon = self.horizon.get();
        self.state.write().recycle(horizon)
    }

    /// Shared view of the row that keeps writers out while held
    pub(crate) fn reader(&self) -> ChainReader<'_, V> {
        ChainReader(self.state.read())
    }

    pub(crate) fn mark_flushed(&self, flush_scn: Scn) {
        let horizon = self.horizon.get();
        let mut state = self.state.write();
        state.flushed_scn = state.flushed_scn.max(flush_scn);
        let removed = state.recycle(horizon);
        if removed > 0 {
            debug!(removed, %flush_scn, "recycled versions after flush");
        }
    }
}

/// Row state pinned for a flush: clamping and scanning see the same versions
pub(crate) struct ChainReader<'a, V>(RwLockReadGuard<'a, ChainState<V>>);

impl<V> ChainReader<'_, V> {
    pub(crate) fn max_committed(&self) -> Option<Scn> {
        self.0.versions.iter().filter_map(|v| v.committed_scn()).max()
    }

    /// Lowers `flush_scn` below every prepared version that may commit under
    /// it, and to `active_bound` while an active version is pending. Active
    /// owners are fenced at the lowered marker so they cannot commit under it
    /// later.
    pub(crate) fn clamp_flush_scn(&self, flush_scn: &mut Scn, active_bound: Scn) {
        for version in &self.0.versions {
            let VersionState::Pending(owner) = &version.state else {
                continue;
            };
            if owner.state() == TxnState::Active && active_bound < *flush_scn {
                debug!(%active_bound, from = %flush_scn, writer = ?owner.writer(), "flush scn lowered for active version");
                *flush_scn = active_bound;
            }
            if let TxnState::Prepared(prepare) = owner.fence_commit(*flush_scn) {
                if prepare <= *flush_scn {
                    debug!(%prepare, from = %flush_scn, "flush scn lowered below prepared version");
                    *flush_scn = prepare.prev();
                }
            }
        }
    }

    pub(crate) fn scan<F>(
        &self,
        consumer: &mut F,
        flush_scn: Scn,
        table_id: u8,
        unit_id: u8,
        for_flush: bool,
    ) -> Result<()>
    where
        F: FnMut(&ScanRecord<'_, V>) -> Result<()>,
    {
        for (resolved, version) in self.0.ordered(for_flush.then_some(flush_scn)) {
            consumer(&ScanRecord {
                table_id,
                unit_id,
                version: version.view(resolved),
            })?;
        }
        Ok(())
    }
}

impl<V: Clone> VersionChain<V> {
    /// Value of the newest version committed at or below `snapshot`.
    /// Pending versions are skipped; `read_seq` only fences pending versions
    /// and so has no effect here.
    pub fn read_snapshot(&self, snapshot: Scn, read_seq: u64, timeout: Duration) -> Result<Option<V>> {
        self.read_visible(None, snapshot, read_seq, timeout)
    }

    /// Like [`VersionChain::read_snapshot`], but the newest pending version of
    /// `writer` written at or before `read_seq` wins.
    pub fn read_by_writer(
        &self,
        writer: &Writer,
        snapshot: Scn,
        read_seq: u64,
        timeout: Duration,
    ) -> Result<Option<V>> {
        self.read_visible(Some(writer), snapshot, read_seq, timeout)
    }

    /// Newest non-aborted version regardless of commit state
    pub fn read_latest(&self, read_seq: u64) -> Option<V> {
        let state = self.state.read();
        let pending = state
            .versions
            .iter()
            .filter(|v| v.seq <= read_seq)
            .filter(|v| matches!(v.resolve(), TxnState::Active | TxnState::Prepared(_)))
            .max_by_key(|v| v.seq);
        let latest = pending.or_else(|| {
            state
                .versions
                .iter()
                .filter_map(|v| v.committed_scn().map(|scn| (scn, v.seq, v)))
                .max_by_key(|(scn, seq, _)| (*scn, *seq))
                .map(|(_, _, v)| v)
        })?;
        if latest.is_remove { None } else { Some(latest.value.clone()) }
    }

    fn read_visible(
        &self,
        reader: Option<&Writer>,
        snapshot: Scn,
        read_seq: u64,
        timeout: Duration,
    ) -> Result<Option<V>> {
        let deadline = deadline_after(timeout);
        loop {
            let state = self.state.read();
            let owner = match state.visible(reader, snapshot, read_seq) {
                Visible::Found(v) if v.is_remove => return Ok(None),
                Visible::Found(v) => return Ok(Some(v.value.clone())),
                Visible::Missing => return Ok(None),
                Visible::Blocked(owner) => owner,
            };
            drop(state);
            if !owner.wait_resolved(deadline) {
                warn!(holder = ?owner.writer(), %snapshot, ?timeout, "read timed out on prepared version");
                return Err(Error::LockTimeout);
            }
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}
