use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::{
    error::{Error, Result},
    storage::scn::Scn,
};

/// Who produced a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriterKind {
    /// A user transaction
    Transaction,
    /// Engine-internal writer (recovery, background jobs)
    Internal,
}

/// Writer identity attached to every version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Writer {
    pub kind: WriterKind,
    pub id: u64,
}

impl Writer {
    pub fn transaction(id: u64) -> Self {
        Self { kind: WriterKind::Transaction, id }
    }

    pub fn internal(id: u64) -> Self {
        Self { kind: WriterKind::Internal, id }
    }
}

/// Commit outcome of a transaction context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    /// Two-phase commit in progress; the commit scn will be >= the prepare scn
    Prepared(Scn),
    Committed(Scn),
    Aborted,
}

impl TxnState {
    pub fn is_resolved(&self) -> bool {
        matches!(self, TxnState::Committed(_) | TxnState::Aborted)
    }
}

#[derive(Debug)]
struct Slot {
    state: TxnState,
    /// Set by flushes that passed over an active version of this context;
    /// prepare and commit markers must stay above it
    commit_floor: Option<Scn>,
}

/// Transaction context shared between a writer and the versions it produced.
///
/// Pending versions hold an `Arc<TxnCtx>` and derive their visibility from
/// [`TxnCtx::state`]. Writers blocked on a pending version wait on the
/// context's condition until it resolves.
#[derive(Debug)]
pub struct TxnCtx {
    writer: Writer,
    slot: Mutex<Slot>,
    resolved: Condvar,
    seq: AtomicU64,
}

impl TxnCtx {
    pub fn new(writer: Writer) -> Self {
        Self {
            writer,
            slot: Mutex::new(Slot { state: TxnState::Active, commit_floor: None }),
            resolved: Condvar::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn writer(&self) -> Writer {
        self.writer
    }

    pub fn state(&self) -> TxnState {
        self.slot.lock().state
    }

    /// Highest flush marker that passed over this context while it was active
    pub fn commit_floor(&self) -> Option<Scn> {
        self.slot.lock().commit_floor
    }

    /// Records that a flush up to `scn` skipped this context's versions.
    ///
    /// While still active, later prepare and commit markers must be above
    /// `scn`. Returns the state observed under the same lock.
    pub(crate) fn fence_commit(&self, scn: Scn) -> TxnState {
        let mut slot = self.slot.lock();
        if slot.state == TxnState::Active {
            slot.commit_floor = Some(slot.commit_floor.map_or(scn, |floor| floor.max(scn)));
        }
        slot.state
    }

    /// Allocates the sequence number of the next write, starting at 1
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Sequence number of the last write, usable as a read fence that sees
    /// everything written so far
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn prepare(&self, scn: Scn) -> Result<()> {
        self.transition(scn, |state| match state {
            TxnState::Active => Ok(TxnState::Prepared(scn)),
            other => Err(other),
        })
    }

    pub fn commit(&self, scn: Scn) -> Result<()> {
        self.transition(scn, |state| match state {
            TxnState::Active => Ok(TxnState::Committed(scn)),
            TxnState::Prepared(prepare) if scn >= prepare => Ok(TxnState::Committed(scn)),
            other => Err(other),
        })
    }

    pub fn abort(&self) -> Result<()> {
        self.transition(Scn::MAX, |state| match state {
            TxnState::Active | TxnState::Prepared(_) => Ok(TxnState::Aborted),
            other => Err(other),
        })
    }

    /// Blocks until the context is committed or aborted, or `deadline` passes.
    /// Returns whether it resolved.
    pub fn wait_resolved(&self, deadline: Instant) -> bool {
        let mut slot = self.slot.lock();
        while !slot.state.is_resolved() {
            if self.resolved.wait_until(&mut slot, deadline).timed_out() {
                return slot.state.is_resolved();
            }
        }
        true
    }

    /// `scn` is the marker the transition assigns, checked against the
    /// commit floor when leaving Active
    fn transition<F>(&self, scn: Scn, f: F) -> Result<()>
    where
        F: FnOnce(TxnState) -> std::result::Result<TxnState, TxnState>,
    {
        let mut slot = self.slot.lock();
        let next = f(slot.state).map_err(|current| {
            Error::Internal(format!(
                "invalid transaction transition for {:?} from {:?}",
                self.writer, current
            ))
        })?;
        if slot.state == TxnState::Active && next != TxnState::Aborted {
            if let Some(floor) = slot.commit_floor.filter(|floor| scn <= *floor) {
                warn!(writer = ?self.writer, %scn, %floor, "commit marker at or below a flushed marker");
                return Err(Error::Conflict(format!(
                    "scn {} for {:?} is not above flushed scn {}",
                    scn, self.writer, floor
                )));
            }
        }
        trace!(writer = ?self.writer, from = ?slot.state, to = ?next, "transaction state change");
        slot.state = next;
        self.resolved.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    use super::{TxnCtx, TxnState, Writer};
    use crate::{
        error::{Error, Result},
        storage::scn::Scn,
    };

    #[test]
    fn test_transitions() -> Result<()> {
        let ctx = TxnCtx::new(Writer::transaction(1));
        assert_eq!(ctx.state(), TxnState::Active);
        ctx.prepare(Scn::new(10))?;
        assert!(ctx.commit(Scn::new(9)).is_err());
        ctx.commit(Scn::new(12))?;
        assert_eq!(ctx.state(), TxnState::Committed(Scn::new(12)));
        assert!(ctx.abort().is_err());

        let ctx = TxnCtx::new(Writer::internal(2));
        ctx.abort()?;
        assert!(ctx.commit(Scn::new(1)).is_err());
        Ok(())
    }

    #[test]
    fn test_seq() {
        let ctx = TxnCtx::new(Writer::transaction(1));
        assert_eq!(ctx.last_seq(), 0);
        assert_eq!(ctx.next_seq(), 1);
        assert_eq!(ctx.next_seq(), 2);
        assert_eq!(ctx.last_seq(), 2);
    }

    #[test]
    fn test_wait_resolved() -> Result<()> {
        let ctx = Arc::new(TxnCtx::new(Writer::transaction(1)));
        assert!(!ctx.wait_resolved(Instant::now() + Duration::from_millis(10)));

        thread::scope(|s| -> Result<()> {
            let waiter = s.spawn(|| ctx.wait_resolved(Instant::now() + Duration::from_secs(10)));
            thread::sleep(Duration::from_millis(20));
            ctx.commit(Scn::new(3))?;
            assert!(waiter.join().unwrap());
            Ok(())
        })
    }

    #[test]
    fn test_commit_floor() -> Result<()> {
        let ctx = TxnCtx::new(Writer::transaction(1));
        assert_eq!(ctx.fence_commit(Scn::new(10)), TxnState::Active);
        assert_eq!(ctx.fence_commit(Scn::new(4)), TxnState::Active);
        assert_eq!(ctx.commit_floor(), Some(Scn::new(10)));
        assert!(matches!(ctx.commit(Scn::new(10)), Err(Error::Conflict(_))));
        assert!(matches!(ctx.prepare(Scn::new(7)), Err(Error::Conflict(_))));
        assert_eq!(ctx.state(), TxnState::Active);
        ctx.prepare(Scn::new(11))?;

        // only active contexts are fenced
        assert_eq!(ctx.fence_commit(Scn::new(50)), TxnState::Prepared(Scn::new(11)));
        ctx.commit(Scn::new(12))?;

        let ctx = TxnCtx::new(Writer::transaction(2));
        ctx.fence_commit(Scn::new(10));
        ctx.abort()?;
        assert_eq!(ctx.state(), TxnState::Aborted);
        Ok(())
    }
}
