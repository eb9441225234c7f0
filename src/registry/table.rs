//! The slot array and its rotating allocation cursor (C2).

use super::open_set::OpenSet;
use super::slot::{IsolationLevel, TransactionSlot};
use crate::error::{GtmError, GtmResult};
use crate::gxid::Gxid;
use crate::handle::Handle;
use crate::ids::{ClientId, ProxyConnId, SessionId};
use std::sync::RwLock;

struct TableInner {
    slots: Vec<TransactionSlot>,
    open_set: OpenSet,
    last_slot: usize,
    latest_completed_xid: Gxid,
}

/// Fixed-capacity transaction table: `N_MAX` slots, a rotating cursor, and
/// the open-set index. Guarded by a single `RwLock` that plays the role of
/// spec.md's "table lock": read-held for lookups, write-held for
/// allocation, removal, and any change to `in_use` or open-set membership.
pub struct SlotTable {
    n_max: usize,
    inner: RwLock<TableInner>,
}

/// Arguments for allocating a fresh slot, bundled so `begin_multi` can pass
/// one value per batch entry.
pub struct NewTxnArgs {
    pub isolation: IsolationLevel,
    pub read_only: bool,
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub proxy_conn_id: ProxyConnId,
    pub is_vacuum: bool,
}

impl SlotTable {
    #[must_use]
    pub fn new(n_max: usize) -> Self {
        let slots = (0..n_max)
            .map(|i| TransactionSlot::empty(Handle::from_index(i)))
            .collect();
        SlotTable {
            n_max,
            inner: RwLock::new(TableInner {
                slots,
                open_set: OpenSet::new(),
                last_slot: n_max.saturating_sub(1),
                latest_completed_xid: Gxid::INVALID,
            }),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.n_max
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.read().expect("table lock poisoned").open_set.len()
    }

    /// Allocates a fresh slot for `args`, reusing an existing slot if
    /// `args.session_id` is already bound to one in the open-set (spec.md
    /// §4.2 step 2). Returns the handle either way.
    pub fn begin(&self, args: NewTxnArgs) -> GtmResult<Handle> {
        let mut inner = self.inner.write().expect("table lock poisoned");

        if !args.session_id.is_empty()
            && let Some(existing) = inner.open_set.by_session(args.session_id.as_str())
        {
            return Ok(existing);
        }

        let n_max = self.n_max;
        let start = (inner.last_slot + 1) % n_max;
        let mut found = None;
        for offset in 0..n_max {
            let idx = (start + offset) % n_max;
            if !inner.slots[idx].in_use {
                found = Some(idx);
                break;
            }
        }

        let Some(idx) = found else {
            return Err(GtmError::Capacity);
        };

        inner.last_slot = idx;
        let session_str = args.session_id.as_str().to_string();
        inner.slots[idx].reinit(
            args.isolation,
            args.read_only,
            args.session_id,
            args.client_id,
            args.proxy_conn_id,
            args.is_vacuum,
        );
        let handle = Handle::from_index(idx);
        inner.open_set.insert(handle);
        inner.open_set.index_session(&session_str, handle);

        Ok(handle)
    }

    /// Records a GXID assignment in the open-set's auxiliary index. Called
    /// by the allocator immediately after assigning `slot.gxid`.
    pub fn index_gxid(&self, handle: Handle, gxid: Gxid) {
        let mut inner = self.inner.write().expect("table lock poisoned");
        inner.open_set.index_gxid(gxid, handle);
    }

    pub fn with_slot<T>(&self, handle: Handle, f: impl FnOnce(&TransactionSlot) -> T) -> GtmResult<T> {
        let inner = self.inner.read().expect("table lock poisoned");
        let slot = inner
            .slots
            .get(handle.index())
            .filter(|s| s.in_use)
            .ok_or(GtmError::InvalidHandle)?;
        Ok(f(slot))
    }

    /// Mutable access for fields guarded directly by the table lock
    /// (`gxid` assignment on a located slot).
    pub fn with_slot_mut<T>(&self, handle: Handle, f: impl FnOnce(&mut TransactionSlot) -> T) -> GtmResult<T> {
        let mut inner = self.inner.write().expect("table lock poisoned");
        let slot = inner
            .slots
            .get_mut(handle.index())
            .filter(|s| s.in_use)
            .ok_or(GtmError::InvalidHandle)?;
        Ok(f(slot))
    }

    /// Binds `gid` to `handle` (`start_prepared`, spec.md §4.3.2), failing
    /// if the GID is already bound to a different open transaction
    /// (invariant I6). Duplicate-check and insert happen under one write
    /// lock to avoid a race between the two.
    pub fn bind_gid(&self, handle: Handle, gid: crate::ids::Gid, node_list: String) -> GtmResult<()> {
        let mut inner = self.inner.write().expect("table lock poisoned");
        if inner.open_set.by_gid(&gid).is_some() {
            return Err(GtmError::DuplicateGid);
        }
        let slot = inner
            .slots
            .get(handle.index())
            .filter(|s| s.in_use)
            .ok_or(GtmError::InvalidHandle)?;
        {
            let mut mutable = slot.mutable.write().expect("slot lock poisoned");
            mutable.state = super::slot::TransactionState::PrepareInProgress;
            mutable.gid = Some(gid.clone());
            mutable.node_list = Some(node_list);
        }
        inner.open_set.index_gid(gid, handle);
        Ok(())
    }

    pub fn by_gxid(&self, gxid: Gxid) -> Option<Handle> {
        self.inner.read().expect("table lock poisoned").open_set.by_gxid(gxid)
    }

    pub fn by_gid(&self, gid: &crate::ids::Gid) -> Option<Handle> {
        self.inner.read().expect("table lock poisoned").open_set.by_gid(gid)
    }

    pub fn by_session(&self, session: &str) -> Option<Handle> {
        self.inner.read().expect("table lock poisoned").open_set.by_session(session)
    }

    #[must_use]
    pub fn latest_completed_xid(&self) -> Gxid {
        self.inner.read().expect("table lock poisoned").latest_completed_xid
    }

    /// The oldest GXID still open, excluding autovacuum transactions
    /// (spec.md §4.1's note that vacuum txns are excluded from snapshot
    /// xmin computations). `None` when nothing non-vacuum is open.
    #[must_use]
    pub fn oldest_open_xid(&self) -> Option<Gxid> {
        let inner = self.inner.read().expect("table lock poisoned");
        let mut oldest: Option<Gxid> = None;
        for h in inner.open_set.iter() {
            let slot = &inner.slots[h.index()];
            if slot.is_vacuum || !slot.gxid.is_normal() {
                continue;
            }
            oldest = match oldest {
                Some(current) if current.precedes(slot.gxid) => Some(current),
                _ => Some(slot.gxid),
            };
        }
        oldest
    }

    #[must_use]
    pub fn last_client_id(&self) -> ClientId {
        let inner = self.inner.read().expect("table lock poisoned");
        let mut best = ClientId::new(0);
        let mut any = false;
        for h in inner.open_set.iter() {
            let cid = inner.slots[h.index()].client_id;
            if !any || cid.follows(best) {
                best = cid;
                any = true;
            }
        }
        best
    }

    /// Bundle of everything cleanup needs to hand the sequence manager,
    /// collected while the table lock is held so the lock can be released
    /// before the (arbitrary, external) sequence-manager calls happen.
    pub fn finish_removal(&self, handle: Handle) -> GtmResult<RemovedSlotInfo> {
        let mut inner = self.inner.write().expect("table lock poisoned");
        self.finish_removal_locked(&mut inner, handle)
    }

    pub fn finish_removal_batch(&self, handles: &[Handle]) -> GtmResult<Vec<RemovedSlotInfo>> {
        let mut inner = self.inner.write().expect("table lock poisoned");
        handles
            .iter()
            .map(|&h| self.finish_removal_locked(&mut inner, h))
            .collect()
    }

    fn finish_removal_locked(&self, inner: &mut TableInner, handle: Handle) -> GtmResult<RemovedSlotInfo> {
        let slot = inner
            .slots
            .get_mut(handle.index())
            .filter(|s| s.in_use)
            .ok_or(GtmError::InvalidHandle)?;

        let gxid = slot.gxid;
        let state = slot.state();
        let (created, dropped, altered) = {
            let mutable = slot.mutable.read().expect("slot lock poisoned");
            (
                mutable.created_seqs.clone(),
                mutable.dropped_seqs.clone(),
                mutable.altered_seqs.clone(),
            )
        };

        inner.open_set.remove(handle);
        if gxid.is_normal() && gxid.follows_or_equals(inner.latest_completed_xid) {
            inner.latest_completed_xid = gxid;
        }
        slot.clear();

        Ok(RemovedSlotInfo {
            handle,
            gxid,
            state,
            created_seqs: created,
            dropped_seqs: dropped,
            altered_seqs: altered,
        })
    }

    /// Walks the open-set removing every slot matching `client_id`/
    /// `proxy_conn_id` that is not `PREPARED`/`PREPARE_IN_PROGRESS`
    /// (spec.md §4.3.6). Returns the removed slots' cleanup info.
    pub fn remove_all(&self, client_id: ClientId, proxy_conn_id: ProxyConnId) -> Vec<RemovedSlotInfo> {
        use super::slot::TransactionState;

        let mut inner = self.inner.write().expect("table lock poisoned");
        let candidates: Vec<Handle> = inner
            .open_set
            .iter()
            .filter(|&h| {
                let slot = &inner.slots[h.index()];
                slot.client_id == client_id
                    && proxy_conn_id.matches(slot.proxy_conn_id)
                    && !matches!(
                        slot.state(),
                        TransactionState::Prepared | TransactionState::PrepareInProgress
                    )
            })
            .collect();

        for &h in &candidates {
            inner.slots[h.index()].set_state(TransactionState::AbortInProgress);
        }

        candidates
            .into_iter()
            .filter_map(|h| self.finish_removal_locked(&mut inner, h).ok())
            .collect()
    }
}

/// What cleanup needs after a slot leaves the open-set: the outcome state
/// (to pick which sequence-manager methods to call) and the three
/// sequence-reference lists (to pass to them).
pub struct RemovedSlotInfo {
    pub handle: Handle,
    pub gxid: Gxid,
    pub state: super::slot::TransactionState,
    pub created_seqs: Vec<crate::sequence::SeqRef>,
    pub dropped_seqs: Vec<crate::sequence::SeqRef>,
    pub altered_seqs: Vec<crate::sequence::SeqRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(session: &str) -> NewTxnArgs {
        NewTxnArgs {
            isolation: IsolationLevel::ReadCommitted,
            read_only: false,
            session_id: SessionId::new(session, 64).unwrap(),
            client_id: ClientId::new(1),
            proxy_conn_id: ProxyConnId::NONE,
            is_vacuum: false,
        }
    }

    #[test]
    fn begin_allocates_distinct_handles() {
        let table = SlotTable::new(4);
        let h1 = table.begin(args("")).unwrap();
        let h2 = table.begin(args("")).unwrap();
        assert_ne!(h1.index(), h2.index());
        assert_eq!(table.open_count(), 2);
    }

    #[test]
    fn begin_reuses_session_slot() {
        let table = SlotTable::new(4);
        let h1 = table.begin(args("s1")).unwrap();
        let h2 = table.begin(args("s1")).unwrap();
        assert_eq!(h1.index(), h2.index());
        assert_eq!(table.open_count(), 1);
    }

    #[test]
    fn begin_fails_at_capacity() {
        let table = SlotTable::new(2);
        table.begin(args("a")).unwrap();
        table.begin(args("b")).unwrap();
        let err = table.begin(args("c")).unwrap_err();
        assert!(matches!(err, GtmError::Capacity));
    }

    #[test]
    fn rotating_cursor_reuses_freed_slots() {
        let table = SlotTable::new(2);
        let h1 = table.begin(args("a")).unwrap();
        table.finish_removal(h1).unwrap();
        let h3 = table.begin(args("c")).unwrap();
        assert_eq!(h3.index(), h1.index());
    }

    #[test]
    fn remove_all_skips_prepared_slots() {
        use super::super::slot::TransactionState;

        let table = SlotTable::new(4);
        let h1 = table.begin(args("")).unwrap();
        let h2 = table.begin(args("")).unwrap();
        table.with_slot(h2, |s| s.set_state(TransactionState::Prepared)).unwrap();

        let removed = table.remove_all(ClientId::new(1), ProxyConnId::NONE);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].handle.index(), h1.index());
        assert_eq!(removed[0].state, TransactionState::AbortInProgress);
        assert!(table.with_slot(h2, |_| ()).is_ok());
    }
}
