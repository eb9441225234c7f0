//! Begin/prepare/commit/abort, single and batched; wait-set enforcement;
//! cleanup-by-client; lookup by GXID/GID/session (C5).

use crate::allocator::IdAllocator;
use crate::control_file::ControlFile;
use crate::error::{GtmError, GtmResult, STATUS_DELAYED, STATUS_ERROR, STATUS_OK};
use crate::gxid::Gxid;
use crate::handle::Handle;
use crate::ids::{ClientId, Gid, ProxyConnId, SessionId};
use crate::registry::slot::TransactionState;
use crate::registry::{IsolationLevel, NewTxnArgs, RemovedSlotInfo, SlotTable};
use crate::sequence::SequenceManager;
use std::sync::Arc;

/// Result of a batched commit/rollback: one status per input handle plus
/// how many slots actually left the open-set.
pub struct BatchResult {
    pub statuses: Vec<i32>,
    pub removed: usize,
}

/// Result of a batched begin. The spec allows partial success within a
/// batch (spec.md §4.3.1: "Allocations that fail raise ERR_CAPACITY; the
/// already-acquired slots remain valid — no rollback of earlier entries
/// in the batch"), so a failure midway keeps every handle allocated so
/// far and reports the error alongside them.
pub struct BeginMultiResult {
    pub handles: Vec<Handle>,
    pub error: Option<GtmError>,
}

pub struct TransactionManager {
    table: SlotTable,
    allocator: IdAllocator,
    sequence_mgr: Arc<dyn SequenceManager>,
    control_file: Arc<dyn ControlFile>,
}

impl TransactionManager {
    #[must_use]
    pub fn new(
        n_max: usize,
        is_standby: bool,
        control_interval: u32,
        sequence_mgr: Arc<dyn SequenceManager>,
        control_file: Arc<dyn ControlFile>,
    ) -> Self {
        TransactionManager {
            table: SlotTable::new(n_max),
            allocator: IdAllocator::new(is_standby, control_interval),
            sequence_mgr,
            control_file,
        }
    }

    #[must_use]
    pub fn allocator(&self) -> &IdAllocator {
        &self.allocator
    }

    #[must_use]
    pub fn table(&self) -> &SlotTable {
        &self.table
    }

    /// Loads `next_xid` from the control file and transitions the
    /// allocator to `RUNNING`. Called once at startup.
    pub fn start(&self) -> GtmResult<()> {
        let xid = self.control_file.load()?;
        self.allocator.set_next(xid)
    }

    // ---- 4.3.1 Begin ----------------------------------------------------

    pub fn begin_multi(&self, entries: Vec<NewTxnArgs>) -> BeginMultiResult {
        let mut handles = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.table.begin(entry) {
                Ok(h) => handles.push(h),
                Err(e) => {
                    return BeginMultiResult { handles, error: Some(e) };
                }
            }
        }
        BeginMultiResult { handles, error: None }
    }

    /// `TXN_BEGIN_GETGXID_MULTI`: allocates a fresh slot for each entry,
    /// then assigns GXIDs to the whole batch as one call into the
    /// allocator so the checkpoint accounting and control-file save see
    /// every handle at once. A capacity failure midway keeps the handles
    /// (and any GXIDs) already assigned, per the same no-rollback rule as
    /// `begin_multi`.
    pub fn begin_get_gxid_multi(&self, entries: Vec<NewTxnArgs>) -> (Vec<Handle>, Vec<Gxid>, Option<GtmError>) {
        let result = self.begin_multi(entries);
        if result.handles.is_empty() {
            return (result.handles, Vec::new(), result.error);
        }
        match self.allocator.allocate(&result.handles, &self.table, self.control_file.as_ref()) {
            Ok(gxids) => (result.handles, gxids, result.error),
            Err(e) => (result.handles, Vec::new(), Some(e)),
        }
    }

    pub fn begin(
        &self,
        isolation: IsolationLevel,
        read_only: bool,
        session_id: SessionId,
        client_id: ClientId,
        proxy_conn_id: ProxyConnId,
    ) -> GtmResult<Handle> {
        self.table.begin(NewTxnArgs {
            isolation,
            read_only,
            session_id,
            client_id,
            proxy_conn_id,
            is_vacuum: false,
        })
    }

    pub fn begin_get_gxid(
        &self,
        isolation: IsolationLevel,
        read_only: bool,
        session_id: SessionId,
        client_id: ClientId,
        proxy_conn_id: ProxyConnId,
    ) -> GtmResult<(Handle, Gxid)> {
        let handle = self.begin(isolation, read_only, session_id, client_id, proxy_conn_id)?;
        let gxids = self.allocator.allocate(&[handle], &self.table, self.control_file.as_ref())?;
        Ok((handle, gxids[0]))
    }

    pub fn begin_autovacuum(&self, isolation: IsolationLevel, read_only: bool) -> GtmResult<(Handle, Gxid)> {
        let handle = self.table.begin(NewTxnArgs {
            isolation,
            read_only,
            session_id: SessionId::empty(),
            client_id: ClientId::new(0),
            proxy_conn_id: ProxyConnId::NONE,
            is_vacuum: true,
        })?;
        let gxids = self.allocator.allocate(&[handle], &self.table, self.control_file.as_ref())?;
        Ok((handle, gxids[0]))
    }

    /// Standby-side begin (`bkup_begin_transaction_get_gxid_multi`): the
    /// GXID is handed down by the master rather than allocated locally.
    pub fn bkup_begin_get_gxid_multi(&self, entries: Vec<(NewTxnArgs, Gxid)>) -> GtmResult<Vec<Handle>> {
        let mut handles = Vec::with_capacity(entries.len());
        for (args, master_gxid) in entries {
            let handle = self.table.begin(args)?;
            self.table.with_slot_mut(handle, |slot| slot.gxid = master_gxid)?;
            self.table.index_gxid(handle, master_gxid);
            self.allocator.observe_master_gxid(master_gxid);
            handles.push(handle);
        }
        Ok(handles)
    }

    // ---- 4.3.2 Prepare (2PC) ---------------------------------------------

    pub fn start_prepared(&self, handle: Handle, gid: Gid, node_list: String) -> GtmResult<()> {
        self.table.bind_gid(handle, gid, node_list)
    }

    pub fn prepare(&self, handle: Handle) -> GtmResult<()> {
        self.table.with_slot(handle, |slot| {
            let mut mutable = slot.mutable.write().expect("slot lock poisoned");
            if mutable.state != TransactionState::PrepareInProgress {
                return Err(GtmError::FatalInvariant(
                    "prepare() called on a slot not in PREPARE_IN_PROGRESS".into(),
                ));
            }
            mutable.state = TransactionState::Prepared;
            Ok(())
        })?
    }

    pub fn get_gid_data(
        &self,
        gid: &Gid,
        isolation: IsolationLevel,
        read_only: bool,
    ) -> GtmResult<(Handle, Gxid, Gxid, Option<String>)> {
        let prepared_handle = self.table.by_gid(gid).ok_or(GtmError::UnknownGid)?;
        let (prepared_gxid, node_list) = self.table.with_slot(prepared_handle, |slot| {
            let mutable = slot.mutable.read().expect("slot lock poisoned");
            (slot.gxid, mutable.node_list.clone())
        })?;

        let new_handle = self.table.begin(NewTxnArgs {
            isolation,
            read_only,
            session_id: SessionId::empty(),
            client_id: ClientId::new(0),
            proxy_conn_id: ProxyConnId::NONE,
            is_vacuum: false,
        })?;
        let new_gxids = self
            .allocator
            .allocate(&[new_handle], &self.table, self.control_file.as_ref())?;

        Ok((new_handle, new_gxids[0], prepared_gxid, node_list))
    }

    // ---- 4.3.3 Commit -----------------------------------------------------

    /// For each handle: `STATUS_ERROR` if invalid, `STATUS_DELAYED` if any
    /// of `waited_xids` is still open (slot untouched, client retries),
    /// else commits and enqueues for removal. Removal happens as one
    /// atomic batch under the table lock; sequence-manager callbacks run
    /// only after that lock is released.
    pub fn commit_multi(&self, handles: &[Handle], waited_xids: &[Gxid]) -> BatchResult {
        let mut statuses = vec![STATUS_ERROR; handles.len()];
        let mut to_remove = Vec::new();

        for (i, &handle) in handles.iter().enumerate() {
            if self.table.with_slot(handle, |_| ()).is_err() {
                continue;
            }
            let delayed = waited_xids.iter().any(|&w| self.table.by_gxid(w).is_some());
            if delayed {
                statuses[i] = STATUS_DELAYED;
                continue;
            }
            let set = self
                .table
                .with_slot(handle, |slot| slot.set_state(TransactionState::CommitInProgress));
            if set.is_err() {
                continue;
            }
            statuses[i] = STATUS_OK;
            to_remove.push(handle);
        }

        let removed = self.finish_batch(&to_remove);
        BatchResult { statuses, removed }
    }

    /// `commit_prepared`: commits `{commit_gxid, prepared_gxid}` as one
    /// atomic two-slot batch. The status of `commit_gxid`'s slot is the
    /// authoritative result for the client.
    pub fn commit_prepared(
        &self,
        commit_handle: Handle,
        prepared_handle: Handle,
        waited_xids: &[Gxid],
    ) -> i32 {
        let result = self.commit_multi(&[commit_handle, prepared_handle], waited_xids);
        result.statuses[0]
    }

    // ---- 4.3.4 Rollback -----------------------------------------------------

    pub fn rollback_multi(&self, handles: &[Handle]) -> BatchResult {
        let mut statuses = vec![STATUS_ERROR; handles.len()];
        let mut to_remove = Vec::new();

        for (i, &handle) in handles.iter().enumerate() {
            let set = self
                .table
                .with_slot(handle, |slot| slot.set_state(TransactionState::AbortInProgress));
            if set.is_err() {
                continue;
            }
            statuses[i] = STATUS_OK;
            to_remove.push(handle);
        }

        let removed = self.finish_batch(&to_remove);
        BatchResult { statuses, removed }
    }

    // ---- 4.3.5 Cleanup (common tail) --------------------------------------

    fn finish_batch(&self, handles: &[Handle]) -> usize {
        let Ok(infos) = self.table.finish_removal_batch(handles) else {
            return 0;
        };
        self.dispatch_cleanup(&infos)
    }

    /// The §4.3.5 tail: dispatched strictly on `state`, shared by every
    /// caller that removes slots (batched commit/rollback and the
    /// disconnect sweep below), so there is exactly one place that decides
    /// which sequence-manager methods a given outcome state calls.
    fn dispatch_cleanup(&self, infos: &[RemovedSlotInfo]) -> usize {
        for info in infos {
            match info.state {
                TransactionState::AbortInProgress => {
                    self.sequence_mgr.drop_sequences(&info.created_seqs);
                    self.sequence_mgr.restore_dropped_sequences(&info.dropped_seqs);
                    self.sequence_mgr.restore_altered_sequences(&info.altered_seqs);
                }
                TransactionState::CommitInProgress => {
                    self.sequence_mgr.commit_dropped_sequences(&info.dropped_seqs);
                    self.sequence_mgr.commit_altered_sequences(&info.altered_seqs);
                }
                _ => {}
            }
        }
        infos.len()
    }

    // ---- 4.3.6 Cleanup-by-client -------------------------------------------

    pub fn remove_all(&self, client_id: ClientId, proxy_conn_id: ProxyConnId) -> usize {
        let infos = self.table.remove_all(client_id, proxy_conn_id);
        self.dispatch_cleanup(&infos)
    }

    #[must_use]
    pub fn get_last_client_id(&self) -> ClientId {
        self.table.last_client_id()
    }

    // ---- Lookups ------------------------------------------------------------

    pub fn gxid_of(&self, handle: Handle) -> GtmResult<Gxid> {
        self.table.with_slot(handle, |slot| slot.gxid)
    }

    #[must_use]
    pub fn handle_by_gxid(&self, gxid: Gxid) -> Option<Handle> {
        self.table.by_gxid(gxid)
    }

    #[must_use]
    pub fn handle_by_gid(&self, gid: &Gid) -> Option<Handle> {
        self.table.by_gid(gid)
    }

    #[must_use]
    pub fn handle_by_session(&self, session: &str) -> Option<Handle> {
        self.table.by_session(session)
    }

    #[must_use]
    pub fn latest_completed_xid(&self) -> Gxid {
        self.table.latest_completed_xid()
    }

    /// The oldest GXID any open (non-vacuum) transaction still needs
    /// visible, i.e. this node's contribution to the cluster-wide xmin.
    /// Falls back to the next GXID to be assigned when nothing is open:
    /// with no open transactions, nothing older than that can still be in
    /// flight.
    #[must_use]
    pub fn global_xmin(&self) -> Gxid {
        self.table.oldest_open_xid().unwrap_or_else(|| self.allocator.read_next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_file::NullControlFile;
    use crate::sequence::NoopSequenceManager;

    fn manager(n_max: usize) -> TransactionManager {
        let mgr = TransactionManager::new(
            n_max,
            false,
            1000,
            Arc::new(NoopSequenceManager),
            Arc::new(NullControlFile),
        );
        mgr.start().unwrap();
        mgr
    }

    fn begin_args(session: &str) -> NewTxnArgs {
        NewTxnArgs {
            isolation: IsolationLevel::ReadCommitted,
            read_only: false,
            session_id: SessionId::new(session, 64).unwrap(),
            client_id: ClientId::new(7),
            proxy_conn_id: ProxyConnId::NONE,
            is_vacuum: false,
        }
    }

    #[test]
    fn scenario_basic_begin_commit() {
        let mgr = manager(16);
        let (h, gxid) = mgr
            .begin_get_gxid(IsolationLevel::ReadCommitted, false, SessionId::new("s1", 64).unwrap(), ClientId::new(1), ProxyConnId::NONE)
            .unwrap();
        assert_eq!(h.index(), 0);
        assert_eq!(gxid, Gxid::FIRST_NORMAL);

        let result = mgr.commit_multi(&[h], &[]);
        assert_eq!(result.statuses, vec![STATUS_OK]);
        assert_eq!(mgr.latest_completed_xid(), Gxid::FIRST_NORMAL);
        assert_eq!(mgr.allocator().read_next(), Gxid::new(4));
    }

    #[test]
    fn scenario_session_reuse_then_fresh_after_commit() {
        let mgr = manager(16);
        let h1 = mgr
            .begin(IsolationLevel::ReadCommitted, false, SessionId::new("s1", 64).unwrap(), ClientId::new(1), ProxyConnId::NONE)
            .unwrap();
        let h2 = mgr
            .begin(IsolationLevel::ReadCommitted, false, SessionId::new("s1", 64).unwrap(), ClientId::new(1), ProxyConnId::NONE)
            .unwrap();
        assert_eq!(h1.index(), h2.index());

        mgr.commit_multi(&[h1], &[]);

        let h3 = mgr
            .begin(IsolationLevel::ReadCommitted, false, SessionId::new("s1", 64).unwrap(), ClientId::new(1), ProxyConnId::NONE)
            .unwrap();
        assert_eq!(h3.index(), h1.index());
    }

    #[test]
    fn scenario_two_phase_commit() {
        let mgr = manager(16);
        let (h0, g0) = mgr
            .begin_get_gxid(IsolationLevel::ReadCommitted, false, SessionId::empty(), ClientId::new(1), ProxyConnId::NONE)
            .unwrap();
        assert_eq!(g0, Gxid::FIRST_NORMAL);

        let gid = Gid::new("tx1", 64).unwrap();
        mgr.start_prepared(h0, gid.clone(), "n1,n2".into()).unwrap();
        mgr.prepare(h0).unwrap();

        let (new_handle, new_gxid, prepared_gxid, node_list) = mgr
            .get_gid_data(&gid, IsolationLevel::ReadCommitted, false)
            .unwrap();
        assert_eq!(prepared_gxid, g0);
        assert_eq!(new_gxid, Gxid::new(4));
        assert_eq!(node_list.as_deref(), Some("n1,n2"));

        let status = mgr.commit_prepared(new_handle, h0, &[]);
        assert_eq!(status, STATUS_OK);
        assert_eq!(mgr.latest_completed_xid(), new_gxid);
        assert!(mgr.gxid_of(h0).is_err());
        assert!(mgr.gxid_of(new_handle).is_err());
    }

    #[test]
    fn scenario_duplicate_gid_rejected() {
        let mgr = manager(16);
        let h0 = mgr.begin(IsolationLevel::ReadCommitted, false, SessionId::empty(), ClientId::new(1), ProxyConnId::NONE).unwrap();
        let h1 = mgr.begin(IsolationLevel::ReadCommitted, false, SessionId::empty(), ClientId::new(1), ProxyConnId::NONE).unwrap();
        let gid = Gid::new("dup", 64).unwrap();
        mgr.start_prepared(h0, gid.clone(), String::new()).unwrap();
        let err = mgr.start_prepared(h1, gid, String::new()).unwrap_err();
        assert!(matches!(err, GtmError::DuplicateGid));
    }

    #[test]
    fn scenario_commit_wait_delay_then_retry() {
        let mgr = manager(16);
        let (h0, g0) = mgr.begin_get_gxid(IsolationLevel::ReadCommitted, false, SessionId::empty(), ClientId::new(1), ProxyConnId::NONE).unwrap();
        let (h1, _g1) = mgr.begin_get_gxid(IsolationLevel::ReadCommitted, false, SessionId::empty(), ClientId::new(1), ProxyConnId::NONE).unwrap();

        let delayed = mgr.commit_multi(&[h1], &[g0]);
        assert_eq!(delayed.statuses, vec![STATUS_DELAYED]);

        let ok = mgr.commit_multi(&[h0], &[]);
        assert_eq!(ok.statuses, vec![STATUS_OK]);

        let retried = mgr.commit_multi(&[h1], &[g0]);
        assert_eq!(retried.statuses, vec![STATUS_OK]);
    }

    #[test]
    fn scenario_remove_all_spares_prepared() {
        let mgr = manager(16);
        let client = ClientId::new(7);
        let h_running = mgr.begin(IsolationLevel::ReadCommitted, false, SessionId::empty(), client, ProxyConnId::NONE).unwrap();
        let h_prepared = mgr.begin(IsolationLevel::ReadCommitted, false, SessionId::empty(), client, ProxyConnId::NONE).unwrap();
        let gid = Gid::new("keep-me", 64).unwrap();
        mgr.start_prepared(h_prepared, gid.clone(), String::new()).unwrap();
        mgr.prepare(h_prepared).unwrap();

        let removed = mgr.remove_all(client, ProxyConnId::NONE);
        assert_eq!(removed, 1);
        assert!(mgr.gxid_of(h_running).is_err());
        assert!(mgr.gxid_of(h_prepared).is_ok());
        assert_eq!(mgr.handle_by_gid(&gid), Some(h_prepared));
    }

    #[test]
    fn begin_multi_keeps_earlier_handles_on_mid_batch_capacity_error() {
        let mgr = manager(2);
        let result = mgr.begin_multi(vec![begin_args("a"), begin_args("b"), begin_args("c")]);
        assert_eq!(result.handles.len(), 2);
        assert!(matches!(result.error, Some(GtmError::Capacity)));
    }
}
