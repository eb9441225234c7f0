//! Per-transaction state (C3).

use crate::gxid::Gxid;
use crate::handle::Handle;
use crate::ids::{ClientId, Gid, ProxyConnId, SessionId};
use crate::sequence::SeqRef;
use std::sync::RwLock;

/// Transaction isolation level, as carried through `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Transaction lifecycle state (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Starting,
    InProgress,
    PrepareInProgress,
    Prepared,
    CommitInProgress,
    AbortInProgress,
    Aborted,
}

/// The fields of a slot that change after allocation, guarded by the
/// slot's own lock (spec.md §5: "write-held only while flipping `state`
/// inside an already-located slot").
#[derive(Debug)]
pub struct SlotMutable {
    pub state: TransactionState,
    pub gid: Option<Gid>,
    pub node_list: Option<String>,
    pub created_seqs: Vec<SeqRef>,
    pub dropped_seqs: Vec<SeqRef>,
    pub altered_seqs: Vec<SeqRef>,
}

impl SlotMutable {
    fn fresh(state: TransactionState) -> Self {
        SlotMutable {
            state,
            gid: None,
            node_list: None,
            created_seqs: Vec::new(),
            dropped_seqs: Vec::new(),
            altered_seqs: Vec::new(),
        }
    }
}

/// A single transaction-table entry.
///
/// `in_use`, `handle` and `gxid` are mutated only under the registry's
/// table lock (invariant I1), never under `mutable`'s own lock, so they
/// live outside it: a lookup can read them without contending with a
/// concurrent `state` flip on an unrelated field.
pub struct TransactionSlot {
    pub in_use: bool,
    pub handle: Handle,
    pub gxid: Gxid,
    pub isolation: IsolationLevel,
    pub read_only: bool,
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub proxy_conn_id: ProxyConnId,
    pub is_vacuum: bool,
    pub mutable: RwLock<SlotMutable>,
}

impl TransactionSlot {
    /// A slot in its initial, unused state.
    pub fn empty(handle: Handle) -> Self {
        TransactionSlot {
            in_use: false,
            handle,
            gxid: Gxid::INVALID,
            isolation: IsolationLevel::ReadCommitted,
            read_only: false,
            session_id: SessionId::empty(),
            client_id: ClientId::new(0),
            proxy_conn_id: ProxyConnId::NONE,
            is_vacuum: false,
            mutable: RwLock::new(SlotMutable::fresh(TransactionState::Starting)),
        }
    }

    /// Re-initializes an already-allocated (but now free) slot for reuse.
    /// Called under the table lock while `in_use` flips false -> true.
    pub fn reinit(
        &mut self,
        isolation: IsolationLevel,
        read_only: bool,
        session_id: SessionId,
        client_id: ClientId,
        proxy_conn_id: ProxyConnId,
        is_vacuum: bool,
    ) {
        self.in_use = true;
        self.gxid = Gxid::INVALID;
        self.isolation = isolation;
        self.read_only = read_only;
        self.session_id = session_id;
        self.client_id = client_id;
        self.proxy_conn_id = proxy_conn_id;
        self.is_vacuum = is_vacuum;
        *self.mutable.write().expect("slot lock poisoned") = SlotMutable::fresh(TransactionState::Starting);
    }

    pub fn state(&self) -> TransactionState {
        self.mutable.read().expect("slot lock poisoned").state
    }

    pub fn set_state(&self, state: TransactionState) {
        self.mutable.write().expect("slot lock poisoned").state = state;
    }

    /// Zero-fills the long-lived string/list buffers and marks the slot
    /// free. Called as the tail of cleanup (spec.md §4.3.5), under the
    /// table lock.
    pub fn clear(&mut self) {
        self.in_use = false;
        self.gxid = Gxid::INVALID;
        self.session_id = SessionId::empty();
        self.client_id = ClientId::new(0);
        self.proxy_conn_id = ProxyConnId::NONE;
        self.is_vacuum = false;
        let mut mutable = self.mutable.write().expect("slot lock poisoned");
        mutable.state = TransactionState::Aborted;
        mutable.gid = None;
        mutable.node_list = None;
        mutable.created_seqs.clear();
        mutable.dropped_seqs.clear();
        mutable.altered_seqs.clear();
    }
}
