//! Monotone GXID counter with wraparound limits and periodic checkpoints
//! (C4).

use crate::control_file::ControlFile;
use crate::error::{GtmError, GtmResult};
use crate::gxid::Gxid;
use crate::handle::Handle;
use crate::registry::SlotTable;
use std::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    ShuttingDown,
}

struct IdGenState {
    process_state: ProcessState,
    next_xid: Gxid,
    oldest_xid: Gxid,
    vac_limit: Option<Gxid>,
    warn_limit: Gxid,
    stop_limit: Gxid,
    control_xid: Gxid,
    backed_up_xid: Gxid,
    allocated_since_checkpoint: u32,
}

/// Tunable wraparound thresholds. The source leaves their derivation from
/// `oldest_xid` unspecified (it's autovacuum's job, out of scope here); the
/// crate exposes them as directly settable so an operator or maintenance
/// task can update them as `oldest_xid` advances.
#[derive(Debug, Clone, Copy)]
pub struct WraparoundLimits {
    pub vac_limit: Option<Gxid>,
    pub warn_limit: Gxid,
    pub stop_limit: Gxid,
}

impl Default for WraparoundLimits {
    fn default() -> Self {
        WraparoundLimits {
            vac_limit: None,
            warn_limit: Gxid::new(u32::MAX),
            stop_limit: Gxid::new(u32::MAX),
        }
    }
}

/// The monotone counter plus the node's process state. `is_standby`
/// distinguishes a warm-standby node, which must never allocate its own
/// GXIDs (it receives them from the master via the `bkup_*` opcodes
/// instead).
pub struct IdAllocator {
    is_standby: bool,
    control_interval: u32,
    state: RwLock<IdGenState>,
    /// Serializes `control_file.save` calls and remembers the last xid
    /// actually persisted. `allocate` decides a checkpoint's xid under
    /// `state`'s write lock, but must release that lock before the
    /// filesystem call; without this, two concurrent checkpoints could
    /// reach `save` out of order and leave the file holding the older
    /// of the two, understating `next_xid` on recovery and risking GXID
    /// reuse.
    last_saved: Mutex<Gxid>,
}

impl IdAllocator {
    #[must_use]
    pub fn new(is_standby: bool, control_interval: u32) -> Self {
        IdAllocator {
            is_standby,
            control_interval,
            state: RwLock::new(IdGenState {
                process_state: ProcessState::Starting,
                next_xid: Gxid::FIRST_NORMAL,
                oldest_xid: Gxid::FIRST_NORMAL,
                vac_limit: None,
                warn_limit: Gxid::new(u32::MAX),
                stop_limit: Gxid::new(u32::MAX),
                control_xid: Gxid::FIRST_NORMAL,
                backed_up_xid: Gxid::INVALID,
                allocated_since_checkpoint: 0,
            }),
            last_saved: Mutex::new(Gxid::FIRST_NORMAL),
        }
    }

    /// Pure observation: the next GXID that will be handed out.
    #[must_use]
    pub fn read_next(&self) -> Gxid {
        self.state.read().expect("id-gen lock poisoned").next_xid
    }

    /// Only callable while the allocator is `STARTING` (i.e. at boot,
    /// after loading the control file).
    pub fn set_next(&self, g: Gxid) -> GtmResult<()> {
        let mut state = self.state.write().expect("id-gen lock poisoned");
        if state.process_state != ProcessState::Starting {
            return Err(GtmError::FatalInvariant(
                "set_next called outside STARTING".into(),
            ));
        }
        state.next_xid = g;
        state.control_xid = g;
        state.process_state = ProcessState::Running;
        Ok(())
    }

    pub fn set_shutting_down(&self) {
        let mut state = self.state.write().expect("id-gen lock poisoned");
        state.process_state = ProcessState::ShuttingDown;
    }

    pub fn set_wraparound_limits(&self, limits: WraparoundLimits) {
        let mut state = self.state.write().expect("id-gen lock poisoned");
        state.vac_limit = limits.vac_limit;
        state.warn_limit = limits.warn_limit;
        state.stop_limit = limits.stop_limit;
    }

    pub fn update_oldest_xid(&self, oldest: Gxid) {
        let mut state = self.state.write().expect("id-gen lock poisoned");
        state.oldest_xid = oldest;
    }

    /// True once the backed-up GXID has fallen behind `next_xid`, signaling
    /// the replication shim should push a restore-point hint to the
    /// standby.
    #[must_use]
    pub fn needs_restore_update(&self) -> bool {
        let state = self.state.read().expect("id-gen lock poisoned");
        state.backed_up_xid.precedes_or_equals(state.next_xid)
    }

    pub fn mark_backed_up(&self, xid: Gxid) {
        let mut state = self.state.write().expect("id-gen lock poisoned");
        state.backed_up_xid = xid;
    }

    fn check_wraparound(state: &IdGenState, xid: Gxid) -> GtmResult<()> {
        let Some(vac_limit) = state.vac_limit else {
            return Ok(());
        };
        if xid.follows_or_equals(vac_limit) {
            if xid.follows_or_equals(state.stop_limit) {
                tracing::error!(xid = %xid, stop_limit = %state.stop_limit, "transaction id wraparound stop limit reached");
                return Err(GtmError::WraparoundStop);
            }
            if xid.follows_or_equals(state.warn_limit) {
                let remaining = xid.distance_to(state.stop_limit);
                tracing::warn!(xid = %xid, remaining, "approaching transaction id wraparound stop limit");
            }
        }
        Ok(())
    }

    /// Assigns a GXID to every handle in `handles` whose slot doesn't
    /// already have one, advancing `next_xid` past the reserved range for
    /// each fresh assignment. Returns one GXID per input handle, in order.
    pub fn allocate(
        &self,
        handles: &[Handle],
        table: &SlotTable,
        control_file: &dyn ControlFile,
    ) -> GtmResult<Vec<Gxid>> {
        if self.is_standby {
            return Err(GtmError::StandbyMode);
        }

        let mut checkpoint: Option<Gxid> = None;
        let mut out = Vec::with_capacity(handles.len());

        {
            let mut state = self.state.write().expect("id-gen lock poisoned");
            if state.process_state == ProcessState::ShuttingDown {
                return Err(GtmError::ShuttingDown);
            }
            if state.process_state != ProcessState::Running {
                return Err(GtmError::FatalInvariant("allocate called before RUNNING".into()));
            }

            for &handle in handles {
                let existing = table.with_slot(handle, |slot| slot.gxid)?;
                if existing.is_valid() {
                    out.push(existing);
                    continue;
                }

                let xid = state.next_xid;
                Self::check_wraparound(&state, xid)?;
                state.next_xid = xid.next();

                table.with_slot_mut(handle, |slot| slot.gxid = xid)?;
                table.index_gxid(handle, xid);
                out.push(xid);

                state.allocated_since_checkpoint += 1;
                let wrapped = xid.precedes(state.control_xid);
                if state.allocated_since_checkpoint >= self.control_interval || wrapped {
                    state.control_xid = xid;
                    state.allocated_since_checkpoint = 0;
                    checkpoint = Some(xid);
                }
            }
        }

        if let Some(xid) = checkpoint {
            let mut last_saved = self.last_saved.lock().expect("checkpoint lock poisoned");
            // `checkpoint` values are handed out in increasing order (each
            // is read from `state.next_xid` under the write lock above),
            // but two callers can still race to get here; holding this
            // lock across the write keeps the file's contents in the same
            // order the checkpoints were decided, and the explicit
            // `precedes` check drops a checkpoint that lost that race
            // instead of writing a stale xid over a newer one.
            if last_saved.precedes(xid) {
                control_file.save(xid)?;
                *last_saved = xid;
            }
        }

        Ok(out)
    }

    /// Standby-side begin: the GXID comes from the master rather than
    /// being allocated locally. Advances `next_xid` to stay ahead of it,
    /// skipping the reserved range on wrap, but never moves it backwards.
    pub fn observe_master_gxid(&self, gxid: Gxid) {
        let mut state = self.state.write().expect("id-gen lock poisoned");
        let candidate = gxid.next();
        if state.next_xid.precedes(candidate) {
            state.next_xid = candidate;
        }
    }

    #[must_use]
    pub fn is_standby(&self) -> bool {
        self.is_standby
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_file::NullControlFile;
    use crate::registry::NewTxnArgs;
    use crate::registry::{IsolationLevel, SlotTable};
    use crate::ids::{ClientId, ProxyConnId, SessionId};

    fn new_table_and_handle(table: &SlotTable) -> Handle {
        table
            .begin(NewTxnArgs {
                isolation: IsolationLevel::ReadCommitted,
                read_only: false,
                session_id: SessionId::empty(),
                client_id: ClientId::new(1),
                proxy_conn_id: ProxyConnId::NONE,
                is_vacuum: false,
            })
            .unwrap()
    }

    #[test]
    fn allocate_skips_reserved_and_advances() {
        let alloc = IdAllocator::new(false, 1000);
        alloc.set_next(Gxid::FIRST_NORMAL).unwrap();
        let table = SlotTable::new(8);
        let cf = NullControlFile;

        let h = new_table_and_handle(&table);
        let gxids = alloc.allocate(&[h], &table, &cf).unwrap();
        assert_eq!(gxids[0], Gxid::FIRST_NORMAL);
        assert_eq!(alloc.read_next(), Gxid::new(4));
    }

    #[test]
    fn allocate_is_idempotent_for_already_assigned_slot() {
        let alloc = IdAllocator::new(false, 1000);
        alloc.set_next(Gxid::FIRST_NORMAL).unwrap();
        let table = SlotTable::new(8);
        let cf = NullControlFile;
        let h = new_table_and_handle(&table);

        let first = alloc.allocate(&[h], &table, &cf).unwrap();
        let second = alloc.allocate(&[h], &table, &cf).unwrap();
        assert_eq!(first, second);
        assert_eq!(alloc.read_next(), Gxid::new(4));
    }

    #[test]
    fn wraparound_warns_then_stops() {
        let alloc = IdAllocator::new(false, 1000);
        alloc.set_next(Gxid::new(10)).unwrap();
        alloc.set_wraparound_limits(WraparoundLimits {
            vac_limit: Some(Gxid::new(10)),
            warn_limit: Gxid::new(10),
            stop_limit: Gxid::new(20),
        });
        let table = SlotTable::new(8);
        let cf = NullControlFile;

        let h = new_table_and_handle(&table);
        assert!(alloc.allocate(&[h], &table, &cf).is_ok());

        let alloc2 = IdAllocator::new(false, 1000);
        alloc2.set_next(Gxid::new(20)).unwrap();
        alloc2.set_wraparound_limits(WraparoundLimits {
            vac_limit: Some(Gxid::new(10)),
            warn_limit: Gxid::new(10),
            stop_limit: Gxid::new(20),
        });
        let table2 = SlotTable::new(8);
        let h2 = new_table_and_handle(&table2);
        let err = alloc2.allocate(&[h2], &table2, &cf).unwrap_err();
        assert!(matches!(err, GtmError::WraparoundStop));
    }

    #[test]
    fn standby_allocate_is_rejected() {
        let alloc = IdAllocator::new(true, 1000);
        let table = SlotTable::new(8);
        let cf = NullControlFile;
        let h = new_table_and_handle(&table);
        let err = alloc.allocate(&[h], &table, &cf).unwrap_err();
        assert!(matches!(err, GtmError::StandbyMode));
    }

    /// A stale `save` call (as if it lost a race against a later
    /// checkpoint) must not overwrite the newer value already recorded.
    #[test]
    fn checkpoint_drops_a_save_older_than_the_last_one_recorded() {
        use std::sync::Mutex as StdMutex;

        struct RecordingControlFile {
            saved: StdMutex<Vec<Gxid>>,
        }

        impl ControlFile for RecordingControlFile {
            fn load(&self) -> GtmResult<Gxid> {
                Ok(Gxid::FIRST_NORMAL)
            }
            fn save(&self, xid: Gxid) -> GtmResult<()> {
                self.saved.lock().unwrap().push(xid);
                Ok(())
            }
        }

        let alloc = IdAllocator::new(false, 1);
        alloc.set_next(Gxid::FIRST_NORMAL).unwrap();
        let table = SlotTable::new(8);
        let cf = RecordingControlFile { saved: StdMutex::new(Vec::new()) };

        for _ in 0..3 {
            let h = new_table_and_handle(&table);
            alloc.allocate(&[h], &table, &cf).unwrap();
        }

        let saved = cf.saved.lock().unwrap();
        assert!(saved.windows(2).all(|w| w[0].precedes(w[1])));
    }
}
