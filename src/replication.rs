//! Forwards mutations to a warm standby before the client is acknowledged
//! (C6). Modeled as an explicit typed sink with retry, kept outside the
//! registry locks per spec.md §9 ("do not entangle it with the registry
//! locks").

use crate::error::{GtmError, GtmResult};
use crate::gxid::Gxid;
use crate::protocol::{self, BeginEntry, Opcode};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// What dispatch.rs hands the shim after a mutation has already completed
/// locally — not the client's wire request, but what the standby needs to
/// reproduce it. `BeginMulti` carries the GXIDs the master just assigned,
/// since `bkup_begin_transaction_get_gxid_multi` is driven by them
/// (spec.md §4.4), not by the standby allocating its own.
#[derive(Debug, Clone)]
pub enum BackupOp {
    BeginMulti { entries: Vec<BeginEntry>, gxids: Vec<Gxid> },
    Prepare { gxid: Gxid },
    StartPrepared { gxid: Gxid, gid: String, node_list: String },
    Commit { gxid: Gxid, waited: Vec<Gxid> },
    CommitPrepared { gxid: Gxid, prepared_gxid: Gxid, waited: Vec<Gxid> },
    CommitMulti { gxids: Vec<Gxid> },
    Rollback { gxid: Gxid },
    RollbackMulti { gxids: Vec<Gxid> },
}

/// The standby link. Guarded by a `tokio::sync::Mutex` rather than
/// `std::sync::RwLock`, unlike every registry lock: sending to and
/// awaiting an ack from the standby crosses an `.await` point, and the
/// registry locks must never do that (spec.md §5).
struct StandbyLink {
    addr: SocketAddr,
    stream: Option<TcpStream>,
}

impl StandbyLink {
    async fn connect(addr: SocketAddr) -> GtmResult<TcpStream> {
        TcpStream::connect(addr).await.map_err(|_| GtmError::ReplicationUnavailable)
    }

    async fn ensure_connected(&mut self) -> GtmResult<&mut TcpStream> {
        if self.stream.is_none() {
            self.stream = Some(Self::connect(self.addr).await?);
        }
        Ok(self.stream.as_mut().expect("just set"))
    }

    fn drop_connection(&mut self) {
        self.stream = None;
    }
}

/// Replication shim attached to a GTM server. `None` when no standby is
/// configured, in which case every `forward` call is a no-op success.
pub struct ReplicationShim {
    link: Option<Mutex<StandbyLink>>,
    synchronous: bool,
}

impl ReplicationShim {
    #[must_use]
    pub fn new(standby_addr: Option<SocketAddr>, synchronous: bool) -> Self {
        ReplicationShim {
            link: standby_addr.map(|addr| Mutex::new(StandbyLink { addr, stream: None })),
            synchronous,
        }
    }

    #[must_use]
    pub fn has_standby(&self) -> bool {
        self.link.is_some()
    }

    /// Encodes `op` as its `BKUP_*` frame and sends it to the standby,
    /// reconnecting and retrying (bounded) on failure. When
    /// `synchronous_backup` is set and the caller isn't itself a proxy,
    /// also waits for the standby's one-byte ack.
    pub async fn forward(&self, op: &BackupOp, from_proxy: bool) -> GtmResult<()> {
        let Some(link) = &self.link else {
            return Ok(());
        };

        let frame = encode_backup_frame(op);
        let mut link = link.lock().await;

        let mut last_err = None;
        for attempt in 0..MAX_RECONNECT_ATTEMPTS {
            let result: std::io::Result<()> = async {
                let stream = link.ensure_connected().await.map_err(std::io::Error::other)?;
                stream.write_all(&frame).await?;
                stream.flush().await?;
                if self.synchronous && !from_proxy {
                    let mut ack = [0u8; 1];
                    stream.read_exact(&mut ack).await?;
                }
                Ok(())
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "standby send failed, reconnecting");
                    link.drop_connection();
                    last_err = Some(e);
                }
            }
        }

        let _ = last_err;
        if self.synchronous && !from_proxy {
            Err(GtmError::ReplicationUnavailable)
        } else {
            // Best-effort otherwise: the master keeps serving and the next
            // successful forward re-establishes the connection.
            Ok(())
        }
    }
}

fn backup_opcode_for(op: &BackupOp) -> Opcode {
    match op {
        BackupOp::BeginMulti { .. } => Opcode::BkupTxnBeginGetgxidMulti,
        BackupOp::Prepare { .. } => Opcode::BkupTxnPrepare,
        BackupOp::StartPrepared { .. } => Opcode::BkupTxnStartPrepared,
        BackupOp::Commit { .. } => Opcode::BkupTxnCommit,
        BackupOp::CommitPrepared { .. } => Opcode::BkupTxnCommitPrepared,
        BackupOp::CommitMulti { .. } => Opcode::BkupTxnCommitMulti,
        BackupOp::Rollback { .. } => Opcode::BkupTxnRollback,
        BackupOp::RollbackMulti { .. } => Opcode::BkupTxnRollbackMulti,
    }
}

fn encode_backup_frame(op: &BackupOp) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(backup_opcode_for(op) as u8);
    body.put_u8(0); // backup frames never carry a proxy header

    match op {
        BackupOp::BeginMulti { entries, gxids } => {
            body.put_u32(entries.len() as u32);
            for (entry, gxid) in entries.iter().zip(gxids) {
                protocol::encode_begin_entry(&mut body, entry);
                body.put_u32(gxid.raw());
            }
        }
        BackupOp::Prepare { gxid } => body.put_u32(gxid.raw()),
        BackupOp::StartPrepared { gxid, gid, node_list } => {
            body.put_u32(gxid.raw());
            protocol::write_string(&mut body, gid);
            protocol::write_string(&mut body, node_list);
        }
        BackupOp::Commit { gxid, waited } => {
            body.put_u32(gxid.raw());
            body.put_u32(waited.len() as u32);
            for w in waited {
                body.put_u32(w.raw());
            }
        }
        BackupOp::CommitPrepared { gxid, prepared_gxid, waited } => {
            body.put_u32(gxid.raw());
            body.put_u32(prepared_gxid.raw());
            body.put_u32(waited.len() as u32);
            for w in waited {
                body.put_u32(w.raw());
            }
        }
        BackupOp::CommitMulti { gxids } | BackupOp::RollbackMulti { gxids } => {
            body.put_u32(gxids.len() as u32);
            for g in gxids {
                body.put_u32(g.raw());
            }
        }
        BackupOp::Rollback { gxid } => body.put_u32(gxid.raw()),
    }

    let mut framed = BytesMut::new();
    framed.put_u32(body.len() as u32);
    framed.put_slice(&body);
    framed.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forward_without_standby_is_a_noop() {
        let shim = ReplicationShim::new(None, false);
        assert!(!shim.has_standby());
        shim.forward(&BackupOp::Rollback { gxid: Gxid::new(7) }, false).await.unwrap();
    }
}
