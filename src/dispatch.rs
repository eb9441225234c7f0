//! One handler per opcode: parse -> act in the transaction manager ->
//! replicate -> respond (C7). `BKUP_*` requests act locally and never
//! forward further or produce a client reply (spec.md §4.4).

use crate::error::GtmError;
use crate::gxid::Gxid;
use crate::handle::Handle;
use crate::ids::{ClientId, Gid, ProxyConnId, SessionId};
use crate::manager::TransactionManager;
use crate::protocol::{BeginEntry, Opcode, Request, Response};
use crate::registry::NewTxnArgs;
use crate::replication::{BackupOp, ReplicationShim};
use std::sync::Arc;

pub struct Dispatcher {
    manager: Arc<TransactionManager>,
    replication: Arc<ReplicationShim>,
    gid_max: usize,
    sid_max: usize,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        manager: Arc<TransactionManager>,
        replication: Arc<ReplicationShim>,
        gid_max: usize,
        sid_max: usize,
    ) -> Self {
        Dispatcher { manager, replication, gid_max, sid_max }
    }

    #[must_use]
    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Cleanup triggered by connection teardown (spec.md §4.3.6). Not a
    /// wire opcode: the server's accept loop calls this when a
    /// connection's read side returns EOF or errors out.
    pub fn on_disconnect(&self, client_id: ClientId, proxy_conn_id: ProxyConnId) -> usize {
        self.manager.remove_all(client_id, proxy_conn_id)
    }

    pub async fn handle(
        &self,
        opcode: Opcode,
        proxy_conn_id: Option<ProxyConnId>,
        connection_client_id: ClientId,
        request: Request,
    ) -> Response {
        match self.handle_inner(connection_client_id, request, proxy_conn_id).await {
            Ok(response) => response,
            Err(e) => Response::Error { code: e.status_code(), message: e.to_string() },
        }
    }

    async fn handle_inner(
        &self,
        connection_client_id: ClientId,
        request: Request,
        proxy_conn_id: Option<ProxyConnId>,
    ) -> Result<Response, GtmError> {
        let from_proxy = proxy_conn_id.is_some();
        let proxy_conn_id = proxy_conn_id.unwrap_or(ProxyConnId::NONE);
        let now = now_ts();

        match request {
            Request::Begin { isolation, read_only, session_id } => {
                let handle = self.manager.begin(
                    isolation,
                    read_only,
                    self.session_id(&session_id)?,
                    connection_client_id,
                    proxy_conn_id,
                )?;
                Ok(Response::Handle { handle, timestamp: now })
            }

            Request::BeginGetgxid { isolation, read_only, session_id } => {
                let (handle, gxid) = self.manager.begin_get_gxid(
                    isolation,
                    read_only,
                    self.session_id(&session_id)?,
                    connection_client_id,
                    proxy_conn_id,
                )?;
                let entry = BeginEntry {
                    isolation,
                    read_only,
                    session_id,
                    client_id: connection_client_id,
                    proxy_conn_id,
                };
                self.replication
                    .forward(&BackupOp::BeginMulti { entries: vec![entry], gxids: vec![gxid] }, from_proxy)
                    .await?;
                Ok(Response::Gxid { gxid, timestamp: now })
            }

            Request::BeginGetgxidAutovacuum { isolation, read_only } => {
                let (_handle, gxid) = self.manager.begin_autovacuum(isolation, read_only)?;
                // Autovacuum transactions never originate from a proxied client
                // connection, so there is no backend to scope cleanup to.
                let entry = BeginEntry {
                    isolation,
                    read_only,
                    session_id: String::new(),
                    client_id: ClientId::new(0),
                    proxy_conn_id: ProxyConnId::NONE,
                };
                self.replication
                    .forward(&BackupOp::BeginMulti { entries: vec![entry], gxids: vec![gxid] }, from_proxy)
                    .await?;
                Ok(Response::GxidOnly { gxid })
            }

            Request::BeginGetgxidMulti { entries } => {
                let mut args = Vec::with_capacity(entries.len());
                for entry in &entries {
                    args.push(NewTxnArgs {
                        isolation: entry.isolation,
                        read_only: entry.read_only,
                        session_id: self.session_id(&entry.session_id)?,
                        client_id: entry.client_id,
                        proxy_conn_id: entry.proxy_conn_id,
                        is_vacuum: false,
                    });
                }
                let (_handles, gxids, error) = self.manager.begin_get_gxid_multi(args);
                if let Some(err) = error {
                    return Err(err);
                }
                self.replication
                    .forward(&BackupOp::BeginMulti { entries, gxids: gxids.clone() }, from_proxy)
                    .await?;
                Ok(Response::GxidMulti { gxids, timestamp: now })
            }

            Request::Prepare { gxid } => {
                let handle = self.handle_of(gxid)?;
                self.manager.prepare(handle)?;
                self.replication.forward(&BackupOp::Prepare { gxid }, from_proxy).await?;
                Ok(Response::GxidOnly { gxid })
            }

            Request::StartPrepared { gxid, gid: gid_raw, node_list } => {
                let handle = self.handle_of(gxid)?;
                let gid = Gid::new(gid_raw.clone(), self.gid_max)?;
                self.manager.start_prepared(handle, gid, node_list.clone())?;
                self.replication
                    .forward(&BackupOp::StartPrepared { gxid, gid: gid_raw, node_list }, from_proxy)
                    .await?;
                Ok(Response::GxidOnly { gxid })
            }

            Request::Commit { gxid, waited } => {
                let handle = self.handle_of(gxid)?;
                let result = self.manager.commit_multi(&[handle], &waited);
                self.replication.forward(&BackupOp::Commit { gxid, waited }, from_proxy).await?;
                Ok(Response::GxidStatus { gxid, status: result.statuses[0] })
            }

            Request::CommitPrepared { gxid, prepared_gxid, waited } => {
                let commit_handle = self.handle_of(gxid)?;
                let prepared_handle = self.handle_of(prepared_gxid)?;
                let status = self.manager.commit_prepared(commit_handle, prepared_handle, &waited);
                self.replication
                    .forward(&BackupOp::CommitPrepared { gxid, prepared_gxid, waited }, from_proxy)
                    .await?;
                Ok(Response::GxidStatus { gxid, status })
            }

            Request::CommitMulti { gxids } => {
                let handles = gxids.iter().map(|&g| self.handle_of(g)).collect::<Result<Vec<_>, _>>()?;
                let result = self.manager.commit_multi(&handles, &[]);
                self.replication.forward(&BackupOp::CommitMulti { gxids }, from_proxy).await?;
                Ok(Response::StatusMulti { statuses: result.statuses })
            }

            Request::Rollback { gxid } => {
                let handle = self.handle_of(gxid)?;
                let result = self.manager.rollback_multi(&[handle]);
                self.replication.forward(&BackupOp::Rollback { gxid }, from_proxy).await?;
                Ok(Response::GxidStatus { gxid, status: result.statuses[0] })
            }

            Request::RollbackMulti { gxids } => {
                let handles = gxids.iter().map(|&g| self.handle_of(g)).collect::<Result<Vec<_>, _>>()?;
                let result = self.manager.rollback_multi(&handles);
                self.replication.forward(&BackupOp::RollbackMulti { gxids }, from_proxy).await?;
                Ok(Response::StatusMulti { statuses: result.statuses })
            }

            Request::GetGidData { isolation, read_only, gid } => {
                let gid = Gid::new(gid, self.gid_max)?;
                let (_handle, new_gxid, prepared_gxid, node_list) =
                    self.manager.get_gid_data(&gid, isolation, read_only)?;
                Ok(Response::GidData { new_gxid, prepared_gxid, node_list })
            }

            Request::GetGxid { handle } => {
                let gxid = self.manager.gxid_of(handle)?;
                Ok(Response::HandleGxid { handle, gxid })
            }

            Request::GetNextGxid => Ok(Response::NextGxid { gxid: self.manager.allocator().read_next() }),

            Request::GxidList => {
                let gxids = (0..self.manager.table().capacity())
                    .map(Handle::from_index)
                    .filter_map(|h| self.manager.gxid_of(h).ok())
                    .filter(|g| g.is_valid())
                    .collect();
                Ok(Response::GxidList { gxids })
            }

            // The reported gxid is the caller's own xmin contribution, not
            // an echo target; the node-wide answer comes from the open-set
            // (spec.md's snapshot/xmin tracker is an external consumer, but
            // this node can still report its own oldest-open-xid honestly
            // rather than bouncing the request back unchanged).
            Request::ReportXmin { .. } => Ok(Response::Xmin {
                latest_completed: self.manager.latest_completed_xid(),
                global_xmin: self.manager.global_xmin(),
                errcode: 0,
            }),

            // ---- BKUP_* : local application only, no further forwarding, no reply ----
            Request::BkupBeginGetgxidMulti { entries, master_gxids } => {
                let args = entries
                    .into_iter()
                    .zip(master_gxids)
                    .map(|(entry, gxid)| -> Result<_, GtmError> {
                        Ok((
                            NewTxnArgs {
                                isolation: entry.isolation,
                                read_only: entry.read_only,
                                session_id: self.session_id(&entry.session_id)?,
                                client_id: entry.client_id,
                                proxy_conn_id: entry.proxy_conn_id,
                                is_vacuum: false,
                            },
                            gxid,
                        ))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.manager.bkup_begin_get_gxid_multi(args)?;
                Ok(Response::NoReply)
            }
            Request::BkupPrepare { gxid } => {
                let handle = self.handle_of(gxid)?;
                self.manager.prepare(handle)?;
                Ok(Response::NoReply)
            }
            Request::BkupStartPrepared { gxid, gid, node_list } => {
                let handle = self.handle_of(gxid)?;
                let gid = Gid::new(gid, self.gid_max)?;
                self.manager.start_prepared(handle, gid, node_list)?;
                Ok(Response::NoReply)
            }
            Request::BkupCommit { gxid, waited } => {
                let handle = self.handle_of(gxid)?;
                self.manager.commit_multi(&[handle], &waited);
                Ok(Response::NoReply)
            }
            Request::BkupCommitPrepared { gxid, prepared_gxid, waited } => {
                let commit_handle = self.handle_of(gxid)?;
                let prepared_handle = self.handle_of(prepared_gxid)?;
                self.manager.commit_prepared(commit_handle, prepared_handle, &waited);
                Ok(Response::NoReply)
            }
            Request::BkupCommitMulti { gxids } => {
                let handles = gxids.iter().map(|&g| self.handle_of(g)).collect::<Result<Vec<_>, _>>()?;
                self.manager.commit_multi(&handles, &[]);
                Ok(Response::NoReply)
            }
            Request::BkupRollback { gxid } => {
                let handle = self.handle_of(gxid)?;
                self.manager.rollback_multi(&[handle]);
                Ok(Response::NoReply)
            }
            Request::BkupRollbackMulti { gxids } => {
                let handles = gxids.iter().map(|&g| self.handle_of(g)).collect::<Result<Vec<_>, _>>()?;
                self.manager.rollback_multi(&handles);
                Ok(Response::NoReply)
            }
        }
    }

    fn session_id(&self, raw: &str) -> Result<SessionId, GtmError> {
        SessionId::new(raw, self.sid_max)
    }

    fn handle_of(&self, gxid: Gxid) -> Result<Handle, GtmError> {
        self.manager.handle_by_gxid(gxid).ok_or(GtmError::UnknownGxid)
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
