//! Wire opcodes and the typed request/response contract dispatch operates
//! on (C7's input side). Byte-level framing is, per spec.md §1, an
//! external collaborator ("a typed request/response stream over a
//! byte-oriented connection") — the GTM core only needs the parsed
//! `Request`/`Response` values. The codec at the bottom of this file is a
//! concrete instantiation of that collaborator, analogous to
//! `NoopSequenceManager` standing in for the sequence manager: good
//! enough to make `gtmd` a runnable binary, not part of the core's
//! contract.

use crate::gxid::Gxid;
use crate::handle::Handle;
use crate::ids::{ClientId, ProxyConnId};
use crate::registry::IsolationLevel;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    TxnBegin = 1,
    TxnBeginGetgxid = 2,
    TxnBeginGetgxidAutovacuum = 3,
    TxnBeginGetgxidMulti = 4,
    TxnPrepare = 5,
    TxnStartPrepared = 6,
    TxnCommit = 7,
    TxnCommitPrepared = 8,
    TxnCommitMulti = 9,
    TxnRollback = 10,
    TxnRollbackMulti = 11,
    TxnGetGidData = 12,
    TxnGetGxid = 13,
    TxnGetNextGxid = 14,
    TxnGxidList = 15,
    ReportXmin = 16,
    BkupTxnBeginGetgxidMulti = 104,
    BkupTxnPrepare = 105,
    BkupTxnStartPrepared = 106,
    BkupTxnCommit = 107,
    BkupTxnCommitPrepared = 108,
    BkupTxnCommitMulti = 109,
    BkupTxnRollback = 110,
    BkupTxnRollbackMulti = 111,
}

impl Opcode {
    #[must_use]
    pub const fn is_backup(self) -> bool {
        (self as u8) >= 100
    }

    pub fn from_u8(raw: u8) -> io::Result<Self> {
        use Opcode::*;
        Ok(match raw {
            1 => TxnBegin,
            2 => TxnBeginGetgxid,
            3 => TxnBeginGetgxidAutovacuum,
            4 => TxnBeginGetgxidMulti,
            5 => TxnPrepare,
            6 => TxnStartPrepared,
            7 => TxnCommit,
            8 => TxnCommitPrepared,
            9 => TxnCommitMulti,
            10 => TxnRollback,
            11 => TxnRollbackMulti,
            12 => TxnGetGidData,
            13 => TxnGetGxid,
            14 => TxnGetNextGxid,
            15 => TxnGxidList,
            16 => ReportXmin,
            104 => BkupTxnBeginGetgxidMulti,
            105 => BkupTxnPrepare,
            106 => BkupTxnStartPrepared,
            107 => BkupTxnCommit,
            108 => BkupTxnCommitPrepared,
            109 => BkupTxnCommitMulti,
            110 => BkupTxnRollback,
            111 => BkupTxnRollbackMulti,
            other => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown opcode {other}"))),
        })
    }
}

/// One entry of a `TXN_BEGIN_GETGXID_MULTI` batch.
#[derive(Debug, Clone)]
pub struct BeginEntry {
    pub isolation: IsolationLevel,
    pub read_only: bool,
    pub session_id: String,
    pub client_id: ClientId,
    pub proxy_conn_id: ProxyConnId,
}

#[derive(Debug, Clone)]
pub enum Request {
    Begin { isolation: IsolationLevel, read_only: bool, session_id: String },
    BeginGetgxid { isolation: IsolationLevel, read_only: bool, session_id: String },
    BeginGetgxidAutovacuum { isolation: IsolationLevel, read_only: bool },
    BeginGetgxidMulti { entries: Vec<BeginEntry> },
    Prepare { gxid: Gxid },
    StartPrepared { gxid: Gxid, gid: String, node_list: String },
    Commit { gxid: Gxid, waited: Vec<Gxid> },
    CommitPrepared { gxid: Gxid, prepared_gxid: Gxid, waited: Vec<Gxid> },
    CommitMulti { gxids: Vec<Gxid> },
    Rollback { gxid: Gxid },
    RollbackMulti { gxids: Vec<Gxid> },
    GetGidData { isolation: IsolationLevel, read_only: bool, gid: String },
    GetGxid { handle: Handle },
    GetNextGxid,
    GxidList,
    ReportXmin { gxid: Gxid, node_type: String, node_name: String },
    BkupBeginGetgxidMulti { entries: Vec<BeginEntry>, master_gxids: Vec<Gxid> },
    BkupPrepare { gxid: Gxid },
    BkupStartPrepared { gxid: Gxid, gid: String, node_list: String },
    BkupCommit { gxid: Gxid, waited: Vec<Gxid> },
    BkupCommitPrepared { gxid: Gxid, prepared_gxid: Gxid, waited: Vec<Gxid> },
    BkupCommitMulti { gxids: Vec<Gxid> },
    BkupRollback { gxid: Gxid },
    BkupRollbackMulti { gxids: Vec<Gxid> },
}

#[derive(Debug, Clone)]
pub enum Response {
    Handle { handle: Handle, timestamp: i64 },
    Gxid { gxid: Gxid, timestamp: i64 },
    GxidOnly { gxid: Gxid },
    GxidMulti { gxids: Vec<Gxid>, timestamp: i64 },
    GxidStatus { gxid: Gxid, status: i32 },
    StatusMulti { statuses: Vec<i32> },
    GidData { new_gxid: Gxid, prepared_gxid: Gxid, node_list: Option<String> },
    HandleGxid { handle: Handle, gxid: Gxid },
    NextGxid { gxid: Gxid },
    GxidList { gxids: Vec<Gxid> },
    Xmin { latest_completed: Gxid, global_xmin: Gxid, errcode: i32 },
    Error { code: i32, message: String },
    /// A `BKUP_*` request never produces a body on the wire.
    NoReply,
}

// ---- codec ------------------------------------------------------------

/// A truncated or malformed frame body must fail cleanly, never panic:
/// `bytes::Buf`'s `get_*` methods panic on underflow, and a panic inside
/// `read_request` would unwind the per-connection task in `server.rs`
/// before `on_disconnect` runs, leaking that client's slots.
fn frame_underflow() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "truncated frame body")
}

fn take_u8(buf: &mut impl Buf) -> io::Result<u8> {
    if buf.remaining() < 1 {
        return Err(frame_underflow());
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut impl Buf) -> io::Result<u32> {
    if buf.remaining() < 4 {
        return Err(frame_underflow());
    }
    Ok(buf.get_u32())
}

fn take_i32(buf: &mut impl Buf) -> io::Result<i32> {
    if buf.remaining() < 4 {
        return Err(frame_underflow());
    }
    Ok(buf.get_i32())
}

fn take_i64(buf: &mut impl Buf) -> io::Result<i64> {
    if buf.remaining() < 8 {
        return Err(frame_underflow());
    }
    Ok(buf.get_i64())
}

/// Rejects a declared element count before looping over it: a huge count
/// paired with a short buffer would otherwise either panic deep inside the
/// loop (via the checked reads above) after doing pointless work, or, for
/// `Vec::with_capacity`-style callers, try to reserve memory sized off an
/// attacker-controlled number. `min_elem_size` is a lower bound on what
/// every element actually costs on the wire.
fn check_count(n: u32, buf: &impl Buf, min_elem_size: usize) -> io::Result<()> {
    if (n as usize).saturating_mul(min_elem_size) > buf.remaining() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "declared count exceeds remaining frame bytes"));
    }
    Ok(())
}

fn read_string(buf: &mut impl Buf, max_len: usize) -> io::Result<String> {
    let len = take_u32(buf)? as usize;
    if len > max_len || buf.remaining() < len {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "string length out of bounds"));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub(crate) fn write_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn read_isolation(raw: u8) -> io::Result<IsolationLevel> {
    match raw {
        0 => Ok(IsolationLevel::ReadCommitted),
        1 => Ok(IsolationLevel::RepeatableRead),
        2 => Ok(IsolationLevel::Serializable),
        other => Err(io::Error::new(io::ErrorKind::InvalidData, format!("invalid isolation level {other}"))),
    }
}

fn write_isolation(buf: &mut BytesMut, isolation: IsolationLevel) {
    buf.put_u8(match isolation {
        IsolationLevel::ReadCommitted => 0,
        IsolationLevel::RepeatableRead => 1,
        IsolationLevel::Serializable => 2,
    });
}

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Reads one length-prefixed frame (`u32` byte length, then the frame
/// body) and decodes it into `(opcode, proxy_conn_id, request)`.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<(Opcode, Option<ProxyConnId>, Request)> {
    let len = reader.read_u32().await?;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame length out of bounds"));
    }
    let mut raw = vec![0u8; len as usize];
    reader.read_exact(&mut raw).await?;
    let mut buf = BytesMut::from(&raw[..]);

    let opcode = Opcode::from_u8(take_u8(&mut buf)?)?;
    let has_proxy = take_u8(&mut buf)? != 0;
    let proxy_conn_id = if has_proxy { Some(ProxyConnId::new(take_i32(&mut buf)?)) } else { None };

    let request = decode_body(opcode, &mut buf, usize::MAX)?;
    Ok((opcode, proxy_conn_id, request))
}

/// A begin entry's fixed-width prefix before its variable-length session
/// id: 1 (isolation) + 1 (read_only) + 4 (session string length) + 4
/// (client id) + 4 (proxy conn id).
const BEGIN_ENTRY_MIN_SIZE: usize = 14;

fn decode_begin_entry(buf: &mut impl Buf, sid_max: usize) -> io::Result<BeginEntry> {
    let isolation = read_isolation(take_u8(buf)?)?;
    let read_only = take_u8(buf)? != 0;
    let session_id = read_string(buf, sid_max)?;
    let client_id = ClientId::new(take_u32(buf)?);
    let proxy_conn_id = ProxyConnId::new(take_i32(buf)?);
    Ok(BeginEntry { isolation, read_only, session_id, client_id, proxy_conn_id })
}

fn decode_body(opcode: Opcode, buf: &mut BytesMut, sid_max: usize) -> io::Result<Request> {
    Ok(match opcode {
        Opcode::TxnBegin => Request::Begin {
            isolation: read_isolation(take_u8(buf)?)?,
            read_only: take_u8(buf)? != 0,
            session_id: read_string(buf, sid_max)?,
        },
        Opcode::TxnBeginGetgxid => Request::BeginGetgxid {
            isolation: read_isolation(take_u8(buf)?)?,
            read_only: take_u8(buf)? != 0,
            session_id: read_string(buf, sid_max)?,
        },
        Opcode::TxnBeginGetgxidAutovacuum => Request::BeginGetgxidAutovacuum {
            isolation: read_isolation(take_u8(buf)?)?,
            read_only: take_u8(buf)? != 0,
        },
        Opcode::TxnBeginGetgxidMulti => {
            let n = take_u32(buf)?;
            check_count(n, buf, BEGIN_ENTRY_MIN_SIZE)?;
            let entries = (0..n).map(|_| decode_begin_entry(buf, sid_max)).collect::<io::Result<Vec<_>>>()?;
            Request::BeginGetgxidMulti { entries }
        }
        Opcode::TxnPrepare => Request::Prepare { gxid: Gxid::new(take_u32(buf)?) },
        Opcode::TxnStartPrepared | Opcode::BkupTxnStartPrepared => {
            let gxid = Gxid::new(take_u32(buf)?);
            let gid = read_string(buf, sid_max)?;
            let node_list = read_string(buf, sid_max)?;
            if opcode.is_backup() {
                Request::BkupStartPrepared { gxid, gid, node_list }
            } else {
                Request::StartPrepared { gxid, gid, node_list }
            }
        }
        Opcode::TxnCommit | Opcode::BkupTxnCommit => {
            let gxid = Gxid::new(take_u32(buf)?);
            let k = take_u32(buf)?;
            check_count(k, buf, 4)?;
            let waited = (0..k).map(|_| take_u32(buf).map(Gxid::new)).collect::<io::Result<Vec<_>>>()?;
            if opcode.is_backup() {
                Request::BkupCommit { gxid, waited }
            } else {
                Request::Commit { gxid, waited }
            }
        }
        Opcode::TxnCommitPrepared | Opcode::BkupTxnCommitPrepared => {
            let gxid = Gxid::new(take_u32(buf)?);
            let prepared_gxid = Gxid::new(take_u32(buf)?);
            let k = take_u32(buf)?;
            check_count(k, buf, 4)?;
            let waited = (0..k).map(|_| take_u32(buf).map(Gxid::new)).collect::<io::Result<Vec<_>>>()?;
            if opcode.is_backup() {
                Request::BkupCommitPrepared { gxid, prepared_gxid, waited }
            } else {
                Request::CommitPrepared { gxid, prepared_gxid, waited }
            }
        }
        Opcode::TxnCommitMulti | Opcode::BkupTxnCommitMulti => {
            let n = take_u32(buf)?;
            check_count(n, buf, 4)?;
            let gxids = (0..n).map(|_| take_u32(buf).map(Gxid::new)).collect::<io::Result<Vec<_>>>()?;
            if opcode.is_backup() {
                Request::BkupCommitMulti { gxids }
            } else {
                Request::CommitMulti { gxids }
            }
        }
        Opcode::TxnRollback | Opcode::BkupTxnRollback => {
            let gxid = Gxid::new(take_u32(buf)?);
            if opcode.is_backup() {
                Request::BkupRollback { gxid }
            } else {
                Request::Rollback { gxid }
            }
        }
        Opcode::TxnRollbackMulti | Opcode::BkupTxnRollbackMulti => {
            let n = take_u32(buf)?;
            check_count(n, buf, 4)?;
            let gxids = (0..n).map(|_| take_u32(buf).map(Gxid::new)).collect::<io::Result<Vec<_>>>()?;
            if opcode.is_backup() {
                Request::BkupRollbackMulti { gxids }
            } else {
                Request::RollbackMulti { gxids }
            }
        }
        Opcode::TxnGetGidData => Request::GetGidData {
            isolation: read_isolation(take_u8(buf)?)?,
            read_only: take_u8(buf)? != 0,
            gid: read_string(buf, sid_max)?,
        },
        Opcode::TxnGetGxid => Request::GetGxid { handle: Handle::from_index(take_u32(buf)? as usize) },
        Opcode::TxnGetNextGxid => Request::GetNextGxid,
        Opcode::TxnGxidList => Request::GxidList,
        Opcode::ReportXmin => Request::ReportXmin {
            gxid: Gxid::new(take_u32(buf)?),
            node_type: read_string(buf, sid_max)?,
            node_name: read_string(buf, sid_max)?,
        },
        Opcode::BkupTxnBeginGetgxidMulti => {
            let n = take_u32(buf)?;
            check_count(n, buf, BEGIN_ENTRY_MIN_SIZE + 4)?;
            let mut entries = Vec::new();
            let mut master_gxids = Vec::new();
            for _ in 0..n {
                entries.push(decode_begin_entry(buf, sid_max)?);
                master_gxids.push(Gxid::new(take_u32(buf)?));
            }
            Request::BkupBeginGetgxidMulti { entries, master_gxids }
        }
        Opcode::BkupTxnPrepare => Request::BkupPrepare { gxid: Gxid::new(take_u32(buf)?) },
    })
}

/// Writes one length-prefixed response frame, echoing `proxy_conn_id` in
/// the proxy header exactly when the request carried one (spec.md §4.5).
///
/// An explicit status byte precedes the body: the same opcode's success
/// and error shapes are different on the wire (a GXID versus a code and
/// message), so the reader cannot tell them apart from the opcode alone.
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    opcode: Opcode,
    proxy_conn_id: Option<ProxyConnId>,
    response: &Response,
) -> io::Result<()> {
    if matches!(response, Response::NoReply) {
        return Ok(());
    }

    let mut body = BytesMut::new();
    body.put_u8(opcode as u8);
    match proxy_conn_id {
        Some(id) => {
            body.put_u8(1);
            body.put_i32(id.raw());
        }
        None => body.put_u8(0),
    }
    body.put_u8(u8::from(matches!(response, Response::Error { .. })));
    encode_body(&mut body, response);

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

fn encode_body(buf: &mut BytesMut, response: &Response) {
    match response {
        Response::Handle { handle, timestamp } => {
            buf.put_u32(handle.index() as u32);
            buf.put_i64(*timestamp);
        }
        Response::Gxid { gxid, timestamp } => {
            buf.put_u32(gxid.raw());
            buf.put_i64(*timestamp);
        }
        Response::GxidOnly { gxid } => buf.put_u32(gxid.raw()),
        Response::GxidMulti { gxids, timestamp } => {
            buf.put_u32(gxids.len() as u32);
            for g in gxids {
                buf.put_u32(g.raw());
            }
            buf.put_i64(*timestamp);
        }
        Response::GxidStatus { gxid, status } => {
            buf.put_u32(gxid.raw());
            buf.put_i32(*status);
        }
        Response::StatusMulti { statuses } => {
            buf.put_u32(statuses.len() as u32);
            for s in statuses {
                buf.put_i32(*s);
            }
        }
        Response::GidData { new_gxid, prepared_gxid, node_list } => {
            buf.put_u32(new_gxid.raw());
            buf.put_u32(prepared_gxid.raw());
            write_string(buf, node_list.as_deref().unwrap_or(""));
        }
        Response::HandleGxid { handle, gxid } => {
            buf.put_u32(handle.index() as u32);
            buf.put_u32(gxid.raw());
        }
        Response::NextGxid { gxid } => buf.put_u32(gxid.raw()),
        Response::GxidList { gxids } => {
            buf.put_u32(gxids.len() as u32);
            for g in gxids {
                buf.put_u32(g.raw());
            }
        }
        Response::Xmin { latest_completed, global_xmin, errcode } => {
            buf.put_u32(latest_completed.raw());
            buf.put_u32(global_xmin.raw());
            buf.put_i32(*errcode);
        }
        Response::Error { code, message } => {
            buf.put_i32(*code);
            write_string(buf, message);
        }
        Response::NoReply => {}
    }
}

// Re-export for the begin-entry/isolation encoding dispatch.rs needs when
// it builds `BKUP_*` request bodies to forward to the standby.
pub(crate) fn encode_begin_entry(buf: &mut BytesMut, entry: &BeginEntry) {
    write_isolation(buf, entry.isolation);
    buf.put_u8(u8::from(entry.read_only));
    write_string(buf, &entry.session_id);
    buf.put_u32(entry.client_id.raw());
    buf.put_i32(entry.proxy_conn_id.raw());
}

/// Writes one length-prefixed request frame, the client-side counterpart
/// to `decode_body`/`read_request`. `gtmctl` and any other direct client
/// use this to talk to `gtmd`.
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    proxy_conn_id: Option<ProxyConnId>,
    request: &Request,
) -> io::Result<()> {
    let opcode = opcode_of(request);
    let mut body = BytesMut::new();
    body.put_u8(opcode as u8);
    match proxy_conn_id {
        Some(id) => {
            body.put_u8(1);
            body.put_i32(id.raw());
        }
        None => body.put_u8(0),
    }
    encode_request_body(&mut body, request);

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

fn opcode_of(request: &Request) -> Opcode {
    match request {
        Request::Begin { .. } => Opcode::TxnBegin,
        Request::BeginGetgxid { .. } => Opcode::TxnBeginGetgxid,
        Request::BeginGetgxidAutovacuum { .. } => Opcode::TxnBeginGetgxidAutovacuum,
        Request::BeginGetgxidMulti { .. } => Opcode::TxnBeginGetgxidMulti,
        Request::Prepare { .. } => Opcode::TxnPrepare,
        Request::StartPrepared { .. } => Opcode::TxnStartPrepared,
        Request::Commit { .. } => Opcode::TxnCommit,
        Request::CommitPrepared { .. } => Opcode::TxnCommitPrepared,
        Request::CommitMulti { .. } => Opcode::TxnCommitMulti,
        Request::Rollback { .. } => Opcode::TxnRollback,
        Request::RollbackMulti { .. } => Opcode::TxnRollbackMulti,
        Request::GetGidData { .. } => Opcode::TxnGetGidData,
        Request::GetGxid { .. } => Opcode::TxnGetGxid,
        Request::GetNextGxid => Opcode::TxnGetNextGxid,
        Request::GxidList => Opcode::TxnGxidList,
        Request::ReportXmin { .. } => Opcode::ReportXmin,
        Request::BkupBeginGetgxidMulti { .. } => Opcode::BkupTxnBeginGetgxidMulti,
        Request::BkupPrepare { .. } => Opcode::BkupTxnPrepare,
        Request::BkupStartPrepared { .. } => Opcode::BkupTxnStartPrepared,
        Request::BkupCommit { .. } => Opcode::BkupTxnCommit,
        Request::BkupCommitPrepared { .. } => Opcode::BkupTxnCommitPrepared,
        Request::BkupCommitMulti { .. } => Opcode::BkupTxnCommitMulti,
        Request::BkupRollback { .. } => Opcode::BkupTxnRollback,
        Request::BkupRollbackMulti { .. } => Opcode::BkupTxnRollbackMulti,
    }
}

fn encode_request_body(buf: &mut BytesMut, request: &Request) {
    match request {
        Request::Begin { isolation, read_only, session_id }
        | Request::BeginGetgxid { isolation, read_only, session_id } => {
            write_isolation(buf, *isolation);
            buf.put_u8(u8::from(*read_only));
            write_string(buf, session_id);
        }
        Request::BeginGetgxidAutovacuum { isolation, read_only } => {
            write_isolation(buf, *isolation);
            buf.put_u8(u8::from(*read_only));
        }
        Request::BeginGetgxidMulti { entries } => {
            buf.put_u32(entries.len() as u32);
            for entry in entries {
                encode_begin_entry(buf, entry);
            }
        }
        Request::Prepare { gxid } | Request::BkupPrepare { gxid } => buf.put_u32(gxid.raw()),
        Request::StartPrepared { gxid, gid, node_list }
        | Request::BkupStartPrepared { gxid, gid, node_list } => {
            buf.put_u32(gxid.raw());
            write_string(buf, gid);
            write_string(buf, node_list);
        }
        Request::Commit { gxid, waited } | Request::BkupCommit { gxid, waited } => {
            buf.put_u32(gxid.raw());
            buf.put_u32(waited.len() as u32);
            for w in waited {
                buf.put_u32(w.raw());
            }
        }
        Request::CommitPrepared { gxid, prepared_gxid, waited }
        | Request::BkupCommitPrepared { gxid, prepared_gxid, waited } => {
            buf.put_u32(gxid.raw());
            buf.put_u32(prepared_gxid.raw());
            buf.put_u32(waited.len() as u32);
            for w in waited {
                buf.put_u32(w.raw());
            }
        }
        Request::CommitMulti { gxids } | Request::BkupCommitMulti { gxids } => {
            buf.put_u32(gxids.len() as u32);
            for g in gxids {
                buf.put_u32(g.raw());
            }
        }
        Request::Rollback { gxid } | Request::BkupRollback { gxid } => buf.put_u32(gxid.raw()),
        Request::RollbackMulti { gxids } | Request::BkupRollbackMulti { gxids } => {
            buf.put_u32(gxids.len() as u32);
            for g in gxids {
                buf.put_u32(g.raw());
            }
        }
        Request::GetGidData { isolation, read_only, gid } => {
            write_isolation(buf, *isolation);
            buf.put_u8(u8::from(*read_only));
            write_string(buf, gid);
        }
        Request::GetGxid { handle } => buf.put_u32(handle.index() as u32),
        Request::GetNextGxid | Request::GxidList => {}
        Request::ReportXmin { gxid, node_type, node_name } => {
            buf.put_u32(gxid.raw());
            write_string(buf, node_type);
            write_string(buf, node_name);
        }
        Request::BkupBeginGetgxidMulti { entries, master_gxids } => {
            buf.put_u32(entries.len() as u32);
            for (entry, gxid) in entries.iter().zip(master_gxids) {
                encode_begin_entry(buf, entry);
                buf.put_u32(gxid.raw());
            }
        }
    }
}

/// Reads one length-prefixed response frame, the client-side counterpart
/// to `encode_body`/`write_response`.
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Response> {
    let len = reader.read_u32().await?;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame length out of bounds"));
    }
    let mut raw = vec![0u8; len as usize];
    reader.read_exact(&mut raw).await?;
    let mut buf = BytesMut::from(&raw[..]);

    let opcode = Opcode::from_u8(take_u8(&mut buf)?)?;
    let has_proxy = take_u8(&mut buf)? != 0;
    if has_proxy {
        take_i32(&mut buf)?;
    }
    let is_error = take_u8(&mut buf)? != 0;
    if is_error {
        return Ok(Response::Error { code: take_i32(&mut buf)?, message: read_string(&mut buf, usize::MAX)? });
    }
    decode_response_body(opcode, &mut buf)
}

fn decode_response_body(opcode: Opcode, buf: &mut BytesMut) -> io::Result<Response> {
    Ok(match opcode {
        Opcode::TxnBegin => Response::Handle {
            handle: Handle::from_index(take_u32(buf)? as usize),
            timestamp: take_i64(buf)?,
        },
        Opcode::TxnBeginGetgxid => {
            Response::Gxid { gxid: Gxid::new(take_u32(buf)?), timestamp: take_i64(buf)? }
        }
        Opcode::TxnBeginGetgxidAutovacuum => Response::GxidOnly { gxid: Gxid::new(take_u32(buf)?) },
        Opcode::TxnBeginGetgxidMulti => {
            let n = take_u32(buf)?;
            check_count(n, buf, 4)?;
            let gxids = (0..n).map(|_| take_u32(buf).map(Gxid::new)).collect::<io::Result<Vec<_>>>()?;
            Response::GxidMulti { gxids, timestamp: take_i64(buf)? }
        }
        Opcode::TxnPrepare | Opcode::TxnStartPrepared => {
            Response::GxidOnly { gxid: Gxid::new(take_u32(buf)?) }
        }
        Opcode::TxnCommit | Opcode::TxnRollback => {
            Response::GxidStatus { gxid: Gxid::new(take_u32(buf)?), status: take_i32(buf)? }
        }
        Opcode::TxnCommitPrepared => {
            Response::GxidStatus { gxid: Gxid::new(take_u32(buf)?), status: take_i32(buf)? }
        }
        Opcode::TxnCommitMulti | Opcode::TxnRollbackMulti => {
            let n = take_u32(buf)?;
            check_count(n, buf, 4)?;
            let statuses = (0..n).map(|_| take_i32(buf)).collect::<io::Result<Vec<_>>>()?;
            Response::StatusMulti { statuses }
        }
        Opcode::TxnGetGidData => {
            let new_gxid = Gxid::new(take_u32(buf)?);
            let prepared_gxid = Gxid::new(take_u32(buf)?);
            let node_list = read_string(buf, usize::MAX)?;
            let node_list = if node_list.is_empty() { None } else { Some(node_list) };
            Response::GidData { new_gxid, prepared_gxid, node_list }
        }
        Opcode::TxnGetGxid => Response::HandleGxid {
            handle: Handle::from_index(take_u32(buf)? as usize),
            gxid: Gxid::new(take_u32(buf)?),
        },
        Opcode::TxnGetNextGxid => Response::NextGxid { gxid: Gxid::new(take_u32(buf)?) },
        Opcode::TxnGxidList => {
            let n = take_u32(buf)?;
            check_count(n, buf, 4)?;
            let gxids = (0..n).map(|_| take_u32(buf).map(Gxid::new)).collect::<io::Result<Vec<_>>>()?;
            Response::GxidList { gxids }
        }
        Opcode::ReportXmin => Response::Xmin {
            latest_completed: Gxid::new(take_u32(buf)?),
            global_xmin: Gxid::new(take_u32(buf)?),
            errcode: take_i32(buf)?,
        },
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("opcode {} never carries a client response", other as u8),
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_begin_request() {
        let mut wire = BytesMut::new();
        wire.put_u8(Opcode::TxnBegin as u8);
        wire.put_u8(0);
        write_isolation(&mut wire, IsolationLevel::RepeatableRead);
        wire.put_u8(0);
        write_string(&mut wire, "s1");

        let mut framed = BytesMut::new();
        framed.put_u32(wire.len() as u32);
        framed.put_slice(&wire);

        let bytes = framed.to_vec();
        let mut reader: &[u8] = &bytes;
        let (opcode, proxy, req) = read_request(&mut reader).await.unwrap();
        assert_eq!(opcode, Opcode::TxnBegin);
        assert!(proxy.is_none());
        match req {
            Request::Begin { isolation, read_only, session_id } => {
                assert_eq!(isolation, IsolationLevel::RepeatableRead);
                assert!(!read_only);
                assert_eq!(session_id, "s1");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn writes_length_prefixed_response() {
        let mut out = Vec::new();
        write_response(&mut out, Opcode::TxnGetNextGxid, None, &Response::NextGxid { gxid: Gxid::new(42) })
            .await
            .unwrap();
        let len = u32::from_be_bytes(out[0..4].try_into().unwrap());
        assert_eq!(len as usize, out.len() - 4);
    }

    /// A frame body shorter than what the opcode needs must fail cleanly
    /// rather than panic in `bytes::Buf`'s `get_*`.
    #[tokio::test]
    async fn truncated_commit_body_is_a_clean_error() {
        let mut wire = BytesMut::new();
        wire.put_u8(Opcode::TxnCommit as u8);
        wire.put_u8(0);
        wire.put_u32(7); // gxid, then nothing else: the waited-count is missing

        let mut framed = BytesMut::new();
        framed.put_u32(wire.len() as u32);
        framed.put_slice(&wire);

        let bytes = framed.to_vec();
        let mut reader: &[u8] = &bytes;
        assert!(read_request(&mut reader).await.is_err());
    }

    /// A declared element count far larger than the remaining bytes must
    /// be rejected up front instead of looping or over-allocating.
    #[tokio::test]
    async fn oversized_declared_count_is_rejected() {
        let mut wire = BytesMut::new();
        wire.put_u8(Opcode::TxnCommitMulti as u8);
        wire.put_u8(0);
        wire.put_u32(u32::MAX); // claims billions of gxids, buffer has none

        let mut framed = BytesMut::new();
        framed.put_u32(wire.len() as u32);
        framed.put_slice(&wire);

        let bytes = framed.to_vec();
        let mut reader: &[u8] = &bytes;
        assert!(read_request(&mut reader).await.is_err());
    }
}
