// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Frame codec.
//!
//! One message is one transport frame:
//!
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ type: u8 │ body (message specific)      │
//! └──────────┴──────────────────────────────┘
//! ```
//!
//! Body primitives, all big-endian:
//!
//! | kind       | layout                          |
//! |------------|---------------------------------|
//! | integer    | `u8` / `u32` / `u64` / `i64`    |
//! | bool       | `u8`, 0 or 1                    |
//! | bytes, str | `u32` length + data (str UTF-8) |
//! | `Option<T>`| `u8` presence + `T`             |
//! | `Vec<T>`   | `u32` count + items             |
//!
//! [`decode`] never panics on malformed input: short reads, bad UTF-8,
//! unknown enum codes and trailing bytes are reported as
//! `PROTOCOL_VIOLATION`, an unknown type byte as `UNEXPECTED_MESSAGE_TYPE`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::messages::*;
use crate::error::{Result, SyncError};

/// Nesting limit for shape include trees.
const MAX_SELECT_DEPTH: usize = 32;

/// Encode a message into one frame.
pub fn encode(message: &SatMessage) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(message.message_type().as_byte());
    encode_body(message, &mut buf);
    buf.freeze()
}

/// Decode one frame.
pub fn decode(frame: &[u8]) -> Result<SatMessage> {
    let mut r = Reader::new(frame);
    let msg_type = MessageType::from_byte(r.u8()?)?;
    let message = decode_body(msg_type, &mut r)?;
    if r.remaining() > 0 {
        return Err(SyncError::protocol_violation(format!(
            "{} trailing bytes after {}",
            r.remaining(),
            msg_type.name()
        )));
    }
    Ok(message)
}

// =============================================================================
// Writer helpers
// =============================================================================

fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(u8::from(v));
}

fn put_bytes(buf: &mut BytesMut, v: &[u8]) {
    buf.put_u32(v.len() as u32);
    buf.put_slice(v);
}

fn put_str(buf: &mut BytesMut, v: &str) {
    put_bytes(buf, v.as_bytes());
}

fn put_opt<T>(buf: &mut BytesMut, v: Option<&T>, f: impl Fn(&mut BytesMut, &T)) {
    match v {
        Some(inner) => {
            buf.put_u8(1);
            f(buf, inner);
        }
        None => buf.put_u8(0),
    }
}

fn put_vec<T>(buf: &mut BytesMut, items: &[T], f: impl Fn(&mut BytesMut, &T)) {
    buf.put_u32(items.len() as u32);
    for item in items {
        f(buf, item);
    }
}

fn put_strs(buf: &mut BytesMut, items: &[String]) {
    put_vec(buf, items, |b, s| put_str(b, s));
}

fn put_row(buf: &mut BytesMut, row: &SatOpRow) {
    put_bytes(buf, &row.nulls_bitmask);
    put_vec(buf, &row.values, |b, v| put_bytes(b, v));
}

fn put_error_resp(buf: &mut BytesMut, e: &SatErrorResp) {
    buf.put_u32(e.error_type.code());
    put_opt(buf, e.lsn.as_ref(), |b, l| put_bytes(b, l));
    put_opt(buf, e.message.as_ref(), |b, m| put_str(b, m));
}

fn put_headers(buf: &mut BytesMut, headers: &[SatAuthHeader]) {
    put_vec(buf, headers, |b, h| {
        put_str(b, &h.key);
        put_str(b, &h.value);
    });
}

fn put_select(buf: &mut BytesMut, select: &SatShapeSelect) {
    put_str(buf, &select.tablename);
    put_opt(buf, select.where_clause.as_ref(), |b, w| put_str(b, w));
    put_vec(buf, &select.include, |b, child| {
        put_strs(b, &child.foreign_key);
        put_select(b, &child.select);
    });
}

fn put_op(buf: &mut BytesMut, op: &SatTransOp) {
    match op {
        SatTransOp::Begin(b) => {
            buf.put_u8(0);
            buf.put_i64(b.commit_timestamp);
            put_bytes(buf, &b.lsn);
            put_opt(buf, b.origin.as_ref(), |w, o| put_str(w, o));
            put_bool(buf, b.is_migration);
            put_opt(buf, b.transaction_id.as_ref(), |w, id| w.put_u64(*id));
        }
        SatTransOp::Commit(c) => {
            buf.put_u8(1);
            buf.put_i64(c.commit_timestamp);
            put_bytes(buf, &c.lsn);
            put_opt(buf, c.transaction_id.as_ref(), |w, id| w.put_u64(*id));
        }
        SatTransOp::Insert(i) => {
            buf.put_u8(2);
            buf.put_u32(i.relation_id);
            put_row(buf, &i.row_data);
            put_strs(buf, &i.tags);
        }
        SatTransOp::Update(u) => {
            buf.put_u8(3);
            buf.put_u32(u.relation_id);
            put_row(buf, &u.row_data);
            put_opt(buf, u.old_row_data.as_ref(), put_row);
            put_strs(buf, &u.tags);
        }
        SatTransOp::Delete(d) => {
            buf.put_u8(4);
            buf.put_u32(d.relation_id);
            put_opt(buf, d.old_row_data.as_ref(), put_row);
            put_strs(buf, &d.tags);
        }
        SatTransOp::Migrate(m) => {
            buf.put_u8(5);
            put_str(buf, &m.version);
            put_vec(buf, &m.stmts, |w, s| {
                w.put_u32(s.op_type.code());
                put_str(w, &s.sql);
            });
            put_opt(buf, m.table.as_ref(), |w, t| {
                put_str(w, &t.name);
                put_vec(w, &t.columns, |w, c| {
                    put_str(w, &c.name);
                    put_str(w, &c.sqlite_type);
                    put_str(w, &c.pg_type);
                });
                put_vec(w, &t.fks, |w, fk| {
                    put_strs(w, &fk.fk_cols);
                    put_str(w, &fk.pk_table);
                    put_strs(w, &fk.pk_cols);
                });
                put_strs(w, &t.pks);
            });
        }
        SatTransOp::Gone(g) => {
            buf.put_u8(6);
            buf.put_u32(g.relation_id);
            put_row(buf, &g.pk_data);
        }
        SatTransOp::AdditionalBegin { reference } => {
            buf.put_u8(7);
            buf.put_u64(*reference);
        }
        SatTransOp::AdditionalCommit { reference } => {
            buf.put_u8(8);
            buf.put_u64(*reference);
        }
    }
}

fn encode_body(message: &SatMessage, buf: &mut BytesMut) {
    match message {
        SatMessage::ErrorResp(e) => put_error_resp(buf, e),
        SatMessage::AuthReq(a) => {
            put_str(buf, &a.id);
            put_str(buf, &a.token);
            put_headers(buf, &a.headers);
        }
        SatMessage::AuthResp(a) => {
            put_str(buf, &a.id);
            put_headers(buf, &a.headers);
        }
        SatMessage::PingReq
        | SatMessage::InStopReplicationReq
        | SatMessage::InStopReplicationResp
        | SatMessage::SubsDataEnd
        | SatMessage::ShapeDataEnd
        | SatMessage::UnsubsResp => {}
        SatMessage::PingResp(p) => put_opt(buf, p.lsn.as_ref(), |b, l| put_bytes(b, l)),
        SatMessage::InStartReplicationReq(r) => {
            put_bytes(buf, &r.lsn);
            put_strs(buf, &r.subscription_ids);
            put_opt(buf, r.schema_version.as_ref(), |b, v| put_str(b, v));
            put_vec(buf, &r.observed_transaction_data, |b, id| b.put_u64(*id));
        }
        SatMessage::InStartReplicationResp(r) => {
            put_opt(buf, r.err.as_ref(), |b, e| {
                b.put_u32(e.code.code());
                put_str(b, &e.message);
            });
            put_opt(buf, r.unacked_window_size.as_ref(), |b, w| b.put_u32(*w));
        }
        SatMessage::OpLog(log) => put_vec(buf, &log.ops, put_op),
        SatMessage::Relation(rel) => {
            put_str(buf, &rel.schema_name);
            put_str(buf, &rel.table_name);
            buf.put_u32(rel.relation_id);
            put_vec(buf, &rel.columns, |b, c| {
                put_str(b, &c.name);
                put_str(b, &c.type_name);
                put_opt(b, c.primary_key.as_ref(), |b, pos| b.put_u32(*pos));
                put_bool(b, c.is_nullable);
            });
        }
        SatMessage::MigrationNotification(n) => {
            put_str(buf, &n.old_schema_version);
            put_str(buf, &n.new_schema_version);
        }
        SatMessage::SubsReq(s) => {
            put_str(buf, &s.subscription_id);
            put_vec(buf, &s.shape_requests, |b, req| {
                put_str(b, &req.request_id);
                put_vec(b, &req.selects, put_select);
            });
        }
        SatMessage::SubsResp(s) => {
            put_str(buf, &s.subscription_id);
            put_opt(buf, s.err.as_ref(), |b, e| {
                b.put_u32(e.code.code());
                put_str(b, &e.message);
                put_vec(b, &e.shape_request_errors, |b, se| {
                    b.put_u32(se.code.code());
                    put_str(b, &se.message);
                    put_str(b, &se.request_id);
                });
            });
        }
        SatMessage::SubsDataError(e) => {
            buf.put_u32(e.code.code());
            put_str(buf, &e.message);
            put_str(buf, &e.subscription_id);
            put_vec(buf, &e.shape_request_errors, |b, se| {
                b.put_u32(se.code.code());
                put_str(b, &se.message);
                put_str(b, &se.request_id);
            });
        }
        SatMessage::SubsDataBegin(b) => {
            put_str(buf, &b.subscription_id);
            put_bytes(buf, &b.lsn);
        }
        SatMessage::ShapeDataBegin(b) => {
            put_str(buf, &b.request_id);
            put_str(buf, &b.uuid);
        }
        SatMessage::UnsubsReq(u) => put_strs(buf, &u.subscription_ids),
        SatMessage::RpcRequest(r) => {
            put_str(buf, &r.method);
            buf.put_u32(r.request_id);
            put_bytes(buf, &r.message);
        }
        SatMessage::RpcResponse(r) => {
            put_str(buf, &r.method);
            buf.put_u32(r.request_id);
            match &r.result {
                None => buf.put_u8(0),
                Some(RpcResult::Message(m)) => {
                    buf.put_u8(1);
                    put_bytes(buf, m);
                }
                Some(RpcResult::Error(e)) => {
                    buf.put_u8(2);
                    put_error_resp(buf, e);
                }
            }
        }
        SatMessage::OpLogAck(a) => {
            buf.put_u64(a.ack_timestamp);
            put_bytes(buf, &a.lsn);
            buf.put_u64(a.transaction_id);
            put_strs(buf, &a.subscription_ids);
            put_vec(buf, &a.additional_data_source_ids, |b, id| b.put_u64(*id));
            put_strs(buf, &a.gone_subscription_ids);
        }
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Bounds-checked cursor over a frame.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(SyncError::protocol_violation(format!(
                "truncated frame reading {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SyncError::protocol_violation(format!("invalid bool byte {other}"))),
        }
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        self.need(len, "byte string")?;
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }

    fn string(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?)
            .map_err(|e| SyncError::protocol_violation(format!("invalid UTF-8 string: {e}")))
    }

    fn opt<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<Option<T>> {
        match self.u8()? {
            0 => Ok(None),
            1 => f(self).map(Some),
            other => Err(SyncError::protocol_violation(format!("invalid presence byte {other}"))),
        }
    }

    fn vec<T>(&mut self, mut f: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let count = self.u32()? as usize;
        // Every item takes at least one byte.
        self.need(count, "repeated field")?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(f(self)?);
        }
        Ok(out)
    }

    fn strings(&mut self) -> Result<Vec<String>> {
        self.vec(|r| r.string())
    }

    fn row(&mut self) -> Result<SatOpRow> {
        Ok(SatOpRow {
            nulls_bitmask: self.bytes()?,
            values: self.vec(|r| r.bytes())?,
        })
    }

    fn error_resp(&mut self) -> Result<SatErrorResp> {
        Ok(SatErrorResp {
            error_type: ErrorRespCode::from_code(self.u32()?)?,
            lsn: self.opt(|r| r.bytes())?,
            message: self.opt(|r| r.string())?,
        })
    }

    fn headers(&mut self) -> Result<Vec<SatAuthHeader>> {
        self.vec(|r| {
            Ok(SatAuthHeader {
                key: r.string()?,
                value: r.string()?,
            })
        })
    }

    fn select(&mut self, depth: usize) -> Result<SatShapeSelect> {
        if depth > MAX_SELECT_DEPTH {
            return Err(SyncError::protocol_violation("shape include tree too deep"));
        }
        Ok(SatShapeSelect {
            tablename: self.string()?,
            where_clause: self.opt(|r| r.string())?,
            include: self.vec(|r| {
                Ok(SatChildRelation {
                    foreign_key: r.strings()?,
                    select: r.select(depth + 1)?,
                })
            })?,
        })
    }

    fn op(&mut self) -> Result<SatTransOp> {
        let op = match self.u8()? {
            0 => SatTransOp::Begin(SatOpBegin {
                commit_timestamp: self.i64()?,
                lsn: self.bytes()?,
                origin: self.opt(|r| r.string())?,
                is_migration: self.bool()?,
                transaction_id: self.opt(|r| r.u64())?,
            }),
            1 => SatTransOp::Commit(SatOpCommit {
                commit_timestamp: self.i64()?,
                lsn: self.bytes()?,
                transaction_id: self.opt(|r| r.u64())?,
            }),
            2 => SatTransOp::Insert(SatOpInsert {
                relation_id: self.u32()?,
                row_data: self.row()?,
                tags: self.strings()?,
            }),
            3 => SatTransOp::Update(SatOpUpdate {
                relation_id: self.u32()?,
                row_data: self.row()?,
                old_row_data: self.opt(|r| r.row())?,
                tags: self.strings()?,
            }),
            4 => SatTransOp::Delete(SatOpDelete {
                relation_id: self.u32()?,
                old_row_data: self.opt(|r| r.row())?,
                tags: self.strings()?,
            }),
            5 => SatTransOp::Migrate(SatOpMigrate {
                version: self.string()?,
                stmts: self.vec(|r| {
                    Ok(SatMigrationStmt {
                        op_type: MigrationOpType::from_code(r.u32()?)?,
                        sql: r.string()?,
                    })
                })?,
                table: self.opt(|r| {
                    Ok(SatMigrationTable {
                        name: r.string()?,
                        columns: r.vec(|r| {
                            Ok(SatMigrationColumn {
                                name: r.string()?,
                                sqlite_type: r.string()?,
                                pg_type: r.string()?,
                            })
                        })?,
                        fks: r.vec(|r| {
                            Ok(SatMigrationForeignKey {
                                fk_cols: r.strings()?,
                                pk_table: r.string()?,
                                pk_cols: r.strings()?,
                            })
                        })?,
                        pks: r.strings()?,
                    })
                })?,
            }),
            6 => SatTransOp::Gone(SatOpGone {
                relation_id: self.u32()?,
                pk_data: self.row()?,
            }),
            7 => SatTransOp::AdditionalBegin { reference: self.u64()? },
            8 => SatTransOp::AdditionalCommit { reference: self.u64()? },
            other => {
                return Err(SyncError::protocol_violation(format!(
                    "unknown transaction op tag {other}"
                )))
            }
        };
        Ok(op)
    }
}

fn decode_body(msg_type: MessageType, r: &mut Reader<'_>) -> Result<SatMessage> {
    let message = match msg_type {
        MessageType::ErrorResp => SatMessage::ErrorResp(r.error_resp()?),
        MessageType::AuthReq => SatMessage::AuthReq(SatAuthReq {
            id: r.string()?,
            token: r.string()?,
            headers: r.headers()?,
        }),
        MessageType::AuthResp => SatMessage::AuthResp(SatAuthResp {
            id: r.string()?,
            headers: r.headers()?,
        }),
        MessageType::PingReq => SatMessage::PingReq,
        MessageType::PingResp => SatMessage::PingResp(SatPingResp {
            lsn: r.opt(|r| r.bytes())?,
        }),
        MessageType::InStartReplicationReq => {
            SatMessage::InStartReplicationReq(SatInStartReplicationReq {
                lsn: r.bytes()?,
                subscription_ids: r.strings()?,
                schema_version: r.opt(|r| r.string())?,
                observed_transaction_data: r.vec(|r| r.u64())?,
            })
        }
        MessageType::InStartReplicationResp => {
            SatMessage::InStartReplicationResp(SatInStartReplicationResp {
                err: r.opt(|r| {
                    Ok(StartReplicationError {
                        code: StartReplicationErrorCode::from_code(r.u32()?)?,
                        message: r.string()?,
                    })
                })?,
                unacked_window_size: r.opt(|r| r.u32())?,
            })
        }
        MessageType::InStopReplicationReq => SatMessage::InStopReplicationReq,
        MessageType::InStopReplicationResp => SatMessage::InStopReplicationResp,
        MessageType::OpLog => SatMessage::OpLog(SatOpLog {
            ops: r.vec(|r| r.op())?,
        }),
        MessageType::Relation => SatMessage::Relation(SatRelation {
            schema_name: r.string()?,
            table_name: r.string()?,
            relation_id: r.u32()?,
            columns: r.vec(|r| {
                Ok(SatRelationColumn {
                    name: r.string()?,
                    type_name: r.string()?,
                    primary_key: r.opt(|r| r.u32())?,
                    is_nullable: r.bool()?,
                })
            })?,
        }),
        MessageType::MigrationNotification => {
            SatMessage::MigrationNotification(SatMigrationNotification {
                old_schema_version: r.string()?,
                new_schema_version: r.string()?,
            })
        }
        MessageType::SubsReq => SatMessage::SubsReq(SatSubsReq {
            subscription_id: r.string()?,
            shape_requests: r.vec(|r| {
                Ok(SatShapeRequest {
                    request_id: r.string()?,
                    selects: r.vec(|r| r.select(0))?,
                })
            })?,
        }),
        MessageType::SubsResp => SatMessage::SubsResp(SatSubsResp {
            subscription_id: r.string()?,
            err: r.opt(|r| {
                Ok(SubsRespError {
                    code: SubsRespErrorCode::from_code(r.u32()?)?,
                    message: r.string()?,
                    shape_request_errors: r.vec(|r| {
                        Ok(ShapeRequestError {
                            code: ShapeReqErrorCode::from_code(r.u32()?)?,
                            message: r.string()?,
                            request_id: r.string()?,
                        })
                    })?,
                })
            })?,
        }),
        MessageType::SubsDataError => SatMessage::SubsDataError(SatSubsDataError {
            code: SubsDataErrorCode::from_code(r.u32()?)?,
            message: r.string()?,
            subscription_id: r.string()?,
            shape_request_errors: r.vec(|r| {
                Ok(ShapeDataError {
                    code: ShapeDataErrorCode::from_code(r.u32()?)?,
                    message: r.string()?,
                    request_id: r.string()?,
                })
            })?,
        }),
        MessageType::SubsDataBegin => SatMessage::SubsDataBegin(SatSubsDataBegin {
            subscription_id: r.string()?,
            lsn: r.bytes()?,
        }),
        MessageType::SubsDataEnd => SatMessage::SubsDataEnd,
        MessageType::ShapeDataBegin => SatMessage::ShapeDataBegin(SatShapeDataBegin {
            request_id: r.string()?,
            uuid: r.string()?,
        }),
        MessageType::ShapeDataEnd => SatMessage::ShapeDataEnd,
        MessageType::UnsubsReq => SatMessage::UnsubsReq(SatUnsubsReq {
            subscription_ids: r.strings()?,
        }),
        MessageType::UnsubsResp => SatMessage::UnsubsResp,
        MessageType::RpcRequest => SatMessage::RpcRequest(SatRpcRequest {
            method: r.string()?,
            request_id: r.u32()?,
            message: r.bytes()?,
        }),
        MessageType::RpcResponse => {
            let method = r.string()?;
            let request_id = r.u32()?;
            let result = match r.u8()? {
                0 => None,
                1 => Some(RpcResult::Message(r.bytes()?)),
                2 => Some(RpcResult::Error(r.error_resp()?)),
                other => {
                    return Err(SyncError::protocol_violation(format!(
                        "invalid rpc result tag {other}"
                    )))
                }
            };
            SatMessage::RpcResponse(SatRpcResponse {
                method,
                request_id,
                result,
            })
        }
        MessageType::OpLogAck => SatMessage::OpLogAck(SatOpLogAck {
            ack_timestamp: r.u64()?,
            lsn: r.bytes()?,
            transaction_id: r.u64()?,
            subscription_ids: r.strings()?,
            additional_data_source_ids: r.vec(|r| r.u64())?,
            gone_subscription_ids: r.strings()?,
        }),
    };
    Ok(message)
}
