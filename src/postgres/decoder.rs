use bytes::{Buf, Bytes};
use thiserror::Error;

use super::lsn::Lsn;
use super::messages::{
    BeginBody, CommitBody, DeleteBody, InsertBody, LogicalMessage, OriginBody, ReplicationFrame,
    TruncateBody, TupleColumn, TupleData, TypeBody, UpdateBody, PRIMARY_KEEPALIVE_TAG,
    XLOG_DATA_TAG,
};
use super::relation::{Column, Relation};

/// A frame or message that could not be turned into an event.
///
/// Every variant is recoverable: the session logs it, skips the frame and
/// keeps streaming without acknowledging the frame's position.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty {0}")]
    Empty(&'static str),

    #[error("truncated {context}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        context: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("unknown pgoutput message type '{}' (0x{:02x})", tag_char(.0), .0)]
    UnknownMessageType(u8),

    #[error("unexpected tuple marker '{}' in {context}", tag_char(.marker))]
    UnexpectedTupleMarker { context: &'static str, marker: u8 },

    #[error("unknown tuple column kind '{}'", tag_char(.0))]
    UnknownColumnKind(u8),

    #[error("invalid length {0} for column value")]
    InvalidLength(i32),

    #[error("unterminated string in {0}")]
    UnterminatedString(&'static str),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("unknown relation id {0}")]
    UnknownRelation(u32),

    #[error("relation {relation_id} has {expected} columns but tuple has {actual}")]
    ColumnCountMismatch {
        relation_id: u32,
        expected: usize,
        actual: usize,
    },
}

fn tag_char(tag: &u8) -> char {
    char::from(*tag)
}

/// Bounds-checked big-endian reader over a message body.
struct Reader {
    buf: Bytes,
    context: &'static str,
}

impl Reader {
    fn new(buf: Bytes, context: &'static str) -> Self {
        Self { buf, context }
    }

    fn need(&self, needed: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < needed {
            return Err(DecodeError::Truncated {
                context: self.context,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn lsn(&mut self) -> Result<Lsn, DecodeError> {
        self.need(8)?;
        Ok(Lsn::new(self.buf.get_u64()))
    }

    fn bytes(&mut self, len: usize) -> Result<Bytes, DecodeError> {
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    /// NUL-terminated string.
    fn cstr(&mut self) -> Result<String, DecodeError> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::UnterminatedString(self.context))?;
        let raw = self.buf.split_to(end);
        self.buf.advance(1);
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8(self.context))
    }

    fn rest(self) -> Bytes {
        self.buf
    }
}

/// Parses the streaming replication envelope of a CopyData payload.
pub fn parse_copy_data(data: Bytes) -> Result<ReplicationFrame, DecodeError> {
    let mut reader = Reader::new(data, "replication frame");
    let tag = reader.u8().map_err(|_| DecodeError::Empty("replication frame"))?;

    match tag {
        XLOG_DATA_TAG => {
            reader.context = "XLogData header";
            let wal_start = reader.lsn()?;
            let wal_end = reader.lsn()?;
            let server_time = reader.i64()?;
            Ok(ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                server_time,
                data: reader.rest(),
            })
        }
        PRIMARY_KEEPALIVE_TAG => {
            reader.context = "primary keepalive";
            let wal_end = reader.lsn()?;
            let server_time = reader.i64()?;
            let reply_requested = reader.u8()? != 0;
            Ok(ReplicationFrame::Keepalive {
                wal_end,
                server_time,
                reply_requested,
            })
        }
        other => Ok(ReplicationFrame::Other(other)),
    }
}

/// Parses a pgoutput (protocol version 1) message.
pub fn parse_logical_message(data: Bytes) -> Result<LogicalMessage, DecodeError> {
    let mut reader = Reader::new(data, "logical message");
    let tag = reader.u8().map_err(|_| DecodeError::Empty("logical message"))?;

    match tag {
        b'B' => decode_begin(reader).map(LogicalMessage::Begin),
        b'C' => decode_commit(reader).map(LogicalMessage::Commit),
        b'O' => decode_origin(reader).map(LogicalMessage::Origin),
        b'R' => decode_relation(reader).map(LogicalMessage::Relation),
        b'Y' => decode_type(reader).map(LogicalMessage::Type),
        b'I' => decode_insert(reader).map(LogicalMessage::Insert),
        b'U' => decode_update(reader).map(LogicalMessage::Update),
        b'D' => decode_delete(reader).map(LogicalMessage::Delete),
        b'T' => decode_truncate(reader).map(LogicalMessage::Truncate),
        // Generic logical message and the streaming-transaction family.
        b'M' | b'S' | b'E' | b'c' | b'A' => Ok(LogicalMessage::Other(tag)),
        other => Err(DecodeError::UnknownMessageType(other)),
    }
}

fn decode_begin(mut reader: Reader) -> Result<BeginBody, DecodeError> {
    reader.context = "BEGIN message";
    Ok(BeginBody {
        final_lsn: reader.lsn()?,
        timestamp: reader.i64()?,
        xid: reader.u32()?,
    })
}

fn decode_commit(mut reader: Reader) -> Result<CommitBody, DecodeError> {
    reader.context = "COMMIT message";
    Ok(CommitBody {
        flags: reader.u8()?,
        commit_lsn: reader.lsn()?,
        end_lsn: reader.lsn()?,
        timestamp: reader.i64()?,
    })
}

fn decode_origin(mut reader: Reader) -> Result<OriginBody, DecodeError> {
    reader.context = "ORIGIN message";
    Ok(OriginBody {
        commit_lsn: reader.lsn()?,
        name: reader.cstr()?,
    })
}

fn decode_relation(mut reader: Reader) -> Result<Relation, DecodeError> {
    reader.context = "RELATION message";
    let id = reader.u32()?;
    let namespace = reader.cstr()?;
    let name = reader.cstr()?;
    let replica_identity = reader.u8()?;
    let num_columns = reader.u16()?;

    let mut columns = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        let flags = reader.u8()?;
        let column_name = reader.cstr()?;
        let type_oid = reader.u32()?;
        let type_modifier = reader.i32()?;
        columns.push(Column {
            name: column_name,
            type_oid,
            type_modifier,
            is_key: flags & 1 != 0,
        });
    }

    Ok(Relation {
        id,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn decode_type(mut reader: Reader) -> Result<TypeBody, DecodeError> {
    reader.context = "TYPE message";
    Ok(TypeBody {
        id: reader.u32()?,
        namespace: reader.cstr()?,
        name: reader.cstr()?,
    })
}

fn decode_insert(mut reader: Reader) -> Result<InsertBody, DecodeError> {
    reader.context = "INSERT message";
    let relation_id = reader.u32()?;
    match reader.u8()? {
        b'N' => Ok(InsertBody {
            relation_id,
            tuple: decode_tuple(&mut reader)?,
        }),
        marker => Err(DecodeError::UnexpectedTupleMarker {
            context: "INSERT",
            marker,
        }),
    }
}

fn decode_update(mut reader: Reader) -> Result<UpdateBody, DecodeError> {
    reader.context = "UPDATE message";
    let relation_id = reader.u32()?;

    let (old_tuple, new_tuple) = match reader.u8()? {
        b'K' | b'O' => {
            let old = decode_tuple(&mut reader)?;
            match reader.u8()? {
                b'N' => (Some(old), decode_tuple(&mut reader)?),
                marker => {
                    return Err(DecodeError::UnexpectedTupleMarker {
                        context: "UPDATE",
                        marker,
                    })
                }
            }
        }
        b'N' => (None, decode_tuple(&mut reader)?),
        marker => {
            return Err(DecodeError::UnexpectedTupleMarker {
                context: "UPDATE",
                marker,
            })
        }
    };

    Ok(UpdateBody {
        relation_id,
        old_tuple,
        new_tuple,
    })
}

fn decode_delete(mut reader: Reader) -> Result<DeleteBody, DecodeError> {
    reader.context = "DELETE message";
    let relation_id = reader.u32()?;
    match reader.u8()? {
        b'K' | b'O' => Ok(DeleteBody {
            relation_id,
            old_tuple: decode_tuple(&mut reader)?,
        }),
        marker => Err(DecodeError::UnexpectedTupleMarker {
            context: "DELETE",
            marker,
        }),
    }
}

fn decode_truncate(mut reader: Reader) -> Result<TruncateBody, DecodeError> {
    reader.context = "TRUNCATE message";
    let num_relations = reader.u32()?;
    let options = reader.u8()?;
    reader.need((num_relations as usize).saturating_mul(4))?;

    let mut relation_ids = Vec::with_capacity(num_relations as usize);
    for _ in 0..num_relations {
        relation_ids.push(reader.u32()?);
    }

    Ok(TruncateBody {
        options,
        relation_ids,
    })
}

fn decode_tuple(reader: &mut Reader) -> Result<TupleData, DecodeError> {
    let num_columns = reader.u16()?;
    let mut columns = Vec::with_capacity(num_columns as usize);

    for _ in 0..num_columns {
        let column = match reader.u8()? {
            b'n' => TupleColumn::Null,
            b'u' => TupleColumn::UnchangedToast,
            b't' => TupleColumn::Text(read_value(reader)?),
            b'b' => TupleColumn::Binary(read_value(reader)?),
            kind => return Err(DecodeError::UnknownColumnKind(kind)),
        };
        columns.push(column);
    }

    Ok(TupleData { columns })
}

fn read_value(reader: &mut Reader) -> Result<Bytes, DecodeError> {
    let len = reader.i32()?;
    if len < 0 {
        return Err(DecodeError::InvalidLength(len));
    }
    reader.bytes(len as usize)
}
