//! Replication stream messages.
//!
//! Two layers travel inside CopyData frames: the streaming replication
//! envelope ([`ReplicationFrame`]) and, inside XLogData, the pgoutput logical
//! message ([`LogicalMessage`]). [`StatusUpdate`] is the one message we send
//! back.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use super::lsn::Lsn;
use super::relation::Relation;

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

pub const XLOG_DATA_TAG: u8 = b'w';
pub const PRIMARY_KEEPALIVE_TAG: u8 = b'k';
pub const STANDBY_STATUS_UPDATE_TAG: u8 = b'r';

/// Current time as microseconds since the PostgreSQL epoch.
pub fn pg_timestamp_now() -> i64 {
    Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

pub fn pg_timestamp_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_micros(micros.checked_add(PG_EPOCH_OFFSET_MICROS)?)
        .single()
}

/// Envelope carried in a CopyData frame from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    Keepalive {
        wal_end: Lsn,
        server_time: i64,
        reply_requested: bool,
    },
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_time: i64,
        data: Bytes,
    },
    /// Any other envelope tag; ignored.
    Other(u8),
}

/// pgoutput logical replication message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalMessage {
    Begin(BeginBody),
    Commit(CommitBody),
    Origin(OriginBody),
    Relation(Relation),
    Type(TypeBody),
    Insert(InsertBody),
    Update(UpdateBody),
    Delete(DeleteBody),
    Truncate(TruncateBody),
    /// A valid pgoutput message kind this client does not act on.
    Other(u8),
}

impl LogicalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            LogicalMessage::Begin(_) => "BEGIN",
            LogicalMessage::Commit(_) => "COMMIT",
            LogicalMessage::Origin(_) => "ORIGIN",
            LogicalMessage::Relation(_) => "RELATION",
            LogicalMessage::Type(_) => "TYPE",
            LogicalMessage::Insert(_) => "INSERT",
            LogicalMessage::Update(_) => "UPDATE",
            LogicalMessage::Delete(_) => "DELETE",
            LogicalMessage::Truncate(_) => "TRUNCATE",
            LogicalMessage::Other(_) => "OTHER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginBody {
    pub final_lsn: Lsn,
    pub timestamp: i64,
    pub xid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginBody {
    pub commit_lsn: Lsn,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertBody {
    pub relation_id: u32,
    pub tuple: TupleData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBody {
    pub relation_id: u32,
    /// Key columns (`K`) or full old row (`O`), when the server sends one.
    pub old_tuple: Option<TupleData>,
    pub new_tuple: TupleData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteBody {
    pub relation_id: u32,
    pub old_tuple: TupleData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncateBody {
    pub options: u8,
    pub relation_ids: Vec<u32>,
}

impl TruncateBody {
    pub fn cascade(&self) -> bool {
        self.options & 1 != 0
    }

    pub fn restart_identity(&self) -> bool {
        self.options & 2 != 0
    }
}

/// Raw column data for one row version, in relation column order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleData {
    pub columns: Vec<TupleColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleColumn {
    Null,
    UnchangedToast,
    Text(Bytes),
    Binary(Bytes),
}

/// Standby status update reporting consumed WAL position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub write: Lsn,
    pub flush: Lsn,
    pub apply: Lsn,
    pub client_time: i64,
    pub reply_requested: bool,
}

impl StatusUpdate {
    /// Report `lsn` as written, flushed and applied.
    pub fn confirmed(lsn: Lsn) -> Self {
        Self {
            write: lsn,
            flush: lsn,
            apply: lsn,
            client_time: pg_timestamp_now(),
            reply_requested: false,
        }
    }

    /// CopyData payload for this update.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(34);
        buf.put_u8(STANDBY_STATUS_UPDATE_TAG);
        buf.put_u64(self.write.as_u64());
        buf.put_u64(self.flush.as_u64());
        buf.put_u64(self.apply.as_u64());
        buf.put_i64(self.client_time);
        buf.put_u8(u8::from(self.reply_requested));
        buf.freeze()
    }
}
