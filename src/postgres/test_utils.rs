use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::lsn::Lsn;

/// Size of the XLogData envelope in front of every pgoutput message.
pub const XLOG_HEADER_LEN: usize = 25;

/// Builds CopyData frames the way a server streaming pgoutput would.
///
/// Every XLogData frame starts at the builder's current position, which
/// then moves past the frame's payload, so a sequence of frames carries
/// increasing, contiguous WAL positions.
pub struct MockMessageBuilder {
    lsn: u64,
    timestamp: i64,
    relations: HashMap<u32, MockRelation>,
}

#[derive(Debug, Clone)]
pub struct MockRelation {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<MockColumn>,
}

#[derive(Debug, Clone)]
pub struct MockColumn {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

impl MockMessageBuilder {
    pub fn new() -> Self {
        Self {
            lsn: 1000,
            timestamp: 750_681_000_000_000, // 2023-10-15 10:30:00 UTC, PostgreSQL epoch
            relations: HashMap::new(),
        }
    }

    pub fn with_lsn(mut self, lsn: u64) -> Self {
        self.lsn = lsn;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn add_relation(
        mut self,
        id: u32,
        schema: &str,
        table: &str,
        columns: Vec<(&str, u32, bool)>,
    ) -> Self {
        let columns = columns
            .into_iter()
            .map(|(name, type_id, is_key)| MockColumn {
                name: name.to_string(),
                type_id,
                is_key,
            })
            .collect();

        self.relations.insert(
            id,
            MockRelation {
                id,
                schema: schema.to_string(),
                table: table.to_string(),
                columns,
            },
        );
        self
    }

    /// Position the next frame will start at.
    pub fn lsn(&self) -> Lsn {
        Lsn::new(self.lsn)
    }

    /// Wraps `payload` in an XLogData envelope and advances the position.
    pub fn xlog_data(&mut self, payload: &[u8]) -> Bytes {
        let start = self.lsn;
        let end = start + payload.len() as u64;

        let mut buf = BytesMut::with_capacity(XLOG_HEADER_LEN + payload.len());
        buf.put_u8(b'w');
        buf.put_u64(start);
        buf.put_u64(end);
        buf.put_i64(self.timestamp);
        buf.put_slice(payload);

        self.lsn = end;
        buf.freeze()
    }

    /// Primary keepalive reporting the current position.
    pub fn keepalive(&self, reply_requested: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(18);
        buf.put_u8(b'k');
        buf.put_u64(self.lsn);
        buf.put_i64(self.timestamp);
        buf.put_u8(u8::from(reply_requested));
        buf.freeze()
    }

    pub fn begin_message(&mut self, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(self.lsn + 100); // final LSN of the transaction
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        self.xlog_data(&buf)
    }

    pub fn commit_message(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0); // flags
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn + 26);
        buf.put_i64(self.timestamp);
        self.xlog_data(&buf)
    }

    /// RELATION message for a relation registered with [`add_relation`].
    ///
    /// [`add_relation`]: MockMessageBuilder::add_relation
    pub fn relation_message(&mut self, rel_id: u32) -> Bytes {
        let relation = self
            .relations
            .get(&rel_id)
            .cloned()
            .expect("Relation not found. Use add_relation() first.");

        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(relation.id);
        put_cstr(&mut buf, &relation.schema);
        put_cstr(&mut buf, &relation.table);
        buf.put_u8(b'd'); // replica identity: default
        buf.put_u16(relation.columns.len() as u16);

        for column in &relation.columns {
            buf.put_u8(u8::from(column.is_key));
            put_cstr(&mut buf, &column.name);
            buf.put_u32(column.type_id);
            buf.put_i32(-1); // type modifier
        }

        self.xlog_data(&buf)
    }

    pub fn insert_message(&mut self, rel_id: u32, values: &[Option<&str>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(rel_id);
        buf.put_u8(b'N');
        put_text_tuple(&mut buf, values);
        self.xlog_data(&buf)
    }

    /// UPDATE message; `old_values` is sent as a full old tuple (`O`).
    pub fn update_message(
        &mut self,
        rel_id: u32,
        old_values: Option<&[Option<&str>]>,
        new_values: &[Option<&str>],
    ) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(rel_id);
        if let Some(old) = old_values {
            buf.put_u8(b'O');
            put_text_tuple(&mut buf, old);
        }
        buf.put_u8(b'N');
        put_text_tuple(&mut buf, new_values);
        self.xlog_data(&buf)
    }

    /// DELETE message carrying the replica identity key (`K`).
    pub fn delete_message(&mut self, rel_id: u32, key_values: &[Option<&str>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(rel_id);
        buf.put_u8(b'K');
        put_text_tuple(&mut buf, key_values);
        self.xlog_data(&buf)
    }

    pub fn binary_insert_message(&mut self, rel_id: u32, values: Vec<BinaryValue>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(rel_id);
        buf.put_u8(b'N');
        buf.put_u16(values.len() as u16);

        for value in values {
            match value {
                BinaryValue::Null => buf.put_u8(b'n'),
                BinaryValue::Unchanged => buf.put_u8(b'u'),
                BinaryValue::Text(text) => {
                    buf.put_u8(b't');
                    buf.put_i32(text.len() as i32);
                    buf.put_slice(text.as_bytes());
                }
                BinaryValue::Binary(data) => {
                    buf.put_u8(b'b');
                    buf.put_i32(data.len() as i32);
                    buf.put_slice(&data);
                }
            }
        }

        self.xlog_data(&buf)
    }

    pub fn truncate_message(&mut self, rel_ids: &[u32], options: u8) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(rel_ids.len() as u32);
        buf.put_u8(options);
        for rel_id in rel_ids {
            buf.put_u32(*rel_id);
        }
        self.xlog_data(&buf)
    }

    pub fn origin_message(&mut self, name: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'O');
        buf.put_u64(self.lsn);
        put_cstr(&mut buf, name);
        self.xlog_data(&buf)
    }

    pub fn type_message(&mut self, type_id: u32, schema: &str, name: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Y');
        buf.put_u32(type_id);
        put_cstr(&mut buf, schema);
        put_cstr(&mut buf, name);
        self.xlog_data(&buf)
    }

    /// BEGIN, RELATION, INSERT, COMMIT for relation `rel_id`.
    pub fn simple_transaction(&mut self, xid: u32, rel_id: u32, values: &[Option<&str>]) -> Vec<Bytes> {
        vec![
            self.begin_message(xid),
            self.relation_message(rel_id),
            self.insert_message(rel_id, values),
            self.commit_message(),
        ]
    }
}

impl Default for MockMessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The pgoutput message inside an XLogData frame.
pub fn logical_payload(frame: &Bytes) -> Bytes {
    frame.slice(XLOG_HEADER_LEN..)
}

fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn put_text_tuple(buf: &mut BytesMut, values: &[Option<&str>]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            Some(v) => {
                buf.put_u8(b't');
                buf.put_i32(v.len() as i32);
                buf.put_slice(v.as_bytes());
            }
            None => buf.put_u8(b'n'),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BinaryValue {
    Null,
    Unchanged,
    Text(String),
    Binary(Vec<u8>),
}

impl BinaryValue {
    pub fn bool(value: bool) -> Self {
        BinaryValue::Binary(vec![u8::from(value)])
    }

    pub fn int4(value: i32) -> Self {
        BinaryValue::Binary(value.to_be_bytes().to_vec())
    }

    pub fn int8(value: i64) -> Self {
        BinaryValue::Binary(value.to_be_bytes().to_vec())
    }

    pub fn text(value: &str) -> Self {
        BinaryValue::Text(value.to_string())
    }
}

/// Common PostgreSQL type OIDs for testing
pub mod type_oids {
    pub const BOOL: u32 = 16;
    pub const INT4: u32 = 23;
    pub const INT8: u32 = 20;
    pub const TEXT: u32 = 25;
    pub const BYTEA: u32 = 17;
    pub const VARCHAR: u32 = 1043;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const JSONB: u32 = 3802;
}

/// Predefined test scenarios
pub mod scenarios {
    use super::*;

    /// `public.users(id int4 key, name text)` cached, then one
    /// INSERT, UPDATE and DELETE inside a transaction.
    pub fn user_table_transaction() -> (MockMessageBuilder, Vec<Bytes>) {
        let mut builder = MockMessageBuilder::new().add_relation(
            16384,
            "public",
            "users",
            vec![("id", type_oids::INT4, true), ("name", type_oids::TEXT, false)],
        );

        let messages = vec![
            builder.begin_message(12345),
            builder.relation_message(16384),
            builder.insert_message(16384, &[Some("1"), Some("Alice")]),
            builder.update_message(
                16384,
                Some(&[Some("1"), Some("Alice")][..]),
                &[Some("1"), Some("Alicia")],
            ),
            builder.delete_message(16384, &[Some("1"), None]),
            builder.commit_message(),
        ];

        (builder, messages)
    }
}
