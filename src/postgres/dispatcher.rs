use bytes::Bytes;
use tracing::{debug, trace};

use super::decoder::{parse_copy_data, parse_logical_message, DecodeError};
use super::lsn::Lsn;
use super::messages::{LogicalMessage, ReplicationFrame, TupleData};
use super::relation::{Relation, RelationCache, TupleDecoder};
use super::types::{ChangeEvent, ChangeOperation};

/// Outcome of dispatching one CopyData frame.
#[derive(Debug)]
pub enum Dispatch {
    /// Server heartbeat. Nothing to acknowledge beyond what is already tracked.
    Keepalive { wal_end: Lsn, reply_requested: bool },
    /// An XLogData frame was fully decoded. `end_lsn` may be confirmed once
    /// `event` (if any) has been delivered.
    Data {
        end_lsn: Lsn,
        kind: &'static str,
        event: Option<ChangeEvent>,
    },
    /// Envelope tag we do not handle.
    Ignored(u8),
}

/// Turns raw CopyData frames into change events, keeping the relation cache
/// and current transaction id up to date along the way.
#[derive(Debug, Default)]
pub struct ProtocolDispatcher {
    relations: RelationCache,
    current_xid: Option<u32>,
}

impl ProtocolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relations(&self) -> &RelationCache {
        &self.relations
    }

    pub fn current_xid(&self) -> Option<u32> {
        self.current_xid
    }

    pub fn dispatch(&mut self, frame: Bytes) -> Result<Dispatch, DecodeError> {
        match parse_copy_data(frame)? {
            ReplicationFrame::Keepalive {
                wal_end,
                reply_requested,
                ..
            } => Ok(Dispatch::Keepalive {
                wal_end,
                reply_requested,
            }),
            ReplicationFrame::XLogData {
                wal_start, data, ..
            } => {
                let end_lsn = wal_start.advance(data.len());
                let message = parse_logical_message(data)?;
                let kind = message.kind();
                let event = self.apply(message, wal_start)?;
                Ok(Dispatch::Data {
                    end_lsn,
                    kind,
                    event,
                })
            }
            ReplicationFrame::Other(tag) => Ok(Dispatch::Ignored(tag)),
        }
    }

    fn apply(
        &mut self,
        message: LogicalMessage,
        lsn: Lsn,
    ) -> Result<Option<ChangeEvent>, DecodeError> {
        match message {
            LogicalMessage::Begin(begin) => {
                trace!("BEGIN: lsn={}, xid={}", begin.final_lsn, begin.xid);
                self.current_xid = Some(begin.xid);
                Ok(None)
            }
            LogicalMessage::Commit(commit) => {
                trace!("COMMIT: lsn={}", commit.end_lsn);
                self.current_xid = None;
                Ok(None)
            }
            LogicalMessage::Relation(relation) => {
                debug!(
                    relation_id = relation.id,
                    columns = relation.columns.len(),
                    "Relation cached: {}",
                    relation.qualified_name()
                );
                self.relations.upsert(relation);
                Ok(None)
            }
            LogicalMessage::Insert(insert) => self
                .row_event(ChangeOperation::Insert, insert.relation_id, &insert.tuple, None, lsn)
                .map(Some),
            LogicalMessage::Update(update) => self
                .row_event(
                    ChangeOperation::Update,
                    update.relation_id,
                    &update.new_tuple,
                    update.old_tuple.as_ref(),
                    lsn,
                )
                .map(Some),
            LogicalMessage::Delete(delete) => self
                .row_event(ChangeOperation::Delete, delete.relation_id, &delete.old_tuple, None, lsn)
                .map(Some),
            LogicalMessage::Truncate(truncate) => {
                debug!(
                    cascade = truncate.cascade(),
                    restart_identity = truncate.restart_identity(),
                    "TRUNCATE of relations {:?}",
                    truncate.relation_ids
                );
                Ok(Some(ChangeEvent::truncate(
                    truncate.relation_ids,
                    lsn,
                    self.current_xid,
                )))
            }
            LogicalMessage::Origin(origin) => {
                trace!("ORIGIN: {} at {}", origin.name, origin.commit_lsn);
                Ok(None)
            }
            LogicalMessage::Type(ty) => {
                trace!("TYPE: {}={}.{}", ty.id, ty.namespace, ty.name);
                Ok(None)
            }
            LogicalMessage::Other(tag) => {
                trace!("Ignoring pgoutput message type {}", tag as char);
                Ok(None)
            }
        }
    }

    fn row_event(
        &self,
        op: ChangeOperation,
        relation_id: u32,
        tuple: &TupleData,
        old_tuple: Option<&TupleData>,
        lsn: Lsn,
    ) -> Result<ChangeEvent, DecodeError> {
        let relation = self.resolve(relation_id)?;
        let row = TupleDecoder::decode(relation, tuple)?;
        let old_row = old_tuple
            .map(|old| TupleDecoder::decode(relation, old))
            .transpose()?;

        Ok(ChangeEvent::row_change(
            op,
            relation,
            row,
            old_row,
            lsn,
            self.current_xid,
        ))
    }

    fn resolve(&self, relation_id: u32) -> Result<&Relation, DecodeError> {
        self.relations
            .lookup(relation_id)
            .ok_or(DecodeError::UnknownRelation(relation_id))
    }
}
