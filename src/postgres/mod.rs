pub mod ack;
pub mod connection;
pub mod decoder;
pub mod dispatcher;
pub mod lsn;
pub mod messages;
pub mod relation;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;

#[cfg(test)]
mod dispatcher_tests;

pub use ack::AckScheduler;
pub use connection::{
    Connector, PgConnector, ReplicationConnection, ReplicationTransport, SlotInfo, SystemInfo,
};
pub use decoder::{parse_copy_data, parse_logical_message, DecodeError};
pub use dispatcher::{Dispatch, ProtocolDispatcher};
pub use lsn::{Lsn, ParseLsnError};
pub use messages::{LogicalMessage, ReplicationFrame, StatusUpdate, TupleColumn, TupleData};
pub use relation::{Column, Relation, RelationCache, TupleDecoder};
pub use types::*;
