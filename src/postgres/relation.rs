use std::collections::HashMap;
use tracing::debug;

use super::decoder::DecodeError;
use super::messages::{TupleColumn, TupleData};
use super::types::{ColumnValue, RowData};

/// Table schema announced by a Relation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
    pub is_key: bool,
}

impl Relation {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

/// Relation id to schema mapping for one session.
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<u32, Relation>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `relation`, replacing any earlier definition with the same id.
    pub fn upsert(&mut self, relation: Relation) {
        if let Some(previous) = self.relations.insert(relation.id, relation) {
            debug!(
                relation_id = previous.id,
                "Replaced cached relation {}",
                previous.qualified_name()
            );
        }
    }

    pub fn lookup(&self, id: u32) -> Option<&Relation> {
        self.relations.get(&id)
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

/// Pairs raw tuple columns with a relation's column names.
pub struct TupleDecoder;

impl TupleDecoder {
    pub fn decode(relation: &Relation, tuple: &TupleData) -> Result<RowData, DecodeError> {
        if tuple.columns.len() != relation.columns.len() {
            return Err(DecodeError::ColumnCountMismatch {
                relation_id: relation.id,
                expected: relation.columns.len(),
                actual: tuple.columns.len(),
            });
        }

        let mut row = RowData::with_capacity(relation.columns.len());
        for (column, data) in relation.columns.iter().zip(&tuple.columns) {
            let value = match data {
                TupleColumn::Null => ColumnValue::Null,
                TupleColumn::UnchangedToast => ColumnValue::Unchanged,
                TupleColumn::Text(bytes) => {
                    ColumnValue::Text(String::from_utf8_lossy(bytes).into_owned())
                }
                TupleColumn::Binary(bytes) => ColumnValue::Binary(bytes.clone()),
            };
            row.push(column.name.clone(), value);
        }

        Ok(row)
    }
}
