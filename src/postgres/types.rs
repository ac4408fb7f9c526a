use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

use super::lsn::Lsn;
use super::relation::Relation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
            ChangeOperation::Truncate => "TRUNCATE",
        };
        f.write_str(name)
    }
}

/// Identity of the table a row event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationRef {
    pub id: u32,
    pub namespace: String,
    pub name: String,
}

impl From<&Relation> for RelationRef {
    fn from(relation: &Relation) -> Self {
        Self {
            id: relation.id,
            namespace: relation.namespace.clone(),
            name: relation.name.clone(),
        }
    }
}

impl fmt::Display for RelationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Decoded value of a single column.
///
/// `Null` is distinct from an empty `Text`. `Unchanged` marks a TOASTed value
/// the server did not resend; JSON output omits such columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Null,
    Unchanged,
    Text(String),
    Binary(Bytes),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => f.write_str("NULL"),
            ColumnValue::Unchanged => f.write_str("<unchanged>"),
            ColumnValue::Text(text) => f.write_str(text),
            ColumnValue::Binary(bytes) => {
                write!(f, "\\x")?;
                for byte in bytes.iter() {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for ColumnValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ColumnValue::Null | ColumnValue::Unchanged => serializer.serialize_none(),
            ColumnValue::Text(text) => serializer.serialize_str(text),
            ColumnValue::Binary(bytes) => serializer
                .serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes)),
        }
    }
}

/// Column name to value mapping that preserves the relation's column order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowData {
    columns: Vec<(String, ColumnValue)>,
}

impl RowData {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            columns: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: ColumnValue) {
        self.columns.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl Serialize for RowData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let present = self
            .columns
            .iter()
            .filter(|(_, value)| *value != ColumnValue::Unchanged);
        let mut map = serializer.serialize_map(None)?;
        for (name, value) in present {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// A decoded row-level change, ready for a sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub op: ChangeOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationRef>,
    /// Relations affected by a TRUNCATE, as raw ids.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub relation_ids: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<RowData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_row: Option<RowData>,
    pub lsn: Lsn,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xid: Option<u32>,
    pub ts_ms: i64,
}

impl ChangeEvent {
    pub fn row_change(
        op: ChangeOperation,
        relation: &Relation,
        row: RowData,
        old_row: Option<RowData>,
        lsn: Lsn,
        xid: Option<u32>,
    ) -> Self {
        Self {
            op,
            relation: Some(RelationRef::from(relation)),
            relation_ids: Vec::new(),
            row: Some(row),
            old_row,
            lsn,
            xid,
            ts_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn truncate(relation_ids: Vec<u32>, lsn: Lsn, xid: Option<u32>) -> Self {
        Self {
            op: ChangeOperation::Truncate,
            relation: None,
            relation_ids,
            row: None,
            old_row: None,
            lsn,
            xid,
            ts_ms: Utc::now().timestamp_millis(),
        }
    }

    /// `namespace.name` of the affected relation, if the event has one.
    pub fn qualified_name(&self) -> Option<String> {
        self.relation.as_ref().map(ToString::to_string)
    }
}
