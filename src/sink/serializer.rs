use std::fmt::Write;

use crate::config::OutputFormat;
use crate::postgres::{ChangeEvent, RowData};
use crate::Result;

pub struct JsonSerializer;

impl JsonSerializer {
    pub fn serialize(event: &ChangeEvent) -> Result<String> {
        serde_json::to_string(event).map_err(Into::into)
    }
}

/// One-line human readable rendering, e.g.
/// `INSERT public.users {id=1, name=Alice} @ 0/16B3748`.
pub struct TextSerializer;

impl TextSerializer {
    pub fn serialize(event: &ChangeEvent) -> String {
        let mut out = event.op.to_string();

        match event.qualified_name() {
            Some(name) => {
                out.push(' ');
                out.push_str(&name);
            }
            None => {
                let _ = write!(out, " relations {:?}", event.relation_ids);
            }
        }

        if let Some(old_row) = &event.old_row {
            out.push(' ');
            write_row(&mut out, old_row);
            out.push_str(" ->");
        }
        if let Some(row) = &event.row {
            out.push(' ');
            write_row(&mut out, row);
        }

        let _ = write!(out, " @ {}", event.lsn);
        out
    }
}

pub fn render(event: &ChangeEvent, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => JsonSerializer::serialize(event),
        OutputFormat::Text => Ok(TextSerializer::serialize(event)),
    }
}

fn write_row(out: &mut String, row: &RowData) {
    out.push('{');
    for (i, (name, value)) in row.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}={}", name, value);
    }
    out.push('}');
}
