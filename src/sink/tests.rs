#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::config::OutputFormat;
    use crate::postgres::{
        ChangeEvent, ChangeOperation, Column, ColumnValue, Lsn, Relation, RowData,
    };
    use bytes::Bytes;
    use serde_json::{json, Value};
    use tokio_stream::StreamExt;

    fn users() -> Relation {
        Relation {
            id: 16384,
            namespace: "public".to_string(),
            name: "users".to_string(),
            replica_identity: b'd',
            columns: vec![
                Column {
                    name: "id".to_string(),
                    type_oid: 23,
                    type_modifier: -1,
                    is_key: true,
                },
                Column {
                    name: "name".to_string(),
                    type_oid: 25,
                    type_modifier: -1,
                    is_key: false,
                },
            ],
        }
    }

    fn row(id: &str, name: ColumnValue) -> RowData {
        let mut row = RowData::with_capacity(2);
        row.push("id", ColumnValue::Text(id.to_string()));
        row.push("name", name);
        row
    }

    fn create_test_event(op: ChangeOperation) -> ChangeEvent {
        let old_row = match op {
            ChangeOperation::Update => Some(row("1", ColumnValue::Text("Alice".to_string()))),
            _ => None,
        };
        ChangeEvent::row_change(
            op,
            &users(),
            row("1", ColumnValue::Text("Alicia".to_string())),
            old_row,
            Lsn::new(0x16B3748),
            Some(12345),
        )
    }

    #[test]
    fn test_json_serialization() {
        let event = create_test_event(ChangeOperation::Insert);
        let json: Value = serde_json::from_str(&JsonSerializer::serialize(&event).unwrap()).unwrap();

        assert_eq!(json["op"], "INSERT");
        assert_eq!(
            json["relation"],
            json!({"id": 16384, "namespace": "public", "name": "users"})
        );
        assert_eq!(json["row"], json!({"id": "1", "name": "Alicia"}));
        assert_eq!(json["lsn"], "0/16B3748");
        assert_eq!(json["xid"], 12345);
        assert!(json.get("old_row").is_none());
        assert!(json.get("relation_ids").is_none());
    }

    #[test]
    fn test_json_update_carries_old_row() {
        let event = create_test_event(ChangeOperation::Update);
        let json: Value = serde_json::from_str(&JsonSerializer::serialize(&event).unwrap()).unwrap();

        assert_eq!(json["op"], "UPDATE");
        assert_eq!(json["old_row"]["name"], "Alice");
        assert_eq!(json["row"]["name"], "Alicia");
    }

    #[test]
    fn test_json_null_and_binary_values() {
        let mut values = RowData::default();
        values.push("id", ColumnValue::Binary(Bytes::from_static(&[0, 0, 0, 7])));
        values.push("name", ColumnValue::Null);
        let event = ChangeEvent::row_change(
            ChangeOperation::Insert,
            &users(),
            values,
            None,
            Lsn::ZERO,
            None,
        );
        let json: Value = serde_json::from_str(&JsonSerializer::serialize(&event).unwrap()).unwrap();

        assert_eq!(json["row"], json!({"id": "AAAABw==", "name": null}));
        assert!(json.get("xid").is_none());
    }

    #[test]
    fn test_text_serialization() {
        let insert = create_test_event(ChangeOperation::Insert);
        assert_eq!(
            TextSerializer::serialize(&insert),
            "INSERT public.users {id=1, name=Alicia} @ 0/16B3748"
        );

        let update = create_test_event(ChangeOperation::Update);
        assert_eq!(
            TextSerializer::serialize(&update),
            "UPDATE public.users {id=1, name=Alice} -> {id=1, name=Alicia} @ 0/16B3748"
        );

        let truncate = ChangeEvent::truncate(vec![16384, 16390], Lsn::new(0x20), None);
        assert_eq!(
            TextSerializer::serialize(&truncate),
            "TRUNCATE relations [16384, 16390] @ 0/20"
        );
    }

    #[tokio::test]
    async fn test_console_sink_writes_one_line_per_event() {
        let mut sink = ConsoleSink::with_writer(Vec::new(), OutputFormat::Text);
        sink.emit(create_test_event(ChangeOperation::Insert))
            .await
            .unwrap();
        sink.emit(create_test_event(ChangeOperation::Delete))
            .await
            .unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("INSERT public.users"));
        assert!(lines[1].starts_with("DELETE public.users"));
    }

    #[tokio::test]
    async fn test_channel_sink_preserves_order() {
        let (mut sink, mut events) = ChannelSink::new(4);
        for op in [
            ChangeOperation::Insert,
            ChangeOperation::Update,
            ChangeOperation::Delete,
        ] {
            sink.emit(create_test_event(op)).await.unwrap();
        }
        drop(sink);

        let mut received = Vec::new();
        while let Some(event) = events.next().await {
            received.push(event.op);
        }
        assert_eq!(
            received,
            vec![
                ChangeOperation::Insert,
                ChangeOperation::Update,
                ChangeOperation::Delete
            ]
        );
    }

    #[tokio::test]
    async fn test_channel_sink_fails_when_consumer_is_gone() {
        let (mut sink, events) = ChannelSink::new(1);
        drop(events);

        let result = sink.emit(create_test_event(ChangeOperation::Insert)).await;
        assert!(matches!(result, Err(crate::Error::Sink(_))));
    }

    #[tokio::test]
    async fn test_forwarder_drains_queue() {
        let (mut sink, events) = ChannelSink::new(2);
        let forwarder = spawn_forwarder(
            events,
            ConsoleSink::with_writer(tokio::io::sink(), OutputFormat::Json),
        );

        for _ in 0..5 {
            sink.emit(create_test_event(ChangeOperation::Insert))
                .await
                .unwrap();
        }
        drop(sink);

        assert_eq!(forwarder.await.unwrap().unwrap(), 5);
    }
}
