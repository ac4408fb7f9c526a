#[cfg(test)]
mod tests {
    use super::super::decoder::DecodeError;
    use super::super::dispatcher::{Dispatch, ProtocolDispatcher};
    use super::super::lsn::Lsn;
    use super::super::test_utils::{scenarios, type_oids, MockMessageBuilder, XLOG_HEADER_LEN};
    use super::super::types::{ChangeEvent, ChangeOperation, ColumnValue};
    use bytes::Bytes;

    fn users_builder() -> MockMessageBuilder {
        MockMessageBuilder::new().add_relation(
            16384,
            "public",
            "users",
            vec![("id", type_oids::INT4, true), ("name", type_oids::TEXT, false)],
        )
    }

    fn event(dispatch: Dispatch) -> ChangeEvent {
        match dispatch {
            Dispatch::Data {
                event: Some(event), ..
            } => event,
            other => panic!("expected a change event, got {:?}", other),
        }
    }

    fn text(event: &ChangeEvent, column: &str) -> Option<String> {
        event
            .row
            .as_ref()
            .and_then(|row| row.get(column))
            .and_then(ColumnValue::as_text)
            .map(str::to_string)
    }

    #[test]
    fn test_insert_after_relation() {
        let mut builder = users_builder();
        let mut dispatcher = ProtocolDispatcher::new();

        let relation = dispatcher.dispatch(builder.relation_message(16384)).unwrap();
        assert!(matches!(relation, Dispatch::Data { event: None, kind: "RELATION", .. }));
        assert_eq!(dispatcher.relations().len(), 1);

        let insert_lsn = builder.lsn();
        let insert = event(
            dispatcher
                .dispatch(builder.insert_message(16384, &[Some("1"), Some("Alice")]))
                .unwrap(),
        );

        assert_eq!(insert.op, ChangeOperation::Insert);
        assert_eq!(insert.qualified_name().as_deref(), Some("public.users"));
        assert_eq!(text(&insert, "id").as_deref(), Some("1"));
        assert_eq!(text(&insert, "name").as_deref(), Some("Alice"));
        assert_eq!(insert.lsn, insert_lsn);
    }

    #[test]
    fn test_end_lsn_covers_payload() {
        let mut builder = users_builder().with_lsn(0x1000);
        let mut dispatcher = ProtocolDispatcher::new();

        let frame = builder.relation_message(16384);
        let payload_len = frame.len() - XLOG_HEADER_LEN;

        match dispatcher.dispatch(frame).unwrap() {
            Dispatch::Data { end_lsn, .. } => {
                assert_eq!(end_lsn, Lsn::new(0x1000 + payload_len as u64));
                assert_eq!(end_lsn, builder.lsn());
            }
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_update_and_delete_with_null() {
        let mut builder = users_builder();
        let mut dispatcher = ProtocolDispatcher::new();
        dispatcher.dispatch(builder.relation_message(16384)).unwrap();

        let update = event(
            dispatcher
                .dispatch(builder.update_message(
                    16384,
                    Some(&[Some("1"), Some("Alice")][..]),
                    &[Some("1"), Some("Alicia")],
                ))
                .unwrap(),
        );
        assert_eq!(update.op, ChangeOperation::Update);
        assert_eq!(text(&update, "name").as_deref(), Some("Alicia"));
        let old_row = update.old_row.as_ref().expect("old row");
        assert_eq!(old_row.get("name").and_then(ColumnValue::as_text), Some("Alice"));

        let delete = event(
            dispatcher
                .dispatch(builder.delete_message(16384, &[Some("1"), None]))
                .unwrap(),
        );
        assert_eq!(delete.op, ChangeOperation::Delete);
        let row = delete.row.as_ref().expect("row");
        assert_eq!(row.get("id").and_then(ColumnValue::as_text), Some("1"));
        assert_eq!(row.get("name"), Some(&ColumnValue::Null));
    }

    #[test]
    fn test_unknown_relation() {
        let mut builder = MockMessageBuilder::new();
        let mut dispatcher = ProtocolDispatcher::new();

        let result = dispatcher.dispatch(builder.insert_message(99, &[Some("x")]));
        assert!(matches!(result, Err(DecodeError::UnknownRelation(99))));
    }

    #[test]
    fn test_column_count_mismatch() {
        let mut builder = users_builder();
        let mut dispatcher = ProtocolDispatcher::new();
        dispatcher.dispatch(builder.relation_message(16384)).unwrap();

        let result = dispatcher.dispatch(builder.insert_message(16384, &[Some("1")]));
        assert_eq!(
            result.unwrap_err(),
            DecodeError::ColumnCountMismatch {
                relation_id: 16384,
                expected: 2,
                actual: 1,
            }
        );
    }

    #[test]
    fn test_truncate_of_uncached_relations() {
        let mut builder = MockMessageBuilder::new();
        let mut dispatcher = ProtocolDispatcher::new();

        let truncate = event(
            dispatcher
                .dispatch(builder.truncate_message(&[16384, 16390], 0))
                .unwrap(),
        );
        assert_eq!(truncate.op, ChangeOperation::Truncate);
        assert_eq!(truncate.relation_ids, vec![16384, 16390]);
        assert!(truncate.relation.is_none());
        assert!(truncate.row.is_none());
    }

    #[test]
    fn test_xid_tracked_between_begin_and_commit() {
        let (_, frames) = scenarios::user_table_transaction();
        let mut dispatcher = ProtocolDispatcher::new();
        let mut events = Vec::new();

        for (i, frame) in frames.into_iter().enumerate() {
            if let Dispatch::Data {
                event: Some(event), ..
            } = dispatcher.dispatch(frame).unwrap()
            {
                events.push(event);
            }
            if i == 0 {
                assert_eq!(dispatcher.current_xid(), Some(12345));
            }
        }

        assert_eq!(dispatcher.current_xid(), None);
        assert_eq!(
            events.iter().map(|e| e.op).collect::<Vec<_>>(),
            vec![
                ChangeOperation::Insert,
                ChangeOperation::Update,
                ChangeOperation::Delete
            ]
        );
        assert!(events.iter().all(|e| e.xid == Some(12345)));
        assert!(events.windows(2).all(|w| w[0].lsn < w[1].lsn));
    }

    #[test]
    fn test_relation_redefinition_replaces_columns() {
        let mut builder = users_builder();
        let mut dispatcher = ProtocolDispatcher::new();
        dispatcher.dispatch(builder.relation_message(16384)).unwrap();

        let mut altered = MockMessageBuilder::new()
            .with_lsn(builder.lsn().as_u64())
            .add_relation(
                16384,
                "public",
                "users",
                vec![
                    ("id", type_oids::INT4, true),
                    ("name", type_oids::TEXT, false),
                    ("email", type_oids::TEXT, false),
                ],
            );
        dispatcher.dispatch(altered.relation_message(16384)).unwrap();
        assert_eq!(dispatcher.relations().len(), 1);

        let insert = event(
            dispatcher
                .dispatch(altered.insert_message(16384, &[Some("2"), Some("Bob"), Some("b@x")]))
                .unwrap(),
        );
        assert_eq!(text(&insert, "email").as_deref(), Some("b@x"));
    }

    #[test]
    fn test_keepalive_and_ignored_frames() {
        let builder = MockMessageBuilder::new().with_lsn(2048);
        let mut dispatcher = ProtocolDispatcher::new();

        match dispatcher.dispatch(builder.keepalive(true)).unwrap() {
            Dispatch::Keepalive {
                wal_end,
                reply_requested,
            } => {
                assert_eq!(wal_end, Lsn::new(2048));
                assert!(reply_requested);
            }
            other => panic!("expected keepalive, got {:?}", other),
        }

        assert!(matches!(
            dispatcher.dispatch(Bytes::from_static(b"x")).unwrap(),
            Dispatch::Ignored(b'x')
        ));
    }

    #[test]
    fn test_corrupted_payload_is_a_decode_error() {
        let mut builder = MockMessageBuilder::new();
        let mut dispatcher = ProtocolDispatcher::new();

        let frame = builder.xlog_data(b"I\x00\x00");
        assert!(matches!(
            dispatcher.dispatch(frame),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
