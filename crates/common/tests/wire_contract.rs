use pagesync_common::crdt::envelope::DeltaEnvelope;
use pagesync_common::protocol::realtime::{PresenceEvent, RowEventType, TransportEvent};
use pagesync_common::types::{record_id_of, PayloadError, Record, RecordId};
use serde_json::json;

fn row_change_frame() -> serde_json::Value {
    json!({
        "type": "row_change",
        "payload": {
            "table": "pages",
            "event_type": "UPDATE",
            "new": {
                "id": "7f3c",
                "workspace_id": "00000000-0000-0000-0000-000000000000",
                "parent_id": null,
                "title": "Roadmap",
                "client_ref": "temp-1",
                "created_at": "2026-02-07T14:08:00Z",
                "updated_at": "2026-02-07T14:09:30Z"
            },
            "old": { "id": "7f3c" },
            "commit_timestamp": "2026-02-07T14:09:30Z"
        }
    })
}

#[test]
fn row_change_frame_decodes_into_a_typed_record() {
    let event: TransportEvent =
        serde_json::from_value(row_change_frame()).expect("row change frame should parse");
    let TransportEvent::RowChange(row) = event else {
        panic!("expected a row change");
    };
    assert_eq!(row.event_type, RowEventType::Update);
    assert_eq!(row.old.as_ref().and_then(record_id_of), Some(RecordId::from("7f3c")));

    let record = Record::decode(&row.table, row.new.as_ref().expect("new row")).expect("valid page");
    let Record::Page(page) = record else {
        panic!("pages table decodes to a page");
    };
    assert_eq!(page.title, "Roadmap");
    assert_eq!(page.client_ref.as_deref(), Some("temp-1"));
    assert!(!page.archived);
}

#[test]
fn payloads_that_break_the_schema_are_rejected_at_the_boundary() {
    let missing_title = json!({
        "id": "7f3c",
        "workspace_id": "00000000-0000-0000-0000-000000000000",
        "created_at": "2026-02-07T14:08:00Z",
        "updated_at": "2026-02-07T14:08:00Z"
    });
    assert!(matches!(
        Record::decode("pages", &missing_title),
        Err(PayloadError::Malformed { table, .. }) if table == "pages"
    ));
    assert!(matches!(Record::decode("comments", &json!({})), Err(PayloadError::UnknownTable(_))));
}

#[test]
fn presence_frames_use_event_tags() {
    let sync: TransportEvent = serde_json::from_value(json!({
        "type": "presence",
        "payload": {
            "event": "sync",
            "state": { "alice": [{ "user_id": "alice", "display_name": "Alice" }] }
        }
    }))
    .expect("presence sync should parse");
    assert_eq!(sync.kind(), "presence");
    assert!(matches!(
        sync,
        TransportEvent::Presence(PresenceEvent::Sync { ref state }) if state["alice"].len() == 1
    ));

    let leave = TransportEvent::Presence(PresenceEvent::Leave {
        key: "bob".into(),
        left_presences: vec![json!({ "user_id": "bob" })],
    });
    let value = serde_json::to_value(&leave).expect("leave should serialize");
    assert_eq!(value["payload"]["event"], "leave");
    assert_eq!(value["payload"]["key"], "bob");
}

#[test]
fn delta_broadcast_carries_a_camel_case_envelope() {
    let frame: TransportEvent = serde_json::from_value(json!({
        "type": "broadcast",
        "payload": {
            "event": "crdt-delta",
            "payload": {
                "docId": "7f3c/content",
                "senderId": "client-2",
                "delta": "AQID",
                "timestamp": "2026-02-07T14:09:30Z"
            }
        }
    }))
    .expect("broadcast frame should parse");
    let TransportEvent::Broadcast(message) = frame else {
        panic!("expected a broadcast");
    };
    assert_eq!(message.event, "crdt-delta");

    let envelope: DeltaEnvelope =
        serde_json::from_value(message.payload).expect("envelope should parse");
    assert_eq!(envelope.doc_id.as_str(), "7f3c/content");
    assert_eq!(envelope.sender_id, "client-2");
    assert!(serde_json::from_value::<DeltaEnvelope>(json!({ "docId": "x" })).is_err());
}
