#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire-format compatibility tests.
//!
//! These parse and emit JSON fixtures shaped exactly like the traffic the
//! collaboration server speaks, so a change that silently renames a field or
//! retags an envelope fails here rather than against a live peer.

mod common;

use scenelink::protocol::{
    CameraPose, ClientMessage, ItemPatch, Operation, OperationBatch, SceneItem, SceneState,
    ServerMessage, Transform,
};
use scenelink::ErrorCode;

// ════════════════════════════════════════════════════════════════════
// Envelope shape
// ════════════════════════════════════════════════════════════════════

#[test]
fn client_envelope_is_type_data_tagged() {
    let msg = ClientMessage::Chat {
        message: "hello".into(),
    };
    let value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value["type"], "CHAT");
    assert_eq!(value["data"]["message"], "hello");
}

#[test]
fn scene_operation_fixture_parses_as_a_server_would_receive_it() {
    let raw = r#"{
        "type": "SCENE_OPERATION",
        "data": {
            "sceneId": "00000000-0000-0000-0000-0000000005ce",
            "operations": [
                {"op": "upsert_item", "item": {"id": "sofa-1", "category": "sofas",
                    "transform": {"position": [1.0, 0.0, 2.0], "rotation": [0.0, 90.0, 0.0], "scale": [1.0, 1.0, 1.0]}}},
                {"op": "update_item", "id": "lamp-3", "patch": {"locked": true}},
                {"op": "remove_item", "id": "rug-7"},
                {"op": "scene_props", "patch": {"exposure": 0.8}}
            ],
            "version": 12,
            "requestId": "req-abc",
            "timestamp": 1700000000000
        }
    }"#;

    let msg: ClientMessage = serde_json::from_str(raw).unwrap();
    let ClientMessage::SceneOperation(batch) = msg else {
        panic!("expected SCENE_OPERATION");
    };
    assert_eq!(batch.version, 12);
    assert_eq!(batch.request_id, "req-abc");
    assert_eq!(batch.operations.len(), 4);
    match &batch.operations[0] {
        Operation::UpsertItem { item } => {
            assert_eq!(item.id, "sofa-1");
            assert_eq!(item.transform.rotation[1], 90.0);
            assert!(item.selectable, "absent selectable defaults to true");
        }
        other => panic!("expected upsert_item, got {other:?}"),
    }
    match &batch.operations[1] {
        Operation::UpdateItem { id, patch } => {
            assert_eq!(id, "lamp-3");
            assert_eq!(patch.locked, Some(true));
            assert!(patch.transform.is_none());
        }
        other => panic!("expected update_item, got {other:?}"),
    }
    assert!(matches!(&batch.operations[2], Operation::RemoveItem { id } if id == "rug-7"));
    assert!(matches!(&batch.operations[3], Operation::SceneProps { .. }));
}

#[test]
fn hello_fixture_parses_as_a_client_would_receive_it() {
    let raw = r#"{
        "type": "HELLO",
        "data": {
            "sceneId": "00000000-0000-0000-0000-0000000005ce",
            "version": 7,
            "serverTime": 1700000000123,
            "clientId": "00000000-0000-0000-0000-000000000001"
        }
    }"#;
    let msg: ServerMessage = serde_json::from_str(raw).unwrap();
    match msg {
        ServerMessage::Hello {
            version,
            server_time,
            ..
        } => {
            assert_eq!(version, 7);
            assert_eq!(server_time, 1_700_000_000_123);
        }
        other => panic!("expected HELLO, got {other:?}"),
    }
}

#[test]
fn error_codes_use_screaming_snake_case_on_the_wire() {
    let msg = ServerMessage::SceneError {
        code: ErrorCode::VersionConflict,
        message: "stale".into(),
        details: None,
    };
    let value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value["type"], "SCENE_ERROR");
    assert_eq!(value["data"]["code"], "VERSION_CONFLICT");
    // Absent details are omitted entirely, not serialized as null.
    assert!(value["data"].get("details").is_none());
}

// ════════════════════════════════════════════════════════════════════
// Tolerance and defaults
// ════════════════════════════════════════════════════════════════════

#[test]
fn unknown_payload_fields_are_ignored() {
    // A newer server may attach fields this client does not know.
    let raw = r#"{
        "type": "PONG",
        "data": {"ts": 42, "serverLoad": 0.3}
    }"#;
    let msg: ServerMessage = serde_json::from_str(raw).unwrap();
    assert!(matches!(msg, ServerMessage::Pong { ts: 42 }));
}

#[test]
fn scene_state_round_trips_with_items_in_order() {
    let mut scene = SceneState::new(common::scene_id());
    for n in 0..4 {
        scene.items.push(SceneItem::new(format!("item-{n}"), "decor"));
    }
    scene.version = 9;

    let json = serde_json::to_string(&scene).unwrap();
    let back: SceneState = serde_json::from_str(&json).unwrap();
    assert_eq!(back, scene);
    let ids: Vec<_> = back.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["item-0", "item-1", "item-2", "item-3"]);
}

#[test]
fn item_patch_with_transform_replaces_wholesale_on_apply() {
    // The wire shape: a patch carries a complete transform or none at all.
    let raw = r#"{"transform": {"position": [5.0, 0.0, 0.0], "rotation": [0.0, 0.0, 0.0], "scale": [2.0, 2.0, 2.0]}}"#;
    let patch: ItemPatch = serde_json::from_str(raw).unwrap();
    let transform = patch.transform.unwrap();
    assert_eq!(transform.scale, [2.0; 3]);
    assert_eq!(
        transform.position,
        Transform {
            position: [5.0, 0.0, 0.0],
            ..Default::default()
        }
        .position
    );
}

#[test]
fn camera_message_carries_quaternion_rotation() {
    let msg = ClientMessage::Camera {
        pose: CameraPose {
            position: [0.0, 1.75, 4.0],
            // A half-turn about Y; every component is exact in f32, so the
            // JSON numbers compare cleanly after the f32 -> f64 widening.
            rotation_quaternion: [0.0, 1.0, 0.0, 0.0],
        },
    };
    let value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value["type"], "CAMERA");
    assert_eq!(value["data"]["pose"]["rotationQuaternion"][1], 1.0);
    assert_eq!(value["data"]["pose"]["position"][1], 1.75);
}

#[test]
fn batch_round_trip_preserves_request_correlation() {
    let batch = OperationBatch {
        scene_id: common::scene_id(),
        operations: vec![common::upsert("a", "chairs")],
        version: 3,
        request_id: "11111111-2222-3333-4444-555555555555".into(),
        timestamp: 1_700_000_000_000,
    };
    let json = serde_json::to_string(&ClientMessage::SceneOperation(Box::new(batch.clone())))
        .unwrap();
    assert!(json.contains(r#""requestId":"11111111-2222-3333-4444-555555555555""#));
    let back: ClientMessage = serde_json::from_str(&json).unwrap();
    assert!(matches!(back, ClientMessage::SceneOperation(b) if *b == batch));
}
