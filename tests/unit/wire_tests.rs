//! Unit tests for frame classification and typed wire payloads.

use serde_json::{json, Value};

use acp_conduit::proto::wire::{
    error_frame, notification_frame, parse_session_notification, request_frame, response_frame,
    ContentBlock, CreateTerminalParams, Frame, PermissionOutcome, RequestPermissionResult,
    RpcError, SessionUpdate, CODE_METHOD_NOT_FOUND,
};
use acp_conduit::AppError;

// ── Frame classification ─────────────────────────────────────────────────

#[test]
fn classifies_inbound_request() {
    let line = r#"{"jsonrpc":"2.0","id":"req-1","method":"fs/read_text_file","params":{"path":"a"}}"#;
    match Frame::parse(line).expect("parses") {
        Frame::Request { id, method, params } => {
            assert_eq!(id, json!("req-1"));
            assert_eq!(method, "fs/read_text_file");
            assert_eq!(params["path"], "a");
        }
        other => panic!("expected Request, got {other:?}"),
    }
}

#[test]
fn method_without_id_is_a_notification() {
    let line = r#"{"jsonrpc":"2.0","method":"session/update","params":{}}"#;
    match Frame::parse(line).expect("parses") {
        Frame::Notification { method, .. } => assert_eq!(method, "session/update"),
        other => panic!("expected Notification, got {other:?}"),
    }
}

#[test]
fn method_with_null_id_is_a_notification() {
    let line = r#"{"jsonrpc":"2.0","id":null,"method":"session/update","params":{}}"#;
    assert!(matches!(
        Frame::parse(line).expect("parses"),
        Frame::Notification { .. }
    ));
}

#[test]
fn missing_params_defaults_to_null() {
    let line = r#"{"jsonrpc":"2.0","method":"session/update"}"#;
    match Frame::parse(line).expect("parses") {
        Frame::Notification { params, .. } => assert_eq!(params, Value::Null),
        other => panic!("expected Notification, got {other:?}"),
    }
}

#[test]
fn classifies_success_response() {
    let line = r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#;
    match Frame::parse(line).expect("parses") {
        Frame::Response { id, result } => {
            assert_eq!(id, 7);
            assert_eq!(result["ok"], true);
        }
        other => panic!("expected Response, got {other:?}"),
    }
}

#[test]
fn classifies_error_response() {
    let line = r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32601,"message":"nope"}}"#;
    match Frame::parse(line).expect("parses") {
        Frame::ErrorResponse { id, error } => {
            assert_eq!(id, 7);
            assert_eq!(error.code, CODE_METHOD_NOT_FOUND);
            assert_eq!(error.message, "nope");
        }
        other => panic!("expected ErrorResponse, got {other:?}"),
    }
}

#[test]
fn rejects_malformed_json() {
    let err = Frame::parse("{not json").expect_err("must fail");
    assert!(matches!(err, AppError::Protocol(_)), "got {err}");
}

#[test]
fn rejects_non_object_frames() {
    let err = Frame::parse("[1,2,3]").expect_err("must fail");
    assert!(matches!(err, AppError::Protocol(_)), "got {err}");
}

#[test]
fn rejects_response_without_result_or_error() {
    let err = Frame::parse(r#"{"jsonrpc":"2.0","id":3}"#).expect_err("must fail");
    assert!(matches!(err, AppError::Protocol(_)), "got {err}");
}

// ── Frame builders ───────────────────────────────────────────────────────

#[test]
fn request_frame_carries_jsonrpc_version() {
    let frame = request_frame(42, "session/prompt", json!({"x": 1}));
    assert_eq!(frame["jsonrpc"], "2.0");
    assert_eq!(frame["id"], 42);
    assert_eq!(frame["method"], "session/prompt");
    assert_eq!(frame["params"]["x"], 1);
}

#[test]
fn notification_frame_has_no_id() {
    let frame = notification_frame("session/cancel", json!({}));
    assert!(frame.get("id").is_none());
}

#[test]
fn response_frames_echo_the_inbound_id_verbatim() {
    let id = json!("string-id-7");
    let ok = response_frame(&id, json!({"done": true}));
    assert_eq!(ok["id"], "string-id-7");

    let err = error_frame(&id, &RpcError::method_not_found("x/y"));
    assert_eq!(err["id"], "string-id-7");
    assert_eq!(err["error"]["code"], CODE_METHOD_NOT_FOUND);
}

// ── Typed payloads ───────────────────────────────────────────────────────

#[test]
fn content_block_serializes_with_type_tag() {
    let block = ContentBlock::text("hi");
    let value = serde_json::to_value(&block).expect("serializes");
    assert_eq!(value, json!({"type": "text", "text": "hi"}));
}

#[test]
fn permission_outcome_wire_shapes() {
    let selected = RequestPermissionResult {
        outcome: PermissionOutcome::Selected {
            option_id: "allow-1".to_owned(),
        },
    };
    assert_eq!(
        serde_json::to_value(&selected).expect("serializes"),
        json!({"outcome": {"outcome": "selected", "optionId": "allow-1"}})
    );

    let cancelled = serde_json::to_value(PermissionOutcome::Cancelled).expect("serializes");
    assert_eq!(cancelled, json!({"outcome": "cancelled"}));
}

#[test]
fn terminal_create_params_use_camel_case() {
    let params: CreateTerminalParams = serde_json::from_value(json!({
        "sessionId": "s1",
        "command": "cargo",
        "args": ["check"],
        "outputByteLimit": 2048
    }))
    .expect("deserializes");

    assert_eq!(params.command, "cargo");
    assert_eq!(params.output_byte_limit, Some(2048));
    assert!(params.env.is_empty());
    assert!(params.cwd.is_none());
}

// ── Session updates ──────────────────────────────────────────────────────

#[test]
fn parses_agent_message_chunk() {
    let params = json!({
        "sessionId": "s1",
        "update": {
            "sessionUpdate": "agent_message_chunk",
            "content": {"type": "text", "text": "hello"}
        }
    });

    let notification = parse_session_notification(&params).expect("parses");
    assert_eq!(notification.session_id, "s1");
    match notification.update {
        SessionUpdate::AgentMessageChunk { content } => assert_eq!(content["text"], "hello"),
        other => panic!("expected AgentMessageChunk, got {other:?}"),
    }
}

#[test]
fn parses_metadata_patching_updates() {
    let mode = json!({
        "sessionId": "s1",
        "update": {"sessionUpdate": "current_mode_update", "currentModeId": "plan"}
    });
    match parse_session_notification(&mode).expect("parses").update {
        SessionUpdate::CurrentModeUpdate { current_mode_id } => {
            assert_eq!(current_mode_id, "plan");
        }
        other => panic!("expected CurrentModeUpdate, got {other:?}"),
    }

    let commands = json!({
        "sessionId": "s1",
        "update": {
            "sessionUpdate": "available_commands_update",
            "availableCommands": [{"name": "review"}]
        }
    });
    match parse_session_notification(&commands).expect("parses").update {
        SessionUpdate::AvailableCommandsUpdate { available_commands } => {
            assert_eq!(available_commands.len(), 1);
            assert_eq!(available_commands[0].name, "review");
        }
        other => panic!("expected AvailableCommandsUpdate, got {other:?}"),
    }
}

#[test]
fn unknown_update_kind_degrades_to_other() {
    let params = json!({
        "sessionId": "s1",
        "update": {"sessionUpdate": "shiny_new_kind", "payload": 9}
    });

    let notification = parse_session_notification(&params).expect("parses");
    match notification.update {
        SessionUpdate::Other(value) => {
            assert_eq!(value["sessionUpdate"], "shiny_new_kind");
            assert_eq!(value["payload"], 9);
        }
        other => panic!("expected Other, got {other:?}"),
    }
}

#[test]
fn missing_session_id_is_a_protocol_error() {
    let err = parse_session_notification(&json!({"update": {}})).expect_err("must fail");
    assert!(matches!(err, AppError::Protocol(_)), "got {err}");
}
