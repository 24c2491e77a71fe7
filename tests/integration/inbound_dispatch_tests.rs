//! Inbound capability calls serviced over the wire: file access,
//! permission mediation, terminal proxying, and error responses.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Notify;

use acp_conduit::permission::{PermissionChooser, PermissionPolicy};
use acp_conduit::proto::wire::{PermissionOption, SessionNotification, SessionUpdate};
use acp_conduit::session::UiSink;
use acp_conduit::ConduitConfig;

use super::test_helpers::{connect_pair, connect_pair_with, plain_session, wait_until};

fn test_config(dir: &tempfile::TempDir) -> ConduitConfig {
    ConduitConfig::for_command("unused-agent", dir.path())
}

#[tokio::test]
async fn fs_write_then_windowed_read() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_connection, mut agent) = connect_pair(test_config(&dir)).await;

    agent
        .request(
            "w1",
            "fs/write_text_file",
            json!({"path": "notes.txt", "content": "line1\nline2\nline3\nline4\nline5"}),
        )
        .await;
    let reply = agent.recv().await;
    assert_eq!(reply["id"], "w1");
    assert_eq!(reply["result"], Value::Null);

    agent
        .request(
            "r1",
            "fs/read_text_file",
            json!({"path": "notes.txt", "line": 2, "limit": 2}),
        )
        .await;
    let reply = agent.recv().await;
    assert_eq!(reply["id"], "r1");
    assert_eq!(reply["result"]["content"], "line3\nline4");
}

#[tokio::test]
async fn fs_read_failure_is_an_error_response_not_a_disconnect() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (connection, mut agent) = connect_pair(test_config(&dir)).await;

    agent
        .request("r1", "fs/read_text_file", json!({"path": "missing.txt"}))
        .await;
    let reply = agent.recv().await;
    assert_eq!(reply["id"], "r1");
    assert_eq!(reply["error"]["code"], -32603);

    // The connection survives a failed call.
    let (result, ()) = tokio::join!(connection.prompt("still alive?"), async {
        let prompt = agent.recv().await;
        agent
            .respond(&prompt["id"], json!({"stopReason": "end_turn"}))
            .await;
    });
    result.expect("prompt ok");
}

#[tokio::test]
async fn unknown_method_gets_method_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_connection, mut agent) = connect_pair(test_config(&dir)).await;

    agent.request("u1", "agent/nonsense", json!({})).await;
    let reply = agent.recv().await;
    assert_eq!(reply["id"], "u1");
    assert_eq!(reply["error"]["code"], -32601);
    assert!(
        reply["error"]["message"]
            .as_str()
            .expect("message is a string")
            .contains("agent/nonsense"),
        "message names the method"
    );
}

#[tokio::test]
async fn malformed_params_get_invalid_params() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_connection, mut agent) = connect_pair(test_config(&dir)).await;

    agent
        .request("b1", "fs/read_text_file", json!({"path": 42}))
        .await;
    let reply = agent.recv().await;
    assert_eq!(reply["id"], "b1");
    assert_eq!(reply["error"]["code"], -32602);
}

#[tokio::test]
async fn garbage_lines_are_skipped_without_dropping_the_connection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (connection, mut agent) = connect_pair(test_config(&dir)).await;

    agent.send_raw("this is not json at all").await;
    agent.send_raw("").await;

    let (result, ()) = tokio::join!(connection.prompt("ping"), async {
        let prompt = agent.recv().await;
        agent
            .respond(&prompt["id"], json!({"stopReason": "end_turn"}))
            .await;
    });
    result.expect("prompt ok after garbage lines");
}

#[tokio::test]
async fn allow_all_policy_auto_selects_allow_always() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&dir);
    config.permission_policy = PermissionPolicy::AllowAll;
    let (_connection, mut agent) = connect_pair(config).await;

    agent
        .request(
            "p1",
            "session/request_permission",
            json!({
                "sessionId": "sess-1",
                "toolCall": {"title": "run tests"},
                "options": [
                    {"optionId": "once", "kind": "allow_once"},
                    {"optionId": "always", "kind": "allow_always"},
                    {"optionId": "no", "kind": "reject_once"}
                ]
            }),
        )
        .await;
    let reply = agent.recv().await;
    assert_eq!(reply["id"], "p1");
    assert_eq!(
        reply["result"]["outcome"],
        json!({"outcome": "selected", "optionId": "always"})
    );
}

#[tokio::test]
async fn ask_policy_without_a_selection_cancels() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_connection, mut agent) = connect_pair(test_config(&dir)).await;

    agent
        .request(
            "p1",
            "session/request_permission",
            json!({
                "toolCall": {},
                "options": [{"optionId": "once", "kind": "allow_once"}]
            }),
        )
        .await;
    let reply = agent.recv().await;
    assert_eq!(reply["result"]["outcome"], json!({"outcome": "cancelled"}));
}

/// Chooser that blocks until released, then selects a fixed option.
struct GatedChooser {
    gate: Arc<Notify>,
}

impl PermissionChooser for GatedChooser {
    fn choose(
        &self,
        _tool_call: &Value,
        _options: &[PermissionOption],
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + '_>> {
        let gate = Arc::clone(&self.gate);
        Box::pin(async move {
            gate.notified().await;
            Some("approved".to_owned())
        })
    }
}

/// Counts forwarded session updates.
#[derive(Default)]
struct UpdateCounter(std::sync::Mutex<usize>);

impl UiSink for UpdateCounter {
    fn on_session_update(&self, notification: &SessionNotification) {
        if matches!(notification.update, SessionUpdate::AgentMessageChunk { .. }) {
            *self.0.lock().expect("lock") += 1;
        }
    }
}

#[tokio::test]
async fn pending_permission_prompt_does_not_block_updates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gate = Arc::new(Notify::new());
    let chooser = Arc::new(GatedChooser {
        gate: Arc::clone(&gate),
    });
    let (connection, mut agent) =
        connect_pair_with(test_config(&dir), chooser, plain_session("sess-1")).await;
    let counter = Arc::new(UpdateCounter::default());
    connection.subscribe(counter.clone());

    agent
        .request(
            "p1",
            "session/request_permission",
            json!({
                "toolCall": {},
                "options": [{"optionId": "approved", "kind": "allow_once"}]
            }),
        )
        .await;

    // While the chooser is parked, updates must still flow.
    agent
        .notify_update(
            "sess-1",
            json!({
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": "still streaming"}
            }),
        )
        .await;
    wait_until("update delivered while permission pending", || {
        *counter.0.lock().expect("lock") == 1
    })
    .await;

    gate.notify_one();
    let reply = agent.recv().await;
    assert_eq!(reply["id"], "p1");
    assert_eq!(
        reply["result"]["outcome"],
        json!({"outcome": "selected", "optionId": "approved"})
    );
}

#[tokio::test]
async fn terminal_lifecycle_over_the_wire() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_connection, mut agent) = connect_pair(test_config(&dir)).await;

    agent
        .request(
            "t1",
            "terminal/create",
            json!({
                "sessionId": "sess-1",
                "command": "sh",
                "args": ["-c", "printf out; printf err 1>&2"]
            }),
        )
        .await;
    let created = agent.recv().await;
    assert_eq!(created["id"], "t1");
    let terminal_id = created["result"]["terminalId"]
        .as_str()
        .expect("terminal id")
        .to_owned();

    agent
        .request(
            "t2",
            "terminal/wait_for_exit",
            json!({"terminalId": terminal_id}),
        )
        .await;
    let exited = agent.recv().await;
    assert_eq!(exited["id"], "t2");
    assert_eq!(exited["result"]["exitCode"], 0);

    // The output pumps may still be draining right after the exit report;
    // poll until both streams landed in the buffer.
    let mut output = Value::Null;
    for attempt in 0..200 {
        let id = format!("t3-{attempt}");
        agent
            .request(&id, "terminal/output", json!({"terminalId": terminal_id}))
            .await;
        output = agent.recv().await;
        let text = output["result"]["output"].as_str().expect("output text");
        if text.contains("out") && text.contains("err") {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let text = output["result"]["output"].as_str().expect("output text");
    assert!(text.contains("out"), "stdout captured, got {text:?}");
    assert!(text.contains("err"), "stderr captured, got {text:?}");
    assert_eq!(output["result"]["truncated"], false);
    assert_eq!(output["result"]["exitStatus"]["exitCode"], 0);

    agent
        .request("t4", "terminal/release", json!({"terminalId": terminal_id}))
        .await;
    let released = agent.recv().await;
    assert_eq!(released["result"], Value::Null);

    // Released ids are unknown to output, but kill stays a no-op success.
    agent
        .request("t5", "terminal/output", json!({"terminalId": terminal_id}))
        .await;
    let gone = agent.recv().await;
    assert_eq!(gone["error"]["code"], -32603);

    agent
        .request("t6", "terminal/kill", json!({"terminalId": terminal_id}))
        .await;
    let killed = agent.recv().await;
    assert_eq!(killed["result"], Value::Null);
}
