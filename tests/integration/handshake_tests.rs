//! Handshake and session-establishment behavior over an in-memory wire.

use std::sync::{Arc, Mutex};

use serde_json::json;

use acp_conduit::permission::NullChooser;
use acp_conduit::session::{AgentConnection, ConnectionState, UiSink};
use acp_conduit::{AppError, ConduitConfig};

use super::test_helpers::{connect_pair_with, plain_session, wait_until, wire};

fn test_config(dir: &tempfile::TempDir) -> ConduitConfig {
    ConduitConfig::for_command("unused-agent", dir.path())
}

/// Records state transitions for assertions.
#[derive(Default)]
struct StateRecorder(Mutex<Vec<ConnectionState>>);

impl UiSink for StateRecorder {
    fn on_state_change(&self, state: ConnectionState) {
        self.0.lock().expect("lock").push(state);
    }
}

#[tokio::test]
async fn connect_reaches_connected_and_captures_metadata() {
    let dir = tempfile::tempdir().expect("tempdir");
    let session = json!({
        "sessionId": "sess-42",
        "modes": {
            "currentModeId": "code",
            "availableModes": [
                {"id": "code", "name": "Code"},
                {"id": "plan", "name": "Plan"}
            ]
        },
        "models": {
            "currentModelId": "m1",
            "availableModels": [{"modelId": "m1"}, {"modelId": "m2", "name": "Fast"}]
        },
        "availableCommands": [{"name": "review"}]
    });

    let (connection, _agent) =
        connect_pair_with(test_config(&dir), Arc::new(NullChooser), session).await;

    assert_eq!(connection.state(), ConnectionState::Connected);
    let meta = connection.metadata().expect("metadata present");
    assert_eq!(meta.session_id, "sess-42");
    assert_eq!(meta.current_mode_id.as_deref(), Some("code"));
    assert_eq!(meta.available_modes.len(), 2);
    assert_eq!(meta.current_model_id.as_deref(), Some("m1"));
    assert_eq!(meta.available_models.len(), 2);
    assert_eq!(meta.available_commands.len(), 1);
}

#[tokio::test]
async fn session_without_modes_or_models_yields_empty_lists() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (connection, _agent) = connect_pair_with(
        test_config(&dir),
        Arc::new(NullChooser),
        plain_session("sess-min"),
    )
    .await;

    let meta = connection.metadata().expect("metadata present");
    assert!(meta.available_modes.is_empty());
    assert!(meta.current_mode_id.is_none());
    assert!(meta.available_models.is_empty());
    assert!(meta.current_model_id.is_none());
    assert!(meta.available_commands.is_empty());
}

#[tokio::test]
async fn protocol_version_mismatch_fails_and_disconnects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let connection = AgentConnection::new(test_config(&dir), Arc::new(NullChooser));
    let (client_read, client_write, mut agent) = wire();

    let (result, ()) = tokio::join!(
        connection.connect_over(client_read, client_write),
        async {
            let init = agent.recv().await;
            agent.respond(&init["id"], json!({"protocolVersion": 99})).await;
        },
    );

    let err = result.expect_err("must fail");
    assert!(matches!(err, AppError::Protocol(_)), "got {err}");
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(connection.metadata().is_none());
}

#[tokio::test]
async fn agent_error_on_initialize_fails_the_connect() {
    let dir = tempfile::tempdir().expect("tempdir");
    let connection = AgentConnection::new(test_config(&dir), Arc::new(NullChooser));
    let (client_read, client_write, mut agent) = wire();

    let (result, ()) = tokio::join!(
        connection.connect_over(client_read, client_write),
        async {
            let init = agent.recv().await;
            agent.respond_err(&init["id"], -32603, "boom").await;
        },
    );

    let err = result.expect_err("must fail");
    assert!(matches!(err, AppError::Protocol(_)), "got {err}");
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn state_transitions_are_emitted_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let connection = AgentConnection::new(test_config(&dir), Arc::new(NullChooser));
    let recorder = Arc::new(StateRecorder::default());
    connection.subscribe(recorder.clone());

    let (client_read, client_write, mut agent) = wire();
    let (result, ()) = tokio::join!(
        connection.connect_over(client_read, client_write),
        agent.serve_handshake(plain_session("sess-1")),
    );
    result.expect("connect succeeds");

    let states = recorder.0.lock().expect("lock").clone();
    assert_eq!(
        states,
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
}

#[tokio::test]
async fn preferred_model_resolves_by_substring_and_is_applied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&dir);
    config.preferred_model = Some("fast".to_owned());

    let connection = AgentConnection::new(config, Arc::new(NullChooser));
    let (client_read, client_write, mut agent) = wire();

    let (result, ()) = tokio::join!(
        connection.connect_over(client_read, client_write),
        async {
            agent
                .serve_handshake(json!({
                    "sessionId": "sess-1",
                    "models": {
                        "currentModelId": "m-default",
                        "availableModels": [
                            {"modelId": "m-default"},
                            {"modelId": "m-fast", "name": "Fast"}
                        ]
                    }
                }))
                .await;

            let set = agent.recv().await;
            assert_eq!(set["method"], "session/set_model");
            assert_eq!(set["params"]["modelId"], "m-fast");
            assert_eq!(set["params"]["sessionId"], "sess-1");
            agent.respond(&set["id"], json!(null)).await;
        },
    );
    result.expect("connect succeeds");

    // The acknowledgement does not patch the metadata; the agent's
    // `current_model_update` notification carries the switch.
    let meta = connection.metadata().expect("metadata present");
    assert_eq!(meta.current_model_id.as_deref(), Some("m-default"));

    agent
        .notify_update(
            "sess-1",
            json!({"sessionUpdate": "current_model_update", "currentModelId": "m-fast"}),
        )
        .await;
    wait_until("model patched from notification", || {
        connection
            .metadata()
            .is_some_and(|meta| meta.current_model_id.as_deref() == Some("m-fast"))
    })
    .await;
}

#[tokio::test]
async fn preferred_model_without_model_list_sends_no_request() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&dir);
    config.preferred_model = Some("fast".to_owned());

    let connection = AgentConnection::new(config, Arc::new(NullChooser));
    let (client_read, client_write, mut agent) = wire();

    let (result, ()) = tokio::join!(
        connection.connect_over(client_read, client_write),
        agent.serve_handshake(plain_session("sess-1")),
    );
    result.expect("connect succeeds");

    // The next frame on the wire must be the prompt, not a model change.
    let (prompt_result, ()) = tokio::join!(connection.prompt("hello"), async {
        let frame = agent.recv().await;
        assert_eq!(frame["method"], "session/prompt");
        agent
            .respond(&frame["id"], json!({"stopReason": "end_turn"}))
            .await;
    });
    assert_eq!(prompt_result.expect("prompt ok").stop_reason, "end_turn");
}

#[tokio::test]
async fn failed_preferred_model_request_is_non_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&dir);
    config.preferred_model = Some("m-fast".to_owned());

    let connection = AgentConnection::new(config, Arc::new(NullChooser));
    let (client_read, client_write, mut agent) = wire();

    let (result, ()) = tokio::join!(
        connection.connect_over(client_read, client_write),
        async {
            agent
                .serve_handshake(json!({
                    "sessionId": "sess-1",
                    "models": {
                        "currentModelId": "m-default",
                        "availableModels": [{"modelId": "m-default"}, {"modelId": "m-fast"}]
                    }
                }))
                .await;

            let set = agent.recv().await;
            assert_eq!(set["method"], "session/set_model");
            agent.respond_err(&set["id"], -32603, "model unavailable").await;
        },
    );

    result.expect("connect still succeeds");
    let meta = connection.metadata().expect("metadata present");
    assert_eq!(
        meta.current_model_id.as_deref(),
        Some("m-default"),
        "agent default stays selected after a failed model change"
    );
}
