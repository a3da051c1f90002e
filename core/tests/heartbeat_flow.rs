//! End-to-end heartbeat flows against a mock orchestration server and real
//! shells. Heartbeats are driven by explicit `send_once` calls so the tests
//! never race the timer.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use serde_json::json;
use tether_core::Agent;
use tether_core::AgentConfig;
use tether_core::HeartbeatStatus;
use tether_core::ShellId;
use tether_core::inspector::NullInspector;
use tether_core::telemetry::NullTelemetry;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

const POLL_STEP: Duration = Duration::from_millis(50);
const POLL_DEADLINE: Duration = Duration::from_secs(10);

fn agent_for(server_uri: &str) -> Agent {
    let config = AgentConfig::new("tok", format!("{server_uri}/hb"));
    Agent::with_providers(config, Arc::new(NullTelemetry), Arc::new(NullInspector))
        .expect("agent construction")
}

async fn mount_once(server: &MockServer, body: Value) {
    Mock::given(method("POST"))
        .and(path("/hb"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

async fn last_request_body(server: &MockServer) -> Value {
    let requests = server.received_requests().await.expect("recording enabled");
    let request = requests.last().expect("at least one request");
    request.body_json().expect("json body")
}

/// Polls the shell's ring until `marker` shows up.
async fn wait_for_output(agent: &Agent, id: &ShellId, marker: &str) -> String {
    let deadline = Instant::now() + POLL_DEADLINE;
    loop {
        let (entries, _) = agent.pool().heartbeat_view();
        let output = entries
            .iter()
            .find(|entry| &entry.pid == id)
            .map(|entry| entry.temp.clone())
            .unwrap_or_default();
        if output.contains(marker) {
            return output;
        }
        if Instant::now() > deadline {
            panic!("marker {marker:?} not observed; last output: {output:?}");
        }
        tokio::time::sleep(POLL_STEP).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cold_start_sends_empty_state() {
    let server = MockServer::start().await;
    mount_once(&server, json!({ "statusCode": 1 })).await;

    let agent = agent_for(&server.uri());
    agent.engine().send_once().await;

    let body = last_request_body(&server).await;
    assert_eq!(body["cli_token"], json!("tok"));
    assert_eq!(body["process_output"], json!([]));
    assert_eq!(
        body["callback"],
        json!({ "process_death": [], "process_created": null })
    );
    assert!(matches!(
        agent.engine().status(),
        HeartbeatStatus::Success { .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_requested_spawn_is_reported_then_acked() {
    let server = MockServer::start().await;
    mount_once(
        &server,
        json!({ "statusCode": 1, "tasks": { "if_require_new_process": 1 } }),
    )
    .await;

    let agent = agent_for(&server.uri());
    agent.engine().send_once().await;
    assert_eq!(agent.pool().len(), 1, "spawn task created one shell");
    let created = agent
        .pool()
        .ledger_snapshot()
        .process_created
        .expect("creation notice pending");

    mount_once(&server, json!({ "statusCode": 1 })).await;
    agent.engine().send_once().await;

    let body = last_request_body(&server).await;
    let entries = body["process_output"].as_array().expect("array");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["PID"], json!(created.as_str()));
    assert_eq!(entries[0]["if_command_executed"], json!(0));
    assert_eq!(body["callback"]["process_created"], json!(created.as_str()));

    // The successful heartbeat cleared the creation notice.
    assert_eq!(agent.pool().ledger_snapshot().process_created, None);

    agent.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_stays_pending_until_confirmed() {
    let server = MockServer::start().await;
    let agent = agent_for(&server.uri());
    let id = agent.pool().spawn().expect("spawn");

    mount_once(
        &server,
        json!({
            "statusCode": 1,
            "tasks": { "command": [{ "PID": id.as_str(), "command": "echo hb-marker-$((40 + 2))" }] },
        }),
    )
    .await;
    agent.engine().send_once().await;

    let (entries, _) = agent.pool().heartbeat_view();
    assert_eq!(entries[0].if_command_executed, 1);
    assert_eq!(entries[0].status.to_string(), "executing");

    wait_for_output(&agent, &id, "hb-marker-42").await;

    mount_once(
        &server,
        json!({
            "statusCode": 1,
            "callback": { "command_executed_confirmed": [id.as_str()] },
        }),
    )
    .await;
    agent.engine().send_once().await;

    let (entries, _) = agent.pool().heartbeat_view();
    assert_eq!(entries[0].if_command_executed, 0);

    agent.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_task_reports_death_until_cleared() {
    let server = MockServer::start().await;
    let agent = agent_for(&server.uri());
    let id = agent.pool().spawn().expect("spawn");

    mount_once(
        &server,
        json!({ "statusCode": 1, "tasks": { "kill_process": [id.as_str()] } }),
    )
    .await;
    agent.engine().send_once().await;
    assert!(agent.pool().is_empty());

    mount_once(&server, json!({ "statusCode": 1 })).await;
    agent.engine().send_once().await;

    let body = last_request_body(&server).await;
    assert_eq!(body["process_output"], json!([]));
    assert_eq!(body["callback"]["process_death"], json!([id.as_str()]));

    // Cleared after the successful delivery.
    assert!(agent.pool().ledger_snapshot().process_death.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_delivery_preserves_acks_for_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hb"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let agent = agent_for(&server.uri());
    let id = agent.pool().spawn().expect("spawn");
    assert!(agent.pool().kill(&id));

    agent.engine().send_once().await;
    assert!(matches!(
        agent.engine().status(),
        HeartbeatStatus::Failed { .. }
    ));
    let pending = agent.pool().ledger_snapshot();
    assert_eq!(pending.process_death, vec![id.clone()]);
    assert_eq!(pending.process_created, Some(id.clone()));

    mount_once(&server, json!({ "statusCode": 1 })).await;
    agent.engine().send_once().await;

    let body = last_request_body(&server).await;
    assert_eq!(body["callback"]["process_death"], json!([id.as_str()]));
    assert_eq!(body["callback"]["process_created"], json!(id.as_str()));
    assert!(agent.pool().ledger_snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_status_code_ignores_acks_and_tasks() {
    let server = MockServer::start().await;
    mount_once(
        &server,
        json!({ "statusCode": 0, "tasks": { "if_require_new_process": 1 } }),
    )
    .await;

    let agent = agent_for(&server.uri());
    agent.engine().send_once().await;

    assert!(agent.pool().is_empty(), "tasks must not run");
    assert!(matches!(
        agent.engine().status(),
        HeartbeatStatus::Failed { .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_line_command_runs_as_one_line() {
    let server = MockServer::start().await;
    let agent = agent_for(&server.uri());
    let id = agent.pool().spawn().expect("spawn");

    mount_once(
        &server,
        json!({
            "statusCode": 1,
            "tasks": { "command": [{
                "PID": id.as_str(),
                "command": "echo multi-first-$((1 + 1))\necho multi-second-$((2 + 1))",
            }] },
        }),
    )
    .await;
    agent.engine().send_once().await;

    // Both segments execute despite arriving as one embedded-newline string.
    wait_for_output(&agent, &id, "multi-first-2").await;
    wait_for_output(&agent, &id, "multi-second-3").await;

    agent.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn acknowledged_output_leaves_the_ring() {
    let server = MockServer::start().await;
    let agent = agent_for(&server.uri());
    let id = agent.pool().spawn().expect("spawn");

    mount_once(
        &server,
        json!({
            "statusCode": 1,
            "tasks": { "command": [{ "PID": id.as_str(), "command": "echo ring-marker-$((5 + 5))" }] },
        }),
    )
    .await;
    agent.engine().send_once().await;
    wait_for_output(&agent, &id, "ring-marker-10").await;

    mount_once(
        &server,
        json!({
            "statusCode": 1,
            "callback": { "process_output_update_succeed": [id.as_str()] },
        }),
    )
    .await;
    agent.engine().send_once().await;

    // The shipped output was cleared; whatever the shell printed since must
    // not contain the old marker.
    let (entries, _) = agent.pool().heartbeat_view();
    assert!(!entries[0].temp.contains("ring-marker-10"));

    agent.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_spawn_overwrites_unshipped_creation_notice() {
    let server = MockServer::start().await;
    let agent = agent_for(&server.uri());

    let _first = agent.pool().spawn().expect("first spawn");
    let second = agent.pool().spawn().expect("second spawn");
    assert_eq!(
        agent.pool().ledger_snapshot().process_created,
        Some(second)
    );

    agent.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cwd_probe_updates_the_prompt() {
    let server = MockServer::start().await;
    let agent = agent_for(&server.uri());
    let id = agent.pool().spawn().expect("spawn");

    // The probe's pwd line can coalesce with the next prompt, in which case
    // the parse falls back to the previous cwd; retry until a clean chunk
    // lands.
    let deadline = Instant::now() + POLL_DEADLINE;
    let mut prompt = String::new();
    'outer: while Instant::now() < deadline {
        agent
            .pool()
            .write(&id, "cd /tmp; pwd\n")
            .expect("write command");
        let attempt_deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < attempt_deadline {
            let descriptors = agent.pool().descriptors();
            if let Some(descriptor) = descriptors.iter().find(|d| d.id == id) {
                if descriptor.cwd == "/tmp" {
                    let (entries, _) = agent.pool().heartbeat_view();
                    prompt = entries[0].cwd.clone();
                    break 'outer;
                }
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    assert!(
        prompt.ends_with(":/tmp# "),
        "prompt should reflect the new cwd, got {prompt:?}"
    );

    agent.shutdown();
}
