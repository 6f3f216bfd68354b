//! Integration tests for `RpcClient` against mock tool servers.
//!
//! Each mock peer is an inline `sh` script that prints the readiness marker
//! to stderr and answers requests on stdout, so the whole stack (spawn,
//! framing, correlation, exit handling) runs against a real child process.
//!
//! # Running
//!
//! ```bash
//! cargo test --test rpc_integration -- --nocapture
//! ```

#![cfg(unix)]

use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::timeout;

use stdio_rpc::config::ReadinessStream;
use stdio_rpc::rpc::protocol::error_codes;
use stdio_rpc::tools::{self, Coordinates, ToolResult, API_RESPONSE_PREFIX};
use stdio_rpc::{ClientConfig, ProcessState, RpcClient, RpcError};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const READY: &str = r#"echo '[Server] Transport connected. Server is listening.' >&2"#;

/// Sets `$id` and `$method` from the request in `$line`.
const PARSE_REQUEST: &str = r#"id=$(printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
method=$(printf '%s\n' "$line" | sed -n 's/.*"method":"\([^"]*\)".*/\1/p')"#;

/// Answers every request with `{"id": ..., "method": ...}`.
const ECHO_LOOP: &str = r#"while IFS= read -r line; do
id=$(printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
method=$(printf '%s\n' "$line" | sed -n 's/.*"method":"\([^"]*\)".*/\1/p')
printf '{"jsonrpc":"2.0","id":"%s","result":{"id":"%s","method":"%s"}}\n' "$id" "$id" "$method"
done"#;

fn mock(script: &str) -> ClientConfig {
    let mut config = ClientConfig::new("sh", &["-c", script]);
    config.readiness_timeout_ms = 5_000;
    config.shutdown_grace_ms = 100;
    config
}

/// A peer that signals readiness and then runs `body`.
fn ready_mock(body: &str) -> ClientConfig {
    mock(&format!("{}\n{}", READY, body))
}

async fn start(config: &ClientConfig) -> RpcClient {
    timeout(TEST_TIMEOUT, RpcClient::start(config))
        .await
        .expect("Test timed out")
        .expect("Peer should start")
}

/// Test: a tool call returns the exact result object and its payload parses.
#[tokio::test]
async fn test_invoke_returns_tool_result() {
    let body = format!(
        r#"{{"content":[{{"type":"text","text":"{}{{\"main\":{{\"temp\":21.5}},\"name\":\"New York\"}}"}}]}}"#,
        API_RESPONSE_PREFIX
    );
    let script = format!(
        "body='{}'\nwhile IFS= read -r line; do\n{}\nprintf '{{\"jsonrpc\":\"2.0\",\"id\":\"%s\",\"result\":%s}}\\n' \"$id\" \"$body\"\ndone",
        body, PARSE_REQUEST
    );
    let client = start(&ready_mock(&script)).await;
    assert!(client.is_ready());
    assert_eq!(client.state(), ProcessState::Running);

    let params = serde_json::to_value(Coordinates::new(40.7128, -74.0060)).unwrap();
    let result = timeout(TEST_TIMEOUT, client.invoke(tools::GET_WEATHER, params))
        .await
        .expect("Test timed out")
        .expect("call should succeed");

    let expected: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(result, expected);

    let payload = ToolResult::from_value(result).unwrap().payload().unwrap();
    assert_eq!(payload, json!({"main": {"temp": 21.5}, "name": "New York"}));

    client.terminate().await.expect("terminate");
}

/// Test: non-JSON and unrelated JSON lines on stdout do not disturb calls.
#[tokio::test]
async fn test_unstructured_output_is_ignored() {
    let script = format!(
        "{}\nwhile IFS= read -r line; do\n{}\necho 'debug: loaded config'\necho '{{\"status\":\"booting\"}}'\necho '{{\"id\":\"req-999\",\"result\":1}}'\nprintf '{{\"jsonrpc\":\"2.0\",\"id\":\"%s\",\"result\":\"ok\"}}\\n' \"$id\"\ndone",
        READY, PARSE_REQUEST
    );
    let client = start(&mock(&script)).await;

    let result = timeout(TEST_TIMEOUT, client.invoke("ping", json!({})))
        .await
        .expect("Test timed out")
        .expect("call should succeed");
    assert_eq!(result, json!("ok"));

    client.terminate().await.expect("terminate");
}

/// Test: each caller receives its own response when the peer answers out of order.
#[tokio::test]
async fn test_concurrent_calls_out_of_order() {
    let script = format!(
        "{}\nIFS= read -r line\n{}\nid_a=$id; method_a=$method\nIFS= read -r line\n{}\n\
         printf '{{\"jsonrpc\":\"2.0\",\"id\":\"%s\",\"result\":{{\"method\":\"%s\"}}}}\\n' \"$id\" \"$method\"\n\
         printf '{{\"jsonrpc\":\"2.0\",\"id\":\"%s\",\"result\":{{\"method\":\"%s\"}}}}\\n' \"$id_a\" \"$method_a\"\n\
         {}",
        READY, PARSE_REQUEST, PARSE_REQUEST, ECHO_LOOP
    );
    let client = start(&mock(&script)).await;

    let (weather, forecast) = timeout(TEST_TIMEOUT, async {
        tokio::join!(
            client.invoke(tools::GET_WEATHER, json!({"latitude": 1.0, "longitude": 2.0})),
            client.invoke(tools::FORECAST, json!({"latitude": 3.0, "longitude": 4.0})),
        )
    })
    .await
    .expect("Test timed out");

    assert_eq!(weather.unwrap(), json!({"method": tools::GET_WEATHER}));
    assert_eq!(forecast.unwrap(), json!({"method": tools::FORECAST}));

    // The peer keeps serving with fresh identifiers.
    let third = client.invoke("ping", json!({})).await.unwrap();
    assert_eq!(third, json!({"id": "req-3", "method": "ping"}));

    client.terminate().await.expect("terminate");
}

/// Test: a peer error is surfaced verbatim as a remote error.
#[tokio::test]
async fn test_remote_error_is_verbatim() {
    let script = format!(
        "{}\nwhile IFS= read -r line; do\n{}\n\
         printf '{{\"jsonrpc\":\"2.0\",\"id\":\"%s\",\"error\":{{\"code\":-32601,\"message\":\"Method not found\",\"data\":{{\"method\":\"%s\"}}}}}}\\n' \"$id\" \"$method\"\ndone",
        READY, PARSE_REQUEST
    );
    let client = start(&mock(&script)).await;

    let err = timeout(TEST_TIMEOUT, client.invoke("nope", json!({})))
        .await
        .expect("Test timed out")
        .unwrap_err();

    assert!(err.is_remote());
    assert!(!err.is_transport());
    match &err {
        RpcError::Remote(detail) => assert_eq!(
            detail,
            &json!({"code": -32601, "message": "Method not found", "data": {"method": "nope"}})
        ),
        other => panic!("Expected Remote error, got: {:?}", other),
    }
    let remote = err.remote_error().expect("typed error");
    assert_eq!(remote.code, error_codes::METHOD_NOT_FOUND);
    assert_eq!(err.to_string(), "remote error: [-32601] Method not found");

    client.terminate().await.expect("terminate");
}

/// Test: exit rejects every pending call with the exit code; later calls fail fast.
#[tokio::test]
async fn test_exit_rejects_pending_calls() {
    let client = start(&ready_mock("IFS= read -r a\nIFS= read -r b\nexit 1")).await;

    let (first, second) = timeout(TEST_TIMEOUT, async {
        tokio::join!(
            client.invoke("getWeather", json!({})),
            client.invoke("getWeather", json!({})),
        )
    })
    .await
    .expect("Test timed out");

    for result in [first, second] {
        match result {
            Err(RpcError::ProcessExited { code }) => assert_eq!(code, Some(1)),
            other => panic!("Expected ProcessExited, got: {:?}", other),
        }
    }

    assert_eq!(client.wait_exit().await.unwrap(), Some(1));
    assert_eq!(client.state(), ProcessState::Exited { code: Some(1) });

    let err = client.invoke("getWeather", json!({})).await.unwrap_err();
    assert!(matches!(err, RpcError::WriteAfterExit));

    // Terminating an exited peer just reports the code.
    assert_eq!(client.terminate().await.unwrap(), Some(1));
}

/// Test: a timed-out call fails alone; its late response is discarded.
#[tokio::test]
async fn test_call_timeout_then_late_response() {
    let script = format!(
        "{}\nIFS= read -r line\n{}\nsleep 0.3\n\
         printf '{{\"jsonrpc\":\"2.0\",\"id\":\"%s\",\"result\":\"late\"}}\\n' \"$id\"\n{}",
        READY, PARSE_REQUEST, ECHO_LOOP
    );
    let client = start(&mock(&script)).await;

    let started = Instant::now();
    let err = client
        .invoke_with_timeout("slow", json!({}), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "call 'slow' timed out after 50ms");
    assert!(started.elapsed() < Duration::from_secs(2));

    // Let the late response arrive and be dropped.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.state(), ProcessState::Running);

    let result = timeout(TEST_TIMEOUT, client.invoke("fast", json!({})))
        .await
        .expect("Test timed out")
        .expect("client should still work");
    assert_eq!(result, json!({"id": "req-2", "method": "fast"}));

    client.terminate().await.expect("terminate");
}

/// Test: the configured default call timeout applies to `invoke`.
#[tokio::test]
async fn test_default_call_timeout() {
    let mut config = ready_mock("exec cat >/dev/null");
    config.call_timeout_ms = Some(50);
    let client = start(&config).await;

    let err = timeout(TEST_TIMEOUT, client.invoke("never", json!({})))
        .await
        .expect("Test timed out")
        .unwrap_err();
    assert!(matches!(err, RpcError::CallTimeout { timeout_ms: 50, .. }));

    client.terminate().await.expect("terminate");
}

/// Test: calls before readiness fail without writing anything.
#[tokio::test]
async fn test_invoke_before_ready() {
    let client = RpcClient::spawn(&mock("exec sleep 30")).expect("spawn");
    assert!(!client.is_ready());

    let err = client.invoke("getWeather", json!({})).await.unwrap_err();
    assert!(matches!(err, RpcError::NotReady));
    let err = client.notify("initialized", json!({})).await.unwrap_err();
    assert!(matches!(err, RpcError::NotReady));

    timeout(TEST_TIMEOUT, client.terminate())
        .await
        .expect("Test timed out")
        .expect("terminate");
}

/// Test: a peer that never signals readiness is reported and killed.
#[tokio::test]
async fn test_readiness_timeout() {
    let mut config = mock("echo 'starting...' >&2\nexec sleep 30");
    config.readiness_timeout_ms = 100;

    let started = Instant::now();
    let err = timeout(TEST_TIMEOUT, RpcClient::start(&config))
        .await
        .expect("Test timed out")
        .err()
        .expect("start should fail");
    assert!(matches!(err, RpcError::ReadinessTimeout(d) if d == Duration::from_millis(100)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

/// Test: a peer that dies before signalling readiness fails the start early.
#[tokio::test]
async fn test_exit_before_ready() {
    let mut config = mock("echo 'boom' >&2\nexit 2");
    config.readiness_timeout_ms = 30_000;

    let err = timeout(TEST_TIMEOUT, RpcClient::start(&config))
        .await
        .expect("should not wait for the readiness timeout")
        .err()
        .expect("start should fail");
    assert!(matches!(err, RpcError::ProcessExited { code: Some(2) }));
}

/// Test: a missing executable is a spawn error.
#[tokio::test]
async fn test_start_missing_executable() {
    let config = ClientConfig::new("/nonexistent/tool-server", &[]);
    let err = RpcClient::start(&config).await.err().expect("start should fail");
    assert!(matches!(err, RpcError::Spawn { .. }));
    assert!(err.to_string().contains("/nonexistent/tool-server"));
}

/// Test: the marker may arrive on stdout, split across writes.
#[tokio::test]
async fn test_readiness_on_output_stream() {
    let script = format!(
        "printf '[Server] Transport conn'\nsleep 0.1\nprintf 'ected. Server is listening.\\n'\n{}",
        ECHO_LOOP
    );
    let mut config = mock(&script);
    config.readiness_stream = ReadinessStream::Output;
    let client = start(&config).await;

    let result = timeout(TEST_TIMEOUT, client.invoke("ping", json!({})))
        .await
        .expect("Test timed out")
        .unwrap();
    assert_eq!(result, json!({"id": "req-1", "method": "ping"}));

    client.terminate().await.expect("terminate");
}

/// Test: without a marker the client is ready as soon as it spawns.
#[tokio::test]
async fn test_no_marker_means_ready_on_spawn() {
    let mut config = mock(ECHO_LOOP);
    config.readiness_marker = None;
    let client = RpcClient::spawn(&config).expect("spawn");
    assert!(client.is_ready());

    let result = timeout(TEST_TIMEOUT, client.invoke("ping", json!({})))
        .await
        .expect("Test timed out")
        .unwrap();
    assert_eq!(result["method"], "ping");

    client.terminate().await.expect("terminate");
}

/// Test: notifications carry no identifier and expect no response.
#[tokio::test]
async fn test_notify_writes_without_identifier() {
    let script = format!(
        "{}\nIFS= read -r note\nIFS= read -r line\n{}\n\
         printf '{{\"jsonrpc\":\"2.0\",\"id\":\"%s\",\"result\":%s}}\\n' \"$id\" \"$note\"\n{}",
        READY, PARSE_REQUEST, ECHO_LOOP
    );
    let client = start(&mock(&script)).await;

    client
        .notify("notifications/initialized", json!({}))
        .await
        .expect("notify");
    let seen = timeout(TEST_TIMEOUT, client.invoke("echo-notification", json!({})))
        .await
        .expect("Test timed out")
        .unwrap();

    assert_eq!(
        seen,
        json!({"jsonrpc": "2.0", "method": "notifications/initialized", "params": {}})
    );

    client.terminate().await.expect("terminate");
}

/// Test: messages the peer sends on its own are forwarded to the subscriber.
#[tokio::test]
async fn test_peer_messages_are_forwarded() {
    let script = format!(
        "{}\necho '{{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{{\"level\":\"info\"}}}}'\n{}",
        READY, ECHO_LOOP
    );
    let mut client = start(&mock(&script)).await;
    let mut messages = client.peer_messages().expect("first take");
    assert!(client.peer_messages().is_none());

    let message = timeout(TEST_TIMEOUT, messages.recv())
        .await
        .expect("Test timed out")
        .expect("message");
    assert_eq!(message.method, "notifications/message");
    assert_eq!(message.id, None);
    assert_eq!(message.params, Some(json!({"level": "info"})));

    client.terminate().await.expect("terminate");
}

/// Test: terminate aborts pending calls, kills a stubborn peer, and is idempotent.
#[tokio::test]
async fn test_terminate_aborts_pending_calls() {
    let client = start(&ready_mock("exec sleep 30")).await;

    let (call, terminated) = timeout(TEST_TIMEOUT, async {
        tokio::join!(client.invoke("getWeather", json!({})), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            client.terminate_with_grace(Duration::from_millis(100)).await
        })
    })
    .await
    .expect("Test timed out");

    assert!(matches!(call, Err(RpcError::Terminated)));
    // Killed by signal after the grace period.
    assert_eq!(terminated.unwrap(), None);
    assert_eq!(client.state(), ProcessState::Exited { code: None });

    assert_eq!(client.terminate().await.unwrap(), None);
    let err = client.invoke("getWeather", json!({})).await.unwrap_err();
    assert!(matches!(err, RpcError::WriteAfterExit));
}

/// Test: a write the peer never reads stalls neither peer output nor terminate.
#[tokio::test]
async fn test_stuck_write_does_not_block_terminate() {
    let script = format!(
        "{}\nsleep 0.5\necho '{{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}}'\nexec sleep 30",
        READY
    );
    let mut client = start(&mock(&script)).await;
    let mut messages = client.peer_messages().expect("first take");

    // Far larger than a pipe buffer; the peer never reads stdin.
    let blob = "x".repeat(1024 * 1024);
    let err = client
        .invoke_with_timeout("big", json!({"blob": blob}), Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let message = timeout(TEST_TIMEOUT, messages.recv())
        .await
        .expect("peer output should still be handled")
        .expect("message");
    assert_eq!(message.method, "notifications/message");

    let code = timeout(Duration::from_secs(3), client.terminate())
        .await
        .expect("terminate should not hang")
        .unwrap();
    assert_eq!(code, None);
}

/// Test: a peer that closed its stdin fails the call with a write error.
#[tokio::test]
async fn test_broken_pipe_is_write_error() {
    let client = start(&mock(&format!("exec 0<&-\n{}\nexec sleep 30", READY))).await;

    let err = timeout(TEST_TIMEOUT, client.invoke("getWeather", json!({})))
        .await
        .expect("Test timed out")
        .unwrap_err();
    assert!(matches!(err, RpcError::Write(_)), "got: {:?}", err);
    assert!(err.is_transport());
    assert!(err.to_string().starts_with("failed to write to peer stdin"));

    // The process is still running; only the call failed.
    assert_eq!(client.state(), ProcessState::Running);

    client.terminate().await.expect("terminate");
}

/// Test: a peer that exits on stdin EOF finishes within the grace period.
#[tokio::test]
async fn test_terminate_orderly_exit() {
    let client = start(&ready_mock(ECHO_LOOP)).await;

    let code = timeout(TEST_TIMEOUT, client.terminate_with_grace(Duration::from_secs(5)))
        .await
        .expect("peer should exit on stdin EOF")
        .unwrap();
    assert_eq!(code, Some(0));
}

/// Test: dropping the client shuts the peer down.
#[tokio::test]
async fn test_drop_kills_peer() {
    let client = start(&ready_mock("exec sleep 30")).await;
    let pid = client.pid().expect("pid");
    drop(client);

    let deadline = Instant::now() + TEST_TIMEOUT;
    loop {
        let alive = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !alive {
            break;
        }
        assert!(Instant::now() < deadline, "peer {} still alive after drop", pid);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
