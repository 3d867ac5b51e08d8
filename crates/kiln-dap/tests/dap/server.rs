//! Session server tests: the initialize/launch lifecycle, wire-shape
//! guarantees, dispatch errors, restart, and transport framing.

use pretty_assertions::assert_eq;
use serde_json::json;

use kiln_dap::protocol::{
    Capabilities, InitializeArguments, StoppedEventBody, ThreadEventBody, ThreadsResponseBody,
};
use kiln_dap::AdapterError;

use super::*;

#[tokio::test]
async fn test_lifecycle_initialize_configure_launch_stop() {
    let (def, _a, _b) = linear_build();
    let mut fx = start_session(def);

    let resp = fx
        .client
        .request("initialize", InitializeArguments::default())
        .await;
    assert!(resp.success);
    let caps: Capabilities = serde_json::from_value(resp.body.unwrap()).unwrap();
    assert!(caps.supports_configuration_done_request);

    fx.client.event("initialized").await;

    // No setBreakpoints at all: configurationDone still unblocks launch.
    let resp = fx.client.request("configurationDone", json!({})).await;
    assert!(resp.success);
    let resp = fx.client.request("launch", json!({})).await;
    assert!(resp.success);

    let started: ThreadEventBody = body_of(&fx.client.event("thread").await);
    assert_eq!(started.reason, "started");

    fx.adapter.stop();
    fx.client.event("terminated").await;
    let served = fx.serve.await.unwrap();
    assert!(matches!(served, Err(AdapterError::ServerStopped)));
}

#[tokio::test]
async fn test_empty_set_breakpoints_returns_empty_array() {
    let (def, _a, _b) = linear_build();
    let mut fx = start_session(def);

    fx.client
        .request("initialize", InitializeArguments::default())
        .await;
    fx.client.request("configurationDone", json!({})).await;
    fx.client.request("launch", json!({})).await;

    let resp = fx
        .client
        .request(
            "setBreakpoints",
            json!({
                "source": {"name": "Dockerfile", "path": "/tmp/Dockerfile"},
                "breakpoints": [],
            }),
        )
        .await;
    assert!(resp.success);
    let body = resp.body.unwrap();
    let breakpoints = body.get("breakpoints").expect("concrete array");
    assert!(breakpoints.is_array());
    assert_eq!(breakpoints.as_array().unwrap().len(), 0);

    fx.adapter.stop();
    let _ = fx.serve.await;
}

#[tokio::test]
async fn test_unknown_command_is_not_implemented() {
    let (def, _a, _b) = linear_build();
    let mut fx = start_session(def);

    let resp = fx.client.request("gotoTargets", json!({})).await;
    assert!(!resp.success);
    assert!(resp.message.unwrap().contains("not implemented"));
    assert_eq!(resp.command, "gotoTargets");

    fx.adapter.stop();
    let _ = fx.serve.await;
}

#[tokio::test]
async fn test_second_initialize_is_rejected() {
    let (def, _a, _b) = linear_build();
    let mut fx = start_session(def);

    let first = fx
        .client
        .request("initialize", InitializeArguments::default())
        .await;
    assert!(first.success);
    let second = fx
        .client
        .request("initialize", InitializeArguments::default())
        .await;
    assert!(!second.success);
    assert!(second.message.unwrap().contains("already initialized"));

    fx.adapter.stop();
    let _ = fx.serve.await;
}

#[tokio::test]
async fn test_step_over_session() {
    let (def, a, b) = linear_build();
    let mut fx = start_session(def);

    fx.client
        .request("initialize", InitializeArguments::default())
        .await;
    fx.client.request("configurationDone", json!({})).await;
    fx.client
        .request("launch", json!({"stopOnEntry": true}))
        .await;

    let stopped: StoppedEventBody = body_of(&fx.client.event("stopped").await);
    assert_eq!(stopped.reason, "step");
    let thread_id = stopped.thread_id;

    let threads: ThreadsResponseBody = serde_json::from_value(
        fx.client.request("threads", json!({})).await.body.unwrap(),
    )
    .unwrap();
    assert_eq!(threads.threads.len(), 1);
    assert_eq!(threads.threads[0].id, thread_id);

    let trace = fx
        .client
        .request("stackTrace", json!({"threadId": thread_id}))
        .await;
    let frames = trace.body.unwrap();
    assert_eq!(frames["stackFrames"][0]["line"], 2);
    let frame_id = frames["stackFrames"][0]["id"].as_i64().unwrap();

    // Scope and variable references compose the thread id into the upper
    // bits.
    let scopes = fx
        .client
        .request("scopes", json!({"frameId": frame_id}))
        .await;
    let scope_ref = scopes.body.unwrap()["scopes"][0]["variablesReference"]
        .as_i64()
        .unwrap();
    assert_eq!(scope_ref >> 24, thread_id);
    let variables = fx
        .client
        .request("variables", json!({"variablesReference": scope_ref}))
        .await;
    assert!(!variables.body.unwrap()["variables"]
        .as_array()
        .unwrap()
        .is_empty());

    let resp = fx
        .client
        .request("next", json!({"threadId": thread_id}))
        .await;
    assert!(resp.success);
    let stopped: StoppedEventBody = body_of(&fx.client.event("stopped").await);
    assert_eq!(stopped.reason, "step");
    let trace = fx
        .client
        .request("stackTrace", json!({"threadId": thread_id}))
        .await;
    assert_eq!(trace.body.unwrap()["stackFrames"][0]["line"], 1);
    assert_eq!(fx.engine.solved_heads(), vec![b, a]);

    fx.client
        .request("next", json!({"threadId": thread_id}))
        .await;
    let exited: ThreadEventBody = body_of(&fx.client.event("thread").await);
    assert_eq!(exited.reason, "exited");
    fx.client.event("terminated").await;

    fx.adapter.stop();
    let _ = fx.serve.await;
}

#[tokio::test]
async fn test_restart_starts_a_fresh_thread() {
    let (def, _a, _b) = linear_build();
    let mut fx = start_session(def);

    fx.client
        .request("initialize", InitializeArguments::default())
        .await;
    fx.client.request("configurationDone", json!({})).await;
    fx.client.request("launch", json!({})).await;

    let started: ThreadEventBody = body_of(&fx.client.event("thread").await);
    assert_eq!((started.reason.as_str(), started.thread_id), ("started", 1));
    fx.client.event("terminated").await;

    let resp = fx.client.request("restart", json!({})).await;
    assert!(resp.success);
    let started: ThreadEventBody = body_of(&fx.client.event("thread").await);
    assert_eq!(started.reason, "started");
    assert_eq!(started.thread_id, 2);

    fx.adapter.stop();
    let _ = fx.serve.await;
}

#[tokio::test]
async fn test_restart_before_launch_fails() {
    let (def, _a, _b) = linear_build();
    let mut fx = start_session(def);

    fx.client
        .request("initialize", InitializeArguments::default())
        .await;
    let resp = fx.client.request("restart", json!({})).await;
    assert!(!resp.success);
    assert!(resp.message.unwrap().contains("no launch configuration"));

    fx.adapter.stop();
    let _ = fx.serve.await;
}

// ── Transport framing ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_transport_round_trips_every_shape() {
    let (mut client_io, server_io) = tokio::io::duplex(4096);
    let mut reader = BufReader::new(server_io);

    let messages = vec![
        Message::Request(Request::new("threads", json!({}))),
        Message::Response(kiln_dap::protocol::Response {
            seq: 2,
            request_seq: 1,
            success: true,
            command: "threads".into(),
            message: None,
            body: Some(json!({"threads": []})),
        }),
        Message::Event(Event::new("stopped", json!({"reason": "step"}))),
    ];
    for message in &messages {
        transport::write_message(&mut client_io, message).await.unwrap();
        let read = transport::read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(&read, message);
    }
}

#[tokio::test]
async fn test_transport_requires_content_length() {
    let (mut client_io, server_io) = tokio::io::duplex(4096);
    let mut reader = BufReader::new(server_io);

    client_io.write_all(b"X-Header: 1\r\n\r\n").await.unwrap();
    drop(client_io);
    let err = transport::read_message(&mut reader).await.unwrap_err();
    assert!(matches!(err, AdapterError::MissingContentLength));
}

#[tokio::test]
async fn test_transport_clean_eof_is_none() {
    let (client_io, server_io) = tokio::io::duplex(4096);
    drop(client_io);
    let mut reader = BufReader::new(server_io);
    assert!(transport::read_message(&mut reader).await.unwrap().is_none());
}
