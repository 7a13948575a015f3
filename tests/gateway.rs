use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::routing::any;
use axum::Router;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use cordial::gateway::events::Command;
use cordial::{CloseOutcome, Event, GatewayConfig, GatewayError, Shard};

/// Serve a bare websocket endpoint and hand each upgraded connection to
/// the test, which plays the gateway's side of the protocol by hand.
async fn spawn_gateway() -> (String, mpsc::UnboundedReceiver<WebSocket>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().route(
        "/",
        any(move |ws: WebSocketUpgrade| {
            let tx = tx.clone();
            async move {
                ws.on_upgrade(move |socket| async move {
                    let _ = tx.send(socket);
                })
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://127.0.0.1:{}", addr.port()), rx)
}

fn test_config(url: &str) -> GatewayConfig {
    let mut config = GatewayConfig::new("test-token").compress(false);
    config.gateway_url = url.to_string();
    config
}

async fn recv_json(socket: &mut WebSocket) -> Value {
    loop {
        let msg = socket
            .recv()
            .await
            .expect("socket closed")
            .expect("socket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_json(socket: &mut WebSocket, payload: Value) {
    socket
        .send(Message::Text(payload.to_string().into()))
        .await
        .unwrap();
}

async fn send_hello(socket: &mut WebSocket, interval_ms: u64) {
    send_json(
        socket,
        json!({ "op": 10, "d": { "heartbeat_interval": interval_ms } }),
    )
    .await;
}

async fn close_with(mut socket: WebSocket, code: u16) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: "".into() })))
        .await;
}

#[tokio::test]
async fn test_identify_follows_hello() {
    let (url, mut conns) = spawn_gateway().await;
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (mut shard, _handle) = Shard::new(test_config(&url), event_tx);
    let task = tokio::spawn(async move { shard.run().await });

    let mut socket = conns.recv().await.unwrap();
    send_hello(&mut socket, 60_000).await;

    let identify = recv_json(&mut socket).await;
    assert_eq!(identify["op"], 2, "expected IDENTIFY after HELLO");
    assert_eq!(identify["d"]["token"], "test-token");
    assert_eq!(identify["d"]["compress"], false);
    assert_eq!(identify["d"]["large_threshold"], 250);
    assert!(
        identify["d"].get("shard").is_none(),
        "single-shard IDENTIFY must omit the shard pair"
    );

    assert!(matches!(events.recv().await, Some(Event::Connected)));

    close_with(socket, 4000).await;
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, CloseOutcome::Reconnect { resumable: true });
    assert!(matches!(events.recv().await, Some(Event::Disconnected)));
}

#[tokio::test]
async fn test_ready_then_resume_on_next_connection() {
    let (url, mut conns) = spawn_gateway().await;
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (mut shard, _handle) = Shard::new(test_config(&url), event_tx);

    let task = tokio::spawn(async move {
        let outcome = shard.run().await;
        (outcome, shard)
    });

    let mut socket = conns.recv().await.unwrap();
    send_hello(&mut socket, 60_000).await;
    let identify = recv_json(&mut socket).await;
    assert_eq!(identify["op"], 2);

    send_json(
        &mut socket,
        json!({ "op": 0, "s": 1, "t": "READY", "d": { "v": 10, "session_id": "sess-1" } }),
    )
    .await;
    send_json(
        &mut socket,
        json!({ "op": 0, "s": 5, "t": "MESSAGE_CREATE", "d": { "content": "hi" } }),
    )
    .await;

    assert!(matches!(events.recv().await, Some(Event::Connected)));
    match events.recv().await {
        Some(Event::Dispatch { name, seq, data }) => {
            assert_eq!(name, "READY");
            assert_eq!(seq, 1);
            assert_eq!(data["session_id"], "sess-1");
        }
        other => panic!("expected READY dispatch, got {other:?}"),
    }
    match events.recv().await {
        Some(Event::Dispatch { name, seq, .. }) => {
            assert_eq!(name, "MESSAGE_CREATE");
            assert_eq!(seq, 5);
        }
        other => panic!("expected MESSAGE_CREATE dispatch, got {other:?}"),
    }

    close_with(socket, 4000).await;
    let (outcome, mut shard) = task.await.unwrap();
    assert_eq!(outcome.unwrap(), CloseOutcome::Reconnect { resumable: true });
    assert!(matches!(events.recv().await, Some(Event::Disconnected)));

    let session = shard.session();
    assert!(session.can_resume());
    assert_eq!(session.sequence, Some(5));

    // The surviving session must RESUME, not IDENTIFY.
    let task = tokio::spawn(async move {
        let outcome = shard.run().await;
        (outcome, shard)
    });
    let mut socket = conns.recv().await.unwrap();
    send_hello(&mut socket, 60_000).await;
    let resume = recv_json(&mut socket).await;
    assert_eq!(resume["op"], 6, "expected RESUME on reconnect");
    assert_eq!(resume["d"]["session_id"], "sess-1");
    assert_eq!(resume["d"]["seq"], 5);

    send_json(&mut socket, json!({ "op": 0, "s": 6, "t": "RESUMED", "d": null })).await;
    assert!(matches!(events.recv().await, Some(Event::Connected)));
    assert!(matches!(events.recv().await, Some(Event::Resumed)));

    close_with(socket, 4000).await;
    let _ = task.await.unwrap();
}

#[tokio::test]
async fn test_missing_ack_closes_the_shard_locally() {
    let (url, mut conns) = spawn_gateway().await;
    let (event_tx, _events) = mpsc::unbounded_channel();
    let (mut shard, _handle) = Shard::new(test_config(&url), event_tx);
    let task = tokio::spawn(async move { shard.run().await });

    let mut socket = conns.recv().await.unwrap();
    send_hello(&mut socket, 400).await;
    let identify = recv_json(&mut socket).await;
    assert_eq!(identify["op"], 2);

    // The first heartbeat arrives on schedule; never acknowledge it.
    let heartbeat = recv_json(&mut socket).await;
    assert_eq!(heartbeat["op"], 1);
    assert_eq!(heartbeat["d"], Value::Null);

    // The next tick detects the zombie and tears down without a close
    // handshake from our side of the socket.
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, CloseOutcome::Reconnect { resumable: true });
}

#[tokio::test]
async fn test_server_heartbeat_request_is_answered_immediately() {
    let (url, mut conns) = spawn_gateway().await;
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (mut shard, _handle) = Shard::new(test_config(&url), event_tx);
    let task = tokio::spawn(async move { shard.run().await });

    let mut socket = conns.recv().await.unwrap();
    send_hello(&mut socket, 60_000).await;
    let _identify = recv_json(&mut socket).await;

    // Raise the stored sequence first so the reply carries it.
    send_json(&mut socket, json!({ "op": 0, "s": 3, "t": "TYPING_START", "d": {} })).await;
    send_json(&mut socket, json!({ "op": 1 })).await;

    // Far sooner than the 60s cadence.
    let reply = recv_json(&mut socket).await;
    assert_eq!(reply["op"], 1);
    assert_eq!(reply["d"], 3);

    assert!(matches!(events.recv().await, Some(Event::Connected)));
    close_with(socket, 4000).await;
    let _ = task.await.unwrap();
}

#[tokio::test]
async fn test_commands_flow_through_the_handle() {
    let (url, mut conns) = spawn_gateway().await;
    let (event_tx, _events) = mpsc::unbounded_channel();
    let (mut shard, handle) = Shard::new(test_config(&url), event_tx);
    let task = tokio::spawn(async move { shard.run().await });

    let mut socket = conns.recv().await.unwrap();
    send_hello(&mut socket, 60_000).await;
    let _identify = recv_json(&mut socket).await;

    assert!(handle.update_presence(json!({ "status": "dnd" })));
    let presence = recv_json(&mut socket).await;
    assert_eq!(presence["op"], 3);
    assert_eq!(presence["d"]["status"], "dnd");
    assert_eq!(presence["d"]["since"], Value::Null);
    assert_eq!(presence["d"]["afk"], false);

    assert!(handle.update_voice_state("g1", Some("c1".into()), false, true));
    let voice = recv_json(&mut socket).await;
    assert_eq!(voice["op"], 4);
    assert_eq!(voice["d"]["guild_id"], "g1");
    assert_eq!(voice["d"]["channel_id"], "c1");
    assert_eq!(voice["d"]["self_deaf"], true);

    assert!(handle.close());
    match socket.recv().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => assert_eq!(frame.code, 1000),
        other => panic!("expected a close frame, got {other:?}"),
    }
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, CloseOutcome::Closed);
}

#[tokio::test]
async fn test_oversized_command_never_reaches_the_server() {
    let (url, mut conns) = spawn_gateway().await;
    let (event_tx, _events) = mpsc::unbounded_channel();
    let (mut shard, handle) = Shard::new(test_config(&url), event_tx);
    let task = tokio::spawn(async move { shard.run().await });

    let mut socket = conns.recv().await.unwrap();
    send_hello(&mut socket, 60_000).await;
    let _identify = recv_json(&mut socket).await;

    assert!(handle.send(Command::Raw(json!({
        "op": 3,
        "d": { "padding": "x".repeat(8192) },
    }))));

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, GatewayError::PayloadTooLarge { size } if size > 4096));
    assert!(err.is_fatal());

    // Nothing but the connection teardown should reach the server.
    let mut saw_payload = false;
    while let Some(Ok(msg)) = socket.recv().await {
        if matches!(msg, Message::Text(_)) {
            saw_payload = true;
        }
    }
    assert!(!saw_payload, "oversized payload leaked onto the wire");
}

#[tokio::test]
async fn test_invalid_session_resumable_reconnects() {
    let (url, mut conns) = spawn_gateway().await;
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (mut shard, _handle) = Shard::new(test_config(&url), event_tx);
    let task = tokio::spawn(async move { shard.run().await });

    let mut socket = conns.recv().await.unwrap();
    send_hello(&mut socket, 60_000).await;
    let _identify = recv_json(&mut socket).await;

    send_json(&mut socket, json!({ "op": 9, "d": true })).await;

    assert!(matches!(events.recv().await, Some(Event::Connected)));
    assert!(matches!(
        events.recv().await,
        Some(Event::InvalidSession { resumable: true })
    ));
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, CloseOutcome::Reconnect { resumable: true });
}

#[tokio::test]
async fn test_reconnect_request_from_server() {
    let (url, mut conns) = spawn_gateway().await;
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (mut shard, _handle) = Shard::new(test_config(&url), event_tx);
    let task = tokio::spawn(async move { shard.run().await });

    let mut socket = conns.recv().await.unwrap();
    send_hello(&mut socket, 60_000).await;
    let _identify = recv_json(&mut socket).await;

    send_json(&mut socket, json!({ "op": 7, "d": null })).await;

    assert!(matches!(events.recv().await, Some(Event::Connected)));
    assert!(matches!(events.recv().await, Some(Event::Reconnect)));
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, CloseOutcome::Reconnect { resumable: true });
}

#[tokio::test]
async fn test_auth_failure_close_is_fatal() {
    let (url, mut conns) = spawn_gateway().await;
    let (event_tx, _events) = mpsc::unbounded_channel();
    let (mut shard, _handle) = Shard::new(test_config(&url), event_tx);
    let task = tokio::spawn(async move { shard.run().await });

    let mut socket = conns.recv().await.unwrap();
    send_hello(&mut socket, 60_000).await;
    let _identify = recv_json(&mut socket).await;

    close_with(socket, 4004).await;
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, GatewayError::AuthenticationFailed));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_session_timeout_close_forces_fresh_identify() {
    let (url, mut conns) = spawn_gateway().await;
    let (event_tx, _events) = mpsc::unbounded_channel();
    let (mut shard, _handle) = Shard::new(test_config(&url), event_tx);

    let task = tokio::spawn(async move {
        let outcome = shard.run().await;
        (outcome, shard)
    });

    let mut socket = conns.recv().await.unwrap();
    send_hello(&mut socket, 60_000).await;
    let _identify = recv_json(&mut socket).await;
    send_json(
        &mut socket,
        json!({ "op": 0, "s": 1, "t": "READY", "d": { "session_id": "sess-1" } }),
    )
    .await;

    close_with(socket, 4009).await;
    let (outcome, shard) = task.await.unwrap();
    assert_eq!(outcome.unwrap(), CloseOutcome::Reconnect { resumable: false });
    assert!(!shard.session().can_resume(), "4009 must discard the session");
}

#[tokio::test]
async fn test_zlib_stream_transport() {
    use flate2::{Compress, Compression, FlushCompress};

    // One shared compression stream across messages, sync-flushed after
    // each, exactly as the real gateway frames them.
    let mut compressor = Compress::new(Compression::default(), true);
    let mut compress = move |payload: &Value| -> Vec<u8> {
        let raw = serde_json::to_vec(payload).unwrap();
        let mut out = Vec::with_capacity(raw.len() + 128);
        compressor
            .compress_vec(&raw, &mut out, FlushCompress::Sync)
            .unwrap();
        out
    };

    let (url, mut conns) = spawn_gateway().await;
    let mut config = GatewayConfig::new("test-token");
    config.gateway_url = url;
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let (mut shard, handle) = Shard::new(config, event_tx);
    let task = tokio::spawn(async move { shard.run().await });

    let mut socket = conns.recv().await.unwrap();
    let hello = compress(&json!({ "op": 10, "d": { "heartbeat_interval": 60_000 } }));
    socket.send(Message::Binary(hello.into())).await.unwrap();

    let identify = recv_json(&mut socket).await;
    assert_eq!(identify["op"], 2);

    // Deliver a dispatch split across two frames; the boundary is only
    // where the flush suffix lands.
    let ready = compress(&json!({
        "op": 0, "s": 1, "t": "READY", "d": { "session_id": "z-1" },
    }));
    let (head, tail) = ready.split_at(ready.len() / 2);
    socket.send(Message::Binary(head.to_vec().into())).await.unwrap();
    socket.send(Message::Binary(tail.to_vec().into())).await.unwrap();

    assert!(matches!(events.recv().await, Some(Event::Connected)));
    match events.recv().await {
        Some(Event::Dispatch { name, data, .. }) => {
            assert_eq!(name, "READY");
            assert_eq!(data["session_id"], "z-1");
        }
        other => panic!("expected READY dispatch, got {other:?}"),
    }

    assert!(handle.close());
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, CloseOutcome::Closed);
}
