/// Reconnect/resume behaviour against a scripted relay edge.
///
/// Validates:
/// - the resume cursor (lastSeq) is re-presented after a drop
/// - replay arrives bracketed, before any live events
/// - the reconnect budget is bounded and disconnect() cancels it
use futures_util::{SinkExt, StreamExt};
use relay_client::{ClientConfig, ClientEvent, RetryPolicy, SessionClient};
use relay_protocol::{Envelope, EventFrame, PROTOCOL_VERSION, ServerFrame};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        base: Duration::from_millis(50),
        max_delay: Duration::from_millis(400),
    }
}

async fn accept_ws(
    listener: &TcpListener,
    seen_uris: &Arc<Mutex<Vec<String>>>,
) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    let uris = Arc::clone(seen_uris);
    tokio_tungstenite::accept_hdr_async(stream, move |request: &Request, response: Response| {
        uris.lock().unwrap().push(request.uri().to_string());
        Ok(response)
    })
    .await
    .unwrap()
}

async fn send_server_frame(ws: &mut WebSocketStream<TcpStream>, frame: &ServerFrame) {
    let text = serde_json::to_string(frame).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn send_event(ws: &mut WebSocketStream<TcpStream>, session_id: &str, seq: u64) {
    let frame = Envelope::Event(EventFrame {
        v: PROTOCOL_VERSION,
        session_id: session_id.to_owned(),
        seq: Some(seq),
        event_type: "turn_start".to_owned(),
        payload: None,
    });
    let text = serde_json::to_string(&frame).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn next_event(client: &mut SessionClient) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), client.next_event())
        .await
        .expect("event within deadline")
        .expect("stream open")
}

#[tokio::test]
async fn drop_resume_replays_before_live_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen_uris = Arc::new(Mutex::new(Vec::new()));

    let server = {
        let seen_uris = Arc::clone(&seen_uris);
        tokio::spawn(async move {
            // Connection 1: deliver up to seq 42, then drop abruptly.
            let mut ws = accept_ws(&listener, &seen_uris).await;
            send_server_frame(
                &mut ws,
                &ServerFrame::Connected {
                    session_id: "s5".to_owned(),
                    last_seq: 0,
                },
            )
            .await;
            for seq in 1..=42u64 {
                send_event(&mut ws, "s5", seq).await;
            }
            drop(ws);

            // Connection 2: the client resumes; replay 43..45 bracketed,
            // then one live event.
            let mut ws = accept_ws(&listener, &seen_uris).await;
            send_server_frame(
                &mut ws,
                &ServerFrame::Connected {
                    session_id: "s5".to_owned(),
                    last_seq: 45,
                },
            )
            .await;
            send_server_frame(
                &mut ws,
                &ServerFrame::ReplayStart {
                    from_seq: 42,
                    to_seq: 45,
                },
            )
            .await;
            for seq in 43..=45u64 {
                send_event(&mut ws, "s5", seq).await;
            }
            send_server_frame(&mut ws, &ServerFrame::ReplayEnd).await;
            send_event(&mut ws, "s5", 46).await;

            // Hold the socket open until the client is done.
            while let Some(Ok(_)) = ws.next().await {}
        })
    };

    let mut config = ClientConfig::new(format!("ws://{addr}"));
    config.client_id = "client-z".to_owned();
    config.retry = fast_retry();
    let mut client = SessionClient::connect(config, "s5", 0).await.unwrap();

    assert!(matches!(
        next_event(&mut client).await,
        ClientEvent::Connected { last_seq: 0, .. }
    ));
    for expected in 1..=42u64 {
        match next_event(&mut client).await {
            ClientEvent::Event(event) => assert_eq!(event.seq, Some(expected)),
            other => panic!("expected event {expected}, got {other:?}"),
        }
    }
    assert_eq!(client.last_seq(), 42);

    // The drop surfaces as a reconnect attempt, then the resumed stream.
    assert_eq!(
        next_event(&mut client).await,
        ClientEvent::Reconnecting { attempt: 1 }
    );
    assert!(matches!(
        next_event(&mut client).await,
        ClientEvent::Connected { last_seq: 45, .. }
    ));
    assert!(matches!(
        next_event(&mut client).await,
        ClientEvent::Frame(ServerFrame::ReplayStart {
            from_seq: 42,
            to_seq: 45
        })
    ));
    for expected in 43..=45u64 {
        match next_event(&mut client).await {
            ClientEvent::Event(event) => assert_eq!(event.seq, Some(expected)),
            other => panic!("expected replayed {expected}, got {other:?}"),
        }
    }
    assert!(matches!(
        next_event(&mut client).await,
        ClientEvent::Frame(ServerFrame::ReplayEnd)
    ));
    match next_event(&mut client).await {
        ClientEvent::Event(event) => assert_eq!(event.seq, Some(46)),
        other => panic!("expected live event 46, got {other:?}"),
    }

    // The second handshake presented the remembered cursor.
    let uris = seen_uris.lock().unwrap().clone();
    assert_eq!(uris.len(), 2);
    assert!(uris[0].contains("lastSeq=0"), "first: {}", uris[0]);
    assert!(uris[1].contains("lastSeq=42"), "second: {}", uris[1]);
    assert!(uris[1].contains("clientId=client-z"));

    client.disconnect().await;
    server.abort();
}

#[tokio::test]
async fn reconnect_budget_is_bounded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen_uris = Arc::new(Mutex::new(Vec::new()));

    // Accept one connection, drop it, then stop listening entirely.
    let server = {
        let seen_uris = Arc::clone(&seen_uris);
        tokio::spawn(async move {
            let ws = accept_ws(&listener, &seen_uris).await;
            drop(ws);
            drop(listener);
        })
    };

    let mut config = ClientConfig::new(format!("ws://{addr}"));
    config.retry = RetryPolicy {
        max_attempts: 2,
        base: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
    };
    let mut client = SessionClient::connect(config, "s1", 0).await.unwrap();
    server.await.unwrap();

    let mut attempts = 0;
    loop {
        match next_event(&mut client).await {
            ClientEvent::Reconnecting { attempt } => attempts = attempt,
            ClientEvent::Disconnected { reason } => {
                assert!(reason.contains("exhausted"), "reason: {reason}");
                break;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn disconnect_cancels_a_pending_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen_uris = Arc::new(Mutex::new(Vec::new()));

    let server = {
        let seen_uris = Arc::clone(&seen_uris);
        tokio::spawn(async move {
            let ws = accept_ws(&listener, &seen_uris).await;
            drop(ws);
            // Keep listening; the client must never come back after
            // disconnect() cancels its backoff.
            let _ = listener.accept().await;
            panic!("client reconnected after disconnect()");
        })
    };

    let mut config = ClientConfig::new(format!("ws://{addr}"));
    config.retry = RetryPolicy {
        max_attempts: 5,
        base: Duration::from_secs(5),
        max_delay: Duration::from_secs(10),
    };
    let mut client = SessionClient::connect(config, "s1", 0).await.unwrap();

    assert_eq!(
        next_event(&mut client).await,
        ClientEvent::Reconnecting { attempt: 1 }
    );
    // disconnect() during the (long) backoff returns promptly.
    let start = tokio::time::Instant::now();
    client.disconnect().await;
    assert!(start.elapsed() < Duration::from_secs(2));
    server.abort();
}
