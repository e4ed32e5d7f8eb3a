/// Socket transport tests against a mock agent.
///
/// Validates:
/// - hello handshake yields a connection id and server capabilities
/// - request/response correlation by request id
/// - event delivery through the transport's stream
/// - reconnect with resume: cursors presented, missed tail replayed
/// - rejected resume resets the connection identity
use relay::transport::{ReconnectConfig, SocketTransport, TransportEvent};
use relay_protocol::ClientInfo;
use relay_test_utils::MockAgentServer;
use std::time::Duration;
use tokio::sync::broadcast;

fn client_info() -> ClientInfo {
    ClientInfo {
        name: "relay-test".to_owned(),
        version: "0".to_owned(),
    }
}

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        max_attempts: 5,
        base: Duration::from_millis(50),
        max_delay: Duration::from_millis(400),
    }
}

async fn recv_event(
    events: &mut broadcast::Receiver<TransportEvent>,
) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within deadline")
        .expect("stream open")
}

#[tokio::test]
async fn handshake_and_request_correlation() {
    let mock = MockAgentServer::start().await.unwrap();
    let transport = SocketTransport::new(mock.url(), client_info(), fast_reconnect());

    transport.connect().await.unwrap();
    assert!(transport.is_connected().await);
    let connection_id = transport.connection_id().await.unwrap();
    assert!(!connection_id.is_empty());
    let caps = transport.server_capabilities().await.unwrap();
    assert!(caps.resume);

    let response = transport
        .send_raw(
            "session.get_state",
            Some("s1"),
            None,
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap();
    assert!(response.ok);

    // Both the hello and the request reached the agent.
    let methods: Vec<String> = mock.requests().iter().map(|r| r.method.clone()).collect();
    assert_eq!(methods, vec!["hello".to_owned(), "session.get_state".to_owned()]);

    transport.disconnect().await;
    assert!(!transport.is_connected().await);
}

#[tokio::test]
async fn events_reach_the_single_consumer() {
    let mock = MockAgentServer::start().await.unwrap();
    let transport = SocketTransport::new(mock.url(), client_info(), fast_reconnect());
    let mut events = transport.events();
    transport.connect().await.unwrap();

    mock.emit_event("s1", Some(1), "agent_start", None);
    mock.emit_event(
        "s1",
        Some(2),
        "message_update",
        Some(serde_json::json!({"event": {"type": "text_delta", "text": "hi"}})),
    );

    let first = recv_event(&mut events).await;
    assert_eq!(first.event_type, "agent_start");
    assert_eq!(first.seq, Some(1));

    let second = recv_event(&mut events).await;
    assert_eq!(second.event_type, "message_update");
    assert_eq!(second.session_id.as_deref(), Some("s1"));

    transport.disconnect().await;
}

#[tokio::test]
async fn reconnect_presents_cursors_and_replays_missed_tail() {
    let mock = MockAgentServer::start().await.unwrap();
    let transport = SocketTransport::new(mock.url(), client_info(), fast_reconnect());
    let mut events = transport.events();
    transport.connect().await.unwrap();
    let first_id = transport.connection_id().await.unwrap();

    for seq in 1..=3u64 {
        mock.emit_event("s5", Some(seq), "turn_start", None);
    }
    for _ in 0..3 {
        recv_event(&mut events).await;
    }

    // Drop the connection, then emit while the transport is down.
    mock.kill_connections();
    tokio::time::sleep(Duration::from_millis(100)).await;
    mock.emit_event("s5", Some(4), "turn_start", None);
    mock.emit_event("s5", Some(5), "turn_end", None);

    // The reconnect controller resumes and the missed tail replays in order.
    let replayed = recv_event(&mut events).await;
    assert_eq!(replayed.seq, Some(4));
    let replayed = recv_event(&mut events).await;
    assert_eq!(replayed.seq, Some(5));

    assert_eq!(transport.connection_id().await.unwrap(), first_id);
    let resumes = mock.resumes();
    assert_eq!(resumes.len(), 2);
    let presented = resumes[1].as_ref().expect("resume presented on reconnect");
    assert_eq!(presented.connection_id, first_id);
    assert_eq!(presented.last_seq_by_session.get("s5"), Some(&3));

    transport.disconnect().await;
}

#[tokio::test]
async fn rejected_resume_resets_connection_identity() {
    let mock = MockAgentServer::start().await.unwrap();
    let transport = SocketTransport::new(mock.url(), client_info(), fast_reconnect());
    transport.connect().await.unwrap();
    let first_id = transport.connection_id().await.unwrap();

    mock.set_accept_resume(false);
    mock.kill_connections();

    // Wait for the reconnect to land.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if transport.is_connected().await {
            if let Some(id) = transport.connection_id().await {
                if id != first_id {
                    break;
                }
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "reconnect did not complete in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    transport.disconnect().await;
}
