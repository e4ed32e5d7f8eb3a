/// Hub behaviour with multiple clients.
///
/// Validates:
/// - deterministic per-session ordering and replay spans
/// - controller election priorities and extension-UI routing
/// - detach grace: quick reconnects keep the channel, expiry releases it
/// - slow consumers are dropped instead of back-pressuring the hub
use relay::environment::StaticEnvironmentService;
use relay::hub::{
    ClientCapabilities, CloseCommand, CommandError, HubContext, HubOptions, NewClient,
    OutboundFrame,
};
use relay::hub_manager::HubManager;
use relay::journal::Journal;
use relay::sandbox::{LocalSandboxConfig, LocalSandboxManager};
use relay::store::{NewSession, SessionMode, SessionStatus, SharedStore, Store};
use relay::transport::ReconnectConfig;
use relay_protocol::{ServerFrame, error_codes};
use relay_test_utils::MockAgentServer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

struct TestStack {
    store: SharedStore,
    journal: Journal,
    manager: Arc<HubManager>,
    mock: MockAgentServer,
}

async fn stack(detach_grace: Duration) -> TestStack {
    let store = Store::open_in_memory().unwrap().into_shared();
    let journal = Journal::new(Arc::clone(&store));
    let mock = MockAgentServer::start().await.unwrap();
    let sandbox = Arc::new(LocalSandboxManager::new(LocalSandboxConfig {
        agent_program: "pi".to_owned(),
        agent_args: vec![],
        state_root: std::env::temp_dir(),
        reconnect: ReconnectConfig {
            max_attempts: 2,
            base: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
        },
    }));
    let environments = Arc::new(StaticEnvironmentService::new(HashMap::new()));
    let ctx = HubContext {
        store: Arc::clone(&store),
        journal: journal.clone(),
        sandbox,
        environments,
    };
    let manager = HubManager::new(ctx, HubOptions { detach_grace });
    TestStack {
        store,
        journal,
        manager,
        mock,
    }
}

async fn active_session(stack: &TestStack, id: &str) {
    let store = stack.store.lock().await;
    store
        .create_session(&NewSession {
            id: id.to_owned(),
            mode: SessionMode::Code,
            environment_id: None,
            repo_id: None,
            sandbox_provider: Some("socket".to_owned()),
            sandbox_provider_id: Some(stack.mock.url()),
            name: None,
        })
        .unwrap();
    store.set_status(id, SessionStatus::Active).unwrap();
}

struct TestClientEnd {
    outbound_rx: mpsc::Receiver<OutboundFrame>,
    kill_rx: oneshot::Receiver<CloseCommand>,
}

fn test_client(id: &str, extension_ui: bool, capacity: usize) -> (NewClient, TestClientEnd) {
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (kill_tx, kill_rx) = oneshot::channel();
    (
        NewClient {
            client_id: id.to_owned(),
            capabilities: ClientCapabilities { extension_ui },
            outbound_tx,
            kill_tx,
        },
        TestClientEnd {
            outbound_rx,
            kill_rx,
        },
    )
}

async fn next_frame(end: &mut TestClientEnd) -> OutboundFrame {
    tokio::time::timeout(Duration::from_secs(5), end.outbound_rx.recv())
        .await
        .expect("frame within deadline")
        .expect("client channel open")
}

async fn expect_no_frame(end: &mut TestClientEnd) {
    let got = tokio::time::timeout(Duration::from_millis(300), end.outbound_rx.recv()).await;
    assert!(got.is_err(), "expected silence, got {:?}", got);
}

fn event_seq(frame: &OutboundFrame) -> u64 {
    match frame {
        OutboundFrame::Event(ev) => ev.seq.expect("journaled events carry a seq"),
        other => panic!("expected event frame, got {other:?}"),
    }
}

/// Scenario: client A sees live events 1..3; client B resumes from 1 and
/// gets a contiguous replay of 2..3 before anything live.
#[tokio::test]
async fn two_clients_observe_deterministic_ordering() {
    let stack = stack(Duration::from_millis(500)).await;
    active_session(&stack, "s1").await;
    let hub = stack.manager.get_or_create("s1").await;

    let (client_a, mut end_a) = test_client("client-a", false, 64);
    hub.add_client(client_a, 0).await.unwrap();
    match next_frame(&mut end_a).await {
        OutboundFrame::Server(ServerFrame::Connected {
            session_id,
            last_seq,
        }) => {
            assert_eq!(session_id, "s1");
            assert_eq!(last_seq, 0);
        }
        other => panic!("expected connected, got {other:?}"),
    }

    for kind in ["agent_start", "turn_start", "turn_end"] {
        stack.mock.emit_event("s1", None, kind, None);
    }
    for expected in 1..=3u64 {
        assert_eq!(event_seq(&next_frame(&mut end_a).await), expected);
    }

    // B resumes from seq 1: replay brackets around 2 and 3.
    let (client_b, mut end_b) = test_client("client-b", false, 64);
    hub.add_client(client_b, 1).await.unwrap();
    match next_frame(&mut end_b).await {
        OutboundFrame::Server(ServerFrame::Connected { last_seq, .. }) => {
            assert_eq!(last_seq, 3)
        }
        other => panic!("expected connected, got {other:?}"),
    }
    match next_frame(&mut end_b).await {
        OutboundFrame::Server(ServerFrame::ReplayStart { from_seq, to_seq }) => {
            assert_eq!((from_seq, to_seq), (1, 3));
        }
        other => panic!("expected replay_start, got {other:?}"),
    }
    assert_eq!(event_seq(&next_frame(&mut end_b).await), 2);
    assert_eq!(event_seq(&next_frame(&mut end_b).await), 3);
    assert!(matches!(
        next_frame(&mut end_b).await,
        OutboundFrame::Server(ServerFrame::ReplayEnd)
    ));

    // Journal is exactly 1..3.
    let journaled = stack.journal.get_after_seq("s1", 0, None).await.unwrap();
    assert_eq!(
        journaled.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    // A client resuming past the head gets no replay.
    let (client_c, mut end_c) = test_client("client-c", false, 64);
    hub.add_client(client_c, 9).await.unwrap();
    match next_frame(&mut end_c).await {
        OutboundFrame::Server(ServerFrame::Connected { last_seq, .. }) => {
            assert_eq!(last_seq, 3)
        }
        other => panic!("expected connected, got {other:?}"),
    }
    expect_no_frame(&mut end_c).await;
}

/// Scenario: election prefers the last writer, UI requests go only to the
/// controller, and non-controllers cannot answer them.
#[tokio::test]
async fn controller_election_and_ui_routing() {
    let stack = stack(Duration::from_millis(500)).await;
    active_session(&stack, "s4").await;
    let hub = stack.manager.get_or_create("s4").await;

    let (client_x, mut end_x) = test_client("client-x", false, 64);
    hub.add_client(client_x, 0).await.unwrap();
    let (client_y, mut end_y) = test_client("client-y", true, 64);
    hub.add_client(client_y, 0).await.unwrap();
    next_frame(&mut end_x).await;
    next_frame(&mut end_y).await;

    // Y is the most recent eligible client.
    assert_eq!(hub.controller_client_id().await.as_deref(), Some("client-y"));

    // Y prompts: becomes last writer, stays controller; the prompt is
    // journaled as history.
    hub.handle_client_command(
        "client-y",
        r#"{"type":"prompt","message":"add a failing test first"}"#,
    )
    .await
    .unwrap();
    assert_eq!(hub.controller_client_id().await.as_deref(), Some("client-y"));
    let journaled = stack.journal.get_after_seq("s4", 0, None).await.unwrap();
    assert_eq!(journaled.len(), 1);
    assert_eq!(journaled[0].event_type, "prompt");

    // The agent asks a question: only the controller sees it.
    stack.mock.emit_event(
        "s4",
        None,
        "extension_ui_request",
        Some(serde_json::json!({"method": "confirm", "message": "overwrite?"})),
    );
    let frame = next_frame(&mut end_y).await;
    match frame {
        OutboundFrame::Event(ev) => assert_eq!(ev.event_type, "extension_ui_request"),
        other => panic!("expected ui request, got {other:?}"),
    }
    expect_no_frame(&mut end_x).await;

    // A non-controller answering is rejected, to it alone.
    let rejected = hub
        .handle_client_command(
            "client-x",
            r#"{"type":"extension_ui_response","id":"u1","result":{"ok":true}}"#,
        )
        .await;
    match rejected {
        Err(CommandError::NotController) => {}
        other => panic!("expected NotController, got {other:?}"),
    }

    // The controller's answer goes through to the agent.
    hub.handle_client_command(
        "client-y",
        r#"{"type":"extension_ui_response","id":"u1","result":{"ok":true}}"#,
    )
    .await
    .unwrap();
    let methods: Vec<String> = stack
        .mock
        .requests()
        .iter()
        .map(|r| r.method.clone())
        .collect();
    assert!(methods.contains(&"extension_ui_response".to_owned()));

    // Unknown senders are rejected outright.
    assert!(matches!(
        hub.handle_client_command("ghost", r#"{"type":"abort"}"#).await,
        Err(CommandError::UnknownClient)
    ));
}

/// Scenario: a client returning within the grace window finds the channel
/// still attached; after expiry the channel is released and a fresh attach
/// happens on the next connect.
#[tokio::test]
async fn detach_grace_keeps_then_releases_the_channel() {
    let stack = stack(Duration::from_millis(300)).await;
    active_session(&stack, "s2").await;
    let hub = stack.manager.get_or_create("s2").await;

    let (client_a, mut end_a) = test_client("client-a", false, 64);
    hub.add_client(client_a, 0).await.unwrap();
    next_frame(&mut end_a).await;
    let hellos_after_first = stack
        .mock
        .requests()
        .iter()
        .filter(|r| r.method == "hello")
        .count();
    assert_eq!(hellos_after_first, 1);

    // Drop and return within the grace: no re-attach.
    hub.remove_client("client-a").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (client_a2, mut end_a2) = test_client("client-a", false, 64);
    hub.add_client(client_a2, 0).await.unwrap();
    next_frame(&mut end_a2).await;
    let hellos_after_return = stack
        .mock
        .requests()
        .iter()
        .filter(|r| r.method == "hello")
        .count();
    assert_eq!(hellos_after_return, 1, "channel must survive the grace window");

    // Drop and stay away: the channel is released.
    hub.remove_client("client-a").await;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(stack.mock.connection_count(), 0, "channel released after grace");

    // The hub is still usable: the next client triggers a fresh attach.
    let (client_a3, mut end_a3) = test_client("client-a", false, 64);
    hub.add_client(client_a3, 0).await.unwrap();
    next_frame(&mut end_a3).await;
    let hellos_after_reattach = stack
        .mock
        .requests()
        .iter()
        .filter(|r| r.method == "hello")
        .count();
    assert_eq!(hellos_after_reattach, 2);
}

/// A client that stops draining its queue is dropped with SLOW_CONSUMER.
#[tokio::test]
async fn slow_consumer_is_dropped_not_backpressured() {
    let stack = stack(Duration::from_millis(500)).await;
    active_session(&stack, "s6").await;
    let hub = stack.manager.get_or_create("s6").await;

    // Tiny queue: connected takes one slot, one event fits, then overflow.
    let (client, end) = test_client("sluggish", false, 2);
    let TestClientEnd {
        outbound_rx,
        kill_rx,
    } = end;
    hub.add_client(client, 0).await.unwrap();

    // A healthy observer keeps receiving throughout.
    let (healthy, mut healthy_end) = test_client("healthy", false, 256);
    hub.add_client(healthy, 0).await.unwrap();
    next_frame(&mut healthy_end).await;

    for _ in 0..4 {
        stack.mock.emit_event("s6", None, "turn_start", None);
    }

    let cmd = tokio::time::timeout(Duration::from_secs(5), kill_rx)
        .await
        .expect("kill within deadline")
        .expect("kill command delivered");
    match cmd.frame {
        Some(ServerFrame::Error { code, .. }) => assert_eq!(code, error_codes::SLOW_CONSUMER),
        other => panic!("expected slow-consumer error, got {other:?}"),
    }
    drop(outbound_rx);

    assert_eq!(hub.connection_count().await, 1, "healthy client remains");
    for _ in 0..4 {
        next_frame(&mut healthy_end).await;
    }
}

/// Channel loss keeps clients attached and tells them the sandbox stopped.
#[tokio::test]
async fn channel_close_broadcasts_stopped_and_keeps_clients() {
    let stack = stack(Duration::from_millis(500)).await;
    active_session(&stack, "s7").await;
    let hub = stack.manager.get_or_create("s7").await;

    let (client, mut end) = test_client("client-a", false, 64);
    hub.add_client(client, 0).await.unwrap();
    next_frame(&mut end).await;

    // Take the agent away for good; the transport's two fast reconnect
    // attempts fail and the channel reports closed.
    stack.mock.shutdown();

    let frame = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match next_frame(&mut end).await {
                OutboundFrame::Server(ServerFrame::SandboxStatus { status, .. }) => {
                    return status;
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("sandbox_status within deadline");
    assert_eq!(frame, relay_protocol::SandboxStatus::Stopped);
    assert_eq!(hub.connection_count().await, 1, "clients are kept");
}
