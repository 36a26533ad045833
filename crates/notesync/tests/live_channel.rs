use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use notesync::{
    ChannelConfig, ChannelEvent, EventBus, EventKind, Listener, Note, Payload, SyncConfig,
    SyncRuntime,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

enum ServerCommand {
    Text(String),
    Drop,
}

/// One accepted client connection as seen by the test.
struct Accepted {
    note_id: Option<String>,
    received: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedSender<ServerCommand>,
}

#[derive(Clone)]
struct ServerState {
    accepted: mpsc::UnboundedSender<Accepted>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    let note_id = params.get("note_id").cloned();
    ws.on_upgrade(move |socket| handle_socket(socket, note_id, state))
}

async fn handle_socket(mut socket: WebSocket, note_id: Option<String>, state: ServerState) {
    let (received_tx, received) = mpsc::unbounded_channel();
    let (commands, mut command_rx) = mpsc::unbounded_channel();
    let _ = state.accepted.send(Accepted {
        note_id,
        received,
        commands,
    });

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    let is_ping = serde_json::from_str::<Value>(&text)
                        .map(|value| value["type"] == "ping")
                        .unwrap_or(false);
                    if is_ping {
                        let _ = socket.send(WsMessage::Text(r#"{"type":"pong"}"#.into())).await;
                    }
                    let _ = received_tx.send(text);
                }
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            command = command_rx.recv() => match command {
                Some(ServerCommand::Text(text)) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(ServerCommand::Drop) | None => break,
            },
        }
    }
}

async fn start_server() -> (String, mpsc::UnboundedReceiver<Accepted>) {
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    let router = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(ServerState {
            accepted: accepted_tx,
        });
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (format!("ws://{addr}/ws"), accepted_rx)
}

fn config(ws_url: String, max_attempts: u32) -> SyncConfig {
    SyncConfig {
        ws_url,
        channel: ChannelConfig {
            base_delay: Duration::from_millis(20),
            max_attempts,
            connect_timeout: Duration::from_secs(2),
            ..ChannelConfig::default()
        },
        ..SyncConfig::default()
    }
}

fn record(bus: &EventBus) -> mpsc::UnboundedReceiver<(EventKind, Payload)> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in EventKind::ALL {
        let tx = tx.clone();
        bus.subscribe(
            kind,
            &Listener::new(move |payload| {
                let _ = tx.send((kind, payload.clone()));
            }),
        );
    }
    rx
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<(EventKind, Payload)>,
    wanted: EventKind,
) -> Payload {
    timeout(WAIT, async {
        loop {
            let (kind, payload) = events.recv().await.expect("event stream open");
            if kind == wanted {
                return payload;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {wanted}"))
}

async fn next_accepted(accepted: &mut mpsc::UnboundedReceiver<Accepted>) -> Accepted {
    timeout(WAIT, accepted.recv())
        .await
        .expect("timed out waiting for connection")
        .expect("server running")
}

#[test_timeout::tokio_timeout_test(20)]
async fn exchanges_note_events_with_a_live_server() {
    let (ws_url, mut accepted) = start_server().await;
    let runtime = SyncRuntime::websocket(config(ws_url, 5));
    let mut events = record(runtime.bus());

    runtime.connect(Some("note-1")).expect("valid endpoint");
    let mut conn = next_accepted(&mut accepted).await;
    assert_eq!(conn.note_id.as_deref(), Some("note-1"));
    wait_for(&mut events, EventKind::Connected).await;
    assert!(runtime.channel().is_open());

    let note = Note {
        id: "note-1".into(),
        title: "Groceries".into(),
        content: "eggs".into(),
        created_at: "2024-01-01T00:00:00".into(),
        updated_at: "2024-01-02T00:00:00".into(),
    };
    assert!(runtime
        .channel()
        .send(&ChannelEvent::note_update(&note).unwrap()));
    let frame = timeout(WAIT, conn.received.recv()).await.unwrap().unwrap();
    let value: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["type"], "note_update");
    assert_eq!(value["payload"]["updatedAt"], "2024-01-02T00:00:00");

    let created = json!({
        "type": "note_create",
        "payload": {"id": "note-2", "title": "Todo", "content": "", "createdAt": "t0", "updatedAt": "t0"}
    });
    conn.commands
        .send(ServerCommand::Text(created.to_string()))
        .unwrap();
    let payload = wait_for(&mut events, EventKind::NoteCreate).await;
    let event = ChannelEvent::new(EventKind::NoteCreate, payload);
    let received: Note = event.payload_as().unwrap();
    assert_eq!(received.id, "note-2");
    assert_eq!(received.title, "Todo");

    assert!(runtime.channel().send(&ChannelEvent::ping()));
    let pong = wait_for(&mut events, EventKind::Pong).await;
    assert_eq!(pong, Value::Null);

    // Drain the ping so the next frame read is the delete.
    let ping = timeout(WAIT, conn.received.recv()).await.unwrap().unwrap();
    assert!(ping.contains("\"ping\""));

    assert!(runtime
        .channel()
        .send(&ChannelEvent::note_delete("note-1")));
    timeout(WAIT, runtime.shutdown_gracefully())
        .await
        .expect("graceful shutdown should finish");

    let last = timeout(WAIT, conn.received.recv()).await.unwrap().unwrap();
    let value: Value = serde_json::from_str(&last).unwrap();
    assert_eq!(value, json!({"type": "note_delete", "payload": {"id": "note-1"}}));
    let closed = timeout(WAIT, async {
        while conn.received.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "server side should see the socket close");
}

#[test_timeout::tokio_timeout_test(20)]
async fn reconnects_to_the_same_room_after_the_server_drops() {
    let (ws_url, mut accepted) = start_server().await;
    let runtime = SyncRuntime::websocket(config(ws_url, 5));
    let mut events = record(runtime.bus());

    runtime.connect(Some("note-7")).expect("valid endpoint");
    let first = next_accepted(&mut accepted).await;
    wait_for(&mut events, EventKind::Connected).await;

    first.commands.send(ServerCommand::Drop).unwrap();
    wait_for(&mut events, EventKind::Disconnected).await;

    let second = next_accepted(&mut accepted).await;
    assert_eq!(second.note_id.as_deref(), Some("note-7"));
    wait_for(&mut events, EventKind::Connected).await;
    assert!(runtime.channel().is_open());
    assert_eq!(runtime.channel().attempt(), 0);

    runtime.shutdown();
}

#[test_timeout::tokio_timeout_test(20)]
async fn gives_up_after_max_attempts_against_a_dead_port() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let runtime = SyncRuntime::websocket(config(format!("ws://{addr}/ws"), 2));
    let mut events = record(runtime.bus());
    runtime.connect(None).expect("valid endpoint");

    for _ in 0..3 {
        let error = wait_for(&mut events, EventKind::Error).await;
        assert!(error["message"].as_str().unwrap().starts_with("connection error"));
        wait_for(&mut events, EventKind::Disconnected).await;
    }

    timeout(WAIT, async {
        while !runtime.channel().is_exhausted() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel should give up");
    assert!(!runtime.channel().send(&ChannelEvent::note_delete("gone")));

    runtime.shutdown();
}
