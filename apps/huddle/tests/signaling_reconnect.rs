use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use huddle_core::backoff::BackoffPolicy;
use huddle_core::signaling::{
    ChannelState, SignalingChannel, SignalingError, SignalingEvent, WebSocketConnector,
};
use huddle_proto::{ChatMessage, PeerRef, ServerEvent};

const WAIT: Duration = Duration::from_secs(5);

/// One accepted socket. Sending `None` on `push` closes it from the server side.
struct ServerConn {
    index: usize,
    push: mpsc::UnboundedSender<Option<String>>,
}

impl ServerConn {
    fn send(&self, event: ServerEvent) {
        let text = event.to_text().expect("encode server event");
        self.push.send(Some(text)).expect("socket task alive");
    }

    fn close(&self) {
        let _ = self.push.send(None);
    }
}

struct Hub {
    next: AtomicUsize,
    accepted: mpsc::UnboundedSender<ServerConn>,
    frames: mpsc::UnboundedSender<(usize, String)>,
}

struct TestServer {
    url: String,
    accepted: mpsc::UnboundedReceiver<ServerConn>,
    frames: mpsc::UnboundedReceiver<(usize, String)>,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    async fn next_conn(&mut self) -> ServerConn {
        timeout(WAIT, self.accepted.recv())
            .await
            .expect("client connected in time")
            .expect("server alive")
    }

    async fn next_frame(&mut self) -> (usize, Value) {
        let (index, text) = timeout(WAIT, self.frames.recv())
            .await
            .expect("frame in time")
            .expect("server alive");
        (index, serde_json::from_str(&text).expect("client frame is json"))
    }
}

async fn spawn_server() -> TestServer {
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let hub = Arc::new(Hub {
        next: AtomicUsize::new(0),
        accepted: accepted_tx,
        frames: frames_tx,
    });
    let router = Router::new().route("/", get(upgrade)).with_state(hub);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });
    TestServer {
        url: format!("http://{addr}/"),
        accepted: accepted_rx,
        frames: frames_rx,
        _shutdown: shutdown_tx,
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, hub))
}

async fn serve_socket(socket: WebSocket, hub: Arc<Hub>) {
    let index = hub.next.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut stream) = socket.split();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Option<String>>();
    if hub.accepted.send(ServerConn { index, push: push_tx }).is_err() {
        return;
    }
    loop {
        tokio::select! {
            pushed = push_rx.recv() => match pushed {
                Some(Some(text)) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ => {
                    let _ = sink.close().await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = hub.frames.send((index, text));
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

fn open_channel(url: &str, policy: BackoffPolicy) -> (Arc<SignalingChannel>, mpsc::UnboundedReceiver<SignalingEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let channel = SignalingChannel::connect(Arc::new(WebSocketConnector), url, policy, events_tx);
    (channel, events_rx)
}

async fn wait_for_state(channel: &SignalingChannel, wanted: ChannelState) {
    let mut watch = channel.watch_state();
    timeout(WAIT, watch.wait_for(|state| *state == wanted))
        .await
        .expect("state reached in time")
        .expect("supervisor alive");
}

/// Skips state notifications and returns the next room event.
async fn next_room_event(events: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("event in time")
            .expect("channel alive");
        if !matches!(event, SignalingEvent::State(_)) {
            return event;
        }
    }
}

fn fast_policy() -> BackoffPolicy {
    BackoffPolicy::linear(Duration::from_millis(50), 5)
}

#[test_timeout::tokio_timeout_test(20)]
async fn join_frame_and_server_events_cross_the_socket() {
    let mut server = spawn_server().await;
    let (channel, mut events) = open_channel(&server.url, fast_policy());
    let conn = server.next_conn().await;
    channel.announce_join("standup", "alice").expect("announce");

    let (index, frame) = server.next_frame().await;
    assert_eq!(index, conn.index);
    assert_eq!(
        frame,
        json!({"event": "join-room", "data": {"roomId": "standup", "peerId": "alice"}})
    );

    conn.send(ServerEvent::UserConnected(PeerRef::raw("bob")));
    assert_eq!(
        next_room_event(&mut events).await,
        SignalingEvent::PeerJoined(PeerRef::raw("bob"))
    );

    // Frames the protocol does not know are skipped without dropping the link.
    conn.push.send(Some("{\"event\":\"typing\",\"data\":{}}".into())).unwrap();
    conn.send(ServerEvent::UserDisconnected(PeerRef::raw("bob")));
    assert_eq!(
        next_room_event(&mut events).await,
        SignalingEvent::PeerLeft(PeerRef::raw("bob"))
    );
    assert_eq!(channel.state(), ChannelState::Connected);

    channel.destroy();
}

#[test_timeout::tokio_timeout_test(20)]
async fn chat_travels_both_ways() {
    let mut server = spawn_server().await;
    let (channel, mut events) = open_channel(&server.url, fast_policy());
    let conn = server.next_conn().await;
    wait_for_state(&channel, ChannelState::Connected).await;

    let outgoing = ChatMessage {
        text: "morning".into(),
        sender: "alice".into(),
        timestamp: 1_700_000_000_000,
    };
    channel.send_chat_message(outgoing.clone()).expect("send chat");
    let (_, frame) = server.next_frame().await;
    assert_eq!(frame["event"], "chat-message");
    assert_eq!(frame["data"]["text"], "morning");
    assert_eq!(frame["data"]["sender"], "alice");

    let incoming = ChatMessage {
        text: "hi alice".into(),
        sender: "bob".into(),
        timestamp: 1_700_000_000_500,
    };
    conn.send(ServerEvent::ChatMessage(incoming.clone()));
    assert_eq!(next_room_event(&mut events).await, SignalingEvent::Chat(incoming));

    channel.destroy();
    assert_eq!(
        channel.send_chat_message(outgoing),
        Err(SignalingError::Destroyed)
    );
}

#[test_timeout::tokio_timeout_test(20)]
async fn join_is_replayed_after_the_server_drops_the_socket() {
    let mut server = spawn_server().await;
    let (channel, mut events) = open_channel(&server.url, fast_policy());
    let first = server.next_conn().await;
    channel.announce_join("standup", "alice").expect("announce");
    let (index, _) = server.next_frame().await;
    assert_eq!(index, first.index);

    first.close();

    let second = server.next_conn().await;
    assert_ne!(second.index, first.index);
    let (index, frame) = server.next_frame().await;
    assert_eq!(index, second.index);
    assert_eq!(frame["event"], "join-room");
    assert_eq!(frame["data"]["peerId"], "alice");
    wait_for_state(&channel, ChannelState::Connected).await;

    let mut saw_reconnecting = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SignalingEvent::State(ChannelState::Reconnecting { attempt: 1 })) {
            saw_reconnecting = true;
        }
    }
    assert!(saw_reconnecting, "supervisor reported the reconnect");

    second.send(ServerEvent::UserConnected(PeerRef::raw("carol")));
    assert_eq!(
        next_room_event(&mut events).await,
        SignalingEvent::PeerJoined(PeerRef::raw("carol"))
    );

    channel.destroy();
}

#[test_timeout::tokio_timeout_test(20)]
async fn unreachable_server_ends_disconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let policy = BackoffPolicy::linear(Duration::from_millis(20), 2);
    let (channel, _events) = open_channel(&format!("http://{addr}/"), policy);
    wait_for_state(&channel, ChannelState::Disconnected).await;

    assert_eq!(
        channel.announce_join("standup", "alice"),
        Err(SignalingError::Disconnected)
    );
}
