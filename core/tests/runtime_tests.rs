/// End-to-end runtime tests against a local stub backend
/// (hyper for REST, tokio-tungstenite for the push feeds)
extern crate chatline_core;

use chatline_core::feed::{FeedKind, FeedState, ReconnectPolicy};
use chatline_core::runtime::{ChatHandle, RuntimeStatus};
use chatline_core::types::{MessageId, RoomId, UserId, ViewEvent};
use chatline_core::{Backend, ChatRuntime, Config};
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::Message;

const TOKEN: &str = "test-token";
const ROOMS_PATH: &str = "/messages/rooms/socket";
const WAIT: Duration = Duration::from_secs(5);

struct Stub {
    /// Message ids per room
    rooms: HashMap<i64, Vec<i64>>,
    /// Artificial latency for `/messages` per room
    delays: HashMap<i64, Duration>,
    room_snapshot: String,
    /// Query strings of every `/messages` request
    requests: Mutex<Vec<String>>,
    /// (socket path, frame) pushed to matching feed connections
    pushes: broadcast::Sender<(String, String)>,
    /// Socket paths, in connection order
    connected: Mutex<Vec<String>>,
    /// Socket paths whose client sent a close frame
    closed: Mutex<Vec<String>>,
}

impl Stub {
    fn new(room_snapshot: serde_json::Value) -> Self {
        let (pushes, _) = broadcast::channel(64);
        Self {
            rooms: HashMap::new(),
            delays: HashMap::new(),
            room_snapshot: room_snapshot.to_string(),
            requests: Mutex::new(Vec::new()),
            pushes,
            connected: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        }
    }

    fn with_room(mut self, room_id: i64, ids: std::ops::RangeInclusive<i64>) -> Self {
        self.rooms.insert(room_id, ids.collect());
        self
    }

    fn with_delay(mut self, room_id: i64, delay: Duration) -> Self {
        self.delays.insert(room_id, delay);
        self
    }

    fn push(&self, path: &str, frame: serde_json::Value) {
        self.pushes
            .send((path.to_string(), frame.to_string()))
            .unwrap();
    }

    fn push_raw(&self, path: &str, frame: &str) {
        self.pushes
            .send((path.to_string(), frame.to_string()))
            .unwrap();
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn was_connected(&self, path: &str) -> bool {
        self.connected.lock().unwrap().iter().any(|p| p == path)
    }

    fn was_closed(&self, path: &str) -> bool {
        self.closed.lock().unwrap().iter().any(|p| p == path)
    }
}

fn message(id: i64) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "content": format!("message {}", id),
        "sender_id": 7,
        "messageType": "text",
    })
}

fn query_param(query: &str, key: &str) -> Option<i64> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| v.parse().ok())
}

async fn handle_http(
    req: Request<hyper::body::Incoming>,
    stub: Arc<Stub>,
) -> Response<Full<bytes::Bytes>> {
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer test-token");
    if !authorized {
        return Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .body(Full::new(bytes::Bytes::new()))
            .unwrap();
    }
    if req.uri().path() != "/messages" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(bytes::Bytes::new()))
            .unwrap();
    }

    let query = req.uri().query().unwrap_or("").to_string();
    stub.requests.lock().unwrap().push(query.clone());
    let room_id = query_param(&query, "room_id").unwrap_or(0);
    let limit = query_param(&query, "limit").unwrap_or(200) as usize;
    let before = query_param(&query, "before_id");

    if let Some(delay) = stub.delays.get(&room_id) {
        sleep(*delay).await;
    }

    let mut ids: Vec<i64> = stub
        .rooms
        .get(&room_id)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|id| before.map_or(true, |b| *id < b))
        .collect();
    ids.sort_unstable_by(|a, b| b.cmp(a));
    ids.truncate(limit);
    let messages: Vec<_> = ids.into_iter().map(message).collect();

    let body = serde_json::json!({ "messages": messages }).to_string();
    Response::builder()
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)))
        .unwrap()
}

async fn serve_http(listener: TcpListener, stub: Arc<Stub>) {
    while let Ok((stream, _)) = listener.accept().await {
        let stub = stub.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let stub = stub.clone();
                async move { Ok::<_, Infallible>(handle_http(req, stub).await) }
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), svc)
                .await;
        });
    }
}

async fn serve_ws(listener: TcpListener, stub: Arc<Stub>) {
    while let Ok((stream, _)) = listener.accept().await {
        let stub = stub.clone();
        tokio::spawn(async move {
            // Subscribe before the handshake completes so no push is missed
            let mut pushes = stub.pushes.subscribe();
            let seen_path = Arc::new(Mutex::new(String::new()));
            let record = seen_path.clone();
            let callback =
                move |req: &WsRequest, resp: WsResponse| -> Result<WsResponse, ErrorResponse> {
                    *record.lock().unwrap() = req.uri().path().to_string();
                    Ok(resp)
                };
            let Ok(ws) = accept_hdr_async(stream, callback).await else {
                return;
            };
            let path = seen_path.lock().unwrap().clone();
            stub.connected.lock().unwrap().push(path.clone());
            let (mut write, mut read) = ws.split();

            if path == ROOMS_PATH
                && write
                    .send(Message::text(stub.room_snapshot.clone()))
                    .await
                    .is_err()
            {
                return;
            }

            loop {
                tokio::select! {
                    push = pushes.recv() => match push {
                        Ok((target, frame)) if target == path => {
                            if write.send(Message::text(frame)).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(_) => return,
                    },
                    msg = read.next() => match msg {
                        Some(Ok(Message::Close(_))) => {
                            stub.closed.lock().unwrap().push(path.clone());
                            return;
                        }
                        Some(Err(_)) | None => return,
                        Some(Ok(_)) => {}
                    },
                }
            }
        });
    }
}

/// Start the stub backend and a runtime pointed at it
async fn start(stub: Stub) -> (Arc<Stub>, ChatHandle, broadcast::Receiver<ViewEvent>) {
    let stub = Arc::new(stub);
    let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api_url = format!("http://{}", http.local_addr().unwrap());
    let ws_url = format!("ws://{}", ws.local_addr().unwrap());
    tokio::spawn(serve_http(http, stub.clone()));
    tokio::spawn(serve_ws(ws, stub.clone()));

    let config = Config {
        api_url: api_url.clone(),
        ws_url: Some(ws_url.clone()),
        token: Some(TOKEN.to_string()),
        reconnect: ReconnectPolicy::disabled(),
        ..Config::default()
    };
    let backend = Backend::new(&api_url, Some(&ws_url), TOKEN, None).unwrap();
    let (runtime, handle) = ChatRuntime::new(&config, backend);
    let events = handle.subscribe();
    tokio::spawn(runtime.run());
    (stub, handle, events)
}

async fn next_matching<F>(rx: &mut broadcast::Receiver<ViewEvent>, mut pred: F) -> ViewEvent
where
    F: FnMut(&ViewEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("runtime stopped"),
            }
        }
    })
    .await
    .expect("timed out waiting for view event")
}

async fn wait_for_status<F>(handle: &ChatHandle, pred: F) -> RuntimeStatus
where
    F: Fn(&RuntimeStatus) -> bool,
{
    timeout(WAIT, async {
        loop {
            let status = handle.status().await.unwrap();
            if pred(&status) {
                return status;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for runtime status")
}

async fn wait_until<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    let reached = timeout(WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

fn room_ids(ev: &ViewEvent) -> Vec<i64> {
    match ev {
        ViewEvent::RoomsUpdated { rooms } => rooms.iter().map(|r| r.room_id.0).collect(),
        _ => Vec::new(),
    }
}

fn is_rooms(ev: &ViewEvent) -> bool {
    matches!(ev, ViewEvent::RoomsUpdated { .. })
}

#[tokio::test]
async fn test_room_feed_snapshot_then_update_reorders() {
    let snapshot = serde_json::json!([
        { "room_id": 1, "name": "one", "last_message": "a", "last_message_id": 10 },
        { "room_id": 2, "name": "two", "last_message": "b", "last_message_id": 20 },
    ]);
    let (stub, handle, mut events) = start(Stub::new(snapshot)).await;

    let ev = next_matching(&mut events, is_rooms).await;
    assert_eq!(room_ids(&ev), vec![2, 1]);

    stub.push(
        ROOMS_PATH,
        serde_json::json!({
            "event": "room_update",
            "room_id": 1,
            "last_message": "hi",
            "last_message_id": 30,
        }),
    );
    let ev = next_matching(&mut events, is_rooms).await;
    assert_eq!(room_ids(&ev), vec![1, 2]);

    let rooms = handle.rooms().await.unwrap();
    assert_eq!(rooms[0].name, "one");
    assert_eq!(rooms[0].last_message, "hi");

    // A malformed frame is dropped and the feed keeps working
    stub.push_raw(ROOMS_PATH, "not json");
    stub.push(
        ROOMS_PATH,
        serde_json::json!({ "event": "room_update", "room_id": 3, "name": "three", "last_message_id": 40 }),
    );
    let ev = next_matching(&mut events, is_rooms).await;
    assert_eq!(room_ids(&ev), vec![3, 1, 2]);

    let status = handle.status().await.unwrap();
    assert_eq!(status.rooms_feed, Some(FeedState::Open));
    assert_eq!(status.room_count, 3);
    handle.shutdown().unwrap();
}

#[tokio::test]
async fn test_thread_initial_load_push_and_backward_pages() {
    let stub = Stub::new(serde_json::json!([])).with_room(1, 1..=250);
    let (stub, handle, mut events) = start(stub).await;
    let thread_path = "/messages/1/socket";

    handle.select_room(RoomId(1)).unwrap();
    let ev = next_matching(&mut events, |ev| {
        matches!(ev, ViewEvent::ThreadUpdated { thread } if thread.messages.len() == 200 && !thread.loading)
    })
    .await;
    let ViewEvent::ThreadUpdated { thread } = ev else {
        unreachable!()
    };
    assert_eq!(thread.messages.first().unwrap().id, MessageId(250));
    assert_eq!(thread.messages.last().unwrap().id, MessageId(51));

    wait_for_status(&handle, |s| s.thread_feed == Some(FeedState::Open)).await;

    // Live pushes: sender table, a batch overlapping the window, a duplicate single
    stub.push(thread_path, serde_json::json!({ "users": [{ "id": 7, "name": "Ada" }] }));
    stub.push(thread_path, serde_json::json!({ "messages": [message(251), message(250)] }));
    stub.push(thread_path, message(251));
    stub.push(thread_path, message(252));

    let ev = next_matching(&mut events, |ev| {
        matches!(ev, ViewEvent::ThreadUpdated { thread } if thread.messages.len() == 202)
    })
    .await;
    let ViewEvent::ThreadUpdated { thread } = ev else {
        unreachable!()
    };
    assert_eq!(thread.messages[0].id, MessageId(252));
    assert_eq!(thread.messages[1].id, MessageId(251));
    assert_eq!(thread.sender_name(UserId(7)), "Ada");
    assert_eq!(thread.sender_name(UserId(99)), "Unknown");

    // Far from the top: nothing to fetch
    handle.scroll(500.0).unwrap();
    // Near the top: one backward page
    handle.scroll(0.0).unwrap();
    handle.scroll(0.0).unwrap();
    let ev = next_matching(&mut events, |ev| {
        matches!(ev, ViewEvent::ThreadUpdated { thread } if thread.messages.len() == 252 && !thread.loading)
    })
    .await;
    let ViewEvent::ThreadUpdated { thread } = ev else {
        unreachable!()
    };
    assert_eq!(thread.messages.last().unwrap().id, MessageId(1));
    assert!(!thread.reached_start);

    // Nothing older left: the empty page marks the start of the conversation
    handle.scroll(0.0).unwrap();
    next_matching(&mut events, |ev| {
        matches!(ev, ViewEvent::ThreadUpdated { thread } if thread.reached_start)
    })
    .await;

    let requests = stub.requests();
    assert_eq!(requests.len(), 3, "requests: {:?}", requests);
    assert!(!requests[0].contains("before_id"));
    assert!(requests[1].contains("before_id=51"));
    assert!(requests[2].contains("before_id=1"));

    // Once the start is reached, scrolling issues nothing further
    handle.scroll(0.0).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(stub.requests().len(), 3);
    handle.shutdown().unwrap();
}

#[tokio::test]
async fn test_switching_rooms_drops_late_page() {
    let stub = Stub::new(serde_json::json!([]))
        .with_room(1, 1..=5)
        .with_room(2, 1001..=1005)
        .with_delay(1, Duration::from_millis(300));
    let (_stub, handle, mut events) = start(stub).await;

    handle.select_room(RoomId(1)).unwrap();
    handle.select_room(RoomId(2)).unwrap();

    next_matching(&mut events, |ev| {
        matches!(ev, ViewEvent::ThreadUpdated { thread }
            if thread.room_id == RoomId(2) && thread.messages.len() == 5)
    })
    .await;

    // Let room 1's slow response arrive
    sleep(Duration::from_millis(500)).await;
    let thread = handle.thread().await.unwrap().unwrap();
    assert_eq!(thread.room_id, RoomId(2));
    assert_eq!(thread.messages.len(), 5);
    assert!(thread.messages.iter().all(|m| m.id.0 > 1000));

    handle.close_room().unwrap();
    next_matching(&mut events, |ev| {
        matches!(ev, ViewEvent::ThreadClosed { room_id } if *room_id == RoomId(2))
    })
    .await;
    assert!(handle.thread().await.unwrap().is_none());
    let status = handle.status().await.unwrap();
    assert_eq!(status.open_room, None);
    handle.shutdown().unwrap();
}

#[tokio::test]
async fn test_switching_rooms_closes_previous_thread_socket() {
    let stub = Stub::new(serde_json::json!([]))
        .with_room(1, 1..=3)
        .with_room(2, 11..=13);
    let (stub, handle, mut events) = start(stub).await;
    wait_until("rooms feed", || stub.was_connected(ROOMS_PATH)).await;

    handle.select_room(RoomId(1)).unwrap();
    next_matching(&mut events, |ev| {
        matches!(ev, ViewEvent::ThreadUpdated { thread }
            if thread.room_id == RoomId(1) && thread.messages.len() == 3)
    })
    .await;
    wait_until("room 1 socket", || stub.was_connected("/messages/1/socket")).await;
    assert!(!stub.was_closed("/messages/1/socket"));

    handle.select_room(RoomId(2)).unwrap();
    wait_until("room 1 socket close", || stub.was_closed("/messages/1/socket")).await;
    wait_until("room 2 socket", || stub.was_connected("/messages/2/socket")).await;
    assert!(!stub.was_closed("/messages/2/socket"));

    handle.close_room().unwrap();
    wait_until("room 2 socket close", || stub.was_closed("/messages/2/socket")).await;

    // The conversation list feed outlives thread switches
    assert!(!stub.was_closed(ROOMS_PATH));
    let status = handle.status().await.unwrap();
    assert_eq!(status.open_room, None);
    handle.shutdown().unwrap();
}

#[tokio::test]
async fn test_view_api_routes() {
    let snapshot = serde_json::json!([
        { "room_id": 4, "name": "ops", "last_message": "x", "last_message_id": 9 },
    ]);
    let stub = Stub::new(snapshot).with_room(4, 1..=3);
    let (_stub, handle, mut events) = start(stub).await;
    next_matching(&mut events, is_rooms).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(chatline_core::view_api::serve(
        listener,
        handle.clone(),
        Some("ada".to_string()),
    ));
    let client = reqwest::Client::new();

    let rooms: serde_json::Value = client
        .get(format!("{}/api/rooms", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rooms["rooms"][0]["room_id"], 4);

    let resp = client.get(format!("{}/api/thread", base)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    let resp = client
        .post(format!("{}/api/thread", base))
        .json(&serde_json::json!({ "room_id": 4 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    next_matching(&mut events, |ev| {
        matches!(ev, ViewEvent::ThreadUpdated { thread } if thread.messages.len() == 3)
    })
    .await;
    let thread: serde_json::Value = client
        .get(format!("{}/api/thread", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(thread["thread"]["room_id"], 4);
    assert_eq!(thread["thread"]["messages"][0]["id"], 3);

    let resp = client
        .post(format!("{}/api/thread/scroll", base))
        .body("{oops")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let status: serde_json::Value = client
        .get(format!("{}/api/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["user"], "ada");
    assert_eq!(status["open_room"], 4);
    assert_eq!(status["rooms_feed"]["state"], "open");

    let mut sse = client.get(format!("{}/events", base)).send().await.unwrap();
    assert_eq!(sse.status().as_u16(), 200);
    assert!(sse.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let hello = timeout(WAIT, sse.chunk()).await.unwrap().unwrap().unwrap();
    assert!(hello.starts_with(b": connected\n\n"));

    let resp = client.delete(format!("{}/api/thread", base)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let mut text = String::from_utf8(hello[": connected\n\n".len()..].to_vec()).unwrap();
    while !text.contains("\"thread_closed\"") {
        let chunk = timeout(WAIT, sse.chunk()).await.unwrap().unwrap().unwrap();
        text.push_str(std::str::from_utf8(&chunk).unwrap());
    }
    assert!(text.lines().filter(|l| !l.is_empty()).all(|l| l.starts_with("data: ")));
    handle.shutdown().unwrap();
}

#[tokio::test]
async fn test_unreachable_feed_reports_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let api_url = format!("http://{}", addr);
    let config = Config {
        reconnect: ReconnectPolicy::disabled(),
        ..Config::default()
    };
    let backend = Backend::new(&api_url, None, TOKEN, None).unwrap();
    let (runtime, handle) = ChatRuntime::new(&config, backend);
    let mut events = handle.subscribe();
    let task = tokio::spawn(runtime.run());

    let ev = next_matching(&mut events, |ev| {
        matches!(ev, ViewEvent::FeedState { feed: FeedKind::Rooms, state: FeedState::Failed { .. } })
    })
    .await;
    assert!(matches!(ev, ViewEvent::FeedState { .. }));

    handle.shutdown().unwrap();
    task.await.unwrap().unwrap();
    assert!(handle.rooms().await.is_err());
}
