/// Local view API: HTTP + SSE front end to the chat runtime
///
/// Endpoints:
///   GET    /api/status
///   GET    /api/rooms
///   GET    /api/thread               404 when no conversation is open
///   POST   /api/thread               body: {"room_id": N}
///   DELETE /api/thread
///   POST   /api/thread/scroll        body: {"scroll_top": px}
///   GET    /events                   SSE stream of ViewEvent JSON
use crate::error::Result;
use crate::runtime::ChatHandle;
use crate::types::{RoomId, ViewEvent};
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

struct ViewState {
    handle: ChatHandle,
    /// Display name of the signed-in user, when validated
    user: Option<String>,
}

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn empty_resp(status: StatusCode) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .body(Full::new(bytes::Bytes::new()).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_ok(value: serde_json::Value) -> Resp {
    json_resp(StatusCode::OK, serde_json::to_vec(&value).unwrap_or_default())
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg })).unwrap_or_default(),
    )
}

fn sse_resp(rx: broadcast::Receiver<ViewEvent>) -> Resp {
    let initial = bytes::Bytes::from(": connected\n\n");
    let first = futures_util::stream::once(async move {
        Ok::<Frame<bytes::Bytes>, Infallible>(Frame::data(initial))
    });

    let events = unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    let data = format!("data: {}\n\n", json);
                    let frame = Frame::data(bytes::Bytes::from(data));
                    return Some((Ok::<_, Infallible>(frame), rx));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Every event carries full state, so skipping is harmless
                    warn!("SSE client lagged {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    cors_headers(Response::builder())
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(BodyExt::boxed(StreamBody::new(first.chain(events))))
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

/// Bind `addr` and serve until the process exits
pub async fn start_view_api(
    handle: ChatHandle,
    user: Option<String>,
    addr: SocketAddr,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, handle, user).await
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, handle: ChatHandle, user: Option<String>) -> Result<()> {
    info!("View API listening on http://{}", listener.local_addr()?);
    let state = Arc::new(ViewState { handle, user });

    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let state = state.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle_request(req, state).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // SSE clients disconnect mid-body
                        if !e.is_incomplete_message() {
                            error!("View API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("View API accept error: {}", e),
        }
    }
}

async fn handle_request(req: Request<hyper::body::Incoming>, state: Arc<ViewState>) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::OPTIONS {
        return empty_resp(StatusCode::NO_CONTENT);
    }

    match (method, path.as_str()) {
        (Method::GET, "/api/status") => get_status(&state).await,
        (Method::GET, "/api/rooms") => get_rooms(&state).await,
        (Method::GET, "/api/thread") => get_thread(&state).await,
        (Method::POST, "/api/thread") => post_thread(req, &state).await,
        (Method::DELETE, "/api/thread") => delete_thread(&state),
        (Method::POST, "/api/thread/scroll") => post_scroll(req, &state).await,
        (Method::GET, "/events") => sse_resp(state.handle.subscribe()),
        _ => json_err(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn get_status(state: &ViewState) -> Resp {
    match state.handle.status().await {
        Ok(status) => json_ok(serde_json::json!({
            "user": state.user,
            "rooms_feed": status.rooms_feed,
            "thread_feed": status.thread_feed,
            "open_room": status.open_room,
            "room_count": status.room_count,
        })),
        Err(e) => json_err(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

async fn get_rooms(state: &ViewState) -> Resp {
    match state.handle.rooms().await {
        Ok(rooms) => json_ok(serde_json::json!({ "rooms": rooms })),
        Err(e) => json_err(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

async fn get_thread(state: &ViewState) -> Resp {
    match state.handle.thread().await {
        Ok(Some(thread)) => json_ok(serde_json::json!({ "thread": thread })),
        Ok(None) => json_err(StatusCode::NOT_FOUND, "no conversation open"),
        Err(e) => json_err(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

#[derive(Deserialize)]
struct SelectRequest {
    room_id: RoomId,
}

async fn post_thread(req: Request<hyper::body::Incoming>, state: &ViewState) -> Resp {
    let r: SelectRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.handle.select_room(r.room_id) {
        Ok(()) => json_ok(serde_json::json!({ "room_id": r.room_id })),
        Err(e) => json_err(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

fn delete_thread(state: &ViewState) -> Resp {
    match state.handle.close_room() {
        Ok(()) => json_ok(serde_json::json!({ "success": true })),
        Err(e) => json_err(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

#[derive(Deserialize)]
struct ScrollRequest {
    scroll_top: f64,
}

async fn post_scroll(req: Request<hyper::body::Incoming>, state: &ViewState) -> Resp {
    let r: ScrollRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.handle.scroll(r.scroll_top) {
        Ok(()) => json_ok(serde_json::json!({ "success": true })),
        Err(e) => json_err(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<T, Resp> {
    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)))?;
    serde_json::from_slice(&body)
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)))
}
