//! In-process portal doubles for the integration tests: a protoo SFU
//! (conference signaling over WebSocket) and a livestream HTTP portal.
//!
//! Each test binary pulls in only the half it needs.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Conference portal (protoo over WebSocket)
// ---------------------------------------------------------------------------

pub struct MockSfu {
    pub http_base: String,
    pub ws_base: String,
    state: Arc<SfuState>,
}

#[derive(Default)]
pub struct SfuState {
    /// Request methods the server swallows without responding.
    silent: Mutex<HashSet<String>>,
    /// Every inbound frame, in arrival order across all sockets.
    received: Mutex<Vec<Value>>,
    rooms: Mutex<HashMap<String, Room>>,
    next_server_request_id: AtomicU64,
    next_entity_id: AtomicU64,
}

#[derive(Default)]
struct Room {
    peers: HashMap<String, PeerEntry>,
}

struct PeerEntry {
    outbox: mpsc::UnboundedSender<String>,
    closer: mpsc::UnboundedSender<()>,
    producers: Vec<ProducerRecord>,
}

#[derive(Clone)]
enum ProducerRecord {
    Audio {
        producer_id: String,
    },
    Data {
        producer_id: String,
        stream_id: u16,
        label: String,
        protocol: String,
    },
}

impl MockSfu {
    pub async fn spawn() -> Self {
        let state = Arc::new(SfuState::default());
        let router = Router::new()
            .route("/auth-token", get(auth_token))
            .route("/conference/connect", get(conference_connect))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock sfu");
        let addr = listener.local_addr().expect("mock sfu addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("mock sfu serve");
        });

        Self {
            http_base: format!("http://{addr}"),
            ws_base: format!("ws://{addr}"),
            state,
        }
    }

    /// Swallow requests of this method (the client should time out).
    pub fn silence(&self, method: &str) {
        self.state
            .silent
            .lock()
            .unwrap()
            .insert(method.to_owned());
    }

    /// Methods of every request/notification received so far, in order.
    pub fn received_methods(&self) -> Vec<String> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| frame.get("method").and_then(Value::as_str))
            .map(str::to_owned)
            .collect()
    }

    /// Every frame received so far, including client responses.
    pub fn received_frames(&self) -> Vec<Value> {
        self.state.received.lock().unwrap().clone()
    }

    /// Push a raw frame to a connected peer's socket.
    pub fn send_raw_to(&self, user_id: &str, frame: Value) {
        let rooms = self.state.rooms.lock().unwrap();
        for room in rooms.values() {
            if let Some(peer) = room.peers.get(user_id) {
                let _ = peer.outbox.send(frame.to_string());
            }
        }
    }

    pub fn peers_in_room(&self, room_id: &str) -> usize {
        self.state
            .rooms
            .lock()
            .unwrap()
            .get(room_id)
            .map(|room| room.peers.len())
            .unwrap_or(0)
    }

    /// Server-side kill of one peer's socket.
    pub fn disconnect(&self, user_id: &str) {
        let rooms = self.state.rooms.lock().unwrap();
        for room in rooms.values() {
            if let Some(peer) = room.peers.get(user_id) {
                let _ = peer.closer.send(());
            }
        }
    }
}

async fn auth_token(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let uid = params.get("uid").cloned().unwrap_or_default();
    axum::Json(json!({"data": format!("token-{uid}")}))
}

async fn conference_connect(
    State(state): State<Arc<SfuState>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let room_id = params.get("rid").cloned().unwrap_or_default();
    let token = params.get("token").cloned().unwrap_or_default();
    let user_id = token
        .strip_prefix("token-")
        .unwrap_or(token.as_str())
        .to_owned();

    ws.protocols(["protoo"])
        .on_upgrade(move |socket| handle_peer(state, socket, room_id, user_id))
}

async fn handle_peer(
    state: Arc<SfuState>,
    mut socket: WebSocket,
    room_id: String,
    user_id: String,
) {
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<String>();
    let (closer, mut closer_rx) = mpsc::unbounded_channel::<()>();
    {
        let mut rooms = state.rooms.lock().unwrap();
        rooms.entry(room_id.clone()).or_default().peers.insert(
            user_id.clone(),
            PeerEntry {
                outbox: outbox.clone(),
                closer,
                producers: Vec::new(),
            },
        );
    }

    loop {
        tokio::select! {
            _ = closer_rx.recv() => break,
            Some(frame) = outbox_rx.recv() => {
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    state.received.lock().unwrap().push(frame.clone());
                    if frame.get("request").and_then(Value::as_bool).unwrap_or(false) {
                        handle_request(&state, &room_id, &user_id, &outbox, &frame);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    }

    let mut rooms = state.rooms.lock().unwrap();
    if let Some(room) = rooms.get_mut(&room_id) {
        room.peers.remove(&user_id);
    }
}

fn handle_request(
    state: &Arc<SfuState>,
    room_id: &str,
    user_id: &str,
    outbox: &mpsc::UnboundedSender<String>,
    frame: &Value,
) {
    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let id = frame.get("id").and_then(Value::as_u64).unwrap_or(0);
    let data = frame.get("data").cloned().unwrap_or(Value::Null);

    if state.silent.lock().unwrap().contains(&method) {
        return;
    }

    let mut fanout: Vec<(mpsc::UnboundedSender<String>, String)> = Vec::new();
    let response = match method.as_str() {
        "join" => ok_response(id, json!({})),
        "getRouterRtpCapabilities" => ok_response(
            id,
            json!({
                "codecs": [{
                    "kind": "audio",
                    "mimeType": "audio/opus",
                    "clockRate": 48000,
                    "channels": 2,
                }],
                "headerExtensions": [],
            }),
        ),
        "createWebRtcTransport" => ok_response(
            id,
            json!({
                "sendTransport": {"transportId": format!("st-{user_id}")},
                "recvTransport": {"transportId": format!("rt-{user_id}")},
            }),
        ),
        "connectWebRtcTransport" => ok_response(id, json!({})),
        "consumeAllExistingProducer" => {
            let rooms = state.rooms.lock().unwrap();
            let mut infos = Vec::new();
            if let Some(room) = rooms.get(room_id) {
                for (peer_id, entry) in &room.peers {
                    if peer_id == user_id {
                        continue;
                    }
                    for producer in &entry.producers {
                        infos.push(consumer_info(state, peer_id, producer));
                    }
                }
            }
            ok_response(id, Value::Array(infos))
        }
        "produce" => {
            let n = state.next_entity_id.fetch_add(1, Ordering::SeqCst);
            let producer_id = format!("{user_id}-audio-{n}");
            let record = ProducerRecord::Audio {
                producer_id: producer_id.clone(),
            };

            let mut rooms = state.rooms.lock().unwrap();
            if let Some(room) = rooms.get_mut(room_id) {
                if let Some(entry) = room.peers.get_mut(user_id) {
                    entry.producers.push(record.clone());
                }
                for (peer_id, entry) in &room.peers {
                    if peer_id == user_id {
                        continue;
                    }
                    let request_id =
                        state.next_server_request_id.fetch_add(1, Ordering::SeqCst);
                    let mut info = consumer_info(state, user_id, &record);
                    let obj = info.as_object_mut().unwrap();
                    let producer_type = obj.remove("producerType").unwrap();
                    obj.insert("kind".to_owned(), producer_type);
                    obj.insert("producerPaused".to_owned(), Value::from(false));
                    fanout.push((
                        entry.outbox.clone(),
                        json!({
                            "request": true,
                            "id": request_id,
                            "method": "newConsumer",
                            "data": info,
                        })
                        .to_string(),
                    ));
                }
            }

            ok_response(id, json!({"producerId": producer_id}))
        }
        "produceData" => {
            let n = state.next_entity_id.fetch_add(1, Ordering::SeqCst);
            let producer_id = format!("{user_id}-data-{n}");
            let record = ProducerRecord::Data {
                producer_id: producer_id.clone(),
                stream_id: (n % u64::from(u16::MAX)) as u16,
                label: data
                    .get("label")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                protocol: data
                    .get("protocol")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            };

            let mut rooms = state.rooms.lock().unwrap();
            if let Some(room) = rooms.get_mut(room_id) {
                if let Some(entry) = room.peers.get_mut(user_id) {
                    entry.producers.push(record.clone());
                }
                for (peer_id, entry) in &room.peers {
                    if peer_id == user_id {
                        continue;
                    }
                    let request_id =
                        state.next_server_request_id.fetch_add(1, Ordering::SeqCst);
                    let mut info = consumer_info(state, user_id, &record);
                    info.as_object_mut().unwrap().remove("producerType");
                    fanout.push((
                        entry.outbox.clone(),
                        json!({
                            "request": true,
                            "id": request_id,
                            "method": "newDataConsumer",
                            "data": info,
                        })
                        .to_string(),
                    ));
                }
            }

            ok_response(id, json!({"producerId": producer_id}))
        }
        _ => json!({
            "response": true,
            "ok": false,
            "id": id,
            "method": "ws-response",
            "errorReason": "not found",
        })
        .to_string(),
    };

    let _ = outbox.send(response);
    for (peer_outbox, frame) in fanout {
        let _ = peer_outbox.send(frame);
    }
}

fn ok_response(id: u64, data: Value) -> String {
    json!({
        "response": true,
        "ok": true,
        "id": id,
        "method": "ws-response",
        "data": data,
    })
    .to_string()
}

fn consumer_info(state: &Arc<SfuState>, peer_id: &str, producer: &ProducerRecord) -> Value {
    let consumer_id = format!(
        "consumer-{}",
        state.next_entity_id.fetch_add(1, Ordering::SeqCst)
    );
    match producer {
        ProducerRecord::Audio { producer_id } => json!({
            "userId": peer_id,
            "consumerId": consumer_id,
            "producerId": producer_id,
            "producerType": "audio",
            "rtpParameters": {},
        }),
        ProducerRecord::Data {
            producer_id,
            stream_id,
            label,
            protocol,
        } => json!({
            "userId": peer_id,
            "consumerId": consumer_id,
            "producerId": producer_id,
            "producerType": "data",
            "streamId": stream_id,
            "label": label,
            "protocol": protocol,
        }),
    }
}

// ---------------------------------------------------------------------------
// Livestream portal (HTTP only)
// ---------------------------------------------------------------------------

pub struct MockLivePortal {
    pub http_base: String,
    state: Arc<LiveState>,
}

pub struct LiveState {
    sign_ok: AtomicBool,
    stream_exists: AtomicBool,
    resumes: AtomicU32,
    pings: AtomicU32,
}

impl MockLivePortal {
    pub async fn spawn() -> Self {
        let state = Arc::new(LiveState {
            sign_ok: AtomicBool::new(true),
            stream_exists: AtomicBool::new(true),
            resumes: AtomicU32::new(0),
            pings: AtomicU32::new(0),
        });

        let router = Router::new()
            .route("/stats/sign", get(live_sign))
            .route("/live/ping", get(live_ping))
            .route("/live/{streamer}/watch", post(live_watch))
            .route("/live/{streamer}/consume", post(live_consume))
            .route("/live/{streamer}/connectTransport", post(live_connect))
            .route("/live/{streamer}/resume", post(live_resume))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock live portal");
        let addr = listener.local_addr().expect("mock live portal addr");
        tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("mock live portal serve");
        });

        Self {
            http_base: format!("http://{addr}"),
            state,
        }
    }

    pub fn refuse_sign(&self) {
        self.state.sign_ok.store(false, Ordering::SeqCst);
    }

    pub fn drop_stream(&self) {
        self.state.stream_exists.store(false, Ordering::SeqCst);
    }

    pub fn resume_count(&self) -> u32 {
        self.state.resumes.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> u32 {
        self.state.pings.load(Ordering::SeqCst)
    }
}

async fn live_sign(State(state): State<Arc<LiveState>>) -> impl IntoResponse {
    if state.sign_ok.load(Ordering::SeqCst) {
        axum::Json(json!({"ok": true, "token": "viewer-token"}))
    } else {
        axum::Json(json!({"ok": false}))
    }
}

async fn live_watch(
    State(state): State<Arc<LiveState>>,
    Path(streamer): Path<String>,
) -> impl IntoResponse {
    if !state.stream_exists.load(Ordering::SeqCst) {
        return axum::Json(json!({"ok": false, "reason": "stream not found"}));
    }
    axum::Json(json!({
        "ok": true,
        "routerRtpCapabilities": {"codecs": [], "headerExtensions": []},
        "transportId": format!("viewer-transport-{streamer}"),
    }))
}

async fn live_consume(Path(streamer): Path<String>) -> impl IntoResponse {
    axum::Json(json!({
        "ok": true,
        "data": [{
            "ok": true,
            "consumerId": format!("screen-consumer-{streamer}"),
            "producerId": format!("screen-producer-{streamer}"),
            "producerType": "screen",
            "rtpParameters": {},
        }],
    }))
}

async fn live_connect(Path(_streamer): Path<String>) -> impl IntoResponse {
    axum::Json(json!({"ok": true}))
}

async fn live_resume(
    State(state): State<Arc<LiveState>>,
    Path(_streamer): Path<String>,
) -> impl IntoResponse {
    state.resumes.fetch_add(1, Ordering::SeqCst);
    axum::Json(json!({"ok": true}))
}

async fn live_ping(State(state): State<Arc<LiveState>>) -> impl IntoResponse {
    state.pings.fetch_add(1, Ordering::SeqCst);
    axum::Json(json!({"ok": true}))
}
