//! Conference session controller.
//!
//! One `ConferencePeer` emulates a full conference participant: it fetches
//! an auth token, opens a protoo socket, walks the mediasoup join script,
//! produces synthetic audio and data, and consumes whatever the other room
//! members produce. Every piece of session state is mutated on the
//! session's executor; protoo callbacks are trampolined onto it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use rand::Rng as _;
use serde_json::{Value, json};
use stampede_media::engine::PeerConnectionFactory;
use stampede_media::{
    AudioData, AudioSender, ConnectionState, ConsumerOptions, CreateTransportOptions,
    DataConsumerOptions, DataSender, Device, DeviceDelegate, DummyAudioConsumer, MediaKind,
    ProducerOptions, TransportKind, rtc_timestamp_ms,
};
use stampede_protocol::{ConsumerInfo, ProducerKind, ProtooNotification, ProtooRequest, frame};
use tracing::{debug, error, info, warn};

use crate::consumer::{ReportDataConsumer, ReportVideoConsumer};
use crate::executor::{Executor, ExecutorClosed};
use crate::http::{self, Endpoints};
use crate::protoo::ProtooClient;

/// Scratch buffer regenerated every tick: 440 frames of 16-bit stereo.
const SCRATCH_LEN: usize = 1760;

/// 440 frames at 44 kHz is 10 ms of audio per tick.
const AUDIO_FRAMES_PER_TICK: u32 = 440;
const AUDIO_SAMPLE_RATE: u32 = 44_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConferenceStatus {
    Idle,
    New,
    Checking,
    Connecting,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
    Exception,
}

impl ConferenceStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ConferenceStatus::Idle => "idle",
            ConferenceStatus::New => "new",
            ConferenceStatus::Checking => "checking",
            ConferenceStatus::Connecting => "connecting",
            ConferenceStatus::Connected => "connected",
            ConferenceStatus::Completed => "completed",
            ConferenceStatus::Failed => "failed",
            ConferenceStatus::Disconnected => "disconnected",
            ConferenceStatus::Closed => "closed",
            ConferenceStatus::Exception => "exception",
        }
    }

    fn from_connection_state(state: ConnectionState) -> Self {
        match state {
            ConnectionState::New => ConferenceStatus::New,
            ConnectionState::Checking => ConferenceStatus::Checking,
            ConnectionState::Connected => ConferenceStatus::Connected,
            ConnectionState::Completed => ConferenceStatus::Completed,
            ConnectionState::Failed => ConferenceStatus::Failed,
            ConnectionState::Disconnected => ConferenceStatus::Disconnected,
            ConnectionState::Closed => ConferenceStatus::Closed,
        }
    }
}

/// Dashboard snapshot of one session. Reading it resets the tick counter,
/// making `data_producer_tick_count` a per-report window.
#[derive(Debug, Clone, Copy)]
pub struct ConferenceState {
    pub status: ConferenceStatus,
    pub peer_count: u32,
    pub data_producer_tick_count: u32,
    pub produce_success: bool,
}

impl Default for ConferenceState {
    fn default() -> Self {
        Self {
            status: ConferenceStatus::Idle,
            peer_count: 0,
            data_producer_tick_count: 0,
            produce_success: false,
        }
    }
}

#[derive(Default)]
struct RemotePeer {
    video_consumer: Option<Arc<ReportVideoConsumer>>,
    audio_consumer: Option<Arc<DummyAudioConsumer>>,
    data_consumer: Option<Arc<ReportDataConsumer>>,
}

pub struct ConferencePeer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    weak_self: Weak<PeerInner>,
    executor: Arc<Executor>,
    endpoints: Endpoints,
    http: reqwest::Client,
    protoo: ProtooClient,
    device: Device,
    user_id: Mutex<String>,
    room_id: Mutex<String>,
    state: Mutex<ConferenceState>,
    transport_options: Mutex<Value>,
    scratch: Mutex<Vec<u8>>,
    data_sender: Mutex<Option<Arc<dyn DataSender>>>,
    audio_sender: Mutex<Option<Arc<dyn AudioSender>>>,
    peers: Mutex<HashMap<String, RemotePeer>>,
    validate_data_channel: AtomicBool,
    /// Set while the session is torn down (or not yet joined) so terminal
    /// transport states from a dying generation cannot re-trigger leave.
    leaving: AtomicBool,
}

impl ConferencePeer {
    pub fn new(
        executor: Arc<Executor>,
        http: reqwest::Client,
        factory: Arc<dyn PeerConnectionFactory>,
        endpoints: Endpoints,
        request_timeout: Duration,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<PeerInner>| {
            let delegate: Weak<dyn DeviceDelegate> = weak.clone();
            PeerInner {
                weak_self: weak.clone(),
                executor,
                endpoints,
                http,
                protoo: ProtooClient::with_request_timeout(request_timeout),
                device: Device::new(delegate, factory.as_ref()),
                user_id: Mutex::new(String::new()),
                room_id: Mutex::new(String::new()),
                state: Mutex::new(ConferenceState::default()),
                transport_options: Mutex::new(Value::Null),
                scratch: Mutex::new(Vec::new()),
                data_sender: Mutex::new(None),
                audio_sender: Mutex::new(None),
                peers: Mutex::new(HashMap::new()),
                validate_data_channel: AtomicBool::new(true),
                leaving: AtomicBool::new(true),
            }
        });

        {
            let weak = Arc::downgrade(&inner);
            inner.protoo.set_on_request(move |request| {
                if let Some(peer) = weak.upgrade() {
                    let task_peer = Arc::clone(&peer);
                    peer.executor
                        .push_task(async move { task_peer.on_protoo_request(request).await });
                }
            });
        }
        {
            let weak = Arc::downgrade(&inner);
            inner.protoo.set_on_notify(move |notification| {
                if let Some(peer) = weak.upgrade() {
                    let task_peer = Arc::clone(&peer);
                    peer.executor
                        .push_task(async move { task_peer.on_protoo_notify(notification) });
                }
            });
        }

        Self { inner }
    }

    pub fn validate_data_channel(&self, validate: bool) {
        self.inner
            .validate_data_channel
            .store(validate, Ordering::SeqCst);
    }

    pub fn user_id(&self) -> String {
        self.inner
            .user_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Start the join script on this session's executor.
    pub fn join_room(&self, user_id: String, room_id: String) {
        *self.inner.user_id.lock().unwrap_or_else(|e| e.into_inner()) = user_id;
        *self.inner.room_id.lock().unwrap_or_else(|e| e.into_inner()) = room_id;
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .produce_success = false;

        let inner = Arc::clone(&self.inner);
        self.inner.executor.push_task(async move {
            if let Err(e) = inner.run_join().await {
                inner.state.lock().unwrap_or_else(|e| e.into_inner()).status =
                    ConferenceStatus::Exception;
                let user_id = inner
                    .user_id
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                error!(user_id = %user_id, error = format!("{e:#}"), "join failed");
            }
        });
    }

    /// Tear the session down without waiting.
    pub fn leave(&self) {
        let _ = self.leave_task();
    }

    /// Tear the session down and wait until its executor ran the teardown.
    pub async fn leave_and_wait(&self) {
        let _ = self.leave_task().await;
    }

    fn leave_task(&self) -> impl Future<Output = Result<(), ExecutorClosed>> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .submit(async move { inner.teardown().await })
    }

    /// Feed one tick of synthetic media. Never blocks: the work is enqueued
    /// onto the session's executor.
    pub fn tick_producer(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .push_task(async move { inner.produce_tick() });
    }

    pub fn state(&self) -> ConferenceState {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = *state;
        state.data_producer_tick_count = 0;
        snapshot
    }

    /// Mean data-channel frame rate over this session's remote peers.
    pub fn avg_frame_rate(&self) -> f32 {
        let peers = self.inner.peers.lock().unwrap_or_else(|e| e.into_inner());
        if peers.is_empty() {
            return 0.0;
        }
        let sum: f32 = peers
            .values()
            .filter_map(|peer| peer.data_consumer.as_ref())
            .map(|consumer| consumer.data_stat().frame_rate)
            .sum();
        sum / peers.len() as f32
    }
}

impl PeerInner {
    async fn run_join(&self) -> anyhow::Result<()> {
        self.leaving.store(false, Ordering::SeqCst);
        let user_id = self.user_id.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let room_id = self.room_id.lock().unwrap_or_else(|e| e.into_inner()).clone();

        let token = http::fetch_auth_token(&self.http, &self.endpoints.http, &user_id).await?;
        self.protoo.connect(&format!(
            "{}/conference/connect?rid={}&token={}",
            self.endpoints.ws, room_id, token
        ));

        self.request(
            "join",
            json!({
                "roomId": room_id,
                "deviceId": "BOT1111",
                "deviceModel": "Linux",
                "networkType": "LAN",
                "gameId": "werewolf",
                "cameraResolution": "TODO",
            }),
        )
        .await?;

        let router_rtp_capabilities = self.request("getRouterRtpCapabilities", json!({})).await?;
        self.device.load(&router_rtp_capabilities)?;

        *self
            .transport_options
            .lock()
            .unwrap_or_else(|e| e.into_inner()) =
            self.request("createWebRtcTransport", json!({})).await?;
        self.device.ensure_transport(TransportKind::Send).await?;
        self.device.ensure_transport(TransportKind::Recv).await?;

        let consumer_infos = self
            .request(
                "consumeAllExistingProducer",
                json!({"rtpCapabilities": self.device.rtp_capabilities()}),
            )
            .await?;
        let infos: Vec<ConsumerInfo> = serde_json::from_value(consumer_infos)
            .context("bad consumeAllExistingProducer response")?;
        self.start_consuming(&infos).await;

        let audio_sender = self
            .device
            .create_audio_source(&ProducerOptions {
                encodings: Value::Null,
                codec_options: json!({"opusStereo": true, "opusDtx": true}),
                codec: Value::Null,
            })
            .await?;
        *self
            .audio_sender
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(audio_sender);

        let data_sender = self
            .device
            .create_data_source("virtual-avatar", "", false, 0, 0)
            .await?;
        *self.data_sender.lock().unwrap_or_else(|e| e.into_inner()) = Some(data_sender);

        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .produce_success = true;
        info!(user_id = %user_id, room_id = %room_id, "joined room");
        Ok(())
    }

    async fn teardown(&self) {
        self.leaving.store(true, Ordering::SeqCst);
        self.protoo.close();
        self.device.stop().await;
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.data_sender.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.audio_sender.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.state.lock().unwrap_or_else(|e| e.into_inner()).status = ConferenceStatus::Idle;
    }

    fn produce_tick(&self) {
        {
            let mut scratch = self.scratch.lock().unwrap_or_else(|e| e.into_inner());
            scratch.resize(SCRATCH_LEN, 0);
            rand::rng().fill(scratch.as_mut_slice());
        }

        let data_sender = self
            .data_sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(sender) = data_sender
            && sender.buffered_amount() == 0
        {
            let mut scratch = self.scratch.lock().unwrap_or_else(|e| e.into_inner());
            let data = &mut scratch[..frame::DATA_FRAME_LEN];
            if self.validate_data_channel.load(Ordering::SeqCst)
                && let Err(e) = frame::seal(data)
            {
                warn!(error = %e, "could not seal data frame");
            }
            sender.send_data(data);
            self.state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .data_producer_tick_count += 1;
        }

        let audio_sender = self
            .audio_sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(sender) = audio_sender {
            let scratch = self.scratch.lock().unwrap_or_else(|e| e.into_inner());
            sender.send_audio_data(&AudioData {
                timestamp_ms: rtc_timestamp_ms(),
                bits_per_sample: 16,
                sample_rate: AUDIO_SAMPLE_RATE,
                number_of_channels: 2,
                number_of_frames: AUDIO_FRAMES_PER_TICK,
                data: scratch.as_slice(),
            });
        }
    }

    async fn start_consuming(&self, infos: &[ConsumerInfo]) {
        for info in infos {
            if let Err(e) = self.consume_one(info).await {
                warn!(
                    consumer_id = %info.consumer_id,
                    error = format!("{e:#}"),
                    "could not start consuming",
                );
            }
        }

        let peer_count = self.peers.lock().unwrap_or_else(|e| e.into_inner()).len() as u32;
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peer_count = peer_count;
    }

    async fn consume_one(&self, info: &ConsumerInfo) -> anyhow::Result<()> {
        let user_id = self.user_id.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match info.kind() {
            ProducerKind::Data => {
                let stream_id = info
                    .stream_id
                    .context("data consumer info carries no streamId")?;
                info!(
                    user_id = %user_id,
                    from = %info.user_id,
                    consumer_id = %info.consumer_id,
                    producer_id = %info.producer_id,
                    stream_id,
                    label = info.label.as_deref().unwrap_or(""),
                    "consuming data",
                );

                let consumer = {
                    let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
                    let peer = peers.entry(info.user_id.clone()).or_default();
                    Arc::clone(peer.data_consumer.get_or_insert_with(|| {
                        Arc::new(ReportDataConsumer::new(
                            self.validate_data_channel.load(Ordering::SeqCst),
                        ))
                    }))
                };

                self.device
                    .create_data_sink(
                        &DataConsumerOptions {
                            consumer_id: info.consumer_id.clone(),
                            producer_id: info.producer_id.clone(),
                            stream_id,
                            label: info.label.clone().unwrap_or_default(),
                            protocol: info.protocol.clone().unwrap_or_default(),
                        },
                        consumer,
                    )
                    .await?;
            }
            ProducerKind::Audio => {
                info!(
                    user_id = %user_id,
                    from = %info.user_id,
                    consumer_id = %info.consumer_id,
                    producer_id = %info.producer_id,
                    "consuming audio",
                );

                let consumer = {
                    let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
                    let peer = peers.entry(info.user_id.clone()).or_default();
                    Arc::clone(
                        peer.audio_consumer
                            .get_or_insert_with(|| Arc::new(DummyAudioConsumer)),
                    )
                };

                self.device
                    .create_audio_sink(
                        &ConsumerOptions {
                            consumer_id: info.consumer_id.clone(),
                            producer_id: info.producer_id.clone(),
                            rtp_parameters: info.rtp_parameters.clone(),
                        },
                        consumer,
                    )
                    .await?;
            }
            ProducerKind::Video => {
                info!(
                    user_id = %user_id,
                    from = %info.user_id,
                    consumer_id = %info.consumer_id,
                    producer_id = %info.producer_id,
                    "consuming video",
                );

                let consumer = {
                    let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
                    let peer = peers.entry(info.user_id.clone()).or_default();
                    Arc::clone(
                        peer.video_consumer
                            .get_or_insert_with(|| Arc::new(ReportVideoConsumer::new())),
                    )
                };

                self.device
                    .create_video_sink(
                        &ConsumerOptions {
                            consumer_id: info.consumer_id.clone(),
                            producer_id: info.producer_id.clone(),
                            rtp_parameters: info.rtp_parameters.clone(),
                        },
                        consumer,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_protoo_request(&self, request: ProtooRequest) {
        match request.method.as_str() {
            "newConsumer" => match ConsumerInfo::from_new_consumer(&request.data) {
                Ok(info) => {
                    self.start_consuming(std::slice::from_ref(&info)).await;
                    self.protoo.response(request.ok(json!({})));
                }
                Err(e) => {
                    warn!(error = %e, "bad newConsumer payload");
                    self.protoo.response(request.err("bad payload"));
                }
            },
            "newDataConsumer" => match ConsumerInfo::from_new_data_consumer(&request.data) {
                Ok(info) => {
                    self.start_consuming(std::slice::from_ref(&info)).await;
                    self.protoo.response(request.ok(json!({})));
                }
                Err(e) => {
                    warn!(error = %e, "bad newDataConsumer payload");
                    self.protoo.response(request.err("bad payload"));
                }
            },
            _ => self.protoo.response(request.err("not found")),
        }
    }

    fn on_protoo_notify(&self, notification: ProtooNotification) {
        match notification.method.as_str() {
            "kick" | "consumerPaused" | "consumerResumed" => {}
            other => debug!(method = other, "unhandled notification"),
        }
    }

    async fn request(&self, method: &str, data: Value) -> anyhow::Result<Value> {
        let response = self.protoo.request(method, data).await?;
        if response.ok {
            Ok(response.data)
        } else {
            anyhow::bail!("{method} rejected: {}", response.error_reason)
        }
    }

    fn leave_in_background(&self) {
        let Some(inner) = self.weak_self.upgrade() else {
            return;
        };
        self.executor
            .push_task(async move { inner.teardown().await });
    }
}

#[async_trait]
impl DeviceDelegate for PeerInner {
    async fn create_server_side_transport(
        &self,
        kind: TransportKind,
        _rtp_capabilities: &Value,
    ) -> anyhow::Result<CreateTransportOptions> {
        let options = self
            .transport_options
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let info = options
            .get(match kind {
                TransportKind::Send => "sendTransport",
                TransportKind::Recv => "recvTransport",
            })
            .cloned()
            .unwrap_or(Value::Null);

        let id = info
            .get("transportId")
            .and_then(Value::as_str)
            .with_context(|| format!("{kind} transport options carry no transportId"))?
            .to_owned();

        let field = |name: &str| info.get(name).cloned().unwrap_or(Value::Null);
        Ok(CreateTransportOptions {
            id,
            ice_parameters: field("iceParameters"),
            ice_candidates: field("iceCandidates"),
            dtls_parameters: field("dtlsParameters"),
            sctp_parameters: field("sctpParameters"),
        })
    }

    async fn connect_transport(
        &self,
        kind: TransportKind,
        _transport_id: &str,
        dtls_parameters: &Value,
    ) -> anyhow::Result<()> {
        self.request(
            "connectWebRtcTransport",
            json!({
                "isSend": kind == TransportKind::Send,
                "dtlsParameters": dtls_parameters,
            }),
        )
        .await?;
        Ok(())
    }

    async fn connect_producer(
        &self,
        _transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> anyhow::Result<String> {
        let response = self
            .request(
                "produce",
                json!({"kind": kind.as_str(), "rtpParameters": rtp_parameters}),
            )
            .await?;
        response
            .get("producerId")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .context("produce response carries no producerId")
    }

    async fn connect_data_producer(
        &self,
        _transport_id: &str,
        sctp_parameters: &Value,
        label: &str,
        protocol: &str,
    ) -> anyhow::Result<String> {
        let response = self
            .request(
                "produceData",
                json!({
                    "label": label,
                    "protocol": protocol,
                    "sctpStreamParameters": sctp_parameters,
                }),
            )
            .await?;
        response
            .get("producerId")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .context("produceData response carries no producerId")
    }

    fn on_connection_state_change(
        &self,
        kind: TransportKind,
        transport_id: &str,
        state: ConnectionState,
    ) {
        debug!(kind = %kind, transport_id, state = %state, "transport state change");
        self.state.lock().unwrap_or_else(|e| e.into_inner()).status =
            ConferenceStatus::from_connection_state(state);

        if state.is_terminal() && !self.leaving.load(Ordering::SeqCst) {
            self.leave_in_background();
        }
    }
}
