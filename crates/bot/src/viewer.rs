//! Livestream viewer session controller.
//!
//! Viewers are read-only: the whole signaling dance happens over the portal
//! HTTP API (sign → watch → consume → resume, plus a 3 s keepalive ping)
//! and the session only ever creates a receive transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::Value;
use stampede_media::engine::PeerConnectionFactory;
use stampede_media::{
    ConnectionState, ConsumerOptions, CreateTransportOptions, Device, DeviceDelegate,
    DummyAudioConsumer, DummyVideoConsumer, TransportKind, VideoConsumer,
};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::consumer::{ReportVideoConsumer, VideoStat};
use crate::executor::Executor;
use crate::http::LiveApi;

const PING_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewerState {
    Idle,
    Handshaking,
    CreatingTransport,
    Consuming,
    GettingAuthTokenFailed,
    StreamNotFound,
    ConsumeStreamFailed,
    Exception,
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl ViewerState {
    pub fn label(&self) -> &'static str {
        match self {
            ViewerState::Idle => "idle",
            ViewerState::Handshaking => "handshake",
            ViewerState::CreatingTransport => "create transport",
            ViewerState::Consuming => "consuming",
            ViewerState::GettingAuthTokenFailed => "auth failed",
            ViewerState::StreamNotFound => "stream not found",
            ViewerState::ConsumeStreamFailed => "consume failed",
            ViewerState::Exception => "exception",
            ViewerState::New => "new",
            ViewerState::Checking => "checking",
            ViewerState::Connected => "connected",
            ViewerState::Completed => "completed",
            ViewerState::Failed => "failed",
            ViewerState::Disconnected => "disconnected",
            ViewerState::Closed => "closed",
        }
    }

    /// States in which the viewer gave up before reaching the media plane.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ViewerState::GettingAuthTokenFailed
                | ViewerState::StreamNotFound
                | ViewerState::ConsumeStreamFailed
                | ViewerState::Exception
        )
    }

    fn from_connection_state(state: ConnectionState) -> Self {
        match state {
            ConnectionState::New => ViewerState::New,
            ConnectionState::Checking => ViewerState::Checking,
            ConnectionState::Connected => ViewerState::Connected,
            ConnectionState::Completed => ViewerState::Completed,
            ConnectionState::Failed => ViewerState::Failed,
            ConnectionState::Disconnected => ViewerState::Disconnected,
            ConnectionState::Closed => ViewerState::Closed,
        }
    }
}

pub struct Viewer {
    inner: Arc<ViewerInner>,
}

struct ViewerInner {
    weak_self: Weak<ViewerInner>,
    executor: Arc<Executor>,
    api: LiveApi,
    device: Device,
    screen_consumer: Arc<ReportVideoConsumer>,
    streamer_id: Mutex<String>,
    state: Mutex<ViewerState>,
    watch_response: Mutex<Value>,
    stopped: AtomicBool,
    ping_task: Mutex<Option<AbortHandle>>,
}

impl Viewer {
    pub fn new(
        executor: Arc<Executor>,
        api: LiveApi,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ViewerInner>| {
            let delegate: Weak<dyn DeviceDelegate> = weak.clone();
            ViewerInner {
                weak_self: weak.clone(),
                executor,
                api,
                device: Device::new(delegate, factory.as_ref()),
                screen_consumer: Arc::new(ReportVideoConsumer::new()),
                streamer_id: Mutex::new(String::new()),
                state: Mutex::new(ViewerState::Idle),
                watch_response: Mutex::new(Value::Null),
                stopped: AtomicBool::new(true),
                ping_task: Mutex::new(None),
            }
        });
        Self { inner }
    }

    /// Start watching on this viewer's executor.
    pub fn watch(&self, streamer_id: String) {
        *self
            .inner
            .streamer_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = streamer_id;

        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .push_task(async move { inner.run_watch().await });
    }

    pub fn state(&self) -> ViewerState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn video_stat(&self) -> VideoStat {
        self.inner.screen_consumer.video_stat()
    }

    pub fn stop(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .push_task(async move { inner.teardown().await });
    }

    pub async fn stop_and_wait(&self) {
        let inner = Arc::clone(&self.inner);
        let _ = self
            .inner
            .executor
            .submit(async move { inner.teardown().await })
            .await;
    }
}

impl ViewerInner {
    fn set_state(&self, state: ViewerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn streamer_id(&self) -> String {
        self.streamer_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn run_watch(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        self.set_state(ViewerState::Handshaking);

        if let Err(e) = self.watch_script().await {
            warn!(
                streamer_id = %self.streamer_id(),
                error = format!("{e:#}"),
                "watch failed",
            );
            self.set_state(ViewerState::Exception);
        }
    }

    async fn watch_script(&self) -> anyhow::Result<()> {
        let streamer_id = self.streamer_id();

        if !self.api.has_session() && !self.api.sign().await? {
            warn!("portal refused to sign a viewer token");
            self.set_state(ViewerState::GettingAuthTokenFailed);
            return Ok(());
        }

        let watch = self.api.watch(&streamer_id).await?;
        if !watch.get("ok").and_then(Value::as_bool).unwrap_or(true) {
            warn!(streamer_id = %streamer_id, response = %watch, "watch rejected");
            self.set_state(ViewerState::StreamNotFound);
            return Ok(());
        }

        self.set_state(ViewerState::CreatingTransport);
        let router_rtp_capabilities = watch
            .get("routerRtpCapabilities")
            .cloned()
            .unwrap_or(Value::Null);
        self.device.load(&router_rtp_capabilities)?;
        *self
            .watch_response
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = watch;
        self.device.ensure_transport(TransportKind::Recv).await?;

        self.set_state(ViewerState::Consuming);
        let consume = self
            .api
            .consume(&streamer_id, self.device.rtp_capabilities())
            .await?;
        if !consume.get("ok").and_then(Value::as_bool).unwrap_or(true) {
            warn!(streamer_id = %streamer_id, response = %consume, "consume rejected");
            self.set_state(ViewerState::ConsumeStreamFailed);
            return Ok(());
        }

        for consumer in consume
            .get("data")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            if !consumer.get("ok").and_then(Value::as_bool).unwrap_or(true) {
                continue;
            }

            let options = ConsumerOptions {
                consumer_id: consumer
                    .get("consumerId")
                    .and_then(Value::as_str)
                    .context("consumer entry carries no consumerId")?
                    .to_owned(),
                producer_id: consumer
                    .get("producerId")
                    .and_then(Value::as_str)
                    .context("consumer entry carries no producerId")?
                    .to_owned(),
                rtp_parameters: consumer.get("rtpParameters").cloned().unwrap_or(Value::Null),
            };

            match consumer
                .get("producerType")
                .and_then(Value::as_str)
                .unwrap_or("")
            {
                "screen" => {
                    self.screen_consumer.reset();
                    self.device
                        .create_video_sink(
                            &options,
                            Arc::clone(&self.screen_consumer) as Arc<dyn VideoConsumer>,
                        )
                        .await?;
                }
                "audio" => {
                    self.device
                        .create_audio_sink(&options, Arc::new(DummyAudioConsumer))
                        .await?;
                }
                _ => {
                    self.device
                        .create_video_sink(&options, Arc::new(DummyVideoConsumer))
                        .await?;
                }
            }
        }

        self.api.resume(&streamer_id).await?;

        let api = self.api.clone();
        let ping = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = api.ping().await {
                    debug!(error = format!("{e:#}"), "keepalive ping failed");
                }
            }
        });
        let previous = self
            .ping_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(ping.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }

        Ok(())
    }

    async fn teardown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(ping) = self
            .ping_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            ping.abort();
        }
        self.device.stop().await;
    }

    fn stop_in_background(&self) {
        let Some(inner) = self.weak_self.upgrade() else {
            return;
        };
        self.executor
            .push_task(async move { inner.teardown().await });
    }
}

impl Drop for ViewerInner {
    fn drop(&mut self) {
        if let Some(ping) = self
            .ping_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            ping.abort();
        }
    }
}

#[async_trait]
impl DeviceDelegate for ViewerInner {
    async fn create_server_side_transport(
        &self,
        _kind: TransportKind,
        _rtp_capabilities: &Value,
    ) -> anyhow::Result<CreateTransportOptions> {
        let watch = self
            .watch_response
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let id = watch
            .get("transportId")
            .and_then(Value::as_str)
            .context("watch response carries no transportId")?
            .to_owned();

        let field = |name: &str| watch.get(name).cloned().unwrap_or(Value::Null);
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
        _kind: TransportKind,
        _transport_id: &str,
        dtls_parameters: &Value,
    ) -> anyhow::Result<()> {
        self.api
            .connect_transport(&self.streamer_id(), dtls_parameters)
            .await
    }

    fn on_connection_state_change(
        &self,
        _kind: TransportKind,
        transport_id: &str,
        state: ConnectionState,
    ) {
        debug!(transport_id, state = %state, "viewer transport state change");
        self.set_state(ViewerState::from_connection_state(state));

        if state.is_terminal() && !self.stopped.load(Ordering::SeqCst) {
            self.stop_in_background();
        }
    }
}
