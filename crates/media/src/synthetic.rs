//! Synthetic peer-connection engine.
//!
//! Emulates the observable behavior of a native WebRTC stack without any
//! packets on the wire: transports report `new` on creation and walk
//! `checking → connected → completed` once the DTLS handshake has been
//! signaled; producers negotiate ids through the observer and count what
//! they are fed; video consumers are driven by a noise-frame generator so
//! receive-side statistics move. Signaling stays fully real; only the media
//! plane is simulated, which is all a signaling load test needs.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Value, json};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::engine::{
    NativeDevice, NativeSink, NativeTransport, PeerConnectionFactory, TransportObserver,
};
use crate::{
    AudioConsumer, AudioData, AudioSender, ConnectionState, ConsumerOptions,
    CreateTransportOptions, DataConsumer, DataConsumerOptions, DataProducerOptions, DataSender,
    MediaKind, ProducerOptions, TransportKind, VideoConsumer, VideoFrame, VideoSender,
    rtc_timestamp_ms,
};

const SYNTHETIC_FINGERPRINT: &str =
    "9C:2F:5D:11:A0:64:3B:E8:77:01:C5:2A:90:4E:6F:D3:18:BB:7C:42:5A:F1:03:8D:66:29:EE:B4:0C:97:D8:51";

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Frame rate of the noise generator feeding video consumers.
    pub video_fps: u32,
    pub video_width: u32,
    pub video_height: u32,
    /// Constant `buffered_amount` reported by data senders. Non-zero
    /// simulates a congested data channel, which makes producers skip ticks.
    pub data_buffered_amount: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            video_fps: 30,
            video_width: 640,
            video_height: 360,
            data_buffered_amount: 0,
        }
    }
}

#[derive(Default)]
struct Counters {
    audio_frames_sent: AtomicU64,
    video_frames_sent: AtomicU64,
    data_messages_sent: AtomicU64,
}

/// Factory for synthetic devices. One per `-p` slot; counters aggregate over
/// every session sharded onto it.
pub struct SyntheticFactory {
    config: SyntheticConfig,
    counters: Arc<Counters>,
}

impl SyntheticFactory {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Total PCM frames pushed through audio producers on this factory.
    pub fn audio_frames_sent(&self) -> u64 {
        self.counters.audio_frames_sent.load(Ordering::Relaxed)
    }

    pub fn video_frames_sent(&self) -> u64 {
        self.counters.video_frames_sent.load(Ordering::Relaxed)
    }

    pub fn data_messages_sent(&self) -> u64 {
        self.counters.data_messages_sent.load(Ordering::Relaxed)
    }
}

impl PeerConnectionFactory for SyntheticFactory {
    fn create_device(&self) -> Box<dyn NativeDevice> {
        Box::new(SyntheticDevice {
            config: self.config.clone(),
            counters: Arc::clone(&self.counters),
            capabilities: None,
        })
    }
}

struct SyntheticDevice {
    config: SyntheticConfig,
    counters: Arc<Counters>,
    capabilities: Option<Value>,
}

impl NativeDevice for SyntheticDevice {
    fn load(&mut self, router_rtp_capabilities: &Value) -> anyhow::Result<Value> {
        if !router_rtp_capabilities.is_object() {
            anyhow::bail!("router rtp capabilities must be an object");
        }

        // The synthetic engine accepts whatever the router offers.
        self.capabilities = Some(router_rtp_capabilities.clone());
        Ok(router_rtp_capabilities.clone())
    }

    fn can_produce(&self, _kind: MediaKind) -> bool {
        self.capabilities.is_some()
    }

    fn create_transport(
        &self,
        kind: TransportKind,
        options: &CreateTransportOptions,
        observer: Arc<dyn TransportObserver>,
    ) -> anyhow::Result<Arc<dyn NativeTransport>> {
        let id = if options.id.is_empty() {
            format!("synthetic-{kind}-{:08x}", rand::rng().random::<u32>())
        } else {
            options.id.clone()
        };

        let transport = Arc::new(SyntheticTransport {
            id: id.clone(),
            kind,
            config: self.config.clone(),
            counters: Arc::clone(&self.counters),
            observer: Arc::clone(&observer),
            connect: tokio::sync::OnceCell::new(),
            closed: AtomicBool::new(false),
            next_stream_id: AtomicU16::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        // `new` fires on the creating task, before the caller holds the
        // transport handle.
        observer.on_connection_state_change(kind, &id, ConnectionState::New);

        // Kick the handshake without waiting for the first produce/consume.
        let eager = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move {
                if let Err(e) = transport.ensure_connected().await {
                    debug!(error = %e, "synthetic transport handshake failed");
                }
            }
        });
        transport.push_task(eager.abort_handle());

        Ok(transport)
    }
}

struct SyntheticTransport {
    id: String,
    kind: TransportKind,
    config: SyntheticConfig,
    counters: Arc<Counters>,
    observer: Arc<dyn TransportObserver>,
    connect: tokio::sync::OnceCell<()>,
    closed: AtomicBool,
    next_stream_id: AtomicU16,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl SyntheticTransport {
    fn push_task(&self, handle: AbortHandle) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    async fn ensure_connected(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("transport {} is closed", self.id);
        }

        self.connect
            .get_or_try_init(|| async {
                let dtls_parameters = json!({
                    "role": "client",
                    "fingerprints": [{
                        "algorithm": "sha-256",
                        "value": SYNTHETIC_FINGERPRINT,
                    }],
                });

                // A transport closed mid-handshake stays silent: real
                // engines stop reporting states after close, and a stale
                // `failed` would read as a fresh transport failure.
                match self
                    .observer
                    .on_connect(self.kind, &self.id, &dtls_parameters)
                    .await
                {
                    Ok(()) => {
                        for state in [
                            ConnectionState::Checking,
                            ConnectionState::Connected,
                            ConnectionState::Completed,
                        ] {
                            if self.closed.load(Ordering::SeqCst) {
                                break;
                            }
                            self.observer
                                .on_connection_state_change(self.kind, &self.id, state);
                        }
                        Ok(())
                    }
                    Err(e) => {
                        if !self.closed.load(Ordering::SeqCst) {
                            self.observer.on_connection_state_change(
                                self.kind,
                                &self.id,
                                ConnectionState::Failed,
                            );
                        }
                        Err(e)
                    }
                }
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NativeTransport for SyntheticTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn consume_video(
        &self,
        options: &ConsumerOptions,
        consumer: Arc<dyn VideoConsumer>,
    ) -> anyhow::Result<Box<dyn NativeSink>> {
        self.ensure_connected().await?;

        let width = self.config.video_width;
        let height = self.config.video_height;
        let fps = self.config.video_fps;
        let mut abort = None;
        if fps > 0 {
            let period_ms = u64::from((1000 / fps.max(1)).max(1));
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(period_ms));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                let mut plane_y = vec![0u8; (width * height) as usize];
                let mut plane_u = vec![0u8; ((width / 2) * (height / 2)) as usize];
                let mut plane_v = vec![0u8; ((width / 2) * (height / 2)) as usize];
                {
                    let mut rng = rand::rng();
                    rng.fill(plane_y.as_mut_slice());
                    rng.fill(plane_u.as_mut_slice());
                    rng.fill(plane_v.as_mut_slice());
                }

                loop {
                    ticker.tick().await;
                    let frame = VideoFrame {
                        timestamp_ms: rtc_timestamp_ms(),
                        width,
                        height,
                        data_y: &plane_y,
                        data_u: &plane_u,
                        data_v: &plane_v,
                        stride_y: width as usize,
                        stride_u: (width / 2) as usize,
                        stride_v: (width / 2) as usize,
                    };
                    consumer.on_video_frame(&frame);
                }
            });
            self.push_task(handle.abort_handle());
            abort = Some(handle.abort_handle());
        }

        Ok(Box::new(SyntheticSink {
            consumer_id: options.consumer_id.clone(),
            abort: Mutex::new(abort),
        }))
    }

    async fn consume_audio(
        &self,
        options: &ConsumerOptions,
        consumer: Arc<dyn AudioConsumer>,
    ) -> anyhow::Result<Box<dyn NativeSink>> {
        self.ensure_connected().await?;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 100 ms of 48 kHz 16-bit stereo silence.
            let silence = vec![0u8; 4800 * 2 * 2];
            loop {
                ticker.tick().await;
                let data = AudioData {
                    timestamp_ms: rtc_timestamp_ms(),
                    bits_per_sample: 16,
                    sample_rate: 48_000,
                    number_of_channels: 2,
                    number_of_frames: 4800,
                    data: &silence,
                };
                consumer.on_audio_data(&data);
            }
        });
        self.push_task(handle.abort_handle());

        Ok(Box::new(SyntheticSink {
            consumer_id: options.consumer_id.clone(),
            abort: Mutex::new(Some(handle.abort_handle())),
        }))
    }

    async fn consume_data(
        &self,
        options: &DataConsumerOptions,
        _consumer: Arc<dyn DataConsumer>,
    ) -> anyhow::Result<Box<dyn NativeSink>> {
        self.ensure_connected().await?;

        // Data frames originate from remote peers; nothing to generate here.
        Ok(Box::new(SyntheticSink {
            consumer_id: options.consumer_id.clone(),
            abort: Mutex::new(None),
        }))
    }

    async fn produce_audio(
        &self,
        _options: &ProducerOptions,
    ) -> anyhow::Result<Arc<dyn AudioSender>> {
        self.ensure_connected().await?;

        let rtp_parameters = json!({
            "mid": "0",
            "codecs": [{
                "mimeType": "audio/opus",
                "payloadType": 111,
                "clockRate": 48_000,
                "channels": 2,
            }],
            "encodings": [{"ssrc": rand::rng().random::<u32>()}],
        });
        let producer_id = self
            .observer
            .on_produce(&self.id, MediaKind::Audio, &rtp_parameters)
            .await?;

        Ok(Arc::new(SyntheticAudioSender {
            producer_id,
            closed: AtomicBool::new(false),
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn produce_video(
        &self,
        _options: &ProducerOptions,
    ) -> anyhow::Result<Arc<dyn VideoSender>> {
        self.ensure_connected().await?;

        let rtp_parameters = json!({
            "mid": "1",
            "codecs": [{
                "mimeType": "video/VP8",
                "payloadType": 96,
                "clockRate": 90_000,
            }],
            "encodings": [{"ssrc": rand::rng().random::<u32>()}],
        });
        let producer_id = self
            .observer
            .on_produce(&self.id, MediaKind::Video, &rtp_parameters)
            .await?;

        Ok(Arc::new(SyntheticVideoSender {
            producer_id,
            closed: AtomicBool::new(false),
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn produce_data(
        &self,
        options: &DataProducerOptions,
    ) -> anyhow::Result<Arc<dyn DataSender>> {
        self.ensure_connected().await?;

        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let sctp_parameters = json!({
            "streamId": stream_id,
            "ordered": options.ordered,
            "maxRetransmits": options.max_retransmits,
            "maxPacketLifeTime": options.max_packet_life_time,
        });
        let producer_id = self
            .observer
            .on_produce_data(&self.id, &sctp_parameters, &options.label, &options.protocol)
            .await?;

        Ok(Arc::new(SyntheticDataSender {
            producer_id,
            closed: AtomicBool::new(false),
            buffered_amount: self.config.data_buffered_amount,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}

impl Drop for SyntheticTransport {
    fn drop(&mut self) {
        NativeTransport::close(self);
    }
}

struct SyntheticSink {
    consumer_id: String,
    abort: Mutex<Option<AbortHandle>>,
}

impl NativeSink for SyntheticSink {
    fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    fn close(&self) {
        if let Some(handle) = self
            .abort
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for SyntheticSink {
    fn drop(&mut self) {
        self.close();
    }
}

struct SyntheticAudioSender {
    producer_id: String,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl AudioSender for SyntheticAudioSender {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send_audio_data(&self, data: &AudioData<'_>) {
        if self.is_closed() {
            return;
        }
        self.counters
            .audio_frames_sent
            .fetch_add(u64::from(data.number_of_frames), Ordering::Relaxed);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(producer_id = %self.producer_id, "audio producer closed");
        }
    }
}

struct SyntheticVideoSender {
    producer_id: String,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl VideoSender for SyntheticVideoSender {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send_video_frame(&self, _frame: &VideoFrame<'_>) {
        if self.is_closed() {
            return;
        }
        self.counters
            .video_frames_sent
            .fetch_add(1, Ordering::Relaxed);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(producer_id = %self.producer_id, "video producer closed");
        }
    }
}

struct SyntheticDataSender {
    producer_id: String,
    closed: AtomicBool,
    buffered_amount: u64,
    counters: Arc<Counters>,
}

impl DataSender for SyntheticDataSender {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered_amount
    }

    fn send_data(&self, _payload: &[u8]) {
        if self.is_closed() {
            return;
        }
        self.counters
            .data_messages_sent
            .fetch_add(1, Ordering::Relaxed);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(producer_id = %self.producer_id, "data producer closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct TestObserver {
        states: Mutex<Vec<ConnectionState>>,
        connects: AtomicUsize,
        next_producer: AtomicUsize,
    }

    impl TestObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                next_producer: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TransportObserver for TestObserver {
        async fn on_connect(
            &self,
            _kind: TransportKind,
            _transport_id: &str,
            dtls_parameters: &Value,
        ) -> anyhow::Result<()> {
            assert!(dtls_parameters["fingerprints"].is_array());
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_produce(
            &self,
            _transport_id: &str,
            kind: MediaKind,
            _rtp_parameters: &Value,
        ) -> anyhow::Result<String> {
            let n = self.next_producer.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{kind}-{n}"))
        }

        async fn on_produce_data(
            &self,
            _transport_id: &str,
            sctp_parameters: &Value,
            _label: &str,
            _protocol: &str,
        ) -> anyhow::Result<String> {
            assert!(sctp_parameters["streamId"].is_u64());
            let n = self.next_producer.fetch_add(1, Ordering::SeqCst);
            Ok(format!("data-{n}"))
        }

        fn on_connection_state_change(
            &self,
            _kind: TransportKind,
            _transport_id: &str,
            state: ConnectionState,
        ) {
            self.states.lock().unwrap().push(state);
        }
    }

    fn transport(
        config: SyntheticConfig,
        observer: &Arc<TestObserver>,
    ) -> Arc<dyn NativeTransport> {
        let factory = SyntheticFactory::new(config);
        let mut device = factory.create_device();
        device.load(&json!({"codecs": []})).unwrap();
        device
            .create_transport(
                TransportKind::Send,
                &CreateTransportOptions {
                    id: "t1".into(),
                    ..Default::default()
                },
                Arc::clone(observer) as Arc<dyn TransportObserver>,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn handshake_runs_once_and_walks_states() {
        let observer = TestObserver::new();
        let t = transport(SyntheticConfig::default(), &observer);

        let sender = t.produce_data(&DataProducerOptions::default()).await.unwrap();
        let _ = t.produce_audio(&ProducerOptions::default()).await.unwrap();

        assert_eq!(observer.connects.load(Ordering::SeqCst), 1);
        let states = observer.states.lock().unwrap().clone();
        assert_eq!(
            states,
            vec![
                ConnectionState::New,
                ConnectionState::Checking,
                ConnectionState::Connected,
                ConnectionState::Completed,
            ]
        );
        assert_eq!(sender.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn configured_backpressure_is_reported() {
        let observer = TestObserver::new();
        let t = transport(
            SyntheticConfig {
                data_buffered_amount: 17,
                ..Default::default()
            },
            &observer,
        );

        let sender = t.produce_data(&DataProducerOptions::default()).await.unwrap();
        assert_eq!(sender.buffered_amount(), 17);
    }

    struct CountingVideoConsumer {
        frames: AtomicUsize,
    }

    impl VideoConsumer for CountingVideoConsumer {
        fn on_video_frame(&self, frame: &VideoFrame<'_>) {
            assert_eq!(frame.data_y.len(), (frame.width * frame.height) as usize);
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn video_consumers_receive_generated_frames() {
        let observer = TestObserver::new();
        let t = transport(
            SyntheticConfig {
                video_fps: 100,
                video_width: 64,
                video_height: 36,
                ..Default::default()
            },
            &observer,
        );

        let consumer = Arc::new(CountingVideoConsumer {
            frames: AtomicUsize::new(0),
        });
        let sink = t
            .consume_video(
                &ConsumerOptions {
                    consumer_id: "c1".into(),
                    producer_id: "p1".into(),
                    rtp_parameters: Value::Null,
                },
                Arc::clone(&consumer) as Arc<dyn VideoConsumer>,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(consumer.frames.load(Ordering::SeqCst) > 0);

        sink.close();
        let after_close = consumer.frames.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(consumer.frames.load(Ordering::SeqCst), after_close);
    }
}
