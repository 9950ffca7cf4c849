//! The device facade: owns the engine-side lifetime graph for one session
//! and routes engine callbacks to the session's [`DeviceDelegate`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::engine::{
    NativeDevice, NativeSink, NativeTransport, PeerConnectionFactory, TransportObserver,
};
use crate::{
    AudioConsumer, AudioData, AudioSender, ConnectionState, ConsumerOptions,
    DataConsumerOptions, DataProducerOptions, DataSender, DeviceDelegate, MediaKind,
    ProducerOptions, TransportKind, VideoConsumer, VideoFrame, VideoSender,
};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device is not loaded")]
    NotLoaded,
    #[error("device delegate is gone")]
    DelegateGone,
    #[error("signaling failed: {0}")]
    Signaling(#[source] anyhow::Error),
    #[error("engine failure: {0}")]
    Engine(#[source] anyhow::Error),
}

/// A per-session media device.
///
/// Created once per session and never replaced. All methods are safe from
/// any task; `stop` is idempotent and the device is reusable afterwards:
/// transports are recreated on the next `ensure_transport`, which is how a
/// session re-joins. The delegate is held weakly, since the session owns
/// the device and never the other way around.
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    delegate: Weak<dyn DeviceDelegate>,
    native: Mutex<Box<dyn NativeDevice>>,
    rtp_capabilities: Mutex<Value>,
    loaded: AtomicBool,
    // The slot lock is held across the delegate round-trip: that is what
    // makes `ensure_transport` effectively-once per kind.
    send_transport: tokio::sync::Mutex<Option<Arc<dyn NativeTransport>>>,
    recv_transport: tokio::sync::Mutex<Option<Arc<dyn NativeTransport>>>,
    sinks: Mutex<Vec<SinkEntry>>,
    senders: Mutex<Vec<SenderHandle>>,
}

struct SinkEntry {
    user_key: usize,
    native: Box<dyn NativeSink>,
    notify_close: Box<dyn Fn() + Send + Sync>,
}

enum SenderHandle {
    Audio(Arc<dyn AudioSender>),
    Video(Arc<dyn VideoSender>),
    Data(Arc<dyn DataSender>),
}

impl SenderHandle {
    fn close(&self) {
        match self {
            SenderHandle::Audio(s) => s.close(),
            SenderHandle::Video(s) => s.close(),
            SenderHandle::Data(s) => s.close(),
        }
    }
}

/// Identity key for a user consumer: the thin part of the `Arc`'s pointer.
fn user_key<T: ?Sized>(ptr: *const T) -> usize {
    ptr as *const () as usize
}

impl Device {
    pub fn new(delegate: Weak<dyn DeviceDelegate>, factory: &dyn PeerConnectionFactory) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                delegate,
                native: Mutex::new(factory.create_device()),
                rtp_capabilities: Mutex::new(Value::Null),
                loaded: AtomicBool::new(false),
                send_transport: tokio::sync::Mutex::new(None),
                recv_transport: tokio::sync::Mutex::new(None),
                sinks: Mutex::new(Vec::new()),
                senders: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Load the router's RTP capabilities into the engine. Returns `false`
    /// (and does nothing) if the device was already loaded.
    pub fn load(&self, router_rtp_capabilities: &Value) -> Result<bool, DeviceError> {
        if self.inner.loaded.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let caps = match self
            .inner
            .native
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .load(router_rtp_capabilities)
        {
            Ok(caps) => caps,
            Err(e) => {
                self.inner.loaded.store(false, Ordering::SeqCst);
                return Err(DeviceError::Engine(e));
            }
        };

        *self
            .inner
            .rtp_capabilities
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = caps;
        Ok(true)
    }

    /// Device-level RTP capabilities; `null` until loaded.
    pub fn rtp_capabilities(&self) -> Value {
        self.inner
            .rtp_capabilities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.inner
            .native
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .can_produce(kind)
    }

    /// Create the transport of the given kind if it does not exist yet.
    pub async fn ensure_transport(
        &self,
        kind: TransportKind,
    ) -> Result<Arc<dyn NativeTransport>, DeviceError> {
        DeviceInner::ensure_transport(&self.inner, kind).await
    }

    pub async fn create_video_sink(
        &self,
        options: &ConsumerOptions,
        consumer: Arc<dyn VideoConsumer>,
    ) -> Result<(), DeviceError> {
        let transport = DeviceInner::ensure_transport(&self.inner, TransportKind::Recv).await?;
        let native = transport
            .consume_video(options, Arc::clone(&consumer))
            .await
            .map_err(DeviceError::Engine)?;
        self.push_sink(user_key(Arc::as_ptr(&consumer)), native, move || {
            consumer.on_close()
        });
        Ok(())
    }

    pub async fn create_audio_sink(
        &self,
        options: &ConsumerOptions,
        consumer: Arc<dyn AudioConsumer>,
    ) -> Result<(), DeviceError> {
        let transport = DeviceInner::ensure_transport(&self.inner, TransportKind::Recv).await?;
        let native = transport
            .consume_audio(options, Arc::clone(&consumer))
            .await
            .map_err(DeviceError::Engine)?;
        self.push_sink(user_key(Arc::as_ptr(&consumer)), native, move || {
            consumer.on_close()
        });
        Ok(())
    }

    pub async fn create_data_sink(
        &self,
        options: &DataConsumerOptions,
        consumer: Arc<dyn crate::DataConsumer>,
    ) -> Result<(), DeviceError> {
        let transport = DeviceInner::ensure_transport(&self.inner, TransportKind::Recv).await?;
        let native = transport
            .consume_data(options, Arc::clone(&consumer))
            .await
            .map_err(DeviceError::Engine)?;
        self.push_sink(user_key(Arc::as_ptr(&consumer)), native, move || {
            consumer.on_close()
        });
        Ok(())
    }

    pub fn close_video_sink(&self, consumer: &Arc<dyn VideoConsumer>) {
        self.inner.remove_sink(user_key(Arc::as_ptr(consumer)));
    }

    pub fn close_audio_sink(&self, consumer: &Arc<dyn AudioConsumer>) {
        self.inner.remove_sink(user_key(Arc::as_ptr(consumer)));
    }

    pub fn close_data_sink(&self, consumer: &Arc<dyn crate::DataConsumer>) {
        self.inner.remove_sink(user_key(Arc::as_ptr(consumer)));
    }

    pub async fn create_audio_source(
        &self,
        options: &ProducerOptions,
    ) -> Result<Arc<dyn AudioSender>, DeviceError> {
        let transport = DeviceInner::ensure_transport(&self.inner, TransportKind::Send).await?;
        let sender = transport
            .produce_audio(options)
            .await
            .map_err(DeviceError::Engine)?;
        self.push_sender(SenderHandle::Audio(Arc::clone(&sender)));
        Ok(sender)
    }

    pub async fn create_video_source(
        &self,
        options: &ProducerOptions,
    ) -> Result<Arc<dyn VideoSender>, DeviceError> {
        let transport = DeviceInner::ensure_transport(&self.inner, TransportKind::Send).await?;
        let sender = transport
            .produce_video(options)
            .await
            .map_err(DeviceError::Engine)?;
        self.push_sender(SenderHandle::Video(Arc::clone(&sender)));
        Ok(sender)
    }

    pub async fn create_data_source(
        &self,
        label: &str,
        protocol: &str,
        ordered: bool,
        max_retransmits: u32,
        max_packet_life_time: u32,
    ) -> Result<Arc<dyn DataSender>, DeviceError> {
        let transport = DeviceInner::ensure_transport(&self.inner, TransportKind::Send).await?;
        let sender = transport
            .produce_data(&DataProducerOptions {
                label: label.to_owned(),
                protocol: protocol.to_owned(),
                ordered,
                max_retransmits,
                max_packet_life_time,
            })
            .await
            .map_err(DeviceError::Engine)?;
        self.push_sender(SenderHandle::Data(Arc::clone(&sender)));
        Ok(sender)
    }

    /// Consume a remote producer and feed it straight back into a local
    /// producer of the same kind. The returned handle closes both ends.
    pub async fn re_encode(
        &self,
        kind: MediaKind,
        consumer_options: &ConsumerOptions,
        producer_options: &ProducerOptions,
    ) -> Result<ReEncodeHandle, DeviceError> {
        let recv = DeviceInner::ensure_transport(&self.inner, TransportKind::Recv).await?;
        let send = DeviceInner::ensure_transport(&self.inner, TransportKind::Send).await?;

        match kind {
            MediaKind::Audio => {
                let sender = send
                    .produce_audio(producer_options)
                    .await
                    .map_err(DeviceError::Engine)?;
                let pipe: Arc<dyn AudioConsumer> = Arc::new(AudioPipe {
                    sender: Arc::clone(&sender),
                });
                let sink = recv
                    .consume_audio(consumer_options, pipe)
                    .await
                    .map_err(DeviceError::Engine)?;
                Ok(ReEncodeHandle {
                    sink,
                    sender: SenderHandle::Audio(sender),
                })
            }
            MediaKind::Video => {
                let sender = send
                    .produce_video(producer_options)
                    .await
                    .map_err(DeviceError::Engine)?;
                let pipe: Arc<dyn VideoConsumer> = Arc::new(VideoPipe {
                    sender: Arc::clone(&sender),
                });
                let sink = recv
                    .consume_video(consumer_options, pipe)
                    .await
                    .map_err(DeviceError::Engine)?;
                Ok(ReEncodeHandle {
                    sink,
                    sender: SenderHandle::Video(sender),
                })
            }
        }
    }

    /// Close every sink and sender and both transports. Idempotent; the
    /// device stays loaded and can build fresh transports afterwards.
    pub async fn stop(&self) {
        let sinks = std::mem::take(
            &mut *self.inner.sinks.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for entry in sinks {
            entry.native.close();
            (entry.notify_close)();
        }

        let senders = std::mem::take(
            &mut *self.inner.senders.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for sender in senders {
            sender.close();
        }

        if let Some(transport) = self.inner.send_transport.lock().await.take() {
            transport.close();
        }
        if let Some(transport) = self.inner.recv_transport.lock().await.take() {
            transport.close();
        }
    }

    fn push_sink(
        &self,
        user_key: usize,
        native: Box<dyn NativeSink>,
        notify_close: impl Fn() + Send + Sync + 'static,
    ) {
        self.inner
            .sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SinkEntry {
                user_key,
                native,
                notify_close: Box::new(notify_close),
            });
    }

    fn push_sender(&self, sender: SenderHandle) {
        self.inner
            .senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sender);
    }
}

impl DeviceInner {
    fn delegate(&self) -> Result<Arc<dyn DeviceDelegate>, DeviceError> {
        self.delegate.upgrade().ok_or(DeviceError::DelegateGone)
    }

    async fn ensure_transport(
        inner: &Arc<Self>,
        kind: TransportKind,
    ) -> Result<Arc<dyn NativeTransport>, DeviceError> {
        if !inner.loaded.load(Ordering::SeqCst) {
            return Err(DeviceError::NotLoaded);
        }

        let slot = match kind {
            TransportKind::Send => &inner.send_transport,
            TransportKind::Recv => &inner.recv_transport,
        };
        let mut slot = slot.lock().await;
        if let Some(transport) = slot.as_ref() {
            return Ok(Arc::clone(transport));
        }

        let delegate = inner.delegate()?;
        let caps = inner
            .rtp_capabilities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let options = delegate
            .create_server_side_transport(kind, &caps)
            .await
            .map_err(DeviceError::Signaling)?;

        let observer: Arc<dyn TransportObserver> = Arc::new(DeviceObserver {
            inner: Arc::downgrade(inner),
        });
        let transport = inner
            .native
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .create_transport(kind, &options, observer)
            .map_err(DeviceError::Engine)?;

        *slot = Some(Arc::clone(&transport));
        Ok(transport)
    }

    fn remove_sink(&self, key: usize) {
        let entry = {
            let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
            sinks
                .iter()
                .position(|entry| entry.user_key == key)
                .map(|index| sinks.remove(index))
        };

        if let Some(entry) = entry {
            entry.native.close();
            (entry.notify_close)();
        }
    }
}

pub struct ReEncodeHandle {
    sink: Box<dyn NativeSink>,
    sender: SenderHandle,
}

impl Drop for ReEncodeHandle {
    fn drop(&mut self) {
        self.sink.close();
        self.sender.close();
    }
}

struct AudioPipe {
    sender: Arc<dyn AudioSender>,
}

impl AudioConsumer for AudioPipe {
    fn on_audio_data(&self, data: &AudioData<'_>) {
        self.sender.send_audio_data(data);
    }
}

struct VideoPipe {
    sender: Arc<dyn VideoSender>,
}

impl VideoConsumer for VideoPipe {
    fn on_video_frame(&self, frame: &VideoFrame<'_>) {
        self.sender.send_video_frame(frame);
    }
}

/// Bridges engine callbacks to the session delegate. Holds the device
/// weakly: the engine may outlive a torn-down device by a tick.
struct DeviceObserver {
    inner: Weak<DeviceInner>,
}

#[async_trait]
impl TransportObserver for DeviceObserver {
    async fn on_connect(
        &self,
        kind: TransportKind,
        transport_id: &str,
        dtls_parameters: &Value,
    ) -> anyhow::Result<()> {
        let inner = self.inner.upgrade().context("device is gone")?;
        let delegate = inner.delegate.upgrade().context("device delegate is gone")?;
        delegate
            .connect_transport(kind, transport_id, dtls_parameters)
            .await
    }

    async fn on_produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> anyhow::Result<String> {
        let inner = self.inner.upgrade().context("device is gone")?;
        let delegate = inner.delegate.upgrade().context("device delegate is gone")?;
        delegate
            .connect_producer(transport_id, kind, rtp_parameters)
            .await
    }

    async fn on_produce_data(
        &self,
        transport_id: &str,
        sctp_parameters: &Value,
        label: &str,
        protocol: &str,
    ) -> anyhow::Result<String> {
        let inner = self.inner.upgrade().context("device is gone")?;
        let delegate = inner.delegate.upgrade().context("device delegate is gone")?;
        delegate
            .connect_data_producer(transport_id, sctp_parameters, label, protocol)
            .await
    }

    fn on_connection_state_change(
        &self,
        kind: TransportKind,
        transport_id: &str,
        state: ConnectionState,
    ) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let Some(delegate) = inner.delegate.upgrade() else {
            warn!(%kind, transport_id, %state, "state change after delegate teardown");
            return;
        };
        delegate.on_connection_state_change(kind, transport_id, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CreateTransportOptions;
    use crate::synthetic::{SyntheticConfig, SyntheticFactory};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct RecordingDelegate {
        transports_created: Mutex<Vec<TransportKind>>,
        transports_connected: Mutex<Vec<TransportKind>>,
        producers: Mutex<Vec<String>>,
    }

    impl RecordingDelegate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                transports_created: Mutex::new(Vec::new()),
                transports_connected: Mutex::new(Vec::new()),
                producers: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DeviceDelegate for RecordingDelegate {
        async fn create_server_side_transport(
            &self,
            kind: TransportKind,
            _rtp_capabilities: &Value,
        ) -> anyhow::Result<CreateTransportOptions> {
            self.transports_created.lock().unwrap().push(kind);
            Ok(CreateTransportOptions {
                id: format!("{kind}-transport"),
                ..Default::default()
            })
        }

        async fn connect_transport(
            &self,
            kind: TransportKind,
            _transport_id: &str,
            _dtls_parameters: &Value,
        ) -> anyhow::Result<()> {
            self.transports_connected.lock().unwrap().push(kind);
            Ok(())
        }

        async fn connect_producer(
            &self,
            _transport_id: &str,
            kind: MediaKind,
            _rtp_parameters: &Value,
        ) -> anyhow::Result<String> {
            let id = format!("producer-{kind}");
            self.producers.lock().unwrap().push(id.clone());
            Ok(id)
        }

        async fn connect_data_producer(
            &self,
            _transport_id: &str,
            _sctp_parameters: &Value,
            label: &str,
            _protocol: &str,
        ) -> anyhow::Result<String> {
            let id = format!("producer-{label}");
            self.producers.lock().unwrap().push(id.clone());
            Ok(id)
        }
    }

    fn new_device(delegate: &Arc<RecordingDelegate>) -> Device {
        let weak: Weak<RecordingDelegate> = Arc::downgrade(delegate);
        let weak: Weak<dyn DeviceDelegate> = weak;
        let factory = SyntheticFactory::new(SyntheticConfig::default());
        Device::new(weak, &factory)
    }

    fn router_caps() -> Value {
        json!({"codecs": [{"mimeType": "audio/opus"}], "headerExtensions": []})
    }

    #[tokio::test]
    async fn load_rejects_second_call() {
        let delegate = RecordingDelegate::new();
        let device = new_device(&delegate);

        assert!(device.load(&router_caps()).unwrap());
        assert!(!device.load(&router_caps()).unwrap());
        assert_eq!(device.rtp_capabilities(), router_caps());
    }

    #[tokio::test]
    async fn ensure_transport_is_effectively_once() {
        let delegate = RecordingDelegate::new();
        let device = new_device(&delegate);
        device.load(&router_caps()).unwrap();

        let first = device.ensure_transport(TransportKind::Send).await.unwrap();
        let second = device.ensure_transport(TransportKind::Send).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            delegate.transports_created.lock().unwrap().as_slice(),
            &[TransportKind::Send]
        );

        device.ensure_transport(TransportKind::Recv).await.unwrap();
        assert_eq!(delegate.transports_created.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ensure_transport_requires_load() {
        let delegate = RecordingDelegate::new();
        let device = new_device(&delegate);

        match device.ensure_transport(TransportKind::Recv).await {
            Err(err) => assert!(matches!(err, DeviceError::NotLoaded)),
            Ok(_) => panic!("expected ensure_transport to fail"),
        }
    }

    #[tokio::test]
    async fn audio_source_negotiates_a_producer() {
        let delegate = RecordingDelegate::new();
        let device = new_device(&delegate);
        device.load(&router_caps()).unwrap();

        let sender = device
            .create_audio_source(&ProducerOptions::default())
            .await
            .unwrap();
        assert!(!sender.is_closed());
        assert_eq!(
            delegate.producers.lock().unwrap().as_slice(),
            &["producer-audio".to_owned()]
        );
        // Producing forced the send transport into the DTLS handshake.
        assert_eq!(
            delegate.transports_connected.lock().unwrap().as_slice(),
            &[TransportKind::Send]
        );
    }

    #[tokio::test]
    async fn data_source_negotiates_a_data_producer() {
        let delegate = RecordingDelegate::new();
        let device = new_device(&delegate);
        device.load(&router_caps()).unwrap();

        let sender = device
            .create_data_source("virtual-avatar", "", false, 0, 0)
            .await
            .unwrap();
        assert_eq!(sender.buffered_amount(), 0);
        assert_eq!(
            delegate.producers.lock().unwrap().as_slice(),
            &["producer-virtual-avatar".to_owned()]
        );
    }

    struct CloseProbe {
        closes: AtomicUsize,
    }

    impl VideoConsumer for CloseProbe {
        fn on_video_frame(&self, _frame: &VideoFrame<'_>) {}
        fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn close_video_sink_fires_on_close_once() {
        let delegate = RecordingDelegate::new();
        let device = new_device(&delegate);
        device.load(&router_caps()).unwrap();

        let probe = Arc::new(CloseProbe {
            closes: AtomicUsize::new(0),
        });
        let consumer: Arc<dyn VideoConsumer> = probe.clone();
        device
            .create_video_sink(
                &ConsumerOptions {
                    consumer_id: "c1".into(),
                    producer_id: "p1".into(),
                    rtp_parameters: Value::Null,
                },
                Arc::clone(&consumer),
            )
            .await
            .unwrap();

        device.close_video_sink(&consumer);
        device.close_video_sink(&consumer);
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_cascades() {
        let delegate = RecordingDelegate::new();
        let device = new_device(&delegate);
        device.load(&router_caps()).unwrap();

        let probe = Arc::new(CloseProbe {
            closes: AtomicUsize::new(0),
        });
        let consumer: Arc<dyn VideoConsumer> = probe.clone();
        device
            .create_video_sink(
                &ConsumerOptions {
                    consumer_id: "c1".into(),
                    producer_id: "p1".into(),
                    rtp_parameters: Value::Null,
                },
                consumer,
            )
            .await
            .unwrap();
        let sender = device
            .create_audio_source(&ProducerOptions::default())
            .await
            .unwrap();

        device.stop().await;
        device.stop().await;

        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
        assert!(sender.is_closed());

        // The device is reusable: the next ensure_transport builds a fresh
        // transport through the delegate, which is how sessions re-join.
        let created_before = delegate.transports_created.lock().unwrap().len();
        device.ensure_transport(TransportKind::Send).await.unwrap();
        assert_eq!(
            delegate.transports_created.lock().unwrap().len(),
            created_before + 1
        );
    }

    #[tokio::test]
    async fn re_encode_closes_both_ends_on_drop() {
        let delegate = RecordingDelegate::new();
        let device = new_device(&delegate);
        device.load(&router_caps()).unwrap();

        let handle = device
            .re_encode(
                MediaKind::Audio,
                &ConsumerOptions {
                    consumer_id: "c9".into(),
                    producer_id: "p9".into(),
                    rtp_parameters: Value::Null,
                },
                &ProducerOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(delegate.producers.lock().unwrap().len(), 1);
        drop(handle);
    }
}
