//! Media-device facade for the load-test harness.
//!
//! The WebRTC engine itself (ICE, DTLS-SRTP, codecs) lives behind the trait
//! surface in [`engine`]; this crate owns the lifetime graph on top of it
//! (factory → device → transports → producers/consumers) and bridges engine
//! callbacks back into signaling through [`DeviceDelegate`], which each
//! session implements.

pub mod device;
pub mod engine;
pub mod synthetic;

pub use device::{Device, DeviceError, ReEncodeHandle};

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Send,
    Recv,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Send => "send",
            TransportKind::Recv => "recv",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICE/DTLS connection state, mirroring the engine's state names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Completed => "completed",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        }
    }

    /// States after which the transport will never carry media again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Failed | ConnectionState::Disconnected | ConnectionState::Closed
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side transport parameters, as returned by the portal.
#[derive(Debug, Clone, Default)]
pub struct CreateTransportOptions {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    pub sctp_parameters: Value,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub consumer_id: String,
    pub producer_id: String,
    pub rtp_parameters: Value,
}

#[derive(Debug, Clone)]
pub struct DataConsumerOptions {
    pub consumer_id: String,
    pub producer_id: String,
    pub stream_id: u16,
    pub label: String,
    pub protocol: String,
}

/// Optional producer knobs, passed through to the engine as JSON.
#[derive(Debug, Clone, Default)]
pub struct ProducerOptions {
    pub encodings: Value,
    pub codec_options: Value,
    pub codec: Value,
}

#[derive(Debug, Clone, Default)]
pub struct DataProducerOptions {
    pub label: String,
    pub protocol: String,
    pub ordered: bool,
    pub max_retransmits: u32,
    pub max_packet_life_time: u32,
}

/// A decoded video frame, valid only for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct VideoFrame<'a> {
    pub timestamp_ms: i64,
    pub width: u32,
    pub height: u32,
    pub data_y: &'a [u8],
    pub data_u: &'a [u8],
    pub data_v: &'a [u8],
    pub stride_y: usize,
    pub stride_u: usize,
    pub stride_v: usize,
}

/// Raw interleaved PCM, valid only for the duration of the call.
#[derive(Debug, Clone, Copy)]
pub struct AudioData<'a> {
    pub timestamp_ms: i64,
    pub bits_per_sample: u32,
    pub sample_rate: u32,
    pub number_of_channels: u32,
    pub number_of_frames: u32,
    pub data: &'a [u8],
}

pub trait VideoConsumer: Send + Sync {
    fn on_video_frame(&self, frame: &VideoFrame<'_>);
    fn on_close(&self) {}
}

pub trait AudioConsumer: Send + Sync {
    fn on_audio_data(&self, data: &AudioData<'_>);
    fn on_close(&self) {}
}

pub trait DataConsumer: Send + Sync {
    fn on_data(&self, payload: &[u8]);
    fn on_close(&self) {}
}

/// Sink that discards every frame. Used where only the consumer's existence
/// matters (keeping the server-side consumer alive).
pub struct DummyVideoConsumer;

impl VideoConsumer for DummyVideoConsumer {
    fn on_video_frame(&self, _frame: &VideoFrame<'_>) {}
}

pub struct DummyAudioConsumer;

impl AudioConsumer for DummyAudioConsumer {
    fn on_audio_data(&self, _data: &AudioData<'_>) {}
}

pub trait VideoSender: Send + Sync {
    fn is_closed(&self) -> bool;
    fn send_video_frame(&self, frame: &VideoFrame<'_>);
    fn close(&self);
}

pub trait AudioSender: Send + Sync {
    fn is_closed(&self) -> bool;
    fn send_audio_data(&self, data: &AudioData<'_>);
    fn close(&self);
}

pub trait DataSender: Send + Sync {
    fn is_closed(&self) -> bool;
    /// Bytes queued but not yet handed to the transport. Producers skip a
    /// tick while this is non-zero.
    fn buffered_amount(&self) -> u64;
    fn send_data(&self, payload: &[u8]);
    fn close(&self);
}

/// Signaling bridge implemented by each session. The device calls these in
/// response to engine events; the session turns them into portal requests.
#[async_trait]
pub trait DeviceDelegate: Send + Sync {
    async fn create_server_side_transport(
        &self,
        kind: TransportKind,
        rtp_capabilities: &Value,
    ) -> anyhow::Result<CreateTransportOptions>;

    async fn connect_transport(
        &self,
        kind: TransportKind,
        transport_id: &str,
        dtls_parameters: &Value,
    ) -> anyhow::Result<()>;

    async fn connect_producer(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> anyhow::Result<String> {
        let _ = (transport_id, rtp_parameters);
        anyhow::bail!("producing {kind} is not supported by this peer")
    }

    async fn connect_data_producer(
        &self,
        transport_id: &str,
        sctp_parameters: &Value,
        label: &str,
        protocol: &str,
    ) -> anyhow::Result<String> {
        let _ = (transport_id, sctp_parameters, label, protocol);
        anyhow::bail!("data producing is not supported by this peer")
    }

    fn on_connection_state_change(
        &self,
        kind: TransportKind,
        transport_id: &str,
        state: ConnectionState,
    ) {
        let _ = (kind, transport_id, state);
    }
}

/// Milliseconds on the media clock. Wall-clock based, like the RTC clock the
/// stat windows were designed against.
pub fn rtc_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
