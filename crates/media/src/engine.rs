//! Trait surface over the native WebRTC engine.
//!
//! Everything the device needs from an engine fits in four traits: a factory
//! that mints per-session devices, the device that negotiates capabilities
//! and creates transports, the transport that hosts producers and consumers,
//! and the observer through which the engine calls back out (DTLS connect,
//! produce negotiation, ICE state changes).
//!
//! The harness ships one implementation, [`crate::synthetic`]; tests supply
//! their own mocks.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    AudioConsumer, AudioSender, ConnectionState, ConsumerOptions, CreateTransportOptions,
    DataConsumer, DataConsumerOptions, DataProducerOptions, DataSender, MediaKind, ProducerOptions,
    TransportKind, VideoConsumer, VideoSender,
};

/// One peer-connection factory, with its own internal network/worker threads.
/// Shared by many sessions; sharded by the supervisor.
pub trait PeerConnectionFactory: Send + Sync {
    fn create_device(&self) -> Box<dyn NativeDevice>;
}

pub trait NativeDevice: Send + Sync {
    /// Negotiate the engine against the router's capabilities. Returns the
    /// device-level RTP capabilities advertised back to the portal.
    fn load(&mut self, router_rtp_capabilities: &Value) -> anyhow::Result<Value>;

    fn can_produce(&self, kind: MediaKind) -> bool;

    /// Construct a transport from server-supplied ICE/DTLS/SCTP parameters.
    ///
    /// The engine may report `new` on the calling task before this returns;
    /// observers must tolerate that re-entrancy.
    fn create_transport(
        &self,
        kind: TransportKind,
        options: &CreateTransportOptions,
        observer: Arc<dyn TransportObserver>,
    ) -> anyhow::Result<Arc<dyn NativeTransport>>;
}

#[async_trait]
pub trait NativeTransport: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TransportKind;

    async fn consume_video(
        &self,
        options: &ConsumerOptions,
        consumer: Arc<dyn VideoConsumer>,
    ) -> anyhow::Result<Box<dyn NativeSink>>;

    async fn consume_audio(
        &self,
        options: &ConsumerOptions,
        consumer: Arc<dyn AudioConsumer>,
    ) -> anyhow::Result<Box<dyn NativeSink>>;

    async fn consume_data(
        &self,
        options: &DataConsumerOptions,
        consumer: Arc<dyn DataConsumer>,
    ) -> anyhow::Result<Box<dyn NativeSink>>;

    async fn produce_audio(&self, options: &ProducerOptions) -> anyhow::Result<Arc<dyn AudioSender>>;

    async fn produce_video(&self, options: &ProducerOptions) -> anyhow::Result<Arc<dyn VideoSender>>;

    async fn produce_data(
        &self,
        options: &DataProducerOptions,
    ) -> anyhow::Result<Arc<dyn DataSender>>;

    fn close(&self);
}

/// Handle to a live engine-side consumer. Closing stops frame delivery and
/// releases the engine resources; dropping must have the same effect.
pub trait NativeSink: Send + Sync {
    fn consumer_id(&self) -> &str;
    fn close(&self);
}

/// Engine-to-signaling bridge, implemented by the device.
#[async_trait]
pub trait TransportObserver: Send + Sync {
    /// DTLS parameters are ready; complete the handshake server-side.
    async fn on_connect(
        &self,
        kind: TransportKind,
        transport_id: &str,
        dtls_parameters: &Value,
    ) -> anyhow::Result<()>;

    /// A media producer needs a server-side id.
    async fn on_produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> anyhow::Result<String>;

    /// A data producer needs a server-side id.
    async fn on_produce_data(
        &self,
        transport_id: &str,
        sctp_parameters: &Value,
        label: &str,
        protocol: &str,
    ) -> anyhow::Result<String>;

    fn on_connection_state_change(
        &self,
        kind: TransportKind,
        transport_id: &str,
        state: ConnectionState,
    );
}
