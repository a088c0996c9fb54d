//! Consumer capability surface
//!
//! Every consumer kind (simulcast, simple, pipe) exposes the same control
//! surface; kind-specific state stays in the concrete type. Methods that
//! may call back into the host take the listener as a parameter, keeping
//! all callbacks synchronous.

pub mod simulcast;

use serde::Serialize;

use rsfu_rtp_core::RtpPacket;

use crate::error::Result;
use crate::types::{ConsumerId, ConsumerScore, MediaKind};

pub use simulcast::SimulcastConsumer;

/// Forwarding strategy of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerKind {
    /// Picks one of N upstream simulcast streams.
    Simulcast,
    /// Forwards a single upstream stream.
    Simple,
    /// Mirrors a stream between routers.
    Pipe,
}

/// Downward callbacks from a consumer into its transport.
pub trait ConsumerListener {
    /// A rewritten packet is ready to go on the wire.
    fn on_consumer_send_rtp_packet(&mut self, consumer_id: &ConsumerId, packet: &RtpPacket);

    /// A stored packet must be retransmitted.
    fn on_consumer_retransmit_rtp_packet(&mut self, consumer_id: &ConsumerId, packet: &RtpPacket);

    /// The consumer needs a key frame from the upstream stream with the
    /// given mapped SSRC.
    fn on_consumer_key_frame_requested(&mut self, consumer_id: &ConsumerId, mapped_ssrc: u32);

    /// The consumer's desired layers changed; the bitrate allocator should
    /// re-plan.
    fn on_consumer_need_bitrate_change(&mut self, consumer_id: &ConsumerId);
}

/// Requests accepted on the consumer's control channel.
#[derive(Debug, Clone)]
pub enum ConsumerRequest {
    /// Ask the upstream producer(s) for a key frame.
    RequestKeyFrame,
    /// Update the receiver's preferred layers; parameters arrive as raw
    /// JSON from the control plane.
    SetPreferredLayers(serde_json::Value),
}

/// Introspection snapshot of a consumer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDump {
    pub id: String,
    pub kind: ConsumerKind,
    pub paused: bool,
    pub producer_paused: bool,
    pub preferred_spatial_layer: i16,
    pub preferred_temporal_layer: i16,
    pub target_spatial_layer: i16,
    pub target_temporal_layer: i16,
    pub current_spatial_layer: i16,
    pub current_temporal_layer: i16,
    pub score: ConsumerScore,
}

/// The shared consumer surface.
pub trait Consumer {
    fn id(&self) -> &ConsumerId;

    fn consumer_kind(&self) -> ConsumerKind;

    fn media_kind(&self) -> MediaKind;

    /// Active means: transport connected and neither side paused.
    fn is_active(&self) -> bool;

    fn is_paused(&self) -> bool;

    fn dump(&self) -> ConsumerDump;

    /// Opt this consumer into the external bitrate-allocation protocol.
    fn set_externally_managed_bitrate(&mut self);

    fn handle_request(
        &mut self,
        request: ConsumerRequest,
        listener: &mut dyn ConsumerListener,
    ) -> Result<()>;

    fn transport_connected(&mut self, listener: &mut dyn ConsumerListener);

    fn transport_disconnected(&mut self, listener: &mut dyn ConsumerListener);

    fn pause(&mut self, listener: &mut dyn ConsumerListener);

    fn resume(&mut self, listener: &mut dyn ConsumerListener);

    fn producer_pause(&mut self, listener: &mut dyn ConsumerListener);

    fn producer_resume(&mut self, listener: &mut dyn ConsumerListener);

    /// Offer one upstream packet to this consumer. Zero or one packet is
    /// forwarded through the listener; the packet's fields are restored
    /// before returning.
    fn send_rtp_packet(&mut self, packet: &mut RtpPacket, listener: &mut dyn ConsumerListener);

    /// A key-frame request (PLI/FIR) arrived from the receiving endpoint.
    fn receive_key_frame_request(&mut self, listener: &mut dyn ConsumerListener);
}
