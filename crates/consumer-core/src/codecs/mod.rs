//! Codec-specific payload handling
//!
//! The forwarding pipeline treats codec payloads through the small
//! [`EncodingContext`] interface: decide keep/drop per packet (temporal
//! filtering), track the current/target temporal layer, and keep
//! codec-level counters continuous across stream switches.

pub mod vp8;

use rsfu_rtp_core::RtpPacket;

use crate::types::MimeType;

pub use vp8::Vp8EncodingContext;

/// Layer geometry shared by all encoding contexts.
#[derive(Debug, Clone, Copy)]
pub struct EncodingContextParams {
    pub spatial_layers: u8,
    pub temporal_layers: u8,
}

/// Per-consumer codec state driving payload rewriting.
pub trait EncodingContext {
    fn spatial_layers(&self) -> u8;

    fn temporal_layers(&self) -> u8;

    /// Process one packet's payload: filter it against the target temporal
    /// layer and rewrite codec counters in place. Returns `false` when the
    /// packet must be dropped. May move the current temporal layer as a
    /// side effect.
    fn process_payload(&mut self, packet: &mut RtpPacket) -> bool;

    /// Tell the context the output stream just resynced; codec counters
    /// must re-anchor on the next key frame.
    fn mark_sync_required(&mut self);

    fn target_temporal_layer(&self) -> i16;

    fn set_target_temporal_layer(&mut self, layer: i16);

    fn current_temporal_layer(&self) -> i16;

    fn set_current_temporal_layer(&mut self, layer: i16);
}

/// Build the encoding context for a codec, when one exists.
pub fn encoding_context_for(
    mime_type: MimeType,
    params: EncodingContextParams,
) -> Option<Box<dyn EncodingContext>> {
    match mime_type {
        MimeType::Vp8 => Some(Box::new(Vp8EncodingContext::new(params))),
        _ => None,
    }
}
