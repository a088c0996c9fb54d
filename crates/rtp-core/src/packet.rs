//! In-memory RTP packet model
//!
//! Parsing and serialization live with the transport; this type carries the
//! already-parsed header fields plus the raw payload. Forwarders rewrite the
//! header fields (SSRC, sequence number, timestamp) and possibly the payload
//! in place, then restore the originals so the same packet object can be
//! offered to other consumers of the same producer.

use bytes::Bytes;

/// Codec-level frame information attached by the receiving (producer-side)
/// depacketizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// Whether this packet starts an independently decodable frame.
    pub key_frame: bool,

    /// Temporal layer this packet belongs to, when the codec signals one.
    pub temporal_layer: Option<u8>,

    /// Whether this frame only depends on frames of lower temporal layers
    /// (a safe point to step a temporal layer up).
    pub layer_sync: bool,
}

/// An RTP packet with rewritable header fields.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    ssrc: u32,
    sequence_number: u16,
    timestamp: u32,
    payload_type: u8,
    marker: bool,
    payload: Bytes,
    /// Original payload stashed before the first in-place edit.
    stashed_payload: Option<Bytes>,
    frame: FrameInfo,
}

impl RtpPacket {
    /// Assemble a packet from parsed header fields and payload.
    pub fn new(
        ssrc: u32,
        sequence_number: u16,
        timestamp: u32,
        payload_type: u8,
        marker: bool,
        payload: Bytes,
        frame: FrameInfo,
    ) -> Self {
        Self {
            ssrc,
            sequence_number,
            timestamp,
            payload_type,
            marker,
            payload,
            stashed_payload: None,
            frame,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.ssrc = ssrc;
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, sequence_number: u16) {
        self.sequence_number = sequence_number;
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn marker(&self) -> bool {
        self.marker
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn frame(&self) -> &FrameInfo {
        &self.frame
    }

    /// Whether this packet starts an independently decodable frame.
    pub fn is_key_frame(&self) -> bool {
        self.frame.key_frame
    }

    /// Temporal layer of this packet, defaulting to the base layer when the
    /// codec does not signal one.
    pub fn temporal_layer(&self) -> u8 {
        self.frame.temporal_layer.unwrap_or(0)
    }

    /// Wire size: fixed RTP header plus payload (header extensions are the
    /// transport's business).
    pub fn size(&self) -> usize {
        12 + self.payload.len()
    }

    /// Replace the payload, stashing the original the first time so that
    /// [`RtpPacket::restore_payload`] can undo all edits.
    pub fn set_payload(&mut self, payload: Bytes) {
        if self.stashed_payload.is_none() {
            self.stashed_payload = Some(self.payload.clone());
        }
        self.payload = payload;
    }

    /// Undo any payload edits made since the packet was built.
    pub fn restore_payload(&mut self) {
        if let Some(original) = self.stashed_payload.take() {
            self.payload = original;
        }
    }
}
