//! VP8 encoding context
//!
//! Implements temporal-layer filtering and counter rewriting for VP8
//! payloads (RFC 7741). When packets of upper temporal layers are dropped,
//! the PictureID and TL0PICIDX fields of forwarded packets are rewritten so
//! the receiver still sees contiguous counters; both are re-anchored on the
//! key frame that follows a stream switch.

use bytes::Bytes;
use tracing::debug;

use rsfu_rtp_core::{RtpPacket, SeqManager};

use super::{EncodingContext, EncodingContextParams};

/// PictureID wraps at 2^15 (the extended M=1 form).
const PICTURE_ID_BITS: u8 = 15;

/// TL0PICIDX is a single octet.
const TL0_INDEX_BITS: u8 = 8;

/// Parsed VP8 payload descriptor with the byte offsets needed to rewrite
/// fields in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Vp8Descriptor {
    pub picture_id: Option<u16>,
    picture_id_offset: usize,
    picture_id_two_bytes: bool,
    pub tl0_picture_index: Option<u8>,
    tl0_offset: usize,
    pub temporal_layer: Option<u8>,
    pub layer_sync: bool,
    pub is_key_frame: bool,
}

impl Vp8Descriptor {
    /// Parse the payload descriptor at the start of a VP8 RTP payload.
    pub(crate) fn parse(payload: &[u8]) -> Option<Self> {
        if payload.is_empty() {
            return None;
        }

        let x = (payload[0] & 0x80) != 0; // Extended control bits
        let start_of_partition = (payload[0] & 0x10) != 0; // S bit
        let partition_index = payload[0] & 0x07;

        let mut offset = 1;
        let mut picture_id = None;
        let mut picture_id_offset = 0;
        let mut picture_id_two_bytes = false;
        let mut tl0_picture_index = None;
        let mut tl0_offset = 0;
        let mut temporal_layer = None;
        let mut layer_sync = false;

        if x {
            let ext = *payload.get(1)?;
            let i = (ext & 0x80) != 0; // PictureID present
            let l = (ext & 0x40) != 0; // TL0PICIDX present
            let t = (ext & 0x20) != 0; // TID present
            let k = (ext & 0x10) != 0; // KEYIDX present

            offset += 1;

            if i {
                let first = *payload.get(offset)?;
                picture_id_offset = offset;

                if (first & 0x80) != 0 {
                    // 15-bit PictureID
                    let second = *payload.get(offset + 1)?;
                    picture_id = Some((((first & 0x7F) as u16) << 8) | second as u16);
                    picture_id_two_bytes = true;
                    offset += 2;
                } else {
                    picture_id = Some((first & 0x7F) as u16);
                    offset += 1;
                }
            }

            if l {
                tl0_picture_index = Some(*payload.get(offset)?);
                tl0_offset = offset;
                offset += 1;
            }

            if t || k {
                let byte = *payload.get(offset)?;
                if t {
                    temporal_layer = Some(byte >> 6);
                    layer_sync = (byte & 0x20) != 0; // Y bit
                }
                offset += 1;
            }
        }

        // A key frame starts at partition 0 with the P bit of the VP8
        // frame header cleared.
        let is_key_frame = start_of_partition
            && partition_index == 0
            && payload.get(offset).is_some_and(|b| (b & 0x01) == 0);

        Some(Self {
            picture_id,
            picture_id_offset,
            picture_id_two_bytes,
            tl0_picture_index,
            tl0_offset,
            temporal_layer,
            layer_sync,
            is_key_frame,
        })
    }

    /// Rewrite the PictureID and TL0PICIDX fields in `data`, preserving
    /// each field's wire width.
    fn rewrite(&self, data: &mut [u8], picture_id: u16, tl0_picture_index: u8) {
        if self.picture_id.is_some() {
            if self.picture_id_two_bytes {
                data[self.picture_id_offset] = 0x80 | ((picture_id >> 8) as u8 & 0x7F);
                data[self.picture_id_offset + 1] = picture_id as u8;
            } else {
                data[self.picture_id_offset] = picture_id as u8 & 0x7F;
            }
        }

        if self.tl0_picture_index.is_some() {
            data[self.tl0_offset] = tl0_picture_index;
        }
    }
}

/// Per-consumer VP8 state.
pub struct Vp8EncodingContext {
    spatial_layers: u8,
    temporal_layers: u8,
    target_temporal_layer: i16,
    current_temporal_layer: i16,
    sync_required: bool,
    picture_id_manager: SeqManager,
    tl0_index_manager: SeqManager,
}

impl Vp8EncodingContext {
    pub fn new(params: EncodingContextParams) -> Self {
        Self {
            spatial_layers: params.spatial_layers,
            temporal_layers: params.temporal_layers,
            target_temporal_layer: -1,
            current_temporal_layer: -1,
            sync_required: false,
            picture_id_manager: SeqManager::new(PICTURE_ID_BITS),
            tl0_index_manager: SeqManager::new(TL0_INDEX_BITS),
        }
    }
}

impl EncodingContext for Vp8EncodingContext {
    fn spatial_layers(&self) -> u8 {
        self.spatial_layers
    }

    fn temporal_layers(&self) -> u8 {
        self.temporal_layers
    }

    fn process_payload(&mut self, packet: &mut RtpPacket) -> bool {
        let Some(descriptor) = Vp8Descriptor::parse(packet.payload()) else {
            // Nothing we can reason about; forward untouched.
            return true;
        };

        let (Some(picture_id), Some(tl0), Some(tid)) = (
            descriptor.picture_id,
            descriptor.tl0_picture_index,
            descriptor.temporal_layer,
        ) else {
            // Without PictureID/TL0PICIDX/TID the stream cannot be
            // temporally filtered; forward as-is.
            return true;
        };

        // Re-anchor the codec counters on the key frame that follows a
        // stream switch.
        if self.sync_required && packet.is_key_frame() {
            self.picture_id_manager.sync((picture_id as u32).wrapping_sub(1));
            self.tl0_index_manager.sync((tl0 as u32).wrapping_sub(1));

            self.sync_required = false;
        }

        // Filter out frames above the target temporal layer. TL0PICIDX only
        // advances on the base layer, which is never filtered.
        if (tid as i16) > self.target_temporal_layer {
            self.picture_id_manager.drop_input(picture_id as u32);

            return false;
        }

        // Step the current temporal layer: up only at a safe point, down
        // right away.
        if (tid as i16) > self.current_temporal_layer
            && (descriptor.layer_sync || packet.is_key_frame())
        {
            debug!(
                temporal_layer = tid,
                "current temporal layer upgraded at sync point"
            );

            self.current_temporal_layer = tid as i16;
        } else if self.target_temporal_layer < self.current_temporal_layer {
            self.current_temporal_layer = self.target_temporal_layer;
        }

        let Some(new_picture_id) = self.picture_id_manager.input(picture_id as u32) else {
            return false;
        };
        let Some(new_tl0) = self.tl0_index_manager.input(tl0 as u32) else {
            return false;
        };

        if new_picture_id != picture_id as u32 || new_tl0 != tl0 as u32 {
            let mut data = packet.payload().to_vec();
            descriptor.rewrite(&mut data, new_picture_id as u16, new_tl0 as u8);
            packet.set_payload(Bytes::from(data));
        }

        true
    }

    fn mark_sync_required(&mut self) {
        self.sync_required = true;
    }

    fn target_temporal_layer(&self) -> i16 {
        self.target_temporal_layer
    }

    fn set_target_temporal_layer(&mut self, layer: i16) {
        self.target_temporal_layer = layer;
    }

    fn current_temporal_layer(&self) -> i16 {
        self.current_temporal_layer
    }

    fn set_current_temporal_layer(&mut self, layer: i16) {
        self.current_temporal_layer = layer;
    }
}
